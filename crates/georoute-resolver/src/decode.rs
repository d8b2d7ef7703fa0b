//! Lenient decoding of classifier output.
//!
//! Models wrap JSON in prose and markdown even when told not to. One decoder
//! serves every stage, trying in order:
//!
//! 1. strip an enclosing code fence (```` ``` ```` or ```` ```json ````)
//! 2. parse the whole remaining text
//! 3. parse the outermost balanced `{...}` span, brackets inside strings
//!    ignored; a `[...]` span only when no object parses, so bracketed
//!    prose ("step [1]") never wins over the answer
//! 4. fail with [`DecodeError`]; there is no placeholder value

use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("classifier returned no output")]
    Empty,
    #[error("classifier output contains no JSON: {0}")]
    NoJson(String),
    #[error("classifier output has the wrong shape: {0}")]
    Shape(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LenientStructuredDecoder;

impl LenientStructuredDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<T, DecodeError> {
        let value = self.decode_value(raw)?;
        serde_json::from_value(value).map_err(|err| DecodeError::Shape(err.to_string()))
    }

    pub fn decode_value(&self, raw: &str) -> Result<Value, DecodeError> {
        let text = strip_fences(raw);
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }

        if let Ok(value) = serde_json::from_str::<Value>(text) {
            return Ok(value);
        }

        outermost_json(text, '{')
            .or_else(|| outermost_json(text, '['))
            .ok_or_else(|| DecodeError::NoJson(preview(text)))
    }
}

/// Remove one enclosing markdown fence and its language tag.
pub fn strip_fences(raw: &str) -> &str {
    let text = raw.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.find('\n') {
        // drop the info string (`json`, `sql`, ...)
        Some(newline) if !rest[..newline].contains('`') => &rest[newline + 1..],
        _ => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Widest balanced span opened by `open` that parses as JSON.
fn outermost_json(text: &str, open: char) -> Option<Value> {
    let mut best: Option<(usize, Value)> = None;
    let mut covered = 0;

    for (start, ch) in text.char_indices() {
        if ch != open || start < covered {
            continue;
        }
        let Some(span) = balanced_span(text, start) else {
            continue;
        };
        match serde_json::from_str::<Value>(span) {
            Ok(value) => {
                covered = start + span.len();
                if best.as_ref().map_or(true, |(len, _)| span.len() > *len) {
                    best = Some((span.len(), value));
                }
            }
            Err(err) => tracing::trace!(error = %err, start, "balanced span did not parse"),
        }
    }
    best.map(|(_, value)| value)
}

/// Balanced `{...}` or `[...]` span starting at byte `start`.
fn balanced_span(text: &str, start: usize) -> Option<&str> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
