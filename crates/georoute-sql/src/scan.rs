//! Lexical helpers over statement text: the top-level select list, the
//! wildcard rewrite used by execution fallback, and named placeholders.
//!
//! The scanner tracks quotes, comments and parenthesis depth, so
//! `SELECT (SELECT max(x) FROM y) AS m FROM t` splits at the second FROM.

use std::collections::BTreeSet;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    Single,
    Double,
    LineComment,
    BlockComment,
}

/// A word found at parenthesis depth zero, outside quotes and comments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TopWord {
    range: Range<usize>,
    text: String,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Walk `sql`, calling `on_code` for every character that is plain code
/// (not quoted, not commented) together with its byte offset and depth.
fn walk(sql: &str, mut on_code: impl FnMut(usize, char, usize)) {
    let mut mode = Mode::Code;
    let mut depth = 0usize;
    let mut chars = sql.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match mode {
            Mode::Code => match c {
                '\'' => mode = Mode::Single,
                '"' => mode = Mode::Double,
                '-' if chars.peek().is_some_and(|&(_, n)| n == '-') => {
                    chars.next();
                    mode = Mode::LineComment;
                }
                '/' if chars.peek().is_some_and(|&(_, n)| n == '*') => {
                    chars.next();
                    mode = Mode::BlockComment;
                }
                '(' => {
                    on_code(idx, c, depth);
                    depth += 1;
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    on_code(idx, c, depth);
                }
                _ => on_code(idx, c, depth),
            },
            Mode::Single => {
                if c == '\'' {
                    if chars.peek().is_some_and(|&(_, n)| n == '\'') {
                        chars.next();
                    } else {
                        mode = Mode::Code;
                    }
                }
            }
            Mode::Double => {
                if c == '"' {
                    if chars.peek().is_some_and(|&(_, n)| n == '"') {
                        chars.next();
                    } else {
                        mode = Mode::Code;
                    }
                }
            }
            Mode::LineComment => {
                if c == '\n' {
                    mode = Mode::Code;
                }
            }
            Mode::BlockComment => {
                if c == '*' && chars.peek().is_some_and(|&(_, n)| n == '/') {
                    chars.next();
                    mode = Mode::Code;
                }
            }
        }
    }
}

fn top_level_words(sql: &str) -> Vec<TopWord> {
    let mut words = Vec::new();
    let mut current: Option<(usize, String)> = None;
    let mut last_end = 0usize;

    walk(sql, |idx, c, depth| {
        let contiguous = idx == last_end;
        last_end = idx + c.len_utf8();

        if depth == 0 && is_word_char(c) {
            if contiguous {
                if let Some((_, text)) = current.as_mut() {
                    text.push(c);
                    return;
                }
            }
            if let Some((start, text)) = current.take() {
                words.push(TopWord { range: start..start + text.len(), text });
            }
            current = Some((idx, c.to_string()));
        } else if let Some((start, text)) = current.take() {
            words.push(TopWord { range: start..start + text.len(), text });
        }
    });
    if let Some((start, text)) = current {
        words.push(TopWord { range: start..start + text.len(), text });
    }
    words
}

/// Byte range of the select list: after the leading SELECT up to the first
/// top-level FROM.
fn select_list_range(sql: &str) -> Option<Range<usize>> {
    let words = top_level_words(sql);
    let first = words.first()?;
    if !first.text.eq_ignore_ascii_case("select") {
        return None;
    }
    let from = words
        .iter()
        .skip(1)
        .find(|w| w.text.eq_ignore_ascii_case("from"))?;
    Some(first.range.end..from.range.start)
}

/// The raw select list of a statement, trimmed.
pub fn select_list(sql: &str) -> Option<&str> {
    select_list_range(sql).map(|range| sql[range].trim())
}

pub fn selects_everything(sql: &str) -> bool {
    select_list(sql).is_some_and(|list| list == "*")
}

/// Replace the select list with `*`, keeping everything from FROM on.
///
/// `None` when there is no top-level FROM or the list is already `*`.
pub fn wildcard_rewrite(sql: &str) -> Option<String> {
    let range = select_list_range(sql)?;
    if sql[range.clone()].trim() == "*" {
        return None;
    }
    Some(format!("{} * {}", &sql[..range.start], &sql[range.end..]))
}

/// Whether `name` appears as a standalone identifier in the select list,
/// bare or double-quoted, compared case-insensitively.
pub fn projects_identifier(list: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let haystack = list.to_ascii_lowercase();
    let needle = name.to_ascii_lowercase();
    let bounded = |c: Option<char>| c.map_or(true, |c| !is_word_char(c));

    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        if bounded(haystack[..start].chars().next_back()) && bounded(haystack[end..].chars().next()) {
            return true;
        }
        from = end;
    }
    false
}

/// Named placeholders (`:name`) used by the statement. `::type` casts are
/// not placeholders.
pub fn placeholders(sql: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut pending: Option<String> = None;
    let mut prev: Option<char> = None;
    let mut last_end = 0usize;

    walk(sql, |idx, c, _| {
        let contiguous = idx == last_end;
        last_end = idx + c.len_utf8();

        if let Some(name) = pending.as_mut() {
            if contiguous && (c.is_ascii_alphanumeric() || c == '_') {
                name.push(c);
                prev = Some(c);
                return;
            }
            if let Some(name) = pending.take().filter(|n| !n.is_empty()) {
                found.insert(name);
            }
        }

        if c == ':' {
            // a second colon makes a cast
            let cast = contiguous && prev == Some(':');
            pending = if cast { None } else { Some(String::new()) };
        }
        prev = Some(c);
    });

    if let Some(name) = pending.filter(|n| !n.is_empty()) {
        found.insert(name);
    }
    found
}
