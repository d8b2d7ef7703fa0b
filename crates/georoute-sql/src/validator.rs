//! Read-only statement gate.
//!
//! A statement passes when it starts with SELECT, contains no `;`, and no
//! unquoted keyword token is one of the write or DDL verbs. Checks run on
//! tokens, so `update_time` or `"drop"` are fine.

use crate::error::SqlRejected;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

pub const FORBIDDEN_KEYWORDS: [&str; 8] = [
    "insert", "update", "delete", "drop", "alter", "grant", "revoke", "truncate",
];

/// Stateless; `validate` is pure and idempotent.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryValidator;

impl QueryValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, sql: &str) -> Result<(), SqlRejected> {
        validate(sql)
    }
}

pub fn validate(sql: &str) -> Result<(), SqlRejected> {
    let trimmed = sql.trim();
    let starts_with_select = trimmed
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"));
    if !starts_with_select {
        return Err(SqlRejected::NotSelect);
    }
    if trimmed.contains(';') {
        return Err(SqlRejected::MultipleStatements);
    }

    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, trimmed)
        .tokenize()
        .map_err(|err| SqlRejected::Unreadable(err.to_string()))?;

    for token in tokens {
        if let Token::Word(word) = token {
            if word.quote_style.is_some() {
                continue;
            }
            let lowered = word.value.to_ascii_lowercase();
            if FORBIDDEN_KEYWORDS.contains(&lowered.as_str()) {
                tracing::warn!(keyword = %lowered, "statement rejected");
                return Err(SqlRejected::ForbiddenKeyword(lowered));
            }
        }
    }
    Ok(())
}
