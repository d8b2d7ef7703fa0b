use georoute_catalog::{SchemaError, StoreError};
use std::time::Duration;

/// Why the builder refused to produce a statement.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("unknown column `{column}` on `{table}`")]
    UnknownColumn { table: String, column: String },
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid paging: {0}")]
    InvalidPaging(String),
    #[error("no columns requested")]
    EmptyProjection,
    #[error(transparent)]
    Schema(SchemaError),
}

impl From<SchemaError> for BuildError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::UnknownTable(table) => BuildError::UnknownTable(table),
            other => BuildError::Schema(other),
        }
    }
}

/// Why the validator refused a statement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqlRejected {
    #[error("only SELECT statements are allowed")]
    NotSelect,
    #[error("multiple statements are not allowed")]
    MultipleStatements,
    #[error("forbidden keyword `{0}`")]
    ForbiddenKeyword(String),
    #[error("statement could not be tokenized: {0}")]
    Unreadable(String),
}

/// Why a validated statement produced no rows.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Rejected(#[from] SqlRejected),
    /// The store failed the statement; `fallback_attempted` tells whether the
    /// wildcard retry also ran and failed.
    #[error("statement failed: {detail}")]
    Failed { detail: String, fallback_attempted: bool },
    #[error("data store unavailable: {0}")]
    Unavailable(String),
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),
}

impl From<StoreError> for ExecutionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ExecutionError::Unavailable(msg),
            StoreError::Statement(detail) => ExecutionError::Failed {
                detail,
                fallback_attempted: false,
            },
            StoreError::Timeout(after) => ExecutionError::Timeout(after),
        }
    }
}
