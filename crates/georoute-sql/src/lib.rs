//! Statement layer for georoute.
//!
//! ```text
//!   draft {columns, filters}          externally synthesised SQL
//!            │                                   │
//!            ▼                                   │
//!   QueryBuilder (schema-checked,                │
//!   quoted, parameterised)                       │
//!            │                                   │
//!            └──────────────► QueryPlan ◄────────┘
//!                                 │
//!                                 ▼
//!                 QueryValidator (read-only gate)
//!                                 │
//!                                 ▼
//!            QueryExecutor ──► DataStore (SqliteStore, ...)
//!                 │
//!                 └─ statement error ─► one `SELECT *` retry
//! ```

pub mod builder;
pub mod error;
pub mod executor;
pub mod filter;
pub mod scan;
pub mod sqlite;
pub mod validator;

pub use builder::{
    quote_ident, quote_table, render_select, BuiltQuery, Dialect, Page, QueryBuilder, LIMIT_PARAM,
    OFFSET_PARAM,
};
pub use error::{BuildError, ExecutionError, SqlRejected};
pub use executor::{feature_collection, ExecutionResult, QueryExecutor, QueryPlan};
pub use filter::{filters_from_json, FilterClause, FilterOp};
pub use sqlite::{SqliteStore, CATALOG_DDL};
pub use validator::{validate, QueryValidator, FORBIDDEN_KEYWORDS};
