//! Parameterised SELECT construction.
//!
//! This is the only place identifiers are spliced into SQL text. Every
//! identifier is checked against `[A-Za-z_][A-Za-z0-9_]*` and double-quoted;
//! every value travels as a named parameter (`:p0`, `:p1`, ... plus
//! `:_limit` and `:_offset`).

use crate::error::BuildError;
use crate::filter::{FilterClause, FilterOp};
use georoute_catalog::{Params, SchemaCatalog, TableSchema};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};

pub const LIMIT_PARAM: &str = "_limit";
pub const OFFSET_PARAM: &str = "_offset";

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier regex"))
}

pub fn is_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name)
}

/// Double-quote one identifier after checking its shape.
pub fn quote_ident(name: &str) -> Result<String, BuildError> {
    if is_identifier(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(BuildError::InvalidIdentifier(name.to_string()))
    }
}

/// Quote a possibly schema-qualified table name part by part.
pub fn quote_table(name: &str) -> Result<String, BuildError> {
    let parts = name
        .split('.')
        .map(quote_ident)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| BuildError::InvalidIdentifier(name.to_string()))?;
    Ok(parts.join("."))
}

/// Target dialect; only affects case-insensitive matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    #[default]
    Postgres,
    /// SQLite's LIKE is already case-insensitive for ASCII.
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Params,
}

/// Paging of a built query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    fn check(self) -> Result<Self, BuildError> {
        if self.limit <= 0 {
            return Err(BuildError::InvalidPaging(format!(
                "limit must be positive, got {}",
                self.limit
            )));
        }
        if self.offset < 0 {
            return Err(BuildError::InvalidPaging(format!(
                "offset must not be negative, got {}",
                self.offset
            )));
        }
        Ok(self)
    }
}

/// Render a SELECT against an already known schema.
///
/// Column checks are exact-case against `schema`; `*` is refused.
pub fn render_select(
    schema: &TableSchema,
    columns: &[String],
    filters: &[FilterClause],
    page: Page,
    dialect: Dialect,
) -> Result<BuiltQuery, BuildError> {
    let page = page.check()?;
    if columns.is_empty() {
        return Err(BuildError::EmptyProjection);
    }

    let projection = columns
        .iter()
        .map(|column| known_column(schema, column))
        .collect::<Result<Vec<_>, _>>()?;

    let mut params = Params::new();
    let mut conditions = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = known_column(schema, &filter.column)?;
        filter.check_value()?;
        conditions.push(render_condition(&column, filter, dialect, &mut params));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        projection.join(", "),
        quote_table(&schema.table)?
    );
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" LIMIT :{LIMIT_PARAM} OFFSET :{OFFSET_PARAM}"));

    params.insert(LIMIT_PARAM.to_string(), json!(page.limit));
    params.insert(OFFSET_PARAM.to_string(), json!(page.offset));
    Ok(BuiltQuery { sql, params })
}

fn known_column(schema: &TableSchema, column: &str) -> Result<String, BuildError> {
    let unknown = || BuildError::UnknownColumn {
        table: schema.table.clone(),
        column: column.to_string(),
    };
    if column == "*" {
        return Err(unknown());
    }
    let quoted = quote_ident(column)?;
    if schema.has_column(column) {
        Ok(quoted)
    } else {
        Err(unknown())
    }
}

fn render_condition(column: &str, filter: &FilterClause, dialect: Dialect, params: &mut Params) -> String {
    let mut bind = |value: Value| {
        let name = format!("p{}", params.len());
        params.insert(name.clone(), value);
        format!(":{name}")
    };

    match filter.operator {
        FilterOp::Is => format!("{column} IS NULL"),
        FilterOp::IsNot => format!("{column} IS NOT NULL"),
        FilterOp::In => {
            let items = match &filter.value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let placeholders: Vec<String> = items.into_iter().map(&mut bind).collect();
            format!("{column} IN ({})", placeholders.join(", "))
        }
        op => {
            let keyword = match (op, dialect) {
                (FilterOp::Like, _) | (FilterOp::ILike, Dialect::Sqlite) => "LIKE",
                (FilterOp::ILike, Dialect::Postgres) => "ILIKE",
                (other, _) => other.as_str(),
            };
            let placeholder = bind(filter.value.clone());
            format!("{column} {keyword} {placeholder}")
        }
    }
}

/// Builds SELECTs for tables whose columns come from the schema catalog.
pub struct QueryBuilder {
    schemas: Arc<SchemaCatalog>,
    dialect: Dialect,
}

impl QueryBuilder {
    pub fn new(schemas: Arc<SchemaCatalog>) -> Self {
        Self {
            schemas,
            dialect: Dialect::default(),
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn build_select(
        &self,
        table: &str,
        columns: &[String],
        filters: &[FilterClause],
        page: Page,
    ) -> Result<BuiltQuery, BuildError> {
        quote_ident(table)?;
        let schema = self.schemas.columns_of(table).await?;
        let built = render_select(&schema, columns, filters, page, self.dialect)?;
        tracing::debug!(table, sql = %built.sql, params = built.params.len(), "built select");
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use georoute_catalog::ColumnSchema;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnSchema::new("id", "integer"),
                ColumnSchema::new("name", "text"),
                ColumnSchema::new("age", "integer"),
                ColumnSchema::new("active", "boolean"),
            ],
        )
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn quote_ident_accepts_plain_names_only() {
        assert_eq!(quote_ident("col").unwrap(), "\"col\"");
        assert_eq!(quote_ident("_x9").unwrap(), "\"_x9\"");
        for bad in ["1invalid", "na-me", "a b", "", "x\"y", "a;drop"] {
            assert!(matches!(quote_ident(bad), Err(BuildError::InvalidIdentifier(_))), "{bad}");
        }
        assert_eq!(quote_table("ne_data.ne_10m_lakes").unwrap(), "\"ne_data\".\"ne_10m_lakes\"");
        assert!(quote_table("ne_data..lakes").is_err());
    }

    #[test]
    fn shorthand_filters_render_in_order() {
        let filters = vec![FilterClause::eq("active", true), FilterClause::eq("name", "Alice")];
        let built = render_select(&users(), &cols(&["id", "name"]), &filters, Page::new(10, 0), Dialect::Postgres)
            .unwrap();
        assert_eq!(
            built.sql,
            "SELECT \"id\", \"name\" FROM \"users\" WHERE \"active\" = :p0 AND \"name\" = :p1 LIMIT :_limit OFFSET :_offset"
        );
        assert_eq!(built.params["p0"], json!(true));
        assert_eq!(built.params["p1"], json!("Alice"));
        assert_eq!(built.params["_limit"], json!(10));
        assert_eq!(built.params["_offset"], json!(0));
    }

    #[test]
    fn explicit_operators_and_lists() {
        let filters = vec![
            FilterClause::new("age", FilterOp::Ge, json!(18)),
            FilterClause::new("id", FilterOp::In, json!([1, 2, 3])),
            FilterClause::new("name", FilterOp::IsNot, Value::Null),
        ];
        let built =
            render_select(&users(), &cols(&["id"]), &filters, Page::new(5, 10), Dialect::Postgres).unwrap();
        assert!(built.sql.contains("WHERE \"age\" >= :p0 AND \"id\" IN (:p1, :p2, :p3) AND \"name\" IS NOT NULL"));
        assert_eq!(built.params.len(), 6);
        assert_eq!(built.params["p3"], json!(3));
    }

    #[test]
    fn ilike_degrades_to_like_on_sqlite() {
        let filters = vec![FilterClause::new("name", FilterOp::ILike, json!("%al%"))];
        let pg = render_select(&users(), &cols(&["id"]), &filters, Page::new(1, 0), Dialect::Postgres).unwrap();
        let lite = render_select(&users(), &cols(&["id"]), &filters, Page::new(1, 0), Dialect::Sqlite).unwrap();
        assert!(pg.sql.contains("\"name\" ILIKE :p0"));
        assert!(lite.sql.contains("\"name\" LIKE :p0"));
    }

    #[test]
    fn unknown_and_wildcard_columns_are_refused() {
        let err = render_select(&users(), &cols(&["email"]), &[], Page::new(1, 0), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::UnknownColumn { ref column, .. } if column == "email"));

        let err = render_select(&users(), &cols(&["*"]), &[], Page::new(1, 0), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::UnknownColumn { .. }));

        let err = render_select(&users(), &cols(&["Name"]), &[], Page::new(1, 0), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::UnknownColumn { .. }));

        let filters = vec![FilterClause::eq("1invalid", 1)];
        let err = render_select(&users(), &cols(&["id"]), &filters, Page::new(1, 0), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::InvalidIdentifier(_)));
    }

    #[test]
    fn paging_and_projection_are_checked() {
        let schema = users();
        let err = render_select(&schema, &cols(&["id"]), &[], Page::new(0, 0), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::InvalidPaging(_)));
        let err = render_select(&schema, &cols(&["id"]), &[], Page::new(1, -1), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::InvalidPaging(_)));
        let err = render_select(&schema, &[], &[], Page::new(1, 0), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::EmptyProjection));
    }

    #[test]
    fn bad_filter_values_are_refused() {
        let filters = vec![FilterClause::new("id", FilterOp::In, json!([]))];
        let err = render_select(&users(), &cols(&["id"]), &filters, Page::new(1, 0), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::InvalidFilter(_)));

        let filters = vec![FilterClause::new("name", FilterOp::Is, json!("not null"))];
        let err = render_select(&users(), &cols(&["id"]), &filters, Page::new(1, 0), Dialect::Postgres).unwrap_err();
        assert!(matches!(err, BuildError::InvalidFilter(_)));
    }
}
