//! Statement layer tests
//!
//! 1. Builder properties: injected identifiers never reach SQL text, filter
//!    count matches WHERE conditions and parameters
//! 2. Validator properties: forbidden keywords, stacked statements
//! 3. Builder + executor against SQLite, including the wildcard fallback

use georoute_catalog::{ColumnSchema, Params, SchemaCatalog, TableSchema};
use georoute_sql::*;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn lakes_schema() -> TableSchema {
    TableSchema::new(
        "ne_data.ne_10m_lakes",
        vec![
            ColumnSchema::new("gid", "integer"),
            ColumnSchema::new("name", "text"),
            ColumnSchema::new("scalerank", "integer"),
            ColumnSchema::new("featurecla", "text"),
            ColumnSchema::geometry("geom", "MULTIPOLYGON", 4326),
        ],
    )
}

const COLUMNS: [&str; 5] = ["gid", "name", "scalerank", "featurecla", "geom"];

// ============================================================================
// Builder properties
// ============================================================================

proptest! {
    #[test]
    fn prop_hostile_identifiers_are_refused(name in "[a-z_]{0,6}[^A-Za-z0-9_][ -~]{0,8}") {
        let columns = vec![name.clone()];
        let result = render_select(&lakes_schema(), &columns, &[], Page::new(10, 0), Dialect::Postgres);
        prop_assert!(result.is_err());

        let filters = vec![FilterClause::eq(name, 1)];
        let result = render_select(&lakes_schema(), &["gid".to_string()], &filters, Page::new(10, 0), Dialect::Postgres);
        prop_assert!(result.is_err());
    }

    #[test]
    fn prop_equality_filters_become_and_conditions(
        picks in proptest::sample::subsequence(COLUMNS.to_vec(), 0..=COLUMNS.len()),
        value in any::<i64>(),
    ) {
        let filters: Vec<FilterClause> = picks.iter().map(|c| FilterClause::eq(*c, value)).collect();
        let built = render_select(&lakes_schema(), &["gid".to_string()], &filters, Page::new(25, 5), Dialect::Postgres)
            .unwrap();

        prop_assert_eq!(built.params.len(), filters.len() + 2);
        prop_assert_eq!(built.params.get(LIMIT_PARAM), Some(&json!(25)));
        prop_assert_eq!(built.params.get(OFFSET_PARAM), Some(&json!(5)));

        if filters.is_empty() {
            prop_assert!(!built.sql.contains(" WHERE "));
        } else {
            let where_clause = built.sql
                .split(" WHERE ")
                .nth(1)
                .and_then(|rest| rest.split(" LIMIT ").next())
                .unwrap()
                .to_string();
            prop_assert_eq!(where_clause.split(" AND ").count(), filters.len());
        }
        prop_assert!(validate(&built.sql).is_ok());
    }

    #[test]
    fn prop_forbidden_keywords_are_rejected(
        idx in 0..FORBIDDEN_KEYWORDS.len(),
        upper in any::<bool>(),
    ) {
        let keyword = if upper {
            FORBIDDEN_KEYWORDS[idx].to_uppercase()
        } else {
            FORBIDDEN_KEYWORDS[idx].to_string()
        };
        let sql = format!("SELECT gid FROM lakes WHERE x IN ({keyword} y)");
        prop_assert!(matches!(validate(&sql), Err(SqlRejected::ForbiddenKeyword(_))));
    }

    #[test]
    fn prop_semicolons_are_rejected(prefix in "[a-z ]{0,10}", suffix in "[a-z ]{0,10}") {
        let sql = format!("SELECT {prefix};{suffix}");
        prop_assert_eq!(validate(&sql), Err(SqlRejected::MultipleStatements));
    }
}

// ============================================================================
// SQLite end to end
// ============================================================================

fn lakes_store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory()
        .unwrap()
        .attach("ne_data", None)
        .unwrap();
    store
        .execute_batch(
            "CREATE TABLE ne_data.ne_10m_lakes (gid INTEGER, name TEXT, scalerank INTEGER, featurecla TEXT, geom MULTIPOLYGON);
             INSERT INTO ne_data.ne_10m_lakes VALUES
                (1, 'Superior', 0, 'Lake', NULL),
                (2, 'Victoria', 0, 'Lake', NULL),
                (3, 'Kariba', 3, 'Reservoir', NULL),
                (4, 'Tahoe', 7, 'Lake', NULL);",
        )
        .unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn test_builder_and_executor_against_sqlite() {
    let store = lakes_store();
    let schemas = Arc::new(SchemaCatalog::new(store.clone()));
    let builder = QueryBuilder::new(schemas).with_dialect(Dialect::Sqlite);

    let filters = filters_from_json(&json!({
        "featurecla": ["Lake", "Reservoir"],
        "scalerank": {"op": "<=", "value": 3},
        "name": {"op": "ilike", "value": "%R%"}
    }))
    .unwrap();
    let columns = vec!["gid".to_string(), "name".to_string(), "geom".to_string()];
    let built = builder
        .build_select("ne_10m_lakes", &columns, &filters, Page::new(10, 0))
        .await
        .unwrap();
    assert!(built.sql.starts_with("SELECT \"gid\", \"name\", \"geom\" FROM \"ne_data\".\"ne_10m_lakes\" WHERE "));

    let executor = QueryExecutor::new(store);
    let result = executor
        .execute(&QueryPlan::new(built.sql, built.params))
        .await
        .unwrap();
    assert!(!result.is_fallback);
    assert_eq!(result.columns, vec!["gid", "name", "geom"]);
    let mut names: Vec<String> = result
        .records()
        .iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["Kariba", "Superior", "Victoria"]);
}

#[tokio::test]
async fn test_builder_rejects_unknown_table_and_column() {
    let schemas = Arc::new(SchemaCatalog::new(lakes_store()));
    let builder = QueryBuilder::new(schemas);

    let err = builder
        .build_select("ne_10m_rivers", &["gid".to_string()], &[], Page::new(10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::UnknownTable(ref t) if t == "ne_10m_rivers"));

    let err = builder
        .build_select("ne_10m_lakes", &["depth".to_string()], &[], Page::new(10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::UnknownColumn { ref column, .. } if column == "depth"));

    let err = builder
        .build_select("lakes; drop", &["gid".to_string()], &[], Page::new(10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::InvalidIdentifier(_)));
}

#[tokio::test]
async fn test_wildcard_fallback_against_sqlite() {
    let executor = QueryExecutor::new(lakes_store());
    let mut params = Params::new();
    params.insert("_limit".into(), json!(2));
    params.insert("_offset".into(), json!(0));

    let plan = QueryPlan::new(
        "SELECT gid, nonexistent FROM ne_data.ne_10m_lakes LIMIT :_limit OFFSET :_offset",
        params.clone(),
    );
    let result = executor.execute(&plan).await.unwrap();
    assert!(result.is_fallback);
    assert_eq!(result.sql, "SELECT * FROM ne_data.ne_10m_lakes LIMIT :_limit OFFSET :_offset");
    assert_eq!(result.row_count, 2);
    assert_eq!(result.columns.len(), 5);

    let plan = QueryPlan::new(
        "SELECT gid FROM ne_data.no_such_table LIMIT :_limit OFFSET :_offset",
        params,
    );
    let err = executor.execute(&plan).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Failed { fallback_attempted: true, .. }));
}
