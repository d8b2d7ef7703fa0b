//! SQLite-backed [`DataStore`].
//!
//! Spatial tables live in an attached database whose alias plays the role of
//! the schema namespace (`ne_data.ne_10m_lakes`). Geometry columns are
//! recognised by declared type (`GEOMETRY`, `POINT`, `MULTIPOLYGON`, ...) or
//! by an entry in the namespace's `geometry_columns` table.

mod taxonomy;

pub use taxonomy::CATALOG_DDL;

use crate::builder::{is_identifier, quote_ident};
use georoute_catalog::{ColumnSchema, DataStore, Params, Rows, StoreError, TableSchema};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_SRID: i32 = 4326;

const GEOMETRY_TYPES: [&str; 8] = [
    "GEOMETRY",
    "POINT",
    "LINESTRING",
    "POLYGON",
    "MULTIPOINT",
    "MULTILINESTRING",
    "MULTIPOLYGON",
    "GEOMETRYCOLLECTION",
];

pub struct SqliteStore {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
    running: AtomicBool,
    namespace: Option<String>,
    default_srid: i32,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(classify)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an existing database file without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(path.as_ref(), flags).map_err(classify)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self {
            conn: Mutex::new(conn),
            interrupt,
            running: AtomicBool::new(false),
            namespace: None,
            default_srid: DEFAULT_SRID,
        }
    }

    /// Attach `path` (or a fresh in-memory database for `None`) under
    /// `alias` and use it as the namespace for introspection.
    pub fn attach(mut self, alias: &str, path: Option<&Path>) -> Result<Self, StoreError> {
        let quoted = quote_ident(alias).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let target = path
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ":memory:".to_string());
        self.conn
            .lock()
            .execute(&format!("ATTACH DATABASE ?1 AS {quoted}"), [target])
            .map_err(classify)?;
        tracing::debug!(alias, "attached namespace database");
        self.namespace = Some(alias.to_string());
        Ok(self)
    }

    pub fn with_default_srid(mut self, srid: i32) -> Self {
        self.default_srid = srid;
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Run a batch of statements outside the read-only gate. Fixture and
    /// import tooling only.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.lock().execute_batch(sql).map_err(classify)
    }

    fn qualified(&self, table: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{table}"),
            None => table.to_string(),
        }
    }

    fn schema_prefix(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("\"{ns}\"."),
            None => String::new(),
        }
    }

    /// `(column, srid)` pairs registered in `geometry_columns`, if that table exists.
    fn registered_geometry(&self, conn: &Connection, table: &str) -> HashMap<String, Option<i32>> {
        let sql = format!(
            "SELECT f_geometry_column, srid FROM {}geometry_columns WHERE lower(f_table_name) = lower(?1)",
            self.schema_prefix()
        );
        let lookup = || -> rusqlite::Result<HashMap<String, Option<i32>>> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i32>>(1)?)))?;
            let registered = rows
                .map(|r| r.map(|(col, srid)| (col.to_ascii_lowercase(), srid)))
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            Ok(registered)
        };
        lookup().unwrap_or_default()
    }
}

impl DataStore for SqliteStore {
    fn query(&self, sql: &str, params: &Params) -> Result<Rows, StoreError> {
        let conn = self.conn.lock();
        let _running = Running::enter(&self.running);
        let mut stmt = conn.prepare(sql).map_err(classify)?;

        for (name, value) in params {
            let index = stmt.parameter_index(&format!(":{name}")).map_err(classify)?;
            if let Some(index) = index {
                stmt.raw_bind_parameter(index, to_sql(value)).map_err(classify)?;
            }
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let width = columns.len();
        let mut out = Vec::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(classify)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i).map_err(classify)?));
            }
            out.push(values);
        }
        Ok(Rows { columns, rows: out })
    }

    fn introspect(&self, table: &str) -> Result<TableSchema, StoreError> {
        let qualified = self.qualified(table);
        if !is_identifier(table) {
            return Ok(TableSchema::new(qualified, Vec::new()));
        }

        let conn = self.conn.lock();
        let _running = Running::enter(&self.running);
        let pragma = format!("PRAGMA {}table_info(\"{table}\")", self.schema_prefix());
        let mut stmt = conn.prepare(&pragma).map_err(classify)?;
        let declared = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    row.get::<_, i64>(3)? != 0,
                ))
            })
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        drop(stmt);

        let registered = if declared.is_empty() {
            HashMap::new()
        } else {
            self.registered_geometry(&conn, table)
        };

        let columns = declared
            .into_iter()
            .map(|(name, data_type, not_null)| {
                let upper = data_type.trim().to_ascii_uppercase();
                let geometry_kind = GEOMETRY_TYPES.contains(&upper.as_str()).then(|| upper.clone());
                let registered_srid = registered.get(&name.to_ascii_lowercase());

                let column = match (geometry_kind, registered_srid) {
                    (Some(kind), srid) => {
                        ColumnSchema::geometry(name, kind, srid.copied().flatten().unwrap_or(self.default_srid))
                    }
                    (None, Some(srid)) => {
                        ColumnSchema::geometry(name, "GEOMETRY", srid.unwrap_or(self.default_srid))
                    }
                    (None, None) => ColumnSchema::new(name, data_type.to_ascii_lowercase()),
                };
                if not_null {
                    column.not_null()
                } else {
                    column
                }
            })
            .collect();

        Ok(TableSchema::new(qualified, columns))
    }

    /// No-op while the connection is idle, so a worker that finished just
    /// before its deadline does not leave an interrupt behind.
    fn interrupt(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.interrupt.interrupt();
        } else {
            tracing::debug!("interrupt skipped; no statement running");
        }
    }
}

/// Marks the connection busy while a statement runs. Taken after the
/// connection lock, dropped before it.
struct Running<'a>(&'a AtomicBool);

impl<'a> Running<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::PermissionDenied
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::OutOfMemory => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Statement(err.to_string()),
        },
        _ => StoreError::Statement(err.to_string()),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory()
            .unwrap()
            .attach("ne_data", None)
            .unwrap();
        store
            .execute_batch(
                "CREATE TABLE ne_data.ne_10m_lakes (gid INTEGER NOT NULL, name TEXT, scalerank INTEGER, geom MULTIPOLYGON);
                 INSERT INTO ne_data.ne_10m_lakes VALUES (1, 'Superior', 0, X'0102'), (2, 'Victoria', 0, NULL), (3, 'Tahoe', 5, NULL);",
            )
            .unwrap();
        store
    }

    #[test]
    fn idle_interrupt_does_not_abort_the_next_statement() {
        let store = store();
        store.interrupt();
        let rows = store.query("SELECT count(*) AS n FROM ne_data.ne_10m_lakes", &Params::new()).unwrap();
        assert_eq!(rows.rows[0][0], json!(3));
        assert!(!store.running.load(Ordering::SeqCst));
    }

    #[test]
    fn introspection_reports_geometry_columns() {
        let schema = store().introspect("ne_10m_lakes").unwrap();
        assert_eq!(schema.table, "ne_data.ne_10m_lakes");
        assert_eq!(schema.column_names().collect::<Vec<_>>(), vec!["gid", "name", "scalerank", "geom"]);

        let gid = schema.column("gid").unwrap();
        assert!(!gid.nullable);
        let geom = schema.column("geom").unwrap();
        assert_eq!(geom.display_type(), "Geometry(MULTIPOLYGON,4326)");
    }

    #[test]
    fn geometry_columns_registry_supplies_srid() {
        let store = store();
        store
            .execute_batch(
                "CREATE TABLE ne_data.geometry_columns (f_table_name TEXT, f_geometry_column TEXT, srid INTEGER);
                 CREATE TABLE ne_data.rivers (gid INTEGER, shape BLOB);
                 INSERT INTO ne_data.geometry_columns VALUES ('rivers', 'shape', 3857);",
            )
            .unwrap();
        let schema = store.introspect("rivers").unwrap();
        assert_eq!(schema.column("shape").unwrap().display_type(), "Geometry(GEOMETRY,3857)");
        assert!(!schema.column("gid").unwrap().is_geometry());
    }

    #[test]
    fn missing_and_malformed_tables_have_no_columns() {
        let store = store();
        assert!(store.introspect("nope").unwrap().columns.is_empty());
        assert!(store.introspect("x\"; DROP TABLE y; --").unwrap().columns.is_empty());
    }

    #[test]
    fn queries_bind_only_referenced_parameters() {
        let store = store();
        let mut params = Params::new();
        params.insert("p0".into(), json!(0));
        params.insert("_limit".into(), json!(10));
        params.insert("_offset".into(), json!(0));
        params.insert("unused".into(), json!("ignored"));

        let rows = store
            .query(
                "SELECT gid, name, geom FROM ne_data.ne_10m_lakes WHERE scalerank = :p0 ORDER BY gid LIMIT :_limit OFFSET :_offset",
                &params,
            )
            .unwrap();
        assert_eq!(rows.columns, vec!["gid", "name", "geom"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.rows[0], vec![json!(1), json!("Superior"), json!("0102")]);
        assert_eq!(rows.rows[1][2], Value::Null);
    }

    #[test]
    fn bad_statements_are_statement_errors() {
        let err = store()
            .query("SELECT nonexistent FROM ne_data.ne_10m_lakes", &Params::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Statement(_)));
    }
}
