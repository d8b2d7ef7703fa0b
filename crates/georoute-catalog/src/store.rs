//! Data store seam shared by schema introspection and query execution.

use crate::model::TableSchema;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Named statement parameters (`:name` placeholders, without the colon).
pub type Params = BTreeMap<String, Value>;

/// Result set of one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as `{column: value}` objects.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<serde_json::Map<_, _>>()
            })
            .collect()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Connection-level failure; the statement never ran.
    #[error("data store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected or failed the statement itself.
    #[error("statement failed: {0}")]
    Statement(String),
    #[error("data store call timed out after {0:?}")]
    Timeout(Duration),
}

/// External relational/spatial store.
///
/// Calls are synchronous; async callers go through [`blocking_call`].
pub trait DataStore: Send + Sync {
    /// Run one statement with named parameters. Parameters the statement does
    /// not reference are ignored.
    fn query(&self, sql: &str, params: &Params) -> Result<Rows, StoreError>;

    /// Column metadata of `table` (unqualified physical name). A table that
    /// does not exist yields an empty column list.
    fn introspect(&self, table: &str) -> Result<TableSchema, StoreError>;

    /// Ask the store to abort whatever statement is currently running.
    ///
    /// Stores shared between runs cannot tell whose statement that is: if a
    /// timed-out worker finishes and another run starts a statement before
    /// the interrupt lands, the other run's statement is aborted and fails
    /// as a statement error. Implementations should at least skip the
    /// interrupt when idle.
    fn interrupt(&self) {}
}

/// Run a store call on the blocking pool, bounded by `timeout`.
///
/// On expiry the store is interrupted (unless the worker has just finished)
/// and [`StoreError::Timeout`] returned; the worker thread finishes on its own.
pub async fn blocking_call<T, F>(
    store: &Arc<dyn DataStore>,
    timeout: Duration,
    call: F,
) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn DataStore) -> Result<T, StoreError> + Send + 'static,
{
    let worker = Arc::clone(store);
    let mut handle = tokio::task::spawn_blocking(move || call(worker.as_ref()));

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(StoreError::Unavailable(format!(
            "store worker failed: {join_err}"
        ))),
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "store call timed out");
            if !handle.is_finished() {
                store.interrupt();
            }
            Err(StoreError::Timeout(timeout))
        }
    }
}
