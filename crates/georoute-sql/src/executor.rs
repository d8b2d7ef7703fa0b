//! Statement execution with a single wildcard fallback.
//!
//! ```text
//! plan ──validate──► run ──ok──────────────────────────► rows (is_fallback = false)
//!                     │
//!                     └─statement error─► SELECT * ... ─► rows (is_fallback = true)
//!                                              │
//!                                              └─error──► Failed { fallback_attempted }
//! ```
//!
//! Connection failures and timeouts are reported as they are; only a
//! statement-level failure earns the retry.

use crate::error::ExecutionError;
use crate::scan;
use crate::validator;
use georoute_catalog::{blocking_call, DataStore, Params, Rows, StoreError, DEFAULT_STORE_TIMEOUT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// A statement ready to run, with the classifier's commentary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub sql: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl QueryPlan {
    pub fn new(sql: impl Into<String>, params: Params) -> Self {
        Self {
            sql: sql.into(),
            params,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// The statement that produced the rows.
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub is_fallback: bool,
}

impl ExecutionResult {
    fn new(sql: String, rows: Rows, is_fallback: bool) -> Self {
        Self {
            sql,
            row_count: rows.rows.len(),
            columns: rows.columns,
            rows: rows.rows,
            is_fallback,
        }
    }

    /// Rows as `{column: value}` objects.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| self.columns.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }

    pub fn to_feature_collection(&self, geom_field: &str) -> Value {
        feature_collection(&self.records(), geom_field)
    }
}

/// GeoJSON `FeatureCollection` with `geom_field` as each feature's geometry
/// and every other column as a property.
///
/// A geometry held as GeoJSON text (`ST_AsGeoJSON`) is embedded as an
/// object; anything else is passed through unchanged.
pub fn feature_collection(records: &[Map<String, Value>], geom_field: &str) -> Value {
    let features: Vec<Value> = records
        .iter()
        .map(|record| {
            let geometry = match record.get(geom_field) {
                Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                    Ok(parsed @ Value::Object(_)) => parsed,
                    _ => Value::String(text.clone()),
                },
                Some(other) => other.clone(),
                None => Value::Null,
            };
            let properties: Map<String, Value> = record
                .iter()
                .filter(|(column, _)| column.as_str() != geom_field)
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            json!({"type": "Feature", "geometry": geometry, "properties": properties})
        })
        .collect();
    json!({"type": "FeatureCollection", "features": features})
}

pub struct QueryExecutor {
    store: Arc<dyn DataStore>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate and run `plan`, retrying once as `SELECT *` when the store
    /// fails the statement itself.
    pub async fn execute(&self, plan: &QueryPlan) -> Result<ExecutionResult, ExecutionError> {
        validator::validate(&plan.sql)?;

        let detail = match self.run(&plan.sql, &plan.params).await {
            Ok(rows) => {
                tracing::debug!(rows = rows.len(), "statement executed");
                return Ok(ExecutionResult::new(plan.sql.clone(), rows, false));
            }
            Err(StoreError::Statement(detail)) => detail,
            Err(other) => return Err(other.into()),
        };

        let Some(fallback) = scan::wildcard_rewrite(&plan.sql) else {
            tracing::warn!(error = %detail, "statement failed; no wildcard fallback possible");
            return Err(ExecutionError::Failed {
                detail,
                fallback_attempted: false,
            });
        };
        validator::validate(&fallback)?;

        tracing::warn!(error = %detail, sql = %fallback, "statement failed; retrying with wildcard projection");
        match self.run(&fallback, &plan.params).await {
            Ok(rows) => {
                tracing::info!(rows = rows.len(), "wildcard fallback succeeded");
                Ok(ExecutionResult::new(fallback, rows, true))
            }
            Err(StoreError::Statement(detail)) => {
                tracing::warn!(error = %detail, "wildcard fallback failed");
                Err(ExecutionError::Failed {
                    detail,
                    fallback_attempted: true,
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn run(&self, sql: &str, params: &Params) -> Result<Rows, StoreError> {
        let sql = sql.to_string();
        let params = params.clone();
        blocking_call(&self.store, self.timeout, move |store| store.query(&sql, &params)).await
    }
}
