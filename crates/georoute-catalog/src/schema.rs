//! Schema catalog: per-table column metadata with single-flight caching.
//!
//! The first lookup of a table introspects the store; every concurrent
//! lookup of the same table waits on that one call and observes the same
//! outcome, error included. Failed lookups are not cached: once the failed
//! flight has landed, the next lookup starts a fresh one.

use crate::model::TableSchema;
use crate::store::{blocking_call, DataStore, StoreError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    #[error("schema introspection unavailable: {0}")]
    Unavailable(String),
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("schema introspection timed out after {0:?}")]
    Timeout(Duration),
}

impl From<StoreError> for SchemaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) | StoreError::Statement(msg) => SchemaError::Unavailable(msg),
            StoreError::Timeout(after) => SchemaError::Timeout(after),
        }
    }
}

type Outcome = Result<Arc<TableSchema>, SchemaError>;

enum Slot {
    Ready(Arc<TableSchema>),
    /// One introspection in flight; waiters subscribe to its outcome.
    Pending {
        flight: u64,
        outcome: watch::Receiver<Option<Outcome>>,
    },
}

enum Step {
    Wait(watch::Receiver<Option<Outcome>>),
    Lead(u64, watch::Sender<Option<Outcome>>),
}

pub struct SchemaCatalog {
    store: Arc<dyn DataStore>,
    slots: DashMap<String, Slot>,
    flights: AtomicU64,
    timeout: Duration,
}

impl SchemaCatalog {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            slots: DashMap::new(),
            flights: AtomicU64::new(0),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Columns of `table` (unqualified physical name).
    pub async fn columns_of(&self, table: &str) -> Result<Arc<TableSchema>, SchemaError> {
        loop {
            let step = match self.slots.entry(table.to_string()) {
                Entry::Occupied(slot) => match slot.get() {
                    Slot::Ready(schema) => {
                        tracing::trace!(table, "schema cache hit");
                        return Ok(Arc::clone(schema));
                    }
                    Slot::Pending { outcome, .. } => Step::Wait(outcome.clone()),
                },
                Entry::Vacant(vacant) => {
                    let flight = self.flights.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(Slot::Pending { flight, outcome: rx });
                    Step::Lead(flight, tx)
                }
            };

            match step {
                Step::Lead(flight, tx) => return self.lead(table, flight, tx).await,
                Step::Wait(rx) => match wait_for(rx).await {
                    Some(outcome) => return outcome,
                    // The leading caller was dropped mid-flight; start over.
                    None => continue,
                },
            }
        }
    }

    /// Cached schema, without touching the store.
    pub fn cached(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.slots.get(table).and_then(|slot| match slot.value() {
            Slot::Ready(schema) => Some(Arc::clone(schema)),
            Slot::Pending { .. } => None,
        })
    }

    /// Drop one cached entry. Administrative tooling only.
    pub fn invalidate(&self, table: &str) {
        if self.slots.remove(table).is_some() {
            tracing::info!(table, "schema cache entry invalidated");
        }
    }

    /// Drop every cached entry. Administrative tooling only.
    pub fn invalidate_all(&self) {
        let count = self.slots.len();
        self.slots.clear();
        tracing::info!(entries = count, "schema cache cleared");
    }

    async fn lead(&self, table: &str, flight: u64, tx: watch::Sender<Option<Outcome>>) -> Outcome {
        let mut guard = FlightGuard {
            slots: &self.slots,
            table,
            flight,
            landed: false,
        };
        let outcome = self.introspect(table).await;
        guard.landed = true;

        match &outcome {
            Ok(schema) => {
                if let Some(mut slot) = self.slots.get_mut(table) {
                    if is_flight(&slot, flight) {
                        *slot = Slot::Ready(Arc::clone(schema));
                    }
                }
            }
            Err(_) => {
                self.slots.remove_if(table, |_, slot| is_flight(slot, flight));
            }
        }
        tx.send_replace(Some(outcome.clone()));
        outcome
    }

    async fn introspect(&self, table: &str) -> Outcome {
        tracing::debug!(table, "introspecting table schema");
        let name = table.to_string();
        let schema = blocking_call(&self.store, self.timeout, move |store| store.introspect(&name))
            .await
            .map_err(|err| {
                tracing::warn!(table, error = %err, "schema introspection failed");
                SchemaError::from(err)
            })?;

        if schema.columns.is_empty() {
            return Err(SchemaError::UnknownTable(table.to_string()));
        }
        Ok(Arc::new(schema))
    }
}

fn is_flight(slot: &Slot, flight: u64) -> bool {
    matches!(slot, Slot::Pending { flight: current, .. } if *current == flight)
}

/// `None` when the leader went away without an outcome.
async fn wait_for(mut rx: watch::Receiver<Option<Outcome>>) -> Option<Outcome> {
    loop {
        let current = rx.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

/// Clears the pending slot if the leading future is dropped before landing.
struct FlightGuard<'a> {
    slots: &'a DashMap<String, Slot>,
    table: &'a str,
    flight: u64,
    landed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.landed {
            let flight = self.flight;
            self.slots.remove_if(self.table, |_, slot| is_flight(slot, flight));
        }
    }
}
