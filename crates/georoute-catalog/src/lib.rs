//! Georoute catalogs: the taxonomy that narrows a question down to one table,
//! and the column metadata of the physical tables themselves.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          CATALOG LAYER                             │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                                                                    │
//! │   Category (L1) ──edge──► Card (L2) ──edge──► Table (L3)           │
//! │        │                                         │                 │
//! │        └──────── TaxonomyCatalog (read-only) ────┘                 │
//! │                                                  │ physical_name   │
//! │                                                  ▼                 │
//! │                                    ┌──────────────────────────┐    │
//! │                                    │ SchemaCatalog            │    │
//! │                                    │ (single-flight cache)    │    │
//! │                                    └────────────┬─────────────┘    │
//! │                                                 │ introspect       │
//! │                                    ┌────────────▼─────────────┐    │
//! │                                    │ DataStore (external)     │    │
//! │                                    └──────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both catalogs are consulted per request and never mutated by the
//! resolution path. Content is produced by import tooling outside this crate.

pub mod model;
pub mod schema;
pub mod store;
pub mod taxonomy;

pub use model::{ColumnSchema, Level, MappingEdge, NodeId, TableDetail, TableSchema, TaxonomyNode};
pub use schema::{SchemaCatalog, SchemaError, DEFAULT_STORE_TIMEOUT};
pub use store::{blocking_call, DataStore, Params, Rows, StoreError};
pub use taxonomy::{
    CatalogError, CardBranch, CategoryBranch, NodeRecord, TableRecord, TaxonomyCatalog,
    TaxonomyFile, TaxonomySnapshot,
};
