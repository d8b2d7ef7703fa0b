//! Catalog data model: taxonomy nodes, mapping edges and column metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a taxonomy node. Unique within one [`Level`].
pub type NodeId = i64;

/// Default weight for nodes and edges that do not declare one.
pub const DEFAULT_WEIGHT: i32 = 100;

// ============================================================================
// Taxonomy
// ============================================================================

/// The three taxonomy levels, broadest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Category,
    Card,
    Table,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Category => f.write_str("category"),
            Level::Card => f.write_str("card"),
            Level::Table => f.write_str("table"),
        }
    }
}

/// A node of the category → card → table taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub id: NodeId,
    pub level: Level,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub weight: i32,
    pub active: bool,
    /// Present exactly when `level == Level::Table`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableDetail>,
}

/// Extra attributes carried by table-level nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableDetail {
    /// Name of the physical table in the data store (unqualified).
    pub physical_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub core_fields: Vec<String>,
    #[serde(default)]
    pub use_cases: Vec<String>,
}

impl TaxonomyNode {
    fn new(id: NodeId, level: Level, name: impl Into<String>) -> Self {
        Self {
            id,
            level,
            name: name.into(),
            description: None,
            keywords: Vec::new(),
            weight: DEFAULT_WEIGHT,
            active: true,
            table: None,
        }
    }

    pub fn category(id: NodeId, name: impl Into<String>) -> Self {
        Self::new(id, Level::Category, name)
    }

    pub fn card(id: NodeId, name: impl Into<String>) -> Self {
        Self::new(id, Level::Card, name)
    }

    pub fn table(id: NodeId, name: impl Into<String>, physical_name: impl Into<String>) -> Self {
        let mut node = Self::new(id, Level::Table, name);
        node.table = Some(TableDetail {
            physical_name: physical_name.into(),
            ..TableDetail::default()
        });
        node
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_core_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(detail) = self.table.as_mut() {
            detail.core_fields = fields.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Mark the node as retired; retired nodes never appear as candidates.
    pub fn retired(mut self) -> Self {
        self.active = false;
        self
    }

    /// Physical table name for table-level nodes.
    pub fn physical_name(&self) -> Option<&str> {
        self.table.as_ref().map(|t| t.physical_name.as_str())
    }
}

/// Weighted parent → child edge (Category → Card or Card → Table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEdge {
    pub parent_id: NodeId,
    pub child_id: NodeId,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

impl MappingEdge {
    pub fn new(parent_id: NodeId, child_id: NodeId) -> Self {
        Self {
            parent_id,
            child_id,
            weight: DEFAULT_WEIGHT,
        }
    }

    pub fn weighted(parent_id: NodeId, child_id: NodeId, weight: i32) -> Self {
        Self {
            parent_id,
            child_id,
            weight,
        }
    }
}

pub(crate) fn default_weight() -> i32 {
    DEFAULT_WEIGHT
}

// ============================================================================
// Column metadata
// ============================================================================

/// Column description as reported by store introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srid: Option<i32>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            geometry_type: None,
            srid: None,
        }
    }

    pub fn geometry(name: impl Into<String>, geometry_type: impl Into<String>, srid: i32) -> Self {
        let geometry_type = geometry_type.into();
        Self {
            name: name.into(),
            data_type: "geometry".to_string(),
            nullable: true,
            geometry_type: Some(geometry_type),
            srid: Some(srid),
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn is_geometry(&self) -> bool {
        self.geometry_type.is_some()
    }

    /// Type label shown to the classifier, e.g. `Geometry(POLYGON,4326)`.
    pub fn display_type(&self) -> String {
        match (&self.geometry_type, self.srid) {
            (Some(kind), Some(srid)) => format!("Geometry({kind},{srid})"),
            (Some(kind), None) => format!("Geometry({kind})"),
            _ => self.data_type.clone(),
        }
    }
}

/// Immutable column snapshot of one physical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Qualified table name as it should appear after `FROM`.
    pub table: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn geometry_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter().filter(|c| c.is_geometry())
    }
}
