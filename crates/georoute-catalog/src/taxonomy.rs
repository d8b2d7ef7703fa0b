//! Taxonomy catalog: read-only access to categories, cards and tables.
//!
//! The catalog is a snapshot loaded at startup, either from a JSON catalog
//! file ([`TaxonomyFile`]) or from the catalog tables of the data store. The
//! allowed table set is therefore data, never a compiled list.

use crate::model::{default_weight, Level, MappingEdge, NodeId, TableDetail, TaxonomyNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The catalog itself cannot be reached. Empty results are never errors.
    #[error("taxonomy catalog unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate {level} id {id}")]
    DuplicateNode { level: Level, id: NodeId },
    #[error("duplicate {level} edge {parent_id} -> {child_id}")]
    DuplicateEdge {
        level: Level,
        parent_id: NodeId,
        child_id: NodeId,
    },
    #[error("{level} edge {parent_id} -> {child_id} references an unknown node")]
    DanglingEdge {
        level: Level,
        parent_id: NodeId,
        child_id: NodeId,
    },
    #[error("invalid taxonomy node: {0}")]
    InvalidNode(String),
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// Catalog trait
// ============================================================================

/// Read-only view of the taxonomy used by the resolver.
///
/// All listing operations return active nodes only, ordered by weight
/// (descending) and then name (ascending). An empty list is a valid answer.
pub trait TaxonomyCatalog: Send + Sync {
    /// Active top-level categories.
    fn top_categories(&self) -> Result<Vec<TaxonomyNode>, CatalogError>;

    /// Active cards reachable from any of `category_ids`, de-duplicated.
    /// Ordered by edge weight, then node weight, then name.
    fn cards_for(&self, category_ids: &[NodeId]) -> Result<Vec<TaxonomyNode>, CatalogError>;

    /// Active tables reachable from any of `card_ids`, de-duplicated.
    fn tables_for(&self, card_ids: &[NodeId]) -> Result<Vec<TaxonomyNode>, CatalogError>;

    /// Look up a single table node by id (active or not).
    fn table(&self, id: NodeId) -> Result<Option<TaxonomyNode>, CatalogError>;

    /// Full category → card → table tree built from the three listing calls.
    fn hierarchy(&self) -> Result<Vec<CategoryBranch>, CatalogError> {
        let mut out = Vec::new();
        for category in self.top_categories()? {
            let mut cards = Vec::new();
            for card in self.cards_for(&[category.id])? {
                let tables = self.tables_for(&[card.id])?;
                cards.push(CardBranch { card, tables });
            }
            out.push(CategoryBranch { category, cards });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryBranch {
    pub category: TaxonomyNode,
    pub cards: Vec<CardBranch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardBranch {
    pub card: TaxonomyNode,
    pub tables: Vec<TaxonomyNode>,
}

// ============================================================================
// Catalog file format
// ============================================================================

/// On-disk catalog, as written by the import tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxonomyFile {
    #[serde(default)]
    pub categories: Vec<NodeRecord>,
    #[serde(default)]
    pub cards: Vec<NodeRecord>,
    #[serde(default)]
    pub tables: Vec<TableRecord>,
    #[serde(default)]
    pub category_cards: Vec<MappingEdge>,
    #[serde(default)]
    pub card_tables: Vec<MappingEdge>,
}

/// Category or card row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    #[serde(default, alias = "description_short")]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Table row; `physical_name` is the store-side table name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    pub id: NodeId,
    #[serde(alias = "display_name")]
    pub name: String,
    #[serde(alias = "table_name")]
    pub physical_name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub core_fields: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub use_cases: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl NodeRecord {
    fn into_node(self, level: Level) -> TaxonomyNode {
        TaxonomyNode {
            id: self.id,
            level,
            name: self.name,
            description: self.description,
            keywords: self.keywords,
            weight: self.weight,
            active: self.active,
            table: None,
        }
    }
}

impl TableRecord {
    fn into_node(self) -> TaxonomyNode {
        TaxonomyNode {
            id: self.id,
            level: Level::Table,
            name: self.name,
            description: None,
            keywords: self.keywords,
            weight: self.weight,
            active: self.active,
            table: Some(TableDetail {
                physical_name: self.physical_name,
                summary: self.summary,
                core_fields: self.core_fields,
                use_cases: self.use_cases,
            }),
        }
    }
}

// ============================================================================
// In-memory snapshot
// ============================================================================

/// Immutable, validated in-memory taxonomy.
#[derive(Debug, Clone, Default)]
pub struct TaxonomySnapshot {
    categories: BTreeMap<NodeId, TaxonomyNode>,
    cards: BTreeMap<NodeId, TaxonomyNode>,
    tables: BTreeMap<NodeId, TaxonomyNode>,
    /// Category → card edges keyed by category id.
    category_cards: BTreeMap<NodeId, Vec<MappingEdge>>,
    /// Card → table edges keyed by card id.
    card_tables: BTreeMap<NodeId, Vec<MappingEdge>>,
}

impl TaxonomySnapshot {
    /// Build a snapshot, rejecting duplicate ids, duplicate edges, edges to
    /// unknown nodes and table nodes without a physical name.
    pub fn new(
        nodes: Vec<TaxonomyNode>,
        category_cards: Vec<MappingEdge>,
        card_tables: Vec<MappingEdge>,
    ) -> Result<Self, CatalogError> {
        let mut snapshot = Self::default();

        for node in nodes {
            if node.level == Level::Table {
                let has_name = node
                    .physical_name()
                    .is_some_and(|name| !name.trim().is_empty());
                if !has_name {
                    return Err(CatalogError::InvalidNode(format!(
                        "table node {} ({}) has no physical table name",
                        node.id, node.name
                    )));
                }
            } else if node.table.is_some() {
                return Err(CatalogError::InvalidNode(format!(
                    "{} node {} carries table attributes",
                    node.level, node.id
                )));
            }

            let level = node.level;
            let id = node.id;
            let slot = match level {
                Level::Category => &mut snapshot.categories,
                Level::Card => &mut snapshot.cards,
                Level::Table => &mut snapshot.tables,
            };
            if slot.insert(id, node).is_some() {
                return Err(CatalogError::DuplicateNode { level, id });
            }
        }

        snapshot.category_cards = index_edges(
            Level::Card,
            category_cards,
            &snapshot.categories,
            &snapshot.cards,
        )?;
        snapshot.card_tables =
            index_edges(Level::Table, card_tables, &snapshot.cards, &snapshot.tables)?;

        tracing::debug!(
            categories = snapshot.categories.len(),
            cards = snapshot.cards.len(),
            tables = snapshot.tables.len(),
            "taxonomy snapshot loaded"
        );
        Ok(snapshot)
    }

    pub fn from_file(file: TaxonomyFile) -> Result<Self, CatalogError> {
        let mut nodes = Vec::with_capacity(file.categories.len() + file.cards.len() + file.tables.len());
        nodes.extend(file.categories.into_iter().map(|r| r.into_node(Level::Category)));
        nodes.extend(file.cards.into_iter().map(|r| r.into_node(Level::Card)));
        nodes.extend(file.tables.into_iter().map(TableRecord::into_node));
        Self::new(nodes, file.category_cards, file.card_tables)
    }

    pub fn from_json_str(text: &str) -> Result<Self, CatalogError> {
        let file: TaxonomyFile = serde_json::from_str(text)?;
        Self::from_file(file)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Number of active table nodes.
    pub fn active_table_count(&self) -> usize {
        self.tables.values().filter(|t| t.active).count()
    }

    /// All active tables, weight desc then name asc.
    pub fn all_tables(&self) -> Vec<TaxonomyNode> {
        sorted_active(self.tables.values())
    }

    /// Keyword search over active tables: substring match on name or summary,
    /// exact match on keywords and use cases. Name matches come first.
    pub fn search_tables(&self, keyword: &str) -> Vec<TaxonomyNode> {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<(u8, &TaxonomyNode)> = self
            .tables
            .values()
            .filter(|t| t.active)
            .filter_map(|t| {
                let name_hit = t.name.to_lowercase().contains(&needle);
                let detail = t.table.as_ref();
                let summary_hit = detail
                    .and_then(|d| d.summary.as_deref())
                    .is_some_and(|s| s.to_lowercase().contains(&needle));
                let tag_hit = t.keywords.iter().any(|k| k.eq_ignore_ascii_case(&needle))
                    || detail.is_some_and(|d| d.use_cases.iter().any(|u| u.eq_ignore_ascii_case(&needle)));
                match (name_hit, summary_hit || tag_hit) {
                    (true, _) => Some((0, t)),
                    (false, true) => Some((1, t)),
                    (false, false) => None,
                }
            })
            .collect();

        hits.sort_by(|(ra, a), (rb, b)| ra.cmp(rb).then_with(|| a.name.cmp(&b.name)));
        hits.into_iter().map(|(_, t)| t.clone()).collect()
    }
}

impl TaxonomyCatalog for TaxonomySnapshot {
    fn top_categories(&self) -> Result<Vec<TaxonomyNode>, CatalogError> {
        Ok(sorted_active(self.categories.values()))
    }

    fn cards_for(&self, category_ids: &[NodeId]) -> Result<Vec<TaxonomyNode>, CatalogError> {
        Ok(reachable(
            &self.category_cards,
            &self.categories,
            &self.cards,
            category_ids,
        ))
    }

    fn tables_for(&self, card_ids: &[NodeId]) -> Result<Vec<TaxonomyNode>, CatalogError> {
        Ok(reachable(&self.card_tables, &self.cards, &self.tables, card_ids))
    }

    fn table(&self, id: NodeId) -> Result<Option<TaxonomyNode>, CatalogError> {
        Ok(self.tables.get(&id).cloned())
    }
}

fn index_edges(
    child_level: Level,
    edges: Vec<MappingEdge>,
    parents: &BTreeMap<NodeId, TaxonomyNode>,
    children: &BTreeMap<NodeId, TaxonomyNode>,
) -> Result<BTreeMap<NodeId, Vec<MappingEdge>>, CatalogError> {
    let mut seen = BTreeSet::new();
    let mut by_parent: BTreeMap<NodeId, Vec<MappingEdge>> = BTreeMap::new();

    for edge in edges {
        if !parents.contains_key(&edge.parent_id) || !children.contains_key(&edge.child_id) {
            return Err(CatalogError::DanglingEdge {
                level: child_level,
                parent_id: edge.parent_id,
                child_id: edge.child_id,
            });
        }
        if !seen.insert((edge.parent_id, edge.child_id)) {
            return Err(CatalogError::DuplicateEdge {
                level: child_level,
                parent_id: edge.parent_id,
                child_id: edge.child_id,
            });
        }
        by_parent.entry(edge.parent_id).or_default().push(edge);
    }

    Ok(by_parent)
}

fn sorted_active<'a>(nodes: impl Iterator<Item = &'a TaxonomyNode>) -> Vec<TaxonomyNode> {
    let mut out: Vec<TaxonomyNode> = nodes.filter(|n| n.active).cloned().collect();
    out.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

/// Children of the given active parents. A child reachable through several
/// parents keeps its heaviest edge.
fn reachable(
    edges: &BTreeMap<NodeId, Vec<MappingEdge>>,
    parents: &BTreeMap<NodeId, TaxonomyNode>,
    children: &BTreeMap<NodeId, TaxonomyNode>,
    parent_ids: &[NodeId],
) -> Vec<TaxonomyNode> {
    let mut best: BTreeMap<NodeId, i32> = BTreeMap::new();

    for parent_id in parent_ids {
        if !parents.get(parent_id).is_some_and(|p| p.active) {
            continue;
        }
        for edge in edges.get(parent_id).into_iter().flatten() {
            if !children.get(&edge.child_id).is_some_and(|c| c.active) {
                continue;
            }
            best.entry(edge.child_id)
                .and_modify(|w| *w = (*w).max(edge.weight))
                .or_insert(edge.weight);
        }
    }

    let mut out: Vec<(i32, &TaxonomyNode)> = best
        .into_iter()
        .filter_map(|(id, weight)| children.get(&id).map(|node| (weight, node)))
        .collect();
    out.sort_by(|(wa, a), (wb, b)| {
        wb.cmp(wa)
            .then_with(|| b.weight.cmp(&a.weight))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    });
    out.into_iter().map(|(_, node)| node.clone()).collect()
}
