//! Taxonomy tables kept next to the spatial data.

use super::SqliteStore;
use georoute_catalog::{
    CatalogError, MappingEdge, NodeRecord, TableRecord, TaxonomyFile, TaxonomySnapshot,
};
use rusqlite::{Connection, Row};

/// Layout of the catalog tables read by [`SqliteStore::load_taxonomy`].
///
/// List-valued columns hold a JSON array or a comma separated string.
pub const CATALOG_DDL: &str = "
CREATE TABLE IF NOT EXISTS l1_category (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    keywords TEXT,
    weight INTEGER NOT NULL DEFAULT 100,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS l2_card (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description_short TEXT,
    keywords TEXT,
    weight INTEGER NOT NULL DEFAULT 100,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS l3_table (
    id INTEGER PRIMARY KEY,
    table_name TEXT NOT NULL,
    display_name TEXT NOT NULL,
    summary TEXT,
    core_fields TEXT,
    keywords TEXT,
    use_cases TEXT,
    weight INTEGER NOT NULL DEFAULT 100,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS map_l1_l2 (
    l1_id INTEGER NOT NULL REFERENCES l1_category(id),
    l2_id INTEGER NOT NULL REFERENCES l2_card(id),
    weight INTEGER NOT NULL DEFAULT 100
);
CREATE TABLE IF NOT EXISTS map_l2_l3 (
    l2_id INTEGER NOT NULL REFERENCES l2_card(id),
    l3_id INTEGER NOT NULL REFERENCES l3_table(id),
    weight INTEGER NOT NULL DEFAULT 100
);
";

impl SqliteStore {
    /// Read the five catalog tables into a validated snapshot.
    pub fn load_taxonomy(&self) -> Result<TaxonomySnapshot, CatalogError> {
        let conn = self.conn.lock();
        let file = read_catalog(&conn).map_err(|err| CatalogError::Unavailable(err.to_string()))?;
        drop(conn);

        tracing::info!(
            categories = file.categories.len(),
            cards = file.cards.len(),
            tables = file.tables.len(),
            "loaded taxonomy tables"
        );
        TaxonomySnapshot::from_file(file)
    }
}

fn read_catalog(conn: &Connection) -> rusqlite::Result<TaxonomyFile> {
    Ok(TaxonomyFile {
        categories: collect(
            conn,
            "SELECT id, name, description, keywords, weight, active FROM l1_category",
            node_record,
        )?,
        cards: collect(
            conn,
            "SELECT id, name, description_short, keywords, weight, active FROM l2_card",
            node_record,
        )?,
        tables: collect(
            conn,
            "SELECT id, display_name, table_name, summary, core_fields, keywords, use_cases, weight, active FROM l3_table",
            |row| {
                Ok(TableRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    physical_name: row.get(2)?,
                    summary: row.get(3)?,
                    core_fields: list_column(row.get(4)?),
                    keywords: list_column(row.get(5)?),
                    use_cases: list_column(row.get(6)?),
                    weight: row.get(7)?,
                    active: row.get(8)?,
                })
            },
        )?,
        category_cards: collect(conn, "SELECT l1_id, l2_id, weight FROM map_l1_l2", edge)?,
        card_tables: collect(conn, "SELECT l2_id, l3_id, weight FROM map_l2_l3", edge)?,
    })
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], map)?;
    let collected = rows.collect::<rusqlite::Result<Vec<T>>>()?;
    Ok(collected)
}

fn node_record(row: &Row<'_>) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        keywords: list_column(row.get(3)?),
        weight: row.get(4)?,
        active: row.get(5)?,
    })
}

fn edge(row: &Row<'_>) -> rusqlite::Result<MappingEdge> {
    Ok(MappingEdge::weighted(row.get(0)?, row.get(1)?, row.get(2)?))
}

fn list_column(raw: Option<String>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    if let Ok(items) = serde_json::from_str::<Vec<String>>(&raw) {
        return items;
    }
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use georoute_catalog::TaxonomyCatalog;

    #[test]
    fn taxonomy_round_trips_through_catalog_tables() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.execute_batch(CATALOG_DDL).unwrap();
        store
            .execute_batch(
                "INSERT INTO l1_category (id, name, keywords, weight) VALUES (1, 'natural', '[\"lake\",\"river\"]', 120), (2, 'cultural', NULL, 100);
                 INSERT INTO l2_card (id, name, description_short, keywords) VALUES (10, 'waters', 'Lakes and rivers', 'lake, river');
                 INSERT INTO l3_table (id, table_name, display_name, core_fields, active) VALUES
                    (100, 'ne_10m_lakes', 'Lakes', 'name,scalerank', 1),
                    (101, 'ne_10m_lakes_old', 'Old lakes', NULL, 0);
                 INSERT INTO map_l1_l2 (l1_id, l2_id) VALUES (1, 10);
                 INSERT INTO map_l2_l3 (l2_id, l3_id, weight) VALUES (10, 100, 90), (10, 101, 100);",
            )
            .unwrap();

        let snapshot = store.load_taxonomy().unwrap();
        let cats = snapshot.top_categories().unwrap();
        assert_eq!(cats[0].name, "natural");
        assert_eq!(cats[0].keywords, vec!["lake", "river"]);

        let cards = snapshot.cards_for(&[1]).unwrap();
        assert_eq!(cards[0].keywords, vec!["lake", "river"]);

        let tables = snapshot.tables_for(&[10]).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].physical_name(), Some("ne_10m_lakes"));
        assert_eq!(
            tables[0].table.as_ref().unwrap().core_fields,
            vec!["name", "scalerank"]
        );
    }

    #[test]
    fn missing_catalog_tables_are_unavailable() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.load_taxonomy().unwrap_err();
        assert!(matches!(err, CatalogError::Unavailable(_)));
    }
}
