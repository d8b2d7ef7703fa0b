//! Stage prompts for LLM-backed classification.

use crate::classifier::{ClassifyRequest, Stage, StagePayload};
use georoute_catalog::{TableSchema, TaxonomyNode};
use serde_json::{json, Value};

const CATEGORY_SYSTEM: &str = r#"You route a user question into a three-level taxonomy of geospatial tables.
Select the one or two top-level categories that best match the intent of the question.
Return only JSON with exactly two keys:
- "selected": an array of objects with keys "id" and "name", taken from the candidates
- "reasons": an array of short strings, one per selected category
Example:
{"selected": [{"id": 1, "name": "natural"}], "reasons": ["The question is about physical geography."]}"#;

const CARD_SYSTEM: &str = r#"You continue routing a user question through a three-level taxonomy of geospatial tables.
From the candidate overview cards, select the one or two that best match the intent.
Return only JSON with exactly two keys:
- "selected": an array of objects with keys "id" and "name", taken from the candidates
- "reasons": an array of short strings in the same order as "selected"
Example:
{"selected": [{"id": 10, "name": "waters"}], "reasons": ["Lakes are inland water bodies."]}"#;

const TABLE_SYSTEM: &str = r#"You finish routing a user question through a three-level taxonomy of geospatial tables.
From the candidate tables, select exactly one table that can answer the question.
Return only JSON with exactly two keys:
- "selected": one object with keys "id", "table_name" and "display_name", taken from the candidates
- "reasons": an array of short strings explaining the choice
Example:
{"selected": {"id": 100, "table_name": "ne_10m_lakes", "display_name": "Lakes"}, "reasons": ["The table holds lake polygons."]}"#;

const STATEMENT_SYSTEM: &str = r#"You write one read-only SQL query for PostgreSQL/PostGIS against the given table.
Return only JSON with these keys:
- "sql": a single SELECT statement, no semicolon, no comments, no DDL or DML
- "params": an object of named parameter values referenced as :name in the SQL
- "assumptions": an array of short strings
- "notes": an array of short strings
Rules:
- Reference the table by its qualified name exactly as given in the schema.
- Select only the columns the question needs, and always include the geometry column when the table has one.
- End the query with LIMIT :_limit OFFSET :_offset. Use the constraints for the limit unless the question asks for a specific count.
- Geometry columns use the SRID shown in their type. Cast to geography for area and distance in meters, e.g. ST_Area(geom::geography).
- Do not use ST_Transform to a projected CRS for measurements.
- Cast measurements to numeric before rounding, e.g. ROUND(ST_Area(geom::geography)::numeric / 1000000.0, 2) AS area_km2.
Example:
{"sql": "SELECT gid, name, geom FROM ne_data.ne_10m_lakes LIMIT :_limit OFFSET :_offset", "params": {}, "assumptions": ["All lakes are wanted."], "notes": []}"#;

/// `(system, user)` prompt pair for one classifier request.
pub fn render(request: &ClassifyRequest) -> (String, String) {
    let system = match request.stage {
        Stage::Category => CATEGORY_SYSTEM,
        Stage::Card => CARD_SYSTEM,
        Stage::Table => TABLE_SYSTEM,
        Stage::Statement => STATEMENT_SYSTEM,
    };

    let user = match &request.payload {
        StagePayload::Candidates(nodes) => {
            let listing: Vec<Value> = nodes
                .iter()
                .map(|node| candidate_json(request.stage, node))
                .collect();
            format!(
                "User question:\n{}\n\nAvailable {} candidates:\n{}",
                request.question,
                request.stage,
                Value::Array(listing)
            )
        }
        StagePayload::Statement {
            table,
            schema,
            constraints,
        } => format!(
            "User question:\n{}\n\nChosen table:\n{}\n\nFull schema of the chosen table:\n{}\n\nConstraints:\n{}",
            request.question,
            candidate_json(Stage::Table, table),
            schema_json(schema),
            json!({ "limit": constraints.limit }),
        ),
    };

    (system.to_string(), user)
}

fn candidate_json(stage: Stage, node: &TaxonomyNode) -> Value {
    match (stage, &node.table) {
        (Stage::Table, Some(detail)) => json!({
            "id": node.id,
            "table_name": detail.physical_name,
            "display_name": node.name,
            "summary": detail.summary,
            "core_fields": detail.core_fields,
            "keywords": node.keywords,
            "use_cases": detail.use_cases,
        }),
        _ => json!({
            "id": node.id,
            "name": node.name,
            "description": node.description,
            "keywords": node.keywords,
        }),
    }
}

fn schema_json(schema: &TableSchema) -> Value {
    let fields: Vec<Value> = schema
        .columns
        .iter()
        .map(|column| {
            json!({
                "name": column.name,
                "type": column.display_type(),
                "nullable": column.nullable,
            })
        })
        .collect();
    json!({ "table": schema.table, "fields": fields })
}
