//! Stage resolver tests
//!
//! 1. Full walk over a small taxonomy with a scripted classifier
//! 2. Selection checks: bounds, reachability, unknown ids
//! 3. Statement checks: geometry column, validator, structured drafts
//! 4. Stage timeouts and cancellation
//! 5. Decoder properties

use async_trait::async_trait;
use georoute_catalog::{MappingEdge, SchemaCatalog, TaxonomyNode, TaxonomySnapshot};
use georoute_resolver::*;
use georoute_sql::{SqlRejected, SqliteStore};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Fixtures
// ============================================================================

/// Answers each stage from a fixed script and records what it was offered.
struct ScriptedClassifier {
    answers: HashMap<Stage, String>,
    delay: Option<Duration>,
    seen: Mutex<Vec<ClassifyRequest>>,
}

impl ScriptedClassifier {
    fn new(answers: &[(Stage, &str)]) -> Self {
        Self {
            answers: answers.iter().map(|(s, a)| (*s, a.to_string())).collect(),
            delay: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn offered(&self, stage: Stage) -> Vec<i64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.stage == stage)
            .flat_map(|r| r.candidates().iter().map(|n| n.id).collect::<Vec<_>>())
            .collect()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<String, ClassifierError> {
        self.seen.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answers
            .get(&request.stage)
            .cloned()
            .ok_or_else(|| ClassifierError::Unavailable(format!("no answer for {}", request.stage)))
    }

    fn model_name(&self) -> String {
        "scripted".into()
    }
}

fn taxonomy() -> Arc<TaxonomySnapshot> {
    Arc::new(
        TaxonomySnapshot::new(
            vec![
                TaxonomyNode::category(1, "natural"),
                TaxonomyNode::category(2, "cultural"),
                TaxonomyNode::card(10, "waters"),
                TaxonomyNode::card(11, "relief"),
                TaxonomyNode::card(20, "populated places"),
                TaxonomyNode::table(100, "Lakes", "ne_10m_lakes"),
                TaxonomyNode::table(101, "Rivers", "ne_10m_rivers"),
                TaxonomyNode::table(200, "Cities", "ne_10m_populated_places"),
            ],
            vec![
                MappingEdge::new(1, 10),
                MappingEdge::new(1, 11),
                MappingEdge::new(2, 20),
            ],
            vec![
                MappingEdge::new(10, 100),
                MappingEdge::new(10, 101),
                MappingEdge::new(20, 200),
            ],
        )
        .unwrap(),
    )
}

fn store() -> Arc<SqliteStore> {
    let store = SqliteStore::open_in_memory()
        .unwrap()
        .attach("ne_data", None)
        .unwrap();
    store
        .execute_batch(
            "CREATE TABLE ne_data.ne_10m_lakes (gid INTEGER, name TEXT, geom MULTIPOLYGON);
             INSERT INTO ne_data.ne_10m_lakes VALUES (1, 'Superior', NULL), (2, 'Victoria', NULL);",
        )
        .unwrap();
    Arc::new(store)
}

fn resolver(classifier: Arc<ScriptedClassifier>) -> StageResolver {
    let schemas = Arc::new(SchemaCatalog::new(store()));
    StageResolver::new(taxonomy(), schemas, classifier)
}

const CATEGORY: &str = r#"{"selected": [{"id": 1, "name": "natural"}], "reasons": ["physical geography"]}"#;
const CARD: &str = r#"{"selected": [{"id": 10, "name": "waters"}], "reasons": ["lakes are water bodies"]}"#;
const TABLE: &str = r#"{"selected": {"id": 100, "table_name": "ne_10m_lakes", "display_name": "Lakes"}}"#;
const STATEMENT: &str = r#"{"sql": "SELECT gid, name, geom FROM ne_data.ne_10m_lakes LIMIT :_limit OFFSET :_offset", "params": {}, "assumptions": ["all lakes"], "notes": []}"#;

// ============================================================================
// Full walk
// ============================================================================

#[tokio::test]
async fn test_lakes_question_resolves_through_all_stages() {
    let classifier = Arc::new(ScriptedClassifier::new(&[
        (Stage::Category, CATEGORY),
        (Stage::Card, CARD),
        (Stage::Table, TABLE),
        (Stage::Statement, STATEMENT),
    ]));
    let resolution = resolver(classifier.clone())
        .resolve("Find all lakes", 100)
        .await
        .unwrap();

    assert_eq!(
        resolution.plan.sql,
        "SELECT gid, name, geom FROM ne_data.ne_10m_lakes LIMIT :_limit OFFSET :_offset"
    );
    assert_eq!(resolution.plan.params["_limit"], json!(100));
    assert_eq!(resolution.plan.params["_offset"], json!(0));
    assert_eq!(resolution.schema.table, "ne_data.ne_10m_lakes");

    let stages: Vec<Stage> = resolution.trail.iter().map(|s| s.stage).collect();
    assert_eq!(stages, Stage::ORDER);
    assert_eq!(resolution.trail[2].selected[0].name, "Lakes");

    // each stage only offered what the previous one reached, equal weights by name
    assert_eq!(classifier.offered(Stage::Category), vec![2, 1]);
    assert_eq!(classifier.offered(Stage::Card), vec![11, 10]);
    assert_eq!(classifier.offered(Stage::Table), vec![100, 101]);
}

#[tokio::test]
async fn test_fenced_output_and_legacy_keys_are_accepted() {
    let classifier = Arc::new(ScriptedClassifier::new(&[
        (Stage::Category, "Here you go:\n```json\n{\"l1_selected\": [{\"id\": \"1\"}]}\n```"),
        (Stage::Card, r#"{"l2_selected": [10]}"#),
        (Stage::Table, r#"{"l3_selected": {"id": 100}}"#),
        (
            Stage::Statement,
            r#"{"final_sql": {"sql": "SELECT * FROM ne_data.ne_10m_lakes LIMIT :_limit;", "params": {"_limit": 5}}}"#,
        ),
    ]));
    let resolution = resolver(classifier).resolve("lakes", 100).await.unwrap();
    assert_eq!(resolution.plan.sql, "SELECT * FROM ne_data.ne_10m_lakes LIMIT :_limit");
    assert_eq!(resolution.plan.params["_limit"], json!(5));
    assert!(!resolution.plan.params.contains_key("_offset"));
}

// ============================================================================
// Selection checks
// ============================================================================

#[tokio::test]
async fn test_unreachable_card_id_is_malformed() {
    // 20 exists, but only under "cultural"
    let classifier = Arc::new(ScriptedClassifier::new(&[
        (Stage::Category, CATEGORY),
        (Stage::Card, r#"{"selected": [20]}"#),
    ]));
    let failure = resolver(classifier).resolve("lakes", 100).await.unwrap_err();
    assert!(matches!(
        failure.error,
        ResolveError::MalformedSelection { stage: Stage::Card, .. }
    ));
    assert_eq!(failure.trail.len(), 1);
}

#[tokio::test]
async fn test_card_without_tables_has_no_reachable_nodes() {
    let classifier = Arc::new(ScriptedClassifier::new(&[
        (Stage::Category, CATEGORY),
        (Stage::Card, r#"{"selected": [11]}"#),
    ]));
    let failure = resolver(classifier).resolve("mountains", 100).await.unwrap_err();
    assert!(matches!(
        failure.error,
        ResolveError::NoReachableNodes { stage: Stage::Table }
    ));
    assert_eq!(failure.trail.len(), 2);
}

#[tokio::test]
async fn test_garbage_output_is_malformed_not_defaulted() {
    let classifier = Arc::new(ScriptedClassifier::new(&[(Stage::Category, "I think natural?")]));
    let failure = resolver(classifier).resolve("lakes", 100).await.unwrap_err();
    assert!(matches!(
        failure.error,
        ResolveError::MalformedSelection { stage: Stage::Category, .. }
    ));
    assert!(failure.trail.is_empty());
}

#[tokio::test]
async fn test_two_tables_are_refused() {
    let classifier = Arc::new(ScriptedClassifier::new(&[
        (Stage::Category, CATEGORY),
        (Stage::Card, CARD),
        (Stage::Table, r#"{"selected": [100, 101]}"#),
    ]));
    let failure = resolver(classifier).resolve("water", 100).await.unwrap_err();
    assert!(matches!(
        failure.error,
        ResolveError::MalformedSelection { stage: Stage::Table, .. }
    ));
}

// ============================================================================
// Statement checks
// ============================================================================

fn with_statement(statement: &str) -> Arc<ScriptedClassifier> {
    Arc::new(ScriptedClassifier::new(&[
        (Stage::Category, CATEGORY),
        (Stage::Card, CARD),
        (Stage::Table, TABLE),
        (Stage::Statement, statement),
    ]))
}

#[tokio::test]
async fn test_statement_without_geometry_is_refused() {
    let classifier = with_statement(r#"{"sql": "SELECT gid, name FROM ne_data.ne_10m_lakes LIMIT :_limit OFFSET :_offset"}"#);
    let failure = resolver(classifier).resolve("lake names", 100).await.unwrap_err();
    assert!(matches!(failure.error, ResolveError::MissingGeometryColumn { .. }));
    assert_eq!(failure.trail.len(), 3);
}

#[tokio::test]
async fn test_write_statement_is_rejected_before_execution() {
    let classifier = with_statement(r#"{"sql": "DELETE FROM ne_data.ne_10m_lakes"}"#);
    let failure = resolver(classifier).resolve("drop lakes", 100).await.unwrap_err();
    assert!(matches!(failure.error, ResolveError::Rejected(SqlRejected::NotSelect)));

    let classifier = with_statement(r#"{"sql": "SELECT geom FROM ne_data.ne_10m_lakes; DROP TABLE x"}"#);
    let failure = resolver(classifier).resolve("drop lakes", 100).await.unwrap_err();
    assert!(matches!(failure.error, ResolveError::Rejected(SqlRejected::MultipleStatements)));
}

#[tokio::test]
async fn test_unknown_projection_is_noted() {
    let classifier = with_statement(
        r#"{"sql": "SELECT gid, depth, geom FROM ne_data.ne_10m_lakes LIMIT 10", "notes": ["deepest first"]}"#,
    );
    let resolution = resolver(classifier).resolve("deep lakes", 100).await.unwrap();
    assert_eq!(resolution.plan.notes.len(), 2);
    assert!(resolution.plan.notes[1].contains("depth"));
}

#[tokio::test]
async fn test_structured_draft_is_built() {
    let classifier = with_statement(
        r#"{"draft": {"columns": ["gid", "name", "geom"], "filters": {"name": "Victoria"}}, "assumptions": ["exact name"]}"#,
    );
    let resolution = resolver(classifier).resolve("Lake Victoria", 50).await.unwrap();
    assert_eq!(
        resolution.plan.sql,
        "SELECT \"gid\", \"name\", \"geom\" FROM \"ne_data\".\"ne_10m_lakes\" WHERE \"name\" = :p0 LIMIT :_limit OFFSET :_offset"
    );
    assert_eq!(resolution.plan.params["p0"], json!("Victoria"));
    assert_eq!(resolution.plan.params["_limit"], json!(50));
    assert_eq!(resolution.plan.assumptions, vec!["exact name"]);
}

#[tokio::test]
async fn test_draft_with_unknown_column_fails_construction() {
    let classifier = with_statement(r#"{"draft": {"columns": ["gid", "depth", "geom"]}}"#);
    let failure = resolver(classifier).resolve("deep lakes", 100).await.unwrap_err();
    assert!(matches!(failure.error, ResolveError::Construction(_)));
}

// ============================================================================
// Timeouts and cancellation
// ============================================================================

#[tokio::test]
async fn test_slow_classifier_times_out() {
    let classifier = Arc::new(ScriptedClassifier::new(&[(Stage::Category, CATEGORY)]).slow(Duration::from_millis(500)));
    let failure = resolver(classifier)
        .with_stage_timeout(Duration::from_millis(20))
        .resolve("lakes", 100)
        .await
        .unwrap_err();
    assert!(matches!(
        failure.error,
        ResolveError::Timeout { stage: Stage::Category, .. }
    ));
}

#[tokio::test]
async fn test_cancellation_abandons_the_run() {
    let classifier = Arc::new(ScriptedClassifier::new(&[(Stage::Category, CATEGORY)]).slow(Duration::from_secs(5)));
    let failure = resolver(classifier)
        .resolve_until("lakes", 100, tokio::time::sleep(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ResolveError::Cancelled));
}

// ============================================================================
// Decoder properties
// ============================================================================

proptest! {
    #[test]
    fn prop_json_survives_surrounding_prose(
        prefix in "[A-Za-z ,.:!]{0,40}",
        suffix in "[A-Za-z ,.:!]{0,40}",
        id in 0i64..1_000_000,
    ) {
        let raw = format!("{prefix}{{\"selected\": [{id}]}}{suffix}");
        let value = LenientStructuredDecoder::new().decode_value(&raw).unwrap();
        prop_assert_eq!(&value["selected"][0], &json!(id));
    }

    #[test]
    fn prop_bracketed_prose_never_wins_over_the_object(
        lead in "[A-Za-z ,.:]{0,20}",
        noise in proptest::collection::vec(0i64..1_000, 0..12),
        tail in "[A-Za-z ,.:]{0,20}",
        id in 0i64..1_000_000,
    ) {
        let listed: Vec<String> = noise.iter().map(i64::to_string).collect();
        let raw = format!(
            "{lead} step [{}]: {{\"selected\": [{id}]}} {tail} [{}]",
            listed.join(", "),
            listed.join(", ")
        );
        let value = LenientStructuredDecoder::new().decode_value(&raw).unwrap();
        prop_assert_eq!(&value["selected"], &json!([id]));
    }

    #[test]
    fn prop_prose_without_json_never_decodes(text in "[A-Z ,.:!]{0,80}") {
        prop_assert!(LenientStructuredDecoder::new().decode_value(&text).is_err());
    }
}
