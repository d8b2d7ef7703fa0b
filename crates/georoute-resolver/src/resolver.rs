//! Stage resolver: category → card → table → statement.
//!
//! Each stage offers the classifier only the nodes reachable from the
//! previous selection and checks its answer against that candidate set. Any
//! stage failure ends the run; the reasoning trail collected so far travels
//! with the error.

use crate::classifier::{
    Classifier, ClassifierError, ClassifyRequest, Constraints, Stage, StagePayload,
};
use crate::decode::{strip_fences, LenientStructuredDecoder};
use georoute_catalog::{
    CatalogError, NodeId, Params, SchemaCatalog, SchemaError, TableSchema, TaxonomyCatalog,
    TaxonomyNode,
};
use georoute_sql::{
    filters_from_json, scan, validate, BuildError, Dialect, Page, QueryBuilder, QueryPlan,
    SqlRejected, LIMIT_PARAM, OFFSET_PARAM,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlparser::ast::{Expr, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bound on one classifier call.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Trail
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedNode {
    pub id: NodeId,
    pub name: String,
}

/// What one stage chose and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSelection {
    pub stage: Stage,
    pub selected: Vec<SelectedNode>,
    pub reasons: Vec<String>,
}

impl StageSelection {
    /// One-line rendering used in the reasoning trail.
    pub fn summary(&self) -> String {
        let picked: Vec<String> = self
            .selected
            .iter()
            .map(|node| format!("{} ({})", node.name, node.id))
            .collect();
        let mut line = format!("{} → {}", self.stage, picked.join(", "));
        if !self.reasons.is_empty() {
            line.push_str(": ");
            line.push_str(&self.reasons.join("; "));
        }
        line
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{stage} classifier failed: {source}")]
    Classifier {
        stage: Stage,
        #[source]
        source: ClassifierError,
    },
    #[error("{stage} classifier timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },
    #[error("malformed {stage} selection: {detail}")]
    MalformedSelection { stage: Stage, detail: String },
    #[error("no {stage} candidates reachable from the previous selection")]
    NoReachableNodes { stage: Stage },
    #[error("statement for `{table}` does not select a geometry column")]
    MissingGeometryColumn { table: String },
    #[error("statement must read only `{table}`, found {found}")]
    ForeignTable { table: String, found: String },
    #[error(transparent)]
    Construction(#[from] BuildError),
    #[error(transparent)]
    Rejected(#[from] SqlRejected),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("resolution cancelled")]
    Cancelled,
}

fn malformed(stage: Stage, detail: impl ToString) -> ResolveError {
    ResolveError::MalformedSelection {
        stage,
        detail: detail.to_string(),
    }
}

/// A failed run together with the stages that did complete.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ResolveFailure {
    #[source]
    pub error: ResolveError,
    pub trail: Vec<StageSelection>,
}

/// A fully resolved question, ready for execution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub table: TaxonomyNode,
    pub schema: Arc<TableSchema>,
    pub plan: QueryPlan,
    pub trail: Vec<StageSelection>,
}

// ============================================================================
// Resolver
// ============================================================================

pub struct StageResolver {
    taxonomy: Arc<dyn TaxonomyCatalog>,
    schemas: Arc<SchemaCatalog>,
    classifier: Arc<dyn Classifier>,
    builder: QueryBuilder,
    decoder: LenientStructuredDecoder,
    stage_timeout: Duration,
}

impl StageResolver {
    pub fn new(
        taxonomy: Arc<dyn TaxonomyCatalog>,
        schemas: Arc<SchemaCatalog>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            builder: QueryBuilder::new(Arc::clone(&schemas)),
            taxonomy,
            schemas,
            classifier,
            decoder: LenientStructuredDecoder::new(),
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Dialect used when the classifier answers with a structured draft.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.builder = QueryBuilder::new(Arc::clone(&self.schemas)).with_dialect(dialect);
        self
    }

    pub fn model_name(&self) -> String {
        self.classifier.model_name()
    }

    pub async fn resolve(&self, question: &str, limit: u32) -> Result<Resolution, ResolveFailure> {
        self.resolve_until(question, limit, std::future::pending::<()>())
            .await
    }

    /// Like [`StageResolver::resolve`], abandoning the run (and any in-flight
    /// classifier call) as soon as `cancel` completes.
    pub async fn resolve_until<C>(
        &self,
        question: &str,
        limit: u32,
        cancel: C,
    ) -> Result<Resolution, ResolveFailure>
    where
        C: Future<Output = ()>,
    {
        let mut trail = Vec::new();
        let outcome = tokio::select! {
            outcome = self.walk(question, limit, &mut trail) => outcome,
            _ = cancel => Err(ResolveError::Cancelled),
        };

        match outcome {
            Ok((table, schema, plan)) => Ok(Resolution {
                table,
                schema,
                plan,
                trail,
            }),
            Err(error) => {
                tracing::warn!(error = %error, stages = trail.len(), "resolution failed");
                Err(ResolveFailure { error, trail })
            }
        }
    }

    async fn walk(
        &self,
        question: &str,
        limit: u32,
        trail: &mut Vec<StageSelection>,
    ) -> Result<(TaxonomyNode, Arc<TableSchema>, QueryPlan), ResolveError> {
        let categories = self.taxonomy.top_categories()?;
        let (selection, picked) = self.choose(Stage::Category, question, categories).await?;
        trail.push(selection);

        let cards = self.taxonomy.cards_for(&ids(&picked))?;
        let (selection, picked) = self.choose(Stage::Card, question, cards).await?;
        trail.push(selection);

        let tables = self.taxonomy.tables_for(&ids(&picked))?;
        let (selection, picked) = self.choose(Stage::Table, question, tables).await?;
        trail.push(selection);

        let table = picked
            .into_iter()
            .next()
            .ok_or_else(|| malformed(Stage::Table, "no table selected"))?;
        let physical = table
            .physical_name()
            .ok_or_else(|| malformed(Stage::Table, format!("node {} has no physical table", table.id)))?
            .to_string();

        let schema = self.schemas.columns_of(&physical).await?;
        let plan = self.statement(question, limit, &table, &physical, &schema).await?;

        let mut reasons = vec![format!("sql: {}", plan.sql)];
        reasons.extend(plan.assumptions.iter().cloned());
        reasons.extend(plan.notes.iter().cloned());
        trail.push(StageSelection {
            stage: Stage::Statement,
            selected: vec![SelectedNode {
                id: table.id,
                name: table.name.clone(),
            }],
            reasons,
        });

        Ok((table, schema, plan))
    }

    /// One candidate stage: ask, decode, and check the answer.
    async fn choose(
        &self,
        stage: Stage,
        question: &str,
        candidates: Vec<TaxonomyNode>,
    ) -> Result<(StageSelection, Vec<TaxonomyNode>), ResolveError> {
        if candidates.is_empty() {
            return Err(ResolveError::NoReachableNodes { stage });
        }
        tracing::debug!(stage = %stage, candidates = candidates.len(), "stage started");

        let request = ClassifyRequest {
            stage,
            question: question.to_string(),
            payload: StagePayload::Candidates(candidates),
        };
        let raw = self.ask(&request).await?;
        let value = self
            .decoder
            .decode_value(&raw)
            .map_err(|err| malformed(stage, err))?;

        let (selection, nodes) = parse_selection(stage, &value, request.candidates())?;
        tracing::info!(
            stage = %stage,
            selected = ?selection.selected.iter().map(|n| n.id).collect::<Vec<_>>(),
            "stage resolved"
        );
        Ok((selection, nodes))
    }

    async fn ask(&self, request: &ClassifyRequest) -> Result<String, ResolveError> {
        let stage = request.stage;
        let started = Instant::now();
        match tokio::time::timeout(self.stage_timeout, self.classifier.classify(request)).await {
            Ok(Ok(raw)) => {
                tracing::debug!(
                    stage = %stage,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    bytes = raw.len(),
                    "classifier answered"
                );
                Ok(raw)
            }
            Ok(Err(source)) => Err(ResolveError::Classifier { stage, source }),
            Err(_) => {
                tracing::warn!(stage = %stage, timeout = ?self.stage_timeout, "classifier timed out");
                Err(ResolveError::Timeout {
                    stage,
                    after: self.stage_timeout,
                })
            }
        }
    }

    async fn statement(
        &self,
        question: &str,
        limit: u32,
        table: &TaxonomyNode,
        physical: &str,
        schema: &TableSchema,
    ) -> Result<QueryPlan, ResolveError> {
        let stage = Stage::Statement;
        let request = ClassifyRequest {
            stage,
            question: question.to_string(),
            payload: StagePayload::Statement {
                table: table.clone(),
                schema: schema.clone(),
                constraints: Constraints { limit },
            },
        };
        let raw = self.ask(&request).await?;
        let value = self
            .decoder
            .decode_value(&raw)
            .map_err(|err| malformed(stage, err))?;

        let mut plan = match value.get("draft") {
            Some(draft) => self.build_draft(draft, &value, physical, limit).await?,
            None => extract_plan(&value)?,
        };

        plan.sql = normalize_sql(&plan.sql);
        let used = scan::placeholders(&plan.sql);
        if used.contains(LIMIT_PARAM) {
            plan.params
                .entry(LIMIT_PARAM.to_string())
                .or_insert_with(|| json!(limit));
        }
        if used.contains(OFFSET_PARAM) {
            plan.params
                .entry(OFFSET_PARAM.to_string())
                .or_insert_with(|| json!(0));
        }

        validate(&plan.sql)?;
        require_source(&plan.sql, schema)?;
        require_geometry(&plan.sql, schema)?;

        for column in unknown_projections(&plan.sql, schema) {
            plan.notes
                .push(format!("column `{column}` is not in the schema of {}", schema.table));
        }
        Ok(plan)
    }

    async fn build_draft(
        &self,
        draft: &Value,
        envelope: &Value,
        physical: &str,
        limit: u32,
    ) -> Result<QueryPlan, ResolveError> {
        #[derive(Deserialize)]
        struct Draft {
            columns: Vec<String>,
            #[serde(default)]
            filters: Value,
            limit: Option<i64>,
            offset: Option<i64>,
        }

        let draft: Draft =
            serde_json::from_value(draft.clone()).map_err(|err| malformed(Stage::Statement, err))?;
        let filters = filters_from_json(&draft.filters)?;
        let page = Page::new(
            draft.limit.unwrap_or(i64::from(limit)),
            draft.offset.unwrap_or(0),
        );
        let built = self
            .builder
            .build_select(physical, &draft.columns, &filters, page)
            .await?;

        Ok(QueryPlan {
            sql: built.sql,
            params: built.params,
            assumptions: strings(envelope.get("assumptions")),
            notes: strings(envelope.get("notes")),
        })
    }
}

fn ids(nodes: &[TaxonomyNode]) -> Vec<NodeId> {
    nodes.iter().map(|node| node.id).collect()
}

// ============================================================================
// Classifier output
// ============================================================================

fn parse_selection(
    stage: Stage,
    value: &Value,
    candidates: &[TaxonomyNode],
) -> Result<(StageSelection, Vec<TaxonomyNode>), ResolveError> {
    let picked = match value {
        Value::Object(map) => map
            .get("selected")
            .or_else(|| map.get(stage.legacy_key()))
            .ok_or_else(|| malformed(stage, "no `selected` key in classifier output"))?,
        Value::Array(_) => value,
        _ => return Err(malformed(stage, "classifier output is not an object")),
    };

    let items: Vec<&Value> = match picked {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut chosen: Vec<NodeId> = Vec::new();
    for item in items {
        let id = item_id(item).ok_or_else(|| malformed(stage, format!("unusable selection item {item}")))?;
        if !chosen.contains(&id) {
            chosen.push(id);
        }
    }

    let allowed = match stage {
        Stage::Table => 1..=1,
        _ => 1..=2,
    };
    if !allowed.contains(&chosen.len()) {
        return Err(malformed(
            stage,
            format!(
                "expected {} to {} selections, got {}",
                allowed.start(),
                allowed.end(),
                chosen.len()
            ),
        ));
    }

    let mut nodes = Vec::with_capacity(chosen.len());
    for id in chosen {
        let node = candidates
            .iter()
            .find(|node| node.id == id)
            .ok_or_else(|| malformed(stage, format!("id {id} is not among the candidates")))?;
        nodes.push(node.clone());
    }

    let reasons = match value {
        Value::Object(map) => strings(map.get("reasons").or_else(|| map.get("reason"))),
        _ => Vec::new(),
    };
    let selection = StageSelection {
        stage,
        selected: nodes
            .iter()
            .map(|node| SelectedNode {
                id: node.id,
                name: node.name.clone(),
            })
            .collect(),
        reasons,
    };
    Ok((selection, nodes))
}

fn item_id(item: &Value) -> Option<NodeId> {
    match item {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => match map.get("id")? {
            Value::Object(_) => None,
            inner => item_id(inner),
        },
        _ => None,
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn params_of(value: Option<&Value>) -> Result<Params, ResolveError> {
    match value {
        None | Some(Value::Null) => Ok(Params::new()),
        Some(Value::Object(map)) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Some(other) => Err(malformed(
            Stage::Statement,
            format!("params must be an object, got {other}"),
        )),
    }
}

/// Plan from `{sql, params, ...}`, `{final_sql: "..."}` or
/// `{final_sql: {sql, params}}`.
fn extract_plan(value: &Value) -> Result<QueryPlan, ResolveError> {
    let stage = Stage::Statement;
    let (sql, params) = match (value.get("sql"), value.get(stage.legacy_key())) {
        (Some(Value::String(sql)), _) => (sql.clone(), params_of(value.get("params"))?),
        (_, Some(Value::String(sql))) => (sql.clone(), params_of(value.get("params"))?),
        (_, Some(nested @ Value::Object(_))) => match nested.get("sql") {
            Some(Value::String(sql)) => (sql.clone(), params_of(nested.get("params"))?),
            _ => return Err(malformed(stage, "`final_sql` has no `sql` string")),
        },
        _ => return Err(malformed(stage, "no SQL in classifier output")),
    };

    Ok(QueryPlan {
        sql,
        params,
        assumptions: strings(value.get("assumptions")),
        notes: strings(value.get("notes")),
    })
}

/// Strip fences, surrounding whitespace and trailing semicolons.
fn normalize_sql(raw: &str) -> String {
    let mut sql = strip_fences(raw).trim();
    while let Some(rest) = sql.strip_suffix(';') {
        sql = rest.trim_end();
    }
    sql.to_string()
}

/// The statement reads `schema.table` and nothing else: one SELECT, one
/// table factor, no joins.
fn require_source(sql: &str, schema: &TableSchema) -> Result<(), ResolveError> {
    let foreign = |found: String| ResolveError::ForeignTable {
        table: schema.table.clone(),
        found,
    };
    let source = source_table(sql).map_err(foreign)?;
    if source.eq_ignore_ascii_case(&schema.table) {
        Ok(())
    } else {
        Err(foreign(format!("`{source}`")))
    }
}

fn source_table(sql: &str) -> Result<String, String> {
    let dialect = GenericDialect {};
    let unparseable = |err: &dyn std::fmt::Display| format!("an unparseable statement ({err})");

    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|err| unparseable(&err))?;
    let selects = tokens
        .iter()
        .filter(|token| matches!(token, Token::Word(word) if word.keyword == Keyword::SELECT))
        .count();
    if selects != 1 {
        return Err("a nested query".to_string());
    }

    let statements = Parser::parse_sql(&dialect, sql).map_err(|err| unparseable(&err))?;
    let [Statement::Query(query)] = statements.as_slice() else {
        return Err("something other than one query".to_string());
    };
    if query.with.is_some() {
        return Err("a common table expression".to_string());
    }
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err("a compound query".to_string());
    };

    match select.from.as_slice() {
        [TableWithJoins {
            relation: TableFactor::Table { name, .. },
            joins,
            ..
        }] if joins.is_empty() => Ok(name
            .0
            .iter()
            .map(|part| part.value.as_str())
            .collect::<Vec<_>>()
            .join(".")),
        [] => Err("no table".to_string()),
        [_] => Err("a join or derived table".to_string()),
        _ => Err("several tables".to_string()),
    }
}

fn require_geometry(sql: &str, schema: &TableSchema) -> Result<(), ResolveError> {
    let mut geometry = schema.geometry_columns().peekable();
    if geometry.peek().is_none() {
        return Ok(());
    }

    let projected = match scan::select_list(sql) {
        Some(list) => {
            scan::selects_everything(sql) || geometry.any(|column| scan::projects_identifier(list, &column.name))
        }
        None => false,
    };
    if projected {
        Ok(())
    } else {
        Err(ResolveError::MissingGeometryColumn {
            table: schema.table.clone(),
        })
    }
}

/// Plain projected identifiers that the schema does not know.
fn unknown_projections(sql: &str, schema: &TableSchema) -> Vec<String> {
    let Ok(statements) = Parser::parse_sql(&GenericDialect {}, sql) else {
        return Vec::new();
    };
    let Some(Statement::Query(query)) = statements.first() else {
        return Vec::new();
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Vec::new();
    };

    let known = |name: &str| schema.column_names().any(|c| c.eq_ignore_ascii_case(name));
    let mut unknown = Vec::new();
    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => continue,
        };
        let name = match expr {
            Expr::Identifier(ident) => &ident.value,
            Expr::CompoundIdentifier(parts) => match parts.last() {
                Some(ident) => &ident.value,
                None => continue,
            },
            _ => continue,
        };
        if !known(name) {
            unknown.push(name.clone());
        }
    }
    unknown
}
