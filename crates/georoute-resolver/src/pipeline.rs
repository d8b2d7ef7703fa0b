//! Request boundary: one question in, one envelope out.

use crate::classifier::Classifier;
use crate::config::PipelineConfig;
use crate::resolver::{ResolveError, StageResolver, StageSelection};
use georoute_catalog::{DataStore, SchemaCatalog, SchemaError, TaxonomyCatalog};
use georoute_sql::{BuildError, ExecutionError, QueryExecutor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub sql: String,
    pub results: Vec<Map<String, Value>>,
    pub reasoning: Vec<String>,
    pub model_used: String,
    pub is_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    SemanticError,
    SqlError,
    ServiceUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::SemanticError => "SEMANTIC_ERROR",
            ErrorCode::SqlError => "SQL_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub detail: String,
    pub reasoning: Vec<String>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, detail: impl Into<String>, reasoning: Vec<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            reasoning,
        }
    }
}

/// Envelope code for a resolution failure.
pub fn resolve_code(error: &ResolveError) -> ErrorCode {
    match error {
        ResolveError::MalformedSelection { .. }
        | ResolveError::NoReachableNodes { .. }
        | ResolveError::MissingGeometryColumn { .. }
        | ResolveError::ForeignTable { .. }
        | ResolveError::Schema(SchemaError::UnknownTable(_)) => ErrorCode::SemanticError,
        ResolveError::Construction(BuildError::Schema(_)) => ErrorCode::ServiceUnavailable,
        ResolveError::Construction(_) => ErrorCode::SemanticError,
        ResolveError::Rejected(_) => ErrorCode::SqlError,
        ResolveError::Classifier { .. }
        | ResolveError::Timeout { .. }
        | ResolveError::Catalog(_)
        | ResolveError::Schema(_) => ErrorCode::ServiceUnavailable,
        ResolveError::Cancelled => ErrorCode::InternalError,
    }
}

/// Envelope code for an execution failure.
pub fn execution_code(error: &ExecutionError) -> ErrorCode {
    match error {
        ExecutionError::Rejected(_) | ExecutionError::Failed { .. } => ErrorCode::SqlError,
        ExecutionError::Unavailable(_) | ExecutionError::Timeout(_) => ErrorCode::ServiceUnavailable,
    }
}

fn reasoning(trail: &[StageSelection]) -> Vec<String> {
    trail.iter().map(StageSelection::summary).collect()
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    resolver: StageResolver,
    executor: QueryExecutor,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(resolver: StageResolver, executor: QueryExecutor, config: PipelineConfig) -> Self {
        Self {
            resolver,
            executor,
            config,
        }
    }

    /// Wire a pipeline around one store, sharing a fresh schema cache
    /// between resolution and execution.
    pub fn from_parts(
        taxonomy: Arc<dyn TaxonomyCatalog>,
        store: Arc<dyn DataStore>,
        classifier: Arc<dyn Classifier>,
        config: PipelineConfig,
    ) -> Self {
        let schemas = Arc::new(SchemaCatalog::new(Arc::clone(&store)).with_timeout(config.store_timeout));
        let resolver = StageResolver::new(taxonomy, schemas, classifier)
            .with_stage_timeout(config.stage_timeout)
            .with_dialect(config.dialect);
        let executor = QueryExecutor::new(store).with_timeout(config.store_timeout);
        Self::new(resolver, executor, config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self, question: &str, limit: Option<u32>) -> Result<ResultEnvelope, ErrorEnvelope> {
        self.run_until(question, limit, std::future::pending::<()>())
            .await
    }

    /// Run one question, giving up as soon as `cancel` completes.
    pub async fn run_until<C>(
        &self,
        question: &str,
        limit: Option<u32>,
        cancel: C,
    ) -> Result<ResultEnvelope, ErrorEnvelope>
    where
        C: Future<Output = ()>,
    {
        let limit = self.check_input(question, limit)?;
        tokio::pin!(cancel);

        let resolution = self
            .resolver
            .resolve_until(question.trim(), limit, cancel.as_mut())
            .await
            .map_err(|failure| {
                ErrorEnvelope::new(
                    resolve_code(&failure.error),
                    failure.error.to_string(),
                    reasoning(&failure.trail),
                )
            })?;
        let trail = reasoning(&resolution.trail);

        let executed = tokio::select! {
            executed = self.executor.execute(&resolution.plan) => executed,
            _ = cancel.as_mut() => {
                return Err(ErrorEnvelope::new(ErrorCode::InternalError, "run cancelled", trail));
            }
        };
        let result = match executed {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(error = %error, "execution failed");
                return Err(ErrorEnvelope::new(execution_code(&error), error.to_string(), trail));
            }
        };

        tracing::info!(
            table = %resolution.schema.table,
            rows = result.row_count,
            is_fallback = result.is_fallback,
            "question answered"
        );
        Ok(ResultEnvelope {
            results: result.records(),
            sql: result.sql,
            reasoning: trail,
            model_used: self.resolver.model_name(),
            is_fallback: result.is_fallback,
        })
    }

    /// Synchronous adapter for callers without a runtime. Must not be called
    /// from inside an async context.
    pub fn run_blocking(&self, question: &str, limit: Option<u32>) -> Result<ResultEnvelope, ErrorEnvelope> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                ErrorEnvelope::new(
                    ErrorCode::InternalError,
                    format!("failed to start runtime: {err}"),
                    Vec::new(),
                )
            })?;
        runtime.block_on(self.run(question, limit))
    }

    fn check_input(&self, question: &str, limit: Option<u32>) -> Result<u32, ErrorEnvelope> {
        let invalid = |detail: String| ErrorEnvelope::new(ErrorCode::ValidationError, detail, Vec::new());
        if question.trim().is_empty() {
            return Err(invalid("question must not be empty".to_string()));
        }
        let limit = limit.unwrap_or(self.config.default_limit);
        if limit == 0 || limit > self.config.max_limit {
            return Err(invalid(format!(
                "limit must be between 1 and {}, got {limit}",
                self.config.max_limit
            )));
        }
        Ok(limit)
    }
}
