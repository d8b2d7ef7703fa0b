//! The classifier seam: one call per resolution stage.

use async_trait::async_trait;
use georoute_catalog::{TableSchema, TaxonomyNode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resolution stages, in the only order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Category,
    Card,
    Table,
    Statement,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Category, Stage::Card, Stage::Table, Stage::Statement];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Category => "category",
            Stage::Card => "card",
            Stage::Table => "table",
            Stage::Statement => "statement",
        }
    }

    /// Selection key used by older prompt formats.
    pub fn legacy_key(self) -> &'static str {
        match self {
            Stage::Category => "l1_selected",
            Stage::Card => "l2_selected",
            Stage::Table => "l3_selected",
            Stage::Statement => "final_sql",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row bounds handed to the statement stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub limit: u32,
}

/// What the classifier chooses from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePayload {
    Candidates(Vec<TaxonomyNode>),
    Statement {
        table: TaxonomyNode,
        schema: TableSchema,
        constraints: Constraints,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifyRequest {
    pub stage: Stage,
    pub question: String,
    pub payload: StagePayload,
}

impl ClassifyRequest {
    pub fn candidates(&self) -> &[TaxonomyNode] {
        match &self.payload {
            StagePayload::Candidates(nodes) => nodes,
            StagePayload::Statement { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classifier rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("classifier returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// External reasoning capability. Implementations return raw text; the
/// resolver decodes it and never trusts it to be in range.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest) -> Result<String, ClassifierError>;

    /// Reported as `model_used` in the result envelope.
    fn model_name(&self) -> String;
}
