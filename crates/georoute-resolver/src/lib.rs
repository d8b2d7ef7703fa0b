//! Georoute resolver: a free-text geospatial question in, one bounded SQL
//! statement and its rows out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        QUESTION → ROWS PIPELINE                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  question ──► Pipeline ──► StageResolver                                 │
//! │                               │                                          │
//! │        ┌──────────┬───────────┼────────────┬──────────────┐              │
//! │        ▼          ▼           ▼            ▼              │              │
//! │    CATEGORY ──► CARD ──────► TABLE ─────► STATEMENT       │              │
//! │     (1-2)       (1-2)        (1)          (QueryPlan)     │              │
//! │        │          │           │            │              │              │
//! │        └──────────┴─── Classifier ─────────┘              │              │
//! │                     (LLM, scripted, ...)                  │              │
//! │                          │                                │              │
//! │              LenientStructuredDecoder           TaxonomyCatalog          │
//! │                                                 SchemaCatalog            │
//! │                                                                          │
//! │  QueryPlan ──► QueryExecutor ──► validate ──► DataStore                  │
//! │                     │                             │ statement error      │
//! │                     └──── SELECT * retry (once) ◄─┘                      │
//! │                                                                          │
//! │  ResultEnvelope { sql, results, reasoning, model_used, is_fallback }     │
//! │  ErrorEnvelope  { code, detail, reasoning }                              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stages run strictly in order. Each one only sees the nodes reachable from
//! the previous selection, and every classifier answer is checked against
//! that candidate set before the run moves on.
//!
//! ## Providers
//! - `openai`: OpenAI-compatible chat completions
//! - `anthropic`: Anthropic messages API
//! - `local`: OpenAI-compatible local servers (vLLM, Ollama)

pub mod classifier;
pub mod config;
pub mod decode;
pub mod llm;
pub mod pipeline;
pub mod prompts;
#[cfg(any(feature = "openai", feature = "anthropic", feature = "local"))]
pub mod providers;
pub mod resolver;

pub use classifier::{
    Classifier, ClassifierError, ClassifyRequest, Constraints, Stage, StagePayload,
};
pub use config::{PipelineConfig, SettingsError};
pub use decode::{DecodeError, LenientStructuredDecoder};
pub use llm::{CompletionProvider, ConfigError, LlmClassifier, LlmConfig, LlmError, Provider};
pub use pipeline::{ErrorCode, ErrorEnvelope, Pipeline, ResultEnvelope};
#[cfg(any(feature = "openai", feature = "anthropic", feature = "local"))]
pub use providers::UnifiedClient;
pub use resolver::{
    Resolution, ResolveError, ResolveFailure, SelectedNode, StageResolver, StageSelection,
    DEFAULT_STAGE_TIMEOUT,
};
