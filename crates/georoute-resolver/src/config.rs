//! Pipeline configuration: defaults, then `GEOROUTE_*` environment
//! variables. Callers (the CLI) apply their own flags last.

use crate::resolver::DEFAULT_STAGE_TIMEOUT;
use georoute_catalog::DEFAULT_STORE_TIMEOUT;
use georoute_sql::Dialect;
use std::time::Duration;

pub const STAGE_TIMEOUT_ENV: &str = "GEOROUTE_STAGE_TIMEOUT_SECS";
pub const STORE_TIMEOUT_ENV: &str = "GEOROUTE_STORE_TIMEOUT_SECS";
pub const DEFAULT_LIMIT_ENV: &str = "GEOROUTE_DEFAULT_LIMIT";
pub const MAX_LIMIT_ENV: &str = "GEOROUTE_MAX_LIMIT";
pub const NAMESPACE_ENV: &str = "GEOROUTE_NAMESPACE";
pub const DIALECT_ENV: &str = "GEOROUTE_DIALECT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bound on each classifier call.
    pub stage_timeout: Duration,
    /// Bound on each data store call.
    pub store_timeout: Duration,
    /// Row limit when the caller gives none.
    pub default_limit: u32,
    /// Largest row limit a caller may ask for.
    pub max_limit: u32,
    /// Schema namespace holding the physical tables.
    pub namespace: String,
    /// SQL dialect of the data store, used when rendering drafts.
    pub dialect: Dialect,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            default_limit: 100,
            max_limit: 10_000,
            namespace: "ne_data".to_string(),
            dialect: Dialect::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid {name}={value:?} (expected integer)")]
    NotAnInteger { name: String, value: String },
    #[error("invalid {name}={value:?} (expected identifier)")]
    NotAnIdentifier { name: String, value: String },
    #[error("invalid {name}={value:?} (expected postgres or sqlite)")]
    UnknownDialect { name: String, value: String },
    #[error("{0}")]
    Inconsistent(String),
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` yields for the `GEOROUTE_*`
    /// names. Numbers are clamped into sane ranges.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let defaults = Self::default();
        let stage_secs = env_u64(&lookup, STAGE_TIMEOUT_ENV, defaults.stage_timeout.as_secs(), 1, 600)?;
        let store_secs = env_u64(&lookup, STORE_TIMEOUT_ENV, defaults.store_timeout.as_secs(), 1, 600)?;
        let max_limit = env_u64(&lookup, MAX_LIMIT_ENV, u64::from(defaults.max_limit), 1, 1_000_000)? as u32;
        let default_limit =
            env_u64(&lookup, DEFAULT_LIMIT_ENV, u64::from(defaults.default_limit), 1, u64::from(max_limit))? as u32;

        let namespace = match lookup(NAMESPACE_ENV).map(|v| v.trim().to_string()) {
            Some(v) if v.is_empty() => defaults.namespace,
            Some(v) if georoute_sql::builder::is_identifier(&v) => v,
            Some(v) => {
                return Err(SettingsError::NotAnIdentifier {
                    name: NAMESPACE_ENV.to_string(),
                    value: v,
                })
            }
            None => defaults.namespace,
        };

        let dialect = match lookup(DIALECT_ENV).map(|v| v.trim().to_ascii_lowercase()) {
            None => defaults.dialect,
            Some(v) => match v.as_str() {
                "" => defaults.dialect,
                "postgres" | "postgresql" | "postgis" => Dialect::Postgres,
                "sqlite" | "spatialite" => Dialect::Sqlite,
                _ => {
                    return Err(SettingsError::UnknownDialect {
                        name: DIALECT_ENV.to_string(),
                        value: v,
                    })
                }
            },
        };

        let config = Self {
            stage_timeout: Duration::from_secs(stage_secs),
            store_timeout: Duration::from_secs(store_secs),
            default_limit,
            max_limit,
            namespace,
            dialect,
        };
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<(), SettingsError> {
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(SettingsError::Inconsistent(format!(
                "default limit {} must be between 1 and the max limit {}",
                self.default_limit, self.max_limit
            )));
        }
        if self.stage_timeout.is_zero() || self.store_timeout.is_zero() {
            return Err(SettingsError::Inconsistent("timeouts must be positive".into()));
        }
        Ok(())
    }
}

fn env_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, SettingsError> {
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let v = raw.trim();
    if v.is_empty() {
        return Ok(default);
    }
    let parsed = v.parse::<u64>().map_err(|_| SettingsError::NotAnInteger {
        name: name.to_string(),
        value: v.to_string(),
    })?;
    Ok(parsed.clamp(min, max))
}
