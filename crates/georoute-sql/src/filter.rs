//! Filter clauses accepted by the query builder.
//!
//! Three JSON spellings are understood:
//!
//! ```text
//! {"active": true, "name": "Alice"}                 shorthand, `=` per key
//! {"age": {"op": ">=", "value": 18}}                 explicit operator per key
//! [{"column": "age", "operator": ">=", "value": 18}] explicit list
//! ```
//!
//! In the shorthand form a JSON array means `in` and `null` means `is`.

use crate::error::BuildError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    ILike,
    In,
    Is,
    IsNot,
}

impl FilterOp {
    pub const ALL: [FilterOp; 11] = [
        FilterOp::Eq,
        FilterOp::Ne,
        FilterOp::Gt,
        FilterOp::Ge,
        FilterOp::Lt,
        FilterOp::Le,
        FilterOp::Like,
        FilterOp::ILike,
        FilterOp::In,
        FilterOp::Is,
        FilterOp::IsNot,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Like => "like",
            FilterOp::ILike => "ilike",
            FilterOp::In => "in",
            FilterOp::Is => "is",
            FilterOp::IsNot => "is not",
        }
    }

    /// Operators whose right-hand side is a single bound scalar.
    pub fn is_comparison(self) -> bool {
        !matches!(self, FilterOp::In | FilterOp::Is | FilterOp::IsNot)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOp {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        let op = match normalized.as_str() {
            "=" | "==" => FilterOp::Eq,
            "!=" | "<>" => FilterOp::Ne,
            ">" => FilterOp::Gt,
            ">=" => FilterOp::Ge,
            "<" => FilterOp::Lt,
            "<=" => FilterOp::Le,
            "like" => FilterOp::Like,
            "ilike" => FilterOp::ILike,
            "in" => FilterOp::In,
            "is" => FilterOp::Is,
            "is not" => FilterOp::IsNot,
            _ => {
                return Err(BuildError::InvalidFilter(format!(
                    "unsupported operator `{s}`"
                )))
            }
        };
        Ok(op)
    }
}

impl TryFrom<String> for FilterOp {
    type Error = BuildError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilterOp> for String {
    fn from(op: FilterOp) -> Self {
        op.as_str().to_string()
    }
}

/// One `column <operator> value` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub column: String,
    #[serde(alias = "op")]
    pub operator: FilterOp,
    #[serde(default)]
    pub value: Value,
}

impl FilterClause {
    pub fn new(column: impl Into<String>, operator: FilterOp, value: Value) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value.into())
    }

    /// Check the value's shape against the operator.
    ///
    /// `in` needs a non-empty list of scalars. `is` and `is not` accept only
    /// JSON null or the string "null" in any case; the negation lives in the
    /// operator. Every other operator needs one non-null scalar.
    pub fn check_value(&self) -> Result<(), BuildError> {
        match self.operator {
            FilterOp::In => match &self.value {
                Value::Array(items) if items.is_empty() => Err(self.invalid("`in` needs at least one value")),
                Value::Array(items) => {
                    if items.iter().all(is_scalar) {
                        Ok(())
                    } else {
                        Err(self.invalid("`in` values must be non-null scalars"))
                    }
                }
                _ => Err(self.invalid("`in` needs a list value")),
            },
            FilterOp::Is | FilterOp::IsNot => {
                if is_null_like(&self.value) {
                    Ok(())
                } else {
                    Err(self.invalid("only null may be tested with `is` / `is not`"))
                }
            }
            op => {
                if is_scalar(&self.value) {
                    Ok(())
                } else if self.value.is_null() {
                    Err(self.invalid(&format!("`{op}` cannot compare against null; use `is`")))
                } else {
                    Err(self.invalid(&format!("`{op}` needs a scalar value")))
                }
            }
        }
    }

    fn invalid(&self, reason: &str) -> BuildError {
        BuildError::InvalidFilter(format!("{} {}: {reason}", self.column, self.operator))
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn is_null_like(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().eq_ignore_ascii_case("null"),
        _ => false,
    }
}

/// Parse filters from any of the accepted JSON spellings. `null` means none.
pub fn filters_from_json(value: &Value) -> Result<Vec<FilterClause>, BuildError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                serde_json::from_value::<FilterClause>(item.clone())
                    .map_err(|err| BuildError::InvalidFilter(format!("malformed filter {item}: {err}")))
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(column, spec)| keyed_filter(column, spec))
            .collect(),
        other => Err(BuildError::InvalidFilter(format!(
            "filters must be an object or a list, got {other}"
        ))),
    }
}

fn keyed_filter(column: &str, spec: &Value) -> Result<FilterClause, BuildError> {
    if let Value::Object(inner) = spec {
        let op = inner.get("op").or_else(|| inner.get("operator"));
        if let Some(op) = op {
            let op = op
                .as_str()
                .ok_or_else(|| BuildError::InvalidFilter(format!("{column}: operator must be a string")))?
                .parse()?;
            let value = inner.get("value").cloned().unwrap_or(Value::Null);
            return Ok(FilterClause::new(column, op, value));
        }
        return Err(BuildError::InvalidFilter(format!(
            "{column}: object filter needs an `op`"
        )));
    }

    let op = match spec {
        Value::Array(_) => FilterOp::In,
        Value::Null => FilterOp::Is,
        _ => FilterOp::Eq,
    };
    Ok(FilterClause::new(column, op, spec.clone()))
}
