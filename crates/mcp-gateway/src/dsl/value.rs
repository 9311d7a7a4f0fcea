//! Runtime value model for the template language.
//!
//! A tagged variant with total member/index lookup: probing a field that is
//! absent yields `Null` rather than an error, so deep template paths degrade
//! gracefully while root identifiers stay checkable.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{DslError, DslResult};

/// A template-language value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Type name used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Seq(_) => "seq",
            Self::Map(_) => "map",
        }
    }

    /// Truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::Seq(items) => !items.is_empty(),
            Self::Map(entries) => !entries.is_empty(),
        }
    }

    /// Total member lookup: `Null` when the value is not a map or the key
    /// is absent.
    #[must_use]
    pub fn member(&self, name: &str) -> Self {
        match self {
            Self::Map(entries) => entries.get(name).cloned().unwrap_or(Self::Null),
            _ => Self::Null,
        }
    }

    /// Total index lookup: sequences by position, maps by stringified key.
    #[must_use]
    pub fn index(&self, key: &Self) -> Self {
        match (self, key) {
            (Self::Seq(items), Self::Number(n)) => {
                if n.fract() != 0.0 || *n < 0.0 {
                    return Self::Null;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let position = *n as usize;
                items.get(position).cloned().unwrap_or(Self::Null)
            }
            (Self::Map(_), Self::String(s)) => self.member(s),
            _ => Self::Null,
        }
    }

    /// The numeric payload, or a type error.
    pub fn as_number(&self) -> DslResult<f64> {
        match self {
            Self::Number(n) => Ok(*n),
            other => Err(DslError::type_error("number", other.type_name())),
        }
    }

    /// The string payload, or a type error.
    pub fn as_str(&self) -> DslResult<&str> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(DslError::type_error("string", other.type_name())),
        }
    }

    /// The sequence payload, or a type error.
    pub fn as_seq(&self) -> DslResult<&[Value]> {
        match self {
            Self::Seq(items) => Ok(items),
            other => Err(DslError::type_error("seq", other.type_name())),
        }
    }

    /// The map payload, or a type error.
    pub fn as_map(&self) -> DslResult<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Ok(entries),
            other => Err(DslError::type_error("map", other.type_name())),
        }
    }

    /// Render the value the way `toString` does: strings bare, numbers
    /// without a trailing `.0`, containers as JSON.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
            Self::Seq(_) | Self::Map(_) => self.to_json().to_string(),
        }
    }

    /// Convert to a `serde_json::Value`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Seq(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Convert from a `serde_json::Value`.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Seq(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries.iter().map(|(k, v)| (k.clone(), Self::from_json(v))).collect(),
            ),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Integer-looking floats print without a fractional part.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
