//! Field kinds and typed field values for fact records.
//!
//! Fact classes in this engine are plain descriptor values: a type declares a
//! schema of named fields, each with a [`FieldKind`], and records carry
//! [`FieldValue`]s checked against that schema on assignment.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utilities::errors::BoardError;

/// The catalog of declarable field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Bytes,
    Bool,
    Int,
    Float,
    /// Accepts int or float.
    Numeric,
    Dict,
    List,
    /// A list whose elements must all be dicts.
    ListOfDicts,
    /// Accepts string or bytes.
    StringOrBytes,
    /// Accepts any value; the worker owns validation.
    Custom,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Numeric => "numeric",
            Self::Dict => "dict",
            Self::List => "list",
            Self::ListOfDicts => "list_of_dicts",
            Self::StringOrBytes => "string_or_bytes",
            Self::Custom => "custom",
        };
        write!(f, "{name}")
    }
}

/// A dynamically typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Dict(BTreeMap<String, FieldValue>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Short name of the value's runtime shape, for error messages.
    pub fn shape(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Dict(_) => "dict",
            Self::List(_) => "list",
        }
    }

    /// The contained string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl FieldKind {
    /// Whether `value` is acceptable for this kind.
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match self {
            Self::String => matches!(value, FieldValue::String(_)),
            Self::Bytes => matches!(value, FieldValue::Bytes(_)),
            Self::Bool => matches!(value, FieldValue::Bool(_)),
            Self::Int => matches!(value, FieldValue::Int(_)),
            Self::Float => matches!(value, FieldValue::Float(_)),
            Self::Numeric => matches!(value, FieldValue::Int(_) | FieldValue::Float(_)),
            Self::Dict => matches!(value, FieldValue::Dict(_)),
            Self::List => matches!(value, FieldValue::List(_)),
            Self::ListOfDicts => match value {
                FieldValue::List(items) => {
                    items.iter().all(|item| matches!(item, FieldValue::Dict(_)))
                }
                _ => false,
            },
            Self::StringOrBytes => {
                matches!(value, FieldValue::String(_) | FieldValue::Bytes(_))
            }
            Self::Custom => true,
        }
    }
}

/// Declaration of a single field within a fact type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<FieldValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            allowed_values: None,
            help: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<FieldValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_allowed_values(
        mut self,
        values: impl IntoIterator<Item = FieldValue>,
    ) -> Self {
        self.allowed_values = Some(values.into_iter().collect());
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Check `value` against the declared kind and allowed set.
    pub fn check(&self, field: &str, value: &FieldValue) -> Result<(), BoardError> {
        if !self.kind.accepts(value) {
            return Err(BoardError::FieldType {
                field: field.to_string(),
                detail: format!("expected {} value, got {}", self.kind, value.shape()),
            });
        }
        if let Some(allowed) = &self.allowed_values {
            if !allowed.contains(value) {
                return Err(BoardError::DisallowedValue {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}
