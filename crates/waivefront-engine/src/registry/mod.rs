//! Parameter registry
//!
//! A typed, tagged key/value store for live control values. Tags are grouped into categories
//! and addressed by their qualified name (`category/name`). Values are written by data sources
//! (OSC, host parameters, built-in defaults) and read once per tick by the render thread from
//! an immutable snapshot.
//!
//! Mental model:
//! - **Declarations** (categories + tags) say what exists and which type each value has.
//! - **Items** are the current values, one per (source, tag).
//! - **Lookup** resolves a tag across sources: the most recently registered source holding an
//!   item for the tag wins; the others stay addressable by source name.

mod sources;

pub use sources::{DataSource, DataSources, RegistrySnapshot};

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Declared type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Float,
    Int,
    String,
    #[serde(alias = "boolean")]
    Bool,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Float => "float",
            ValueKind::Int => "int",
            ValueKind::String => "string",
            ValueKind::Bool => "bool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float" => Some(ValueKind::Float),
            "int" => Some(ValueKind::Int),
            "string" => Some(ValueKind::String),
            "bool" | "boolean" => Some(ValueKind::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live control value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f32),
    Int(i32),
    String(String),
    Bool(bool),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Float(_) => ValueKind::Float,
            Value::Int(_) => ValueKind::Int,
            Value::String(_) => ValueKind::String,
            Value::Bool(_) => ValueKind::Bool,
        }
    }

    /// Interpret a JSON default against a declared kind.
    pub fn from_json(kind: ValueKind, v: &serde_json::Value) -> Option<Self> {
        match kind {
            ValueKind::Float => v.as_f64().map(|f| Value::Float(f as f32)),
            ValueKind::Int => v.as_i64().and_then(|i| i32::try_from(i).ok()).map(Value::Int),
            ValueKind::String => v.as_str().map(|s| Value::String(s.to_string())),
            ValueKind::Bool => v.as_bool().map(Value::Bool),
        }
    }

    /// Zero value used when a tag has no declared default.
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Int => Value::Int(0),
            ValueKind::String => Value::String(String::new()),
            ValueKind::Bool => Value::Bool(false),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "\"{v}\""),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// `category/name`, e.g. `synth/filter/cutoff` (category `synth`, tag `filter/cutoff`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTag(Arc<str>);

impl QualifiedTag {
    pub fn new(category: &str, name: &str) -> Result<Self> {
        let category = category.trim_matches('/');
        let name = name.trim_matches('/');
        if category.is_empty() || category.contains('/') {
            return Err(EngineError::Configuration(format!(
                "invalid category name '{category}'"
            )));
        }
        if name.is_empty() {
            return Err(EngineError::Configuration(format!(
                "empty tag name in category '{category}'"
            )));
        }
        Ok(Self(Arc::from(format!("{category}/{name}"))))
    }

    /// Parse `category/name` (a leading slash is accepted).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('/');
        match s.split_once('/') {
            Some((category, name)) => Self::new(category, name),
            None => Err(EngineError::Configuration(format!(
                "tag '{s}' is not qualified (expected category/name)"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn category(&self) -> &str {
        self.0.split_once('/').map(|(c, _)| c).unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or("")
    }

    /// GLSL-safe identifier for this tag: `synth/filter/cutoff` -> `synth_filter_cutoff`.
    pub fn uniform_ident(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for QualifiedTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named grouping of tags. Immutable once declared.
#[derive(Debug, Clone, PartialEq)]
pub struct DataCategory {
    pub name: String,
    pub presentation_name: String,
    pub order: i32,
}

impl DataCategory {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            presentation_name: name.clone(),
            name,
            order: 0,
        }
    }
}

/// Which adapter owns writes to a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlOrigin {
    #[default]
    Osc,
    Host,
    Internal,
}

impl ControlOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlOrigin::Osc => "osc",
            ControlOrigin::Host => "host",
            ControlOrigin::Internal => "internal",
        }
    }
}

/// A declared parameter: qualified name + value type + render-side hints.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTag {
    pub qualified: QualifiedTag,
    pub kind: ValueKind,
    pub default: Option<Value>,
    /// Exponential smoothing coefficient in 0..1 (0 = exact push).
    pub smoothing: f32,
    pub control: ControlOrigin,
}

impl DataTag {
    pub fn new(qualified: QualifiedTag, kind: ValueKind) -> Self {
        Self {
            qualified,
            kind,
            default: None,
            smoothing: 0.0,
            control: ControlOrigin::Osc,
        }
    }

    pub fn with_default(mut self, v: Value) -> Self {
        self.default = Some(v);
        self
    }

    pub fn with_smoothing(mut self, s: f32) -> Self {
        self.smoothing = s.clamp(0.0, 1.0);
        self
    }

    pub fn with_control(mut self, c: ControlOrigin) -> Self {
        self.control = c;
        self
    }

    pub fn category(&self) -> &str {
        self.qualified.category()
    }

    /// Same identity and type; render hints may differ.
    fn compatible_with(&self, other: &DataTag) -> bool {
        self.qualified == other.qualified && self.kind == other.kind
    }
}

/// Current value for a tag, as written by one source.
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub tag: QualifiedTag,
    pub value: Value,
    pub updated_at: Instant,
    pub source: Arc<str>,
}
