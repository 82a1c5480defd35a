use std::path::PathBuf;

use thiserror::Error;

use crate::registry::ValueKind;

/// Which shader stage a compile error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
        }
    }
}

/// Line/column reported by the driver's info log, when it reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u32,
    pub column: Option<u32>,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.column {
            Some(c) => write!(f, "{}:{}", self.line, c),
            None => write!(f, "{}", self.line),
        }
    }
}

fn fmt_location(loc: &Option<SourceLocation>) -> String {
    loc.map(|l| format!(" at {l}")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad source name, bad endpoint, conflicting declarations.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data source '{0}' is already registered")]
    DuplicateSource(String),

    #[error("data source '{0}' is not registered")]
    UnknownSource(String),

    #[error("tag '{0}' is not declared")]
    UnknownTag(String),

    #[error("tag '{tag}' is controlled by {owner}")]
    ControlConflict { tag: String, owner: &'static str },

    #[error("type mismatch for tag '{tag}': declared {expected}, got {actual}")]
    TypeMismatch {
        tag: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("video source not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    #[error("unsupported video format for {}: {reason}", .path.display())]
    UnsupportedFormat { path: PathBuf, reason: String },

    /// Malformed input that is not tied to a file (OSC packets, decoder output).
    #[error("format error: {0}")]
    Format(String),

    #[error("{} shader compile error{}:\n{log}", .stage.as_str(), fmt_location(.location))]
    Compile {
        stage: ShaderStage,
        location: Option<SourceLocation>,
        log: String,
    },

    #[error("program link error:\n{log}")]
    Link { log: String },

    /// GPU allocation failure.
    #[error("GPU resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("GPU context lost")]
    ContextLost,

    #[error("video loader failed: {reason}")]
    LoaderFailed { reason: String },

    #[error("no GPU surface bound")]
    NoSurface,

    /// The `assets/` folder could not be found.
    #[error("could not locate assets/ starting from {}", .start_dir.display())]
    AssetsNotFound { start_dir: PathBuf },

    #[error("I/O error for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parse error for {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON-to-typed deserialization error (when the JSON is already parsed).
    #[error("JSON deserialize error for {}: {source}", .path.display())]
    JsonValue {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Config is syntactically valid but semantically invalid.
    #[error("invalid config {}: {msg}", .path.display())]
    InvalidConfig { path: PathBuf, msg: String },
}

impl EngineError {
    /// Structural errors need a user-visible response; everything else is per-input noise.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EngineError::SourceNotFound { .. }
                | EngineError::UnsupportedFormat { .. }
                | EngineError::Link { .. }
                | EngineError::Compile { .. }
                | EngineError::ContextLost
                | EngineError::ResourceExhausted(_)
                | EngineError::LoaderFailed { .. }
                | EngineError::NoSurface
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
