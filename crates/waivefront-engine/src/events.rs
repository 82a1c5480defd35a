use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{ShaderStage, SourceLocation};
use crate::osc::OscStats;
use crate::video::LoaderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Render,
    Params,
    Video,
}

/// Status published by the engine for front ends. Never carries an error object across
/// threads; failures are rendered to text first.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A configuration file was successfully loaded.
    ConfigLoaded { kind: ConfigKind, path: PathBuf },

    /// A configuration file failed to load or validate.
    ConfigError { kind: ConfigKind, path: PathBuf, error: String },

    /// A program linked and is now active.
    ShaderCompileOk { generation: u64, uniforms: usize },

    /// Compile or link failed; the previous program (if any) stays active.
    ShaderCompileErr {
        stage: Option<ShaderStage>,
        location: Option<SourceLocation>,
        log: String,
    },

    /// The video loader changed state.
    LoaderState { loader_id: u64, label: String, status: LoaderStatus },

    OscBound { addr: SocketAddr, source: String },

    /// Once per second while ticking.
    Stats { fps: f32, texture_uploads: u64, osc: Option<OscStats> },
}
