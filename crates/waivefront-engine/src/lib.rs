//! WaiveFront engine
//!
//! Live control values (OSC, host parameters) land in a typed registry; a decode thread
//! publishes video frames into a latest-wins cell; the render thread binds both into shader
//! uniforms and a frame texture once per tick.
//!
//! Front ends (the viewer window, a plugin adapter) own the GPU surface and the tick; see
//! [`Engine`] and [`Tickable`].

pub mod logging;

pub mod assets;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod osc;
pub mod registry;
pub mod shader;
pub mod validate;
pub mod video;

pub use engine::{Engine, ReloadHandle, ShutdownHandle, TickReport, Tickable};
pub use error::{EngineError, Result};
pub use events::EngineEvent;
pub use registry::{DataSource, DataSources, QualifiedTag, Value, ValueKind};
