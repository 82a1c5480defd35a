//! Frame orchestrator
//!
//! [`Engine`] owns the registry, the host and defaults sources, the (single) video loader,
//! the shader source and, once a surface is bound, every GPU object. Front ends call
//! [`Tickable::tick`] once per display refresh on the thread that owns the GPU context and
//! never touch registry or decode internals directly.
//!
//! Per tick: snapshot registry -> latest frame -> upload if new -> push uniforms -> draw.
//! Nothing in a tick blocks on another thread.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::config::{EngineConfig, ParamsJson};
use crate::error::{EngineError, Result};
use crate::events::{ConfigKind, EngineEvent};
use crate::osc::{OscConfig, OscServer, OscStats};
use crate::registry::{ControlOrigin, DataSource, DataSources, Value};
use crate::shader::{
    FrameContext, GpuBackend, ShaderProgram, ShaderRectangle, ShaderSource, ShaderTexture,
    UniformBindings,
};
use crate::validate::IssueLevel;
use crate::video::{FrameDecoder, LoaderStatus, VideoConfig, VideoFrameDescription, VideoLoader};

/// Source names owned by the engine itself.
pub const DEFAULTS_SOURCE: &str = "internal:defaults";
pub const HOST_SOURCE: &str = "host";

/// Texture unit the video frame is bound to.
const FRAME_TEXTURE_UNIT: u32 = 0;

const EVENT_CAPACITY: usize = 256;
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// What a front end implements against: a surface to bind and a tick to drive.
pub trait Tickable {
    type Surface;

    fn bind_surface(&mut self, surface: Self::Surface, width: u32, height: u32) -> Result<()>;

    fn tick(&mut self) -> Result<TickReport>;
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// A program was active and the rectangle was drawn.
    pub drew: bool,
    /// A new frame was uploaded this tick.
    pub uploaded: bool,
    pub uniforms_pushed: usize,
    /// `(loader id, sequence)` now in the frame texture.
    pub frame: Option<(u64, u64)>,
    /// Shutdown was requested; GPU objects have been released.
    pub shutdown: bool,
    /// The loader gave up this tick and was detached. The last frame stays on screen.
    pub loader_failed: Option<String>,
}

/// Asks the render thread to recompile at its next tick. `Clone + Send`.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    flag: Arc<AtomicBool>,
}

impl ReloadHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Asks the engine to tear down at its next tick. `Clone + Send`.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct GpuState<B: GpuBackend> {
    backend: B,
    program: Option<ShaderProgram>,
    rect: ShaderRectangle,
    texture: ShaderTexture,
}

impl<B: GpuBackend> GpuState<B> {
    fn release(self) -> B {
        let GpuState {
            mut backend,
            program,
            rect,
            mut texture,
        } = self;
        if let Some(p) = program {
            p.release(&mut backend);
        }
        rect.release(&mut backend);
        texture.release(&mut backend);
        backend
    }
}

pub struct Engine<B: GpuBackend> {
    registry: DataSources,
    defaults: DataSource,
    host: DataSource,
    bindings: UniformBindings,
    clear_color: [f32; 4],
    source: ShaderSource,
    video: Option<VideoLoader>,
    video_size: Option<(u32, u32)>,
    last_loader_status: Option<(u64, LoaderStatus)>,
    osc: Option<OscServer>,
    gpu: Option<GpuState<B>>,
    size: (u32, u32),
    frame_index: u64,
    started: Instant,
    reload: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    stats_since: Instant,
    ticks_since: u64,
}

impl<B: GpuBackend> Engine<B> {
    /// Engine over a fresh registry with the defaults and host sources registered.
    pub fn new(source: ShaderSource) -> Result<Self> {
        Self::with_registry(DataSources::new(), source)
    }

    /// Engine over an existing registry (shared with another adapter).
    pub fn with_registry(registry: DataSources, source: ShaderSource) -> Result<Self> {
        let defaults = registry.register_source(DEFAULTS_SOURCE)?;
        let host = registry.register_source(HOST_SOURCE)?;
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let now = Instant::now();
        Ok(Self {
            registry,
            defaults,
            host,
            bindings: UniformBindings::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            source,
            video: None,
            video_size: None,
            last_loader_status: None,
            osc: None,
            gpu: None,
            size: (0, 0),
            frame_index: 0,
            started: now,
            reload: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx,
            stats_since: now,
            ticks_since: 0,
        })
    }

    /// Build everything a loaded config describes: declarations and defaults, OSC, video.
    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        let mut engine = Self::new(cfg.render.shader_source()?)?;
        engine.report_config(cfg);
        engine.bindings = cfg.render.bindings.clone();
        engine.clear_color = cfg.render.clear_color;
        engine.declare_params(&cfg.params)?;
        if cfg.params.osc.enabled {
            engine.start_osc(&cfg.params.osc)?;
        }
        if let Some(path) = &cfg.video.path {
            engine.open_video(path, &cfg.video.config)?;
        }
        Ok(engine)
    }

    fn report_config(&self, cfg: &EngineConfig) {
        let files = [
            (ConfigKind::Render, &cfg.paths.render_json),
            (ConfigKind::Params, &cfg.paths.params_json),
            (ConfigKind::Video, &cfg.paths.video_json),
        ];
        for (kind, path) in files {
            if path.is_file() {
                self.emit(EngineEvent::ConfigLoaded {
                    kind,
                    path: path.clone(),
                });
            }
        }
        for issue in cfg.issues.iter().filter(|i| i.level == IssueLevel::Error) {
            self.emit(EngineEvent::ConfigError {
                kind: ConfigKind::Params,
                path: cfg.paths.params_json.clone(),
                error: format!("{}: {}", issue.path, issue.message),
            });
        }
    }

    pub fn set_bindings(&mut self, bindings: UniformBindings) {
        self.bindings = bindings;
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    /// Declare categories and tags, then write declared defaults through the defaults source.
    pub fn declare_params(&mut self, params: &ParamsJson) -> Result<()> {
        let defaults = params.declare(&self.registry);
        for (tag, value) in defaults {
            self.defaults.set(tag.as_str(), value)?;
        }
        crate::logi!(
            "REGISTRY",
            "declared {} tags in {} categories",
            self.registry.snapshot().tag_count(),
            self.registry.snapshot().categories().len()
        );
        Ok(())
    }

    /// Start (or restart) OSC ingestion.
    pub fn start_osc(&mut self, cfg: &OscConfig) -> Result<SocketAddr> {
        // Drop the old server first so its source name and port are free.
        self.osc = None;
        let server = OscServer::start(cfg, &self.registry)?;
        let addr = server.local_addr();
        self.emit(EngineEvent::OscBound {
            addr,
            source: server.source_name().to_string(),
        });
        self.osc = Some(server);
        Ok(addr)
    }

    pub fn stop_osc(&mut self) {
        self.osc = None;
    }

    pub fn osc_addr(&self) -> Option<SocketAddr> {
        self.osc.as_ref().map(OscServer::local_addr)
    }

    pub fn osc_stats(&self) -> Option<OscStats> {
        self.osc.as_ref().map(OscServer::stats)
    }

    /// Open a video file, replacing the current source.
    pub fn open_video(&mut self, path: &Path, cfg: &VideoConfig) -> Result<VideoFrameDescription> {
        let loader = VideoLoader::open(path, cfg)?;
        Ok(self.install_loader(loader))
    }

    /// Open any decoder, replacing the current source.
    pub fn open_video_with(
        &mut self,
        decoder: Box<dyn FrameDecoder>,
        label: &str,
        cfg: &VideoConfig,
    ) -> Result<VideoFrameDescription> {
        let loader = VideoLoader::open_with(decoder, label, cfg)?;
        Ok(self.install_loader(loader))
    }

    fn install_loader(&mut self, loader: VideoLoader) -> VideoFrameDescription {
        let desc = loader.description().clone();
        self.video_size = Some((desc.width, desc.height));
        self.video = Some(loader);
        desc
    }

    /// Detach the loader and drop its frame from the GPU texture.
    pub fn close_video(&mut self) {
        self.video = None;
        self.video_size = None;
        self.frame_index = 0;
        if let Some(gpu) = self.gpu.as_mut() {
            gpu.texture.release(&mut gpu.backend);
        }
    }

    pub fn video(&self) -> Option<&VideoLoader> {
        self.video.as_ref()
    }

    /// Release one frame from a stepped loader.
    pub fn advance_video(&self) {
        if let Some(v) = &self.video {
            v.advance();
        }
    }

    /// Host-controlled write (plugin parameter, transport). Strictly typed, and only for tags
    /// declared with `control: host`.
    pub fn set_parameter(&self, tag: &str, value: Value) -> Result<()> {
        if let Some(declared) = self.registry.tag(tag) {
            if declared.control != ControlOrigin::Host {
                return Err(EngineError::ControlConflict {
                    tag: declared.qualified.as_str().to_string(),
                    owner: declared.control.as_str(),
                });
            }
        }
        self.host.set(tag, value)
    }

    pub fn registry(&self) -> &DataSources {
        &self.registry
    }

    pub fn shader_source(&self) -> &ShaderSource {
        &self.source
    }

    pub fn program(&self) -> Option<&ShaderProgram> {
        self.gpu.as_ref().and_then(|g| g.program.as_ref())
    }

    pub fn texture_upload_count(&self) -> u64 {
        self.gpu.as_ref().map(|g| g.texture.upload_count()).unwrap_or(0)
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.size
    }

    pub fn is_bound(&self) -> bool {
        self.gpu.is_some()
    }

    /// Status events; every call returns a receiver on the same channel.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        ReloadHandle {
            flag: Arc::clone(&self.reload),
        }
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Release);
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = (width.max(1), height.max(1));
    }

    /// Create GPU objects on `backend` and link the current program.
    ///
    /// Rebinding releases the previous surface's objects first. With no program to fall back
    /// on, a compile or link failure is returned and the surface stays unbound.
    pub fn bind_surface(&mut self, backend: B, width: u32, height: u32) -> Result<()> {
        if let Some(old) = self.gpu.take() {
            old.release();
        }
        let mut backend = backend;
        self.resize(width, height);

        let rect = ShaderRectangle::create(&mut backend)?;
        let snap = self.registry.snapshot();
        match ShaderProgram::link(&mut backend, &self.source, &self.bindings, &snap) {
            Ok(program) => {
                self.emit(EngineEvent::ShaderCompileOk {
                    generation: program.generation(),
                    uniforms: program.uniforms().len(),
                });
                self.gpu = Some(GpuState {
                    backend,
                    program: Some(program),
                    rect,
                    texture: ShaderTexture::new(),
                });
                crate::logi!("RENDER", "surface bound {}x{}", self.size.0, self.size.1);
                Ok(())
            }
            Err(e) => {
                self.report_shader_error(&e);
                rect.release(&mut backend);
                Err(e)
            }
        }
    }

    /// Re-read file-backed shader stages and relink.
    ///
    /// On failure the active program keeps running and the error is returned.
    pub fn reload_shader(&mut self) -> Result<()> {
        if let Err(e) = self.source.reload() {
            crate::logw!("SHADER", "reload failed, keeping current source: {e}");
            return Err(e);
        }
        let Some(gpu) = self.gpu.as_mut() else {
            return Ok(());
        };
        let snap = self.registry.snapshot();
        match ShaderProgram::link(&mut gpu.backend, &self.source, &self.bindings, &snap) {
            Ok(program) => {
                if let Some(old) = gpu.program.replace(program) {
                    old.release(&mut gpu.backend);
                }
                let (generation, uniforms) = gpu
                    .program
                    .as_ref()
                    .map(|p| (p.generation(), p.uniforms().len()))
                    .unwrap_or_default();
                self.emit(EngineEvent::ShaderCompileOk { generation, uniforms });
                Ok(())
            }
            Err(e) => {
                self.report_shader_error(&e);
                Err(e)
            }
        }
    }

    /// Replace the shader text and relink (front ends that edit shaders in memory).
    pub fn set_shader_source(&mut self, source: ShaderSource) -> Result<()> {
        let previous = std::mem::replace(&mut self.source, source);
        match self.reload_shader() {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.gpu.as_ref().map(|g| g.program.is_none()).unwrap_or(true) {
                    self.source = previous;
                }
                Err(e)
            }
        }
    }

    fn report_shader_error(&self, e: &EngineError) {
        crate::loge!("SHADER", "{e}");
        let (stage, location, log) = match e {
            EngineError::Compile { stage, location, log } => (Some(*stage), *location, log.clone()),
            EngineError::Link { log } => (None, None, log.clone()),
            other => (None, None, other.to_string()),
        };
        self.emit(EngineEvent::ShaderCompileErr { stage, location, log });
    }

    fn emit(&self, ev: EngineEvent) {
        // A front end that never drains the channel loses events, not frames.
        let _ = self.events_tx.try_send(ev);
    }

    fn release_gpu(&mut self) {
        if let Some(gpu) = self.gpu.take() {
            gpu.release();
            crate::logi!("RENDER", "GPU objects released");
        }
    }

    fn poll_loader_status(&mut self) {
        let Some(v) = &self.video else {
            return;
        };
        let status = v.status();
        let changed = match &self.last_loader_status {
            Some((id, s)) => *id != v.id() || *s != status,
            None => true,
        };
        if changed {
            let ev = EngineEvent::LoaderState {
                loader_id: v.id(),
                label: v.label().to_string(),
                status: status.clone(),
            };
            self.last_loader_status = Some((v.id(), status));
            self.emit(ev);
        }
    }

    fn maybe_emit_stats(&mut self) {
        self.ticks_since += 1;
        let elapsed = self.stats_since.elapsed();
        if elapsed < STATS_INTERVAL {
            return;
        }
        let fps = self.ticks_since as f32 / elapsed.as_secs_f32();
        self.emit(EngineEvent::Stats {
            fps,
            texture_uploads: self.texture_upload_count(),
            osc: self.osc_stats(),
        });
        self.stats_since = Instant::now();
        self.ticks_since = 0;
    }

    /// One render tick. Must run on the thread that owns the GPU context.
    pub fn tick(&mut self) -> Result<TickReport> {
        if self.shutdown.load(Ordering::Acquire) {
            self.release_gpu();
            self.video = None;
            self.osc = None;
            return Ok(TickReport {
                shutdown: true,
                ..TickReport::default()
            });
        }

        if self.gpu.is_none() {
            return Err(EngineError::NoSurface);
        }
        if self.gpu.as_mut().map(|g| g.backend.is_context_lost()).unwrap_or(false) {
            crate::loge!("RENDER", "GPU context lost");
            return Err(EngineError::ContextLost);
        }

        if self.reload.swap(false, Ordering::AcqRel) {
            // Errors were already reported as events; the old program keeps drawing.
            let _ = self.reload_shader();
        }

        self.poll_loader_status();

        let snap = self.registry.snapshot();

        let mut report = TickReport::default();
        let frame = match self.video.as_ref().map(VideoLoader::latest_frame) {
            None => None,
            Some(Ok(f)) => f,
            Some(Err(e)) => {
                crate::loge!("VIDEO", "{e}; detaching loader, last frame stays on screen");
                // Catch a failure that landed after the poll above.
                self.poll_loader_status();
                self.video = None;
                report.loader_failed = Some(e.to_string());
                None
            }
        };
        let palette = self.video.as_ref().and_then(VideoLoader::palette);

        let (clear, size, video_size) = (self.clear_color, self.size, self.video_size);
        let Some(gpu) = self.gpu.as_mut() else {
            return Err(EngineError::NoSurface);
        };

        if let Some(frame) = &frame {
            report.uploaded = gpu.texture.sync(&mut gpu.backend, frame)?;
            if report.uploaded {
                self.frame_index = frame.frame_index;
            }
        }
        report.frame = gpu.texture.current_frame();

        gpu.backend.begin_frame(size.0, size.1, clear);
        if let Some(program) = gpu.program.as_mut() {
            gpu.texture.bind(&mut gpu.backend, FRAME_TEXTURE_UNIT);
            let ctx = FrameContext {
                time: self.started.elapsed().as_secs_f32(),
                width: size.0,
                height: size.1,
                frame_index: self.frame_index,
                video_size,
                palette,
                texture_unit: FRAME_TEXTURE_UNIT,
            };
            report.uniforms_pushed = program.apply(&mut gpu.backend, &snap, &ctx);
            gpu.rect.draw(&mut gpu.backend);
            report.drew = true;
        }

        self.maybe_emit_stats();
        Ok(report)
    }
}

impl<B: GpuBackend> Tickable for Engine<B> {
    type Surface = B;

    fn bind_surface(&mut self, surface: B, width: u32, height: u32) -> Result<()> {
        Engine::bind_surface(self, surface, width, height)
    }

    fn tick(&mut self) -> Result<TickReport> {
        Engine::tick(self)
    }
}

impl<B: GpuBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.release_gpu();
        // Join background threads before the registry handles go away.
        self.video = None;
        self.osc = None;
    }
}
