//! WaiveFront viewer
//!
//! Standalone window front end: owns the GL surface, drives one engine tick per redraw and
//! forwards keyboard and file-watch events.
//!
//! Keys: `R` recompile, `Space` step a `stepped` video, `Esc` quit.

mod hotreload;

use std::ffi::CString;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use glutin::config::ConfigTemplateBuilder;
use glutin::context::{ContextApi, ContextAttributesBuilder, NotCurrentContext, Version};
use glutin::display::GetGlDisplay;
use glutin::prelude::*;
use glutin::surface::{SurfaceAttributesBuilder, SwapInterval, WindowSurface};
use glutin_winit::DisplayBuilder;
use raw_window_handle::HasRawWindowHandle;
use winit::dpi::PhysicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};

use waivefront_engine::assets::AssetsRoot;
use waivefront_engine::config::{load_engine_config, ConfigMode};
use waivefront_engine::shader::GlowBackend;
use waivefront_engine::{loge, logi, logw, Engine, EngineEvent};

use crate::hotreload::HotReload;

const TITLE: &str = "waivefront";

#[derive(Debug, Default)]
struct Args {
    log_file: Option<PathBuf>,
    assets: Option<PathBuf>,
    video: Option<PathBuf>,
    strict: bool,
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "--log-file" => args.log_file = it.next().map(PathBuf::from),
            "--assets" => args.assets = it.next().map(PathBuf::from),
            "--video" => args.video = it.next().map(PathBuf::from),
            "--strict" => args.strict = true,
            other => eprintln!("ignoring unknown argument '{other}'"),
        }
    }
    if args.log_file.is_none() {
        if let Ok(p) = std::env::var("WAIVEFRONT_LOG_FILE") {
            if !p.trim().is_empty() {
                args.log_file = Some(PathBuf::from(p));
            }
        }
    }
    args
}

fn locate_assets(explicit: Option<&Path>) -> anyhow::Result<AssetsRoot> {
    if let Some(dir) = explicit {
        return Ok(AssetsRoot::at(dir)?);
    }
    let cwd = std::env::current_dir().context("reading current directory")?;
    AssetsRoot::discover(&cwd)
        .or_else(|_| AssetsRoot::discover(Path::new(env!("CARGO_MANIFEST_DIR"))))
        .context("locating assets/ (set WAIVEFRONT_ASSETS or pass --assets)")
}

fn log_event(ev: &EngineEvent, window: &winit::window::Window) {
    match ev {
        EngineEvent::ShaderCompileOk { generation, uniforms } => {
            logi!("SHADER", "active program: generation {generation}, {uniforms} uniforms");
            window.set_title(TITLE);
        }
        EngineEvent::ShaderCompileErr { stage, location, .. } => {
            let stage = stage.map(|s| s.as_str()).unwrap_or("link");
            let at = location.map(|l| format!(" line {}", l.line)).unwrap_or_default();
            window.set_title(&format!("{TITLE} - {stage} error{at} (previous program active)"));
        }
        EngineEvent::LoaderState { loader_id, label, status } => {
            logi!("VIDEO", "loader #{loader_id} {label}: {}", status.as_str());
        }
        EngineEvent::OscBound { addr, source } => logi!("OSC", "bound {addr} as '{source}'"),
        EngineEvent::Stats { fps, texture_uploads, osc } => {
            let osc = osc
                .map(|s| format!(" osc rx={} ok={} bad={} rej={}", s.received, s.dispatched, s.malformed, s.rejected))
                .unwrap_or_default();
            logi!("RENDER", "fps={fps:.1} uploads={texture_uploads}{osc}");
        }
        EngineEvent::ConfigLoaded { kind, path } => logi!("CONFIG", "{kind:?} loaded: {}", path.display()),
        EngineEvent::ConfigError { kind, path, error } => {
            logw!("CONFIG", "{kind:?} {}: {error}", path.display())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args();
    let run_id = waivefront_engine::logging::init(args.log_file.clone());
    logi!("INIT", "run_id={run_id}");

    let assets = locate_assets(args.assets.as_deref())?;
    let mode = if args.strict { ConfigMode::Strict } else { ConfigMode::Lenient };
    let mut cfg = load_engine_config(&assets, mode)?;
    if let Some(v) = &args.video {
        cfg.video.path = Some(v.clone());
    }
    logi!("INIT", "fragment shader: {}", cfg.render.fragment_path.display());

    let mut engine: Engine<GlowBackend> = Engine::from_config(&cfg)?;
    let events = engine.events();
    let shutdown = engine.shutdown_handle();

    let hot = match HotReload::new(&engine.shader_source().watched_paths()) {
        Ok(h) => Some(h),
        Err(e) => {
            logw!("WATCH", "hot reload disabled: {e}");
            None
        }
    };

    let event_loop = EventLoop::new().context("creating event loop")?;
    let window_builder = winit::window::WindowBuilder::new()
        .with_title(TITLE)
        .with_inner_size(PhysicalSize::new(1280, 720));

    let template = ConfigTemplateBuilder::new().with_alpha_size(8).with_depth_size(0);
    let display_builder = DisplayBuilder::new().with_window_builder(Some(window_builder));

    let (window, gl_config) = display_builder
        .build(&event_loop, template, |configs| {
            // glutin only calls this with a non-empty set.
            configs
                .reduce(|a, b| if a.num_samples() > b.num_samples() { a } else { b })
                .expect("at least one GL config")
        })
        .map_err(|e| anyhow::anyhow!("building GL display: {e}"))?;
    let window = window.context("no window created")?;

    let raw_window_handle = window.raw_window_handle();
    let gl_display = gl_config.display();

    let context_attributes = ContextAttributesBuilder::new()
        .with_context_api(ContextApi::OpenGl(Some(Version::new(3, 3))))
        .build(Some(raw_window_handle));

    let not_current_gl_context: NotCurrentContext = unsafe {
        gl_display
            .create_context(&gl_config, &context_attributes)
            .context("creating GL context")?
    };

    let size = window.inner_size();
    let attrs = SurfaceAttributesBuilder::<WindowSurface>::new().build(
        raw_window_handle,
        NonZeroU32::new(size.width).unwrap_or(NonZeroU32::MIN),
        NonZeroU32::new(size.height).unwrap_or(NonZeroU32::MIN),
    );
    let gl_surface = unsafe {
        gl_display
            .create_window_surface(&gl_config, &attrs)
            .context("creating window surface")?
    };
    let gl_context = not_current_gl_context
        .make_current(&gl_surface)
        .context("making GL context current")?;

    if let Err(e) = gl_surface.set_swap_interval(&gl_context, SwapInterval::Wait(NonZeroU32::MIN)) {
        logw!("RENDER", "vsync unavailable: {e}");
    }

    let gl = unsafe {
        glow::Context::from_loader_function(|s| match CString::new(s) {
            Ok(c) => gl_display.get_proc_address(&c) as *const _,
            Err(_) => std::ptr::null(),
        })
    };

    engine.bind_surface(GlowBackend::new(Arc::new(gl)), size.width, size.height)?;

    event_loop.run(move |event, target| {
        target.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => shutdown.request(),

                WindowEvent::KeyboardInput { event, .. } if event.state.is_pressed() => {
                    if let PhysicalKey::Code(code) = event.physical_key {
                        match code {
                            KeyCode::Escape => shutdown.request(),
                            KeyCode::KeyR => {
                                logi!("SHADER", "reload requested");
                                engine.request_reload();
                            }
                            KeyCode::Space => engine.advance_video(),
                            _ => {}
                        }
                    }
                }

                WindowEvent::Resized(new_size) => {
                    let w = NonZeroU32::new(new_size.width).unwrap_or(NonZeroU32::MIN);
                    let h = NonZeroU32::new(new_size.height).unwrap_or(NonZeroU32::MIN);
                    gl_surface.resize(&gl_context, w, h);
                    engine.resize(w.get(), h.get());
                }

                WindowEvent::RedrawRequested => {
                    if let Some(hot) = &hot {
                        let changed: Vec<_> = hot.rx().try_iter().collect();
                        if let Some(hotreload::HotEvent::ShaderChanged(p)) = changed.last() {
                            logi!("WATCH", "{} changed", p.display());
                            engine.request_reload();
                        }
                    }

                    match engine.tick() {
                        Ok(r) if r.shutdown => {
                            target.exit();
                            return;
                        }
                        Ok(r) => {
                            if let Some(reason) = r.loader_failed {
                                logw!("VIDEO", "video stopped: {reason}");
                            }
                        }
                        Err(e) if e.is_structural() => {
                            loge!("RENDER", "{e}");
                            target.exit();
                            return;
                        }
                        Err(e) => logw!("RENDER", "{e}"),
                    }

                    for ev in events.try_iter() {
                        log_event(&ev, &window);
                    }

                    if let Err(e) = gl_surface.swap_buffers(&gl_context) {
                        logw!("RENDER", "swap_buffers failed: {e}");
                    }
                }

                _ => {}
            },

            Event::AboutToWait => window.request_redraw(),

            _ => {}
        }
    })?;

    Ok(())
}
