// GPU backend with no GPU.
//
// Records every call into a shared log so tests (and headless runs) can observe what the
// renderer did: texture uploads, the last value pushed to each uniform, draw calls.
// "Compilation" is a light scan of the GLSL text:
//   - a line starting with `#error` fails the stage, reported at that line,
//   - a stage without `void main` fails the link,
//   - `uniform <type> <name>;` declarations become the active-uniform list.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use super::gpu::{
    ActiveUniform, GeometryId, GpuBackend, ProgramId, ShaderId, TextureId, UniformKind,
    UniformLocation, UniformValue,
};
use super::parse_source_location;
use crate::error::{EngineError, Result, ShaderStage};
use crate::video::PixelFormat;

#[derive(Debug, Clone)]
struct HeadlessTexture {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, Default)]
struct HeadlessLog {
    next_id: u32,
    shaders: HashMap<u32, String>,
    programs: HashMap<u32, Vec<(String, UniformKind)>>,
    textures: HashMap<u32, HeadlessTexture>,
    geometries: HashMap<u32, usize>,
    /// location id -> uniform name
    locations: HashMap<u32, String>,
    current_program: Option<u32>,
    bound: BTreeMap<u32, u32>,
    uniform_values: HashMap<String, UniformValue>,
    uniform_pushes: u64,
    texture_allocs: u64,
    uploads: u64,
    draws: u64,
    frames: u64,
    context_lost: bool,
}

impl HeadlessLog {
    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// Read side of a [`HeadlessBackend`]; cheap to clone and usable after the backend has been
/// moved into an engine.
#[derive(Debug, Clone, Default)]
pub struct HeadlessProbe {
    log: Arc<Mutex<HeadlessLog>>,
}

impl HeadlessProbe {
    fn lock(&self) -> MutexGuard<'_, HeadlessLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn upload_count(&self) -> u64 {
        self.lock().uploads
    }

    pub fn texture_alloc_count(&self) -> u64 {
        self.lock().texture_allocs
    }

    pub fn draw_count(&self) -> u64 {
        self.lock().draws
    }

    pub fn frame_count(&self) -> u64 {
        self.lock().frames
    }

    pub fn uniform_push_count(&self) -> u64 {
        self.lock().uniform_pushes
    }

    /// Last value pushed to the uniform called `name`, across programs.
    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.lock().uniform_values.get(name).copied()
    }

    /// Pixels of the texture bound to `unit`.
    pub fn bound_texture_pixels(&self, unit: u32) -> Option<Vec<u8>> {
        let log = self.lock();
        let id = log.bound.get(&unit)?;
        log.textures.get(id).map(|t| t.pixels.clone())
    }

    pub fn bound_texture_size(&self, unit: u32) -> Option<(u32, u32)> {
        let log = self.lock();
        let id = log.bound.get(&unit)?;
        log.textures.get(id).map(|t| (t.width, t.height))
    }

    /// Objects still alive: (shaders, programs, textures, geometries).
    pub fn live_objects(&self) -> (usize, usize, usize, usize) {
        let log = self.lock();
        (
            log.shaders.len(),
            log.programs.len(),
            log.textures.len(),
            log.geometries.len(),
        )
    }

    pub fn set_context_lost(&self, lost: bool) {
        self.lock().context_lost = lost;
    }
}

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    probe: HeadlessProbe,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> HeadlessProbe {
        self.probe.clone()
    }
}

/// `uniform [precision] <type> <name>[ = ...];` -> (name, kind).
fn scan_uniforms(src: &str) -> Vec<(String, UniformKind)> {
    let mut out = Vec::new();
    for line in src.lines() {
        let line = line.trim();
        let Some(decl) = line.strip_prefix("uniform ") else {
            continue;
        };
        let decl = decl.split(';').next().unwrap_or("");
        let decl = decl.split('=').next().unwrap_or("").trim();
        let tokens: Vec<&str> = decl.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }
        let ty = tokens[tokens.len() - 2];
        let name = tokens[tokens.len() - 1];
        let name = name.split('[').next().unwrap_or(name);
        out.push((name.to_string(), UniformKind::from_glsl(ty)));
    }
    out
}

impl GpuBackend for HeadlessBackend {
    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderId> {
        if let Some((idx, line)) = source
            .lines()
            .enumerate()
            .find(|(_, l)| l.trim_start().starts_with("#error"))
        {
            let msg = line.trim_start().trim_start_matches("#error").trim();
            let log = format!("0:{}(1): error: {msg}", idx + 1);
            return Err(EngineError::Compile {
                stage,
                location: parse_source_location(&log),
                log,
            });
        }
        let mut log = self.probe.lock();
        let id = log.next();
        log.shaders.insert(id, source.to_string());
        Ok(ShaderId(id))
    }

    fn link_program(&mut self, vertex: ShaderId, fragment: ShaderId) -> Result<ProgramId> {
        let mut log = self.probe.lock();
        let (Some(vs), Some(fs)) = (log.shaders.get(&vertex.0), log.shaders.get(&fragment.0)) else {
            return Err(EngineError::Link {
                log: "unknown shader object".into(),
            });
        };
        for (stage, src) in [("vertex", vs), ("fragment", fs)] {
            if !src.contains("void main") {
                return Err(EngineError::Link {
                    log: format!("error: {stage} shader lacks `main` function"),
                });
            }
        }
        let mut uniforms = scan_uniforms(vs);
        for (name, kind) in scan_uniforms(fs) {
            if !uniforms.iter().any(|(n, _)| *n == name) {
                uniforms.push((name, kind));
            }
        }
        let id = log.next();
        log.programs.insert(id, uniforms);
        Ok(ProgramId(id))
    }

    fn delete_shader(&mut self, id: ShaderId) {
        self.probe.lock().shaders.remove(&id.0);
    }

    fn delete_program(&mut self, id: ProgramId) {
        let mut log = self.probe.lock();
        log.programs.remove(&id.0);
        if log.current_program == Some(id.0) {
            log.current_program = None;
        }
    }

    fn active_uniforms(&mut self, program: ProgramId) -> Vec<ActiveUniform> {
        let mut log = self.probe.lock();
        let Some(decls) = log.programs.get(&program.0).cloned() else {
            return Vec::new();
        };
        decls
            .into_iter()
            .map(|(name, kind)| {
                let id = log.next();
                log.locations.insert(id, name.clone());
                ActiveUniform {
                    name,
                    kind,
                    location: UniformLocation(id),
                }
            })
            .collect()
    }

    fn use_program(&mut self, program: ProgramId) {
        let mut log = self.probe.lock();
        if log.programs.contains_key(&program.0) {
            log.current_program = Some(program.0);
        }
    }

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue) {
        let mut log = self.probe.lock();
        if let Some(name) = log.locations.get(&location.0).cloned() {
            log.uniform_values.insert(name, *value);
            log.uniform_pushes += 1;
        }
    }

    fn create_texture(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<TextureId> {
        let mut log = self.probe.lock();
        if log.context_lost {
            return Err(EngineError::ContextLost);
        }
        let id = log.next();
        let size = width as usize * height as usize * format.bytes_per_pixel();
        log.textures.insert(
            id,
            HeadlessTexture {
                width,
                height,
                pixels: vec![0; size],
            },
        );
        log.texture_allocs += 1;
        Ok(TextureId(id))
    }

    fn upload_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: &[u8],
    ) -> Result<()> {
        let mut log = self.probe.lock();
        let Some(tex) = log.textures.get_mut(&texture.0) else {
            return Err(EngineError::Format(format!("upload to unknown texture {}", texture.0)));
        };
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if tex.width != width || tex.height != height || pixels.len() != expected {
            return Err(EngineError::Format(format!(
                "upload of {}x{} ({} bytes) into {}x{} texture",
                width,
                height,
                pixels.len(),
                tex.width,
                tex.height
            )));
        }
        tex.pixels.clear();
        tex.pixels.extend_from_slice(pixels);
        log.uploads += 1;
        Ok(())
    }

    fn delete_texture(&mut self, id: TextureId) {
        let mut log = self.probe.lock();
        log.textures.remove(&id.0);
        log.bound.retain(|_, t| *t != id.0);
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureId) {
        self.probe.lock().bound.insert(unit, texture.0);
    }

    fn create_geometry(&mut self, vertices: &[f32], indices: &[u32]) -> Result<GeometryId> {
        if vertices.len() % 4 != 0 || indices.iter().any(|&i| i as usize >= vertices.len() / 4) {
            return Err(EngineError::Format("malformed geometry".into()));
        }
        let mut log = self.probe.lock();
        let id = log.next();
        log.geometries.insert(id, indices.len());
        Ok(GeometryId(id))
    }

    fn delete_geometry(&mut self, id: GeometryId) {
        self.probe.lock().geometries.remove(&id.0);
    }

    fn draw_indexed(&mut self, geometry: GeometryId, _index_count: u32) {
        let mut log = self.probe.lock();
        if log.geometries.contains_key(&geometry.0) && log.current_program.is_some() {
            log.draws += 1;
        }
    }

    fn begin_frame(&mut self, _width: u32, _height: u32, _clear: [f32; 4]) {
        self.probe.lock().frames += 1;
    }

    fn is_context_lost(&mut self) -> bool {
        self.probe.lock().context_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_uniform_declarations() {
        let src = "precision mediump float;\nuniform float u_time;\nuniform lowp vec3 u_palette0;\nuniform sampler2D u_texture;\nuniform float weights[4];\n";
        let u = scan_uniforms(src);
        assert_eq!(
            u,
            vec![
                ("u_time".to_string(), UniformKind::Float),
                ("u_palette0".to_string(), UniformKind::Vec3),
                ("u_texture".to_string(), UniformKind::Sampler2D),
                ("weights".to_string(), UniformKind::Float),
            ]
        );
    }

    #[test]
    fn error_directive_fails_compile_with_location() {
        let mut gpu = HeadlessBackend::new();
        let err = gpu
            .compile_shader(ShaderStage::Fragment, "void main() {}\n\n#error broken on purpose\n")
            .unwrap_err();
        match err {
            EngineError::Compile { stage, location, .. } => {
                assert_eq!(stage, ShaderStage::Fragment);
                assert_eq!(location.map(|l| l.line), Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_main_fails_link() {
        let mut gpu = HeadlessBackend::new();
        let vs = gpu.compile_shader(ShaderStage::Vertex, "void main() {}").unwrap();
        let fs = gpu.compile_shader(ShaderStage::Fragment, "uniform float x;").unwrap();
        assert!(matches!(gpu.link_program(vs, fs), Err(EngineError::Link { .. })));
    }
}
