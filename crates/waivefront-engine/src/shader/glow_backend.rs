// OpenGL implementation of the GPU seam, on top of `glow`.
//
// Handles are mapped to opaque ids; every call happens on the thread that owns the context.

use std::collections::HashMap;
use std::sync::Arc;

use glow::HasContext;

use super::gpu::{
    ActiveUniform, GeometryId, GpuBackend, ProgramId, ShaderId, TextureId, UniformKind,
    UniformLocation, UniformValue, ATTRIB_POSITION, ATTRIB_TEXCOORD,
};
use super::parse_source_location;
use crate::error::{EngineError, Result, ShaderStage};
use crate::video::PixelFormat;

type GlUniformLocation = <glow::Context as HasContext>::UniformLocation;

struct Geometry {
    vao: glow::NativeVertexArray,
    vbo: glow::NativeBuffer,
    ebo: glow::NativeBuffer,
}

pub struct GlowBackend {
    gl: Arc<glow::Context>,
    next_id: u32,
    shaders: HashMap<u32, glow::NativeShader>,
    programs: HashMap<u32, glow::NativeProgram>,
    textures: HashMap<u32, glow::NativeTexture>,
    geometries: HashMap<u32, Geometry>,
    uniforms: HashMap<u32, GlUniformLocation>,
    /// Uniform ids handed out per program, dropped with it.
    program_uniforms: HashMap<u32, Vec<u32>>,
    errors: ErrorLatch,
}

/// Upper bound on `glGetError` calls per drain; some drivers never return NO_ERROR once lost.
const MAX_DRAINED_ERRORS: usize = 16;

/// `glGetError` clears what it reports, so every read goes through here. Context loss is
/// latched: drivers report it once.
#[derive(Debug, Default)]
struct ErrorLatch {
    context_lost: bool,
}

impl ErrorLatch {
    /// Drain the error queue; returns everything except `CONTEXT_LOST`.
    fn drain(&mut self, mut next: impl FnMut() -> u32) -> Vec<u32> {
        let mut out = Vec::new();
        for _ in 0..MAX_DRAINED_ERRORS {
            match next() {
                glow::NO_ERROR => break,
                glow::CONTEXT_LOST => self.context_lost = true,
                code => out.push(code),
            }
        }
        out
    }

    /// Outcome of an allocation given the errors drained right after it.
    fn alloc_result(&self, what: &str, errors: &[u32]) -> Result<()> {
        if self.context_lost {
            return Err(EngineError::ContextLost);
        }
        if errors.contains(&glow::OUT_OF_MEMORY) {
            return Err(EngineError::ResourceExhausted(what.to_string()));
        }
        for code in errors {
            crate::logw!("RENDER", "GL error 0x{code:04x} during {what}");
        }
        Ok(())
    }
}

impl GlowBackend {
    pub fn new(gl: Arc<glow::Context>) -> Self {
        Self {
            gl,
            next_id: 1,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            textures: HashMap::new(),
            geometries: HashMap::new(),
            uniforms: HashMap::new(),
            program_uniforms: HashMap::new(),
            errors: ErrorLatch::default(),
        }
    }

    pub fn gl(&self) -> &glow::Context {
        &self.gl
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn drain_errors(&mut self) -> Vec<u32> {
        let gl = &self.gl;
        self.errors.drain(|| unsafe { gl.get_error() })
    }

    fn check_alloc(&mut self, what: &str) -> Result<()> {
        let errors = self.drain_errors();
        self.errors.alloc_result(what, &errors)
    }
}

fn gl_formats(format: PixelFormat) -> (i32, u32) {
    match format {
        PixelFormat::Rgba8 => (glow::RGBA8 as i32, glow::RGBA),
        PixelFormat::Rgb8 => (glow::RGB8 as i32, glow::RGB),
    }
}

fn kind_from_gl(utype: u32) -> UniformKind {
    match utype {
        glow::FLOAT => UniformKind::Float,
        glow::INT | glow::UNSIGNED_INT => UniformKind::Int,
        glow::BOOL => UniformKind::Bool,
        glow::FLOAT_VEC2 => UniformKind::Vec2,
        glow::FLOAT_VEC3 => UniformKind::Vec3,
        glow::FLOAT_VEC4 => UniformKind::Vec4,
        glow::FLOAT_MAT4 => UniformKind::Mat4,
        glow::SAMPLER_2D => UniformKind::Sampler2D,
        _ => UniformKind::Other,
    }
}

impl GpuBackend for GlowBackend {
    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderId> {
        let gl_stage = match stage {
            ShaderStage::Vertex => glow::VERTEX_SHADER,
            ShaderStage::Fragment => glow::FRAGMENT_SHADER,
        };
        unsafe {
            let sh = self
                .gl
                .create_shader(gl_stage)
                .map_err(|e| EngineError::ResourceExhausted(format!("create {} shader: {e}", stage.as_str())))?;
            self.gl.shader_source(sh, source);
            self.gl.compile_shader(sh);
            if !self.gl.get_shader_compile_status(sh) {
                let log = self.gl.get_shader_info_log(sh);
                self.gl.delete_shader(sh);
                return Err(EngineError::Compile {
                    stage,
                    location: parse_source_location(&log),
                    log,
                });
            }
            let id = self.next();
            self.shaders.insert(id, sh);
            Ok(ShaderId(id))
        }
    }

    fn link_program(&mut self, vertex: ShaderId, fragment: ShaderId) -> Result<ProgramId> {
        let (Some(&vs), Some(&fs)) = (self.shaders.get(&vertex.0), self.shaders.get(&fragment.0)) else {
            return Err(EngineError::Link {
                log: "link requested for unknown shader objects".into(),
            });
        };
        unsafe {
            let program = self
                .gl
                .create_program()
                .map_err(|e| EngineError::ResourceExhausted(format!("create program: {e}")))?;
            self.gl.attach_shader(program, vs);
            self.gl.attach_shader(program, fs);
            self.gl.bind_attrib_location(program, ATTRIB_POSITION.0, ATTRIB_POSITION.1);
            self.gl.bind_attrib_location(program, ATTRIB_TEXCOORD.0, ATTRIB_TEXCOORD.1);
            self.gl.link_program(program);

            let ok = self.gl.get_program_link_status(program);
            self.gl.detach_shader(program, vs);
            self.gl.detach_shader(program, fs);
            if !ok {
                let log = self.gl.get_program_info_log(program);
                self.gl.delete_program(program);
                return Err(EngineError::Link { log });
            }
            let id = self.next();
            self.programs.insert(id, program);
            Ok(ProgramId(id))
        }
    }

    fn delete_shader(&mut self, id: ShaderId) {
        if let Some(sh) = self.shaders.remove(&id.0) {
            unsafe { self.gl.delete_shader(sh) };
        }
    }

    fn delete_program(&mut self, id: ProgramId) {
        if let Some(p) = self.programs.remove(&id.0) {
            unsafe { self.gl.delete_program(p) };
        }
        for u in self.program_uniforms.remove(&id.0).unwrap_or_default() {
            self.uniforms.remove(&u);
        }
    }

    fn active_uniforms(&mut self, program: ProgramId) -> Vec<ActiveUniform> {
        let Some(&p) = self.programs.get(&program.0) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        unsafe {
            let count = self.gl.get_active_uniforms(p);
            for index in 0..count {
                let Some(info) = self.gl.get_active_uniform(p, index) else {
                    continue;
                };
                // Arrays report "name[0]"; the engine feeds element 0 only.
                let name = info.name.trim_end_matches("[0]").to_string();
                if name.starts_with("gl_") {
                    continue;
                }
                let Some(loc) = self.gl.get_uniform_location(p, &name) else {
                    continue;
                };
                let id = self.next();
                self.uniforms.insert(id, loc);
                self.program_uniforms.entry(program.0).or_default().push(id);
                out.push(ActiveUniform {
                    name,
                    kind: kind_from_gl(info.utype),
                    location: UniformLocation(id),
                });
            }
        }
        out
    }

    fn use_program(&mut self, program: ProgramId) {
        let p = self.programs.get(&program.0).copied();
        unsafe { self.gl.use_program(p) };
    }

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue) {
        let Some(loc) = self.uniforms.get(&location.0) else {
            return;
        };
        let loc = Some(loc);
        unsafe {
            match *value {
                UniformValue::Float(v) => self.gl.uniform_1_f32(loc, v),
                UniformValue::Int(v) => self.gl.uniform_1_i32(loc, v),
                UniformValue::Vec2([x, y]) => self.gl.uniform_2_f32(loc, x, y),
                UniformValue::Vec3([x, y, z]) => self.gl.uniform_3_f32(loc, x, y, z),
                UniformValue::Vec4([x, y, z, w]) => self.gl.uniform_4_f32(loc, x, y, z, w),
                UniformValue::Mat4(ref m) => self.gl.uniform_matrix_4_f32_slice(loc, false, m),
                UniformValue::Texture(unit) => self.gl.uniform_1_i32(loc, unit as i32),
            }
        }
    }

    fn create_texture(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<TextureId> {
        let (internal, fmt) = gl_formats(format);
        unsafe {
            let tex = self
                .gl
                .create_texture()
                .map_err(|e| EngineError::ResourceExhausted(format!("create texture: {e}")))?;
            self.gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            self.gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            self.gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            self.gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            self.gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                internal,
                width as i32,
                height as i32,
                0,
                fmt,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(None),
            );
            self.gl.bind_texture(glow::TEXTURE_2D, None);
            if let Err(e) = self.check_alloc("texture storage") {
                self.gl.delete_texture(tex);
                return Err(e);
            }
            let id = self.next();
            self.textures.insert(id, tex);
            Ok(TextureId(id))
        }
    }

    fn upload_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: &[u8],
    ) -> Result<()> {
        let Some(&tex) = self.textures.get(&texture.0) else {
            return Err(EngineError::Format(format!("upload to unknown texture {}", texture.0)));
        };
        let (_, fmt) = gl_formats(format);
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            self.gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            self.gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                0,
                0,
                width as i32,
                height as i32,
                fmt,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(Some(pixels)),
            );
            self.gl.bind_texture(glow::TEXTURE_2D, None);
        }
        self.check_alloc("texture upload")
    }

    fn delete_texture(&mut self, id: TextureId) {
        if let Some(t) = self.textures.remove(&id.0) {
            unsafe { self.gl.delete_texture(t) };
        }
    }

    fn bind_texture(&mut self, unit: u32, texture: TextureId) {
        let tex = self.textures.get(&texture.0).copied();
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + unit);
            self.gl.bind_texture(glow::TEXTURE_2D, tex);
        }
    }

    fn create_geometry(&mut self, vertices: &[f32], indices: &[u32]) -> Result<GeometryId> {
        let err = |e: String| EngineError::ResourceExhausted(format!("create geometry: {e}"));
        unsafe {
            let vao = self.gl.create_vertex_array().map_err(err)?;
            let vbo = self.gl.create_buffer().map_err(err)?;
            let ebo = self.gl.create_buffer().map_err(err)?;

            self.gl.bind_vertex_array(Some(vao));
            self.gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            self.gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(vertices),
                glow::STATIC_DRAW,
            );
            let stride = 4 * std::mem::size_of::<f32>() as i32;
            self.gl.vertex_attrib_pointer_f32(ATTRIB_POSITION.0, 2, glow::FLOAT, false, stride, 0);
            self.gl.enable_vertex_attrib_array(ATTRIB_POSITION.0);
            self.gl.vertex_attrib_pointer_f32(
                ATTRIB_TEXCOORD.0,
                2,
                glow::FLOAT,
                false,
                stride,
                2 * std::mem::size_of::<f32>() as i32,
            );
            self.gl.enable_vertex_attrib_array(ATTRIB_TEXCOORD.0);

            self.gl.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, Some(ebo));
            self.gl.buffer_data_u8_slice(
                glow::ELEMENT_ARRAY_BUFFER,
                bytemuck::cast_slice(indices),
                glow::STATIC_DRAW,
            );
            self.gl.bind_vertex_array(None);

            let id = self.next();
            self.geometries.insert(id, Geometry { vao, vbo, ebo });
            Ok(GeometryId(id))
        }
    }

    fn delete_geometry(&mut self, id: GeometryId) {
        if let Some(g) = self.geometries.remove(&id.0) {
            unsafe {
                self.gl.delete_vertex_array(g.vao);
                self.gl.delete_buffer(g.vbo);
                self.gl.delete_buffer(g.ebo);
            }
        }
    }

    fn draw_indexed(&mut self, geometry: GeometryId, index_count: u32) {
        let Some(g) = self.geometries.get(&geometry.0) else {
            return;
        };
        unsafe {
            self.gl.bind_vertex_array(Some(g.vao));
            self.gl.draw_elements(glow::TRIANGLES, index_count as i32, glow::UNSIGNED_INT, 0);
            self.gl.bind_vertex_array(None);
        }
    }

    fn begin_frame(&mut self, width: u32, height: u32, clear: [f32; 4]) {
        unsafe {
            self.gl.viewport(0, 0, width as i32, height as i32);
            self.gl.clear_color(clear[0], clear[1], clear[2], clear[3]);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    fn is_context_lost(&mut self) -> bool {
        // Errors raised by last frame's draw calls surface here rather than being dropped.
        for code in self.drain_errors() {
            crate::logw!("RENDER", "GL error 0x{code:04x} since last frame");
        }
        self.errors.context_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(codes: &[u32]) -> impl FnMut() -> u32 + '_ {
        let mut it = codes.iter().copied();
        move || it.next().unwrap_or(glow::NO_ERROR)
    }

    #[test]
    fn context_loss_is_latched_and_other_errors_kept() {
        let mut latch = ErrorLatch::default();
        let errors = latch.drain(queue(&[glow::INVALID_ENUM, glow::CONTEXT_LOST, glow::NO_ERROR]));
        assert_eq!(errors, vec![glow::INVALID_ENUM]);
        assert!(latch.context_lost);

        assert!(latch.drain(queue(&[])).is_empty());
        assert!(latch.context_lost);
    }

    #[test]
    fn allocation_errors_are_classified() {
        let latch = ErrorLatch::default();
        assert!(latch.alloc_result("texture storage", &[]).is_ok());
        assert!(latch.alloc_result("texture storage", &[glow::INVALID_VALUE]).is_ok());
        assert!(matches!(
            latch.alloc_result("texture storage", &[glow::INVALID_VALUE, glow::OUT_OF_MEMORY]),
            Err(EngineError::ResourceExhausted(_))
        ));

        let mut lost = ErrorLatch::default();
        lost.drain(queue(&[glow::CONTEXT_LOST]));
        assert!(matches!(lost.alloc_result("texture upload", &[]), Err(EngineError::ContextLost)));
    }

    #[test]
    fn drain_is_bounded() {
        let mut latch = ErrorLatch::default();
        let errors = latch.drain(|| glow::INVALID_OPERATION);
        assert_eq!(errors.len(), MAX_DRAINED_ERRORS);
    }
}
