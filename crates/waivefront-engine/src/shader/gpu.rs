//! GPU seam.
//!
//! The shader subsystem talks to the GPU only through [`GpuBackend`]. Object handles are
//! opaque ids so the same program/texture/geometry code drives both the OpenGL backend and the
//! headless one used in tests.

use crate::error::{Result, ShaderStage};
use crate::video::PixelFormat;

macro_rules! gpu_id {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

gpu_id!(ShaderId, ProgramId, TextureId, GeometryId, UniformLocation);

/// Uniform types the engine knows how to feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    Int,
    Bool,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    Sampler2D,
    /// Declared in the program but not fed by the engine.
    Other,
}

impl UniformKind {
    /// GLSL spelling, used by the headless backend's declaration scan.
    pub fn from_glsl(ty: &str) -> Self {
        match ty {
            "float" => UniformKind::Float,
            "int" | "uint" => UniformKind::Int,
            "bool" => UniformKind::Bool,
            "vec2" => UniformKind::Vec2,
            "vec3" => UniformKind::Vec3,
            "vec4" => UniformKind::Vec4,
            "mat4" => UniformKind::Mat4,
            "sampler2D" => UniformKind::Sampler2D,
            _ => UniformKind::Other,
        }
    }
}

/// A value pushed to a uniform. One variant per kind; no generic uniform type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4([f32; 16]),
    /// Texture unit index for a sampler.
    Texture(u32),
}

/// One entry of a linked program's active-uniform list.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveUniform {
    pub name: String,
    pub kind: UniformKind,
    pub location: UniformLocation,
}

/// Vertex layout shared by every backend: interleaved `vec2 position, vec2 texcoord`.
pub const ATTRIB_POSITION: (u32, &str) = (0, "a_position");
pub const ATTRIB_TEXCOORD: (u32, &str) = (1, "a_texcoord");

pub trait GpuBackend {
    /// Compile one stage. Failures are `EngineError::Compile` with the driver log.
    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderId>;

    /// Link two compiled stages. Failures are `EngineError::Link`.
    fn link_program(&mut self, vertex: ShaderId, fragment: ShaderId) -> Result<ProgramId>;

    fn delete_shader(&mut self, id: ShaderId);

    fn delete_program(&mut self, id: ProgramId);

    fn active_uniforms(&mut self, program: ProgramId) -> Vec<ActiveUniform>;

    fn use_program(&mut self, program: ProgramId);

    fn set_uniform(&mut self, location: UniformLocation, value: &UniformValue);

    /// Allocate storage for a `width x height` texture.
    fn create_texture(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<TextureId>;

    fn upload_texture(
        &mut self,
        texture: TextureId,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: &[u8],
    ) -> Result<()>;

    fn delete_texture(&mut self, id: TextureId);

    fn bind_texture(&mut self, unit: u32, texture: TextureId);

    /// Upload interleaved vertices (see [`ATTRIB_POSITION`]) and triangle indices.
    fn create_geometry(&mut self, vertices: &[f32], indices: &[u32]) -> Result<GeometryId>;

    fn delete_geometry(&mut self, id: GeometryId);

    fn draw_indexed(&mut self, geometry: GeometryId, index_count: u32);

    /// Set the viewport and clear the target.
    fn begin_frame(&mut self, width: u32, height: u32, clear: [f32; 4]);

    fn is_context_lost(&mut self) -> bool;
}
