use super::gpu::{GeometryId, GpuBackend};
use crate::error::Result;

/// Interleaved `x, y, u, v`. Frames are stored top row first, so v is flipped.
const VERTICES: [f32; 16] = [
    -1.0, -1.0, 0.0, 1.0, //
    1.0, -1.0, 1.0, 1.0, //
    1.0, 1.0, 1.0, 0.0, //
    -1.0, 1.0, 0.0, 0.0, //
];

const INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Full-frame quad every program draws onto.
#[derive(Debug)]
pub struct ShaderRectangle {
    geometry: GeometryId,
}

impl ShaderRectangle {
    pub fn create<B: GpuBackend + ?Sized>(gpu: &mut B) -> Result<Self> {
        Ok(Self {
            geometry: gpu.create_geometry(&VERTICES, &INDICES)?,
        })
    }

    pub fn draw<B: GpuBackend + ?Sized>(&self, gpu: &mut B) {
        gpu.draw_indexed(self.geometry, INDICES.len() as u32);
    }

    pub fn release<B: GpuBackend + ?Sized>(self, gpu: &mut B) {
        gpu.delete_geometry(self.geometry);
    }
}
