use super::gpu::{GpuBackend, TextureId};
use crate::error::Result;
use crate::video::{FrameData, PixelFormat};

/// GPU texture backing the current video frame.
///
/// Uploads happen once per distinct `(loader id, sequence)`; re-syncing the same frame is a
/// no-op. A size or format change reallocates storage.
#[derive(Debug)]
pub struct ShaderTexture {
    id: Option<TextureId>,
    width: u32,
    height: u32,
    format: PixelFormat,
    last: Option<(u64, u64)>,
    uploads: u64,
}

impl Default for ShaderTexture {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderTexture {
    pub fn new() -> Self {
        Self {
            id: None,
            width: 0,
            height: 0,
            format: PixelFormat::Rgba8,
            last: None,
            uploads: 0,
        }
    }

    pub fn id(&self) -> Option<TextureId> {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    /// `(loader id, sequence)` of the frame currently in the texture.
    pub fn current_frame(&self) -> Option<(u64, u64)> {
        self.last
    }

    /// Make the texture hold `frame`. Returns whether an upload happened.
    pub fn sync<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B, frame: &FrameData) -> Result<bool> {
        let key = (frame.loader_id, frame.sequence);
        if self.last == Some(key) && self.id.is_some() {
            return Ok(false);
        }

        let resized = self.width != frame.width
            || self.height != frame.height
            || self.format != frame.pixel_format;
        let id = match self.id {
            Some(id) if !resized => id,
            stale => {
                if let Some(old) = stale {
                    gpu.delete_texture(old);
                    self.id = None;
                }
                let id = gpu.create_texture(frame.width, frame.height, frame.pixel_format)?;
                crate::logi!(
                    "RENDER",
                    "frame texture allocated {}x{} {:?}",
                    frame.width,
                    frame.height,
                    frame.pixel_format
                );
                self.id = Some(id);
                self.width = frame.width;
                self.height = frame.height;
                self.format = frame.pixel_format;
                id
            }
        };

        gpu.upload_texture(id, frame.width, frame.height, frame.pixel_format, &frame.pixels)?;
        self.last = Some(key);
        self.uploads += 1;
        Ok(true)
    }

    pub fn bind<B: GpuBackend + ?Sized>(&self, gpu: &mut B, unit: u32) {
        if let Some(id) = self.id {
            gpu.bind_texture(unit, id);
        }
    }

    pub fn release<B: GpuBackend + ?Sized>(&mut self, gpu: &mut B) {
        if let Some(id) = self.id.take() {
            gpu.delete_texture(id);
        }
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::HeadlessBackend;
    use std::time::Duration;

    fn frame(seq: u64, w: u32, h: u32) -> FrameData {
        FrameData {
            pixels: vec![seq as u8; (w * h * 4) as usize],
            width: w,
            height: h,
            pixel_format: PixelFormat::Rgba8,
            pts: Duration::ZERO,
            sequence: seq,
            frame_index: seq,
            loop_count: 0,
            loader_id: 1,
        }
    }

    #[test]
    fn same_frame_is_not_uploaded_twice() {
        let mut gpu = HeadlessBackend::new();
        let probe = gpu.probe();
        let mut tex = ShaderTexture::new();

        assert!(tex.sync(&mut gpu, &frame(0, 2, 2)).unwrap());
        assert!(!tex.sync(&mut gpu, &frame(0, 2, 2)).unwrap());
        assert!(tex.sync(&mut gpu, &frame(1, 2, 2)).unwrap());
        assert_eq!(probe.upload_count(), 2);
        assert_eq!(probe.texture_alloc_count(), 1);
    }

    #[test]
    fn resize_reallocates() {
        let mut gpu = HeadlessBackend::new();
        let probe = gpu.probe();
        let mut tex = ShaderTexture::new();

        tex.sync(&mut gpu, &frame(0, 2, 2)).unwrap();
        tex.sync(&mut gpu, &frame(1, 4, 2)).unwrap();
        assert_eq!(probe.texture_alloc_count(), 2);
        assert_eq!(tex.size(), (4, 2));
        assert_eq!(probe.live_objects().2, 1);

        tex.release(&mut gpu);
        assert_eq!(probe.live_objects().2, 0);
    }
}
