//! Dominant-colour palette of a frame.
//!
//! Pixels are bucketed into a 12-bit histogram (4 bits per channel); the five most populated
//! buckets give the palette, each colour being the mean of the pixels in its bucket.

use super::PixelFormat;

pub const PALETTE_SIZE: usize = 5;

/// Cap on sampled pixels per frame.
const MAX_SAMPLES: usize = 1 << 16;

/// Five RGB colours in 0..1, most dominant first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Palette {
    pub colors: [[f32; 3]; PALETTE_SIZE],
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            colors: [[0.0; 3]; PALETTE_SIZE],
        }
    }
}

#[derive(Clone, Copy, Default)]
struct Bucket {
    count: u32,
    sum: [u64; 3],
}

pub fn extract_palette(pixels: &[u8], format: PixelFormat) -> Palette {
    let bpp = format.bytes_per_pixel();
    let n = pixels.len() / bpp;
    if n == 0 {
        return Palette::default();
    }
    let step = (n / MAX_SAMPLES).max(1);

    let mut buckets = vec![Bucket::default(); 4096];
    for px in pixels.chunks_exact(bpp).step_by(step) {
        let (r, g, b) = (px[0], px[1], px[2]);
        let idx = ((r as usize >> 4) << 8) | ((g as usize >> 4) << 4) | (b as usize >> 4);
        let bucket = &mut buckets[idx];
        bucket.count += 1;
        bucket.sum[0] += r as u64;
        bucket.sum[1] += g as u64;
        bucket.sum[2] += b as u64;
    }

    let mut ranked: Vec<(usize, Bucket)> = buckets
        .into_iter()
        .enumerate()
        .filter(|(_, b)| b.count > 0)
        .collect();
    // Ties break on bucket index so the result is deterministic.
    ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.0.cmp(&b.0)));

    let mut palette = Palette::default();
    for (slot, (_, b)) in ranked.iter().take(PALETTE_SIZE).enumerate() {
        let c = b.count as f32 * 255.0;
        palette.colors[slot] = [b.sum[0] as f32 / c, b.sum[1] as f32 / c, b.sum[2] as f32 / c];
    }
    // Fewer distinct colours than slots: repeat the last one found.
    let found = ranked.len().min(PALETTE_SIZE);
    if found > 0 {
        for slot in found..PALETTE_SIZE {
            palette.colors[slot] = palette.colors[found - 1];
        }
    }
    palette
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_colour_comes_first() {
        let mut pixels = Vec::new();
        for _ in 0..30 {
            pixels.extend_from_slice(&[255, 0, 0, 255]);
        }
        for _ in 0..10 {
            pixels.extend_from_slice(&[0, 0, 255, 255]);
        }
        let p = extract_palette(&pixels, PixelFormat::Rgba8);
        assert_eq!(p.colors[0], [1.0, 0.0, 0.0]);
        assert_eq!(p.colors[1], [0.0, 0.0, 1.0]);
        // Padded with the last distinct colour.
        assert_eq!(p.colors[4], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn rgb_input_and_empty_frame() {
        let p = extract_palette(&[0, 255, 0, 0, 255, 0], PixelFormat::Rgb8);
        assert_eq!(p.colors[0], [0.0, 1.0, 0.0]);
        assert_eq!(extract_palette(&[], PixelFormat::Rgba8), Palette::default());
    }
}
