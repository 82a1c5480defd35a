// Frame decoders.
//
// `FfmpegDecoder` shells out to the ffmpeg tools: `ffprobe` describes the first video stream,
// then `ffmpeg` converts it to raw RGBA on stdout and we read one frame-sized chunk at a time.
// Rewinding restarts the child process.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use serde::Deserialize;

use super::{PixelFormat, VideoFrameDescription};
use crate::error::{EngineError, Result};

/// Pixels for one frame plus its presentation time relative to the start of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub pixels: Vec<u8>,
    pub pts: Duration,
}

/// Decoder seam driven by the loader thread.
pub trait FrameDecoder: Send {
    fn description(&self) -> &VideoFrameDescription;

    /// Next frame, `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>>;

    /// Restart from the first frame.
    fn rewind(&mut self) -> Result<()>;
}

/// Parse ffprobe's rational frame rate ("30000/1001", "25/1", "25").
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    let s = s.trim();
    let rate = match s.split_once('/') {
        Some((n, d)) => {
            let n: f64 = n.trim().parse().ok()?;
            let d: f64 = d.trim().parse().ok()?;
            if d == 0.0 {
                return None;
            }
            n / d
        }
        None => s.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    color_space: Option<String>,
}

/// Turn ffprobe JSON into a frame description for RGBA output.
pub fn description_from_probe(path: &Path, json: &str) -> Result<VideoFrameDescription> {
    let unsupported = |reason: &str| EngineError::UnsupportedFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let probe: ProbeOutput = serde_json::from_str(json).map_err(|e| EngineError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| unsupported("no video stream"))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(unsupported("video stream has no frame size")),
    };
    if stream.pix_fmt.as_deref().map_or(true, str::is_empty) {
        return Err(unsupported("video stream has no pixel format"));
    }

    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(30.0);

    Ok(VideoFrameDescription {
        width,
        height,
        pixel_format: PixelFormat::Rgba8,
        frame_rate,
        color_space: stream.color_space.filter(|c| !c.is_empty() && c != "unknown"),
    })
}

/// Subprocess decoder backed by `ffprobe` + `ffmpeg`.
pub struct FfmpegDecoder {
    path: PathBuf,
    ffmpeg: String,
    description: VideoFrameDescription,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    frame_index: u64,
}

impl FfmpegDecoder {
    pub fn open(path: &Path, ffmpeg: &str, ffprobe: &str) -> Result<Self> {
        if !path.is_file() {
            return Err(EngineError::SourceNotFound {
                path: path.to_path_buf(),
            });
        }

        let out = Command::new(ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,pix_fmt,r_frame_rate,avg_frame_rate,color_space",
                "-of",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::Io {
                path: PathBuf::from(ffprobe),
                source: e,
            })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(EngineError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: format!("ffprobe failed: {}", stderr.trim()),
            });
        }

        let description = description_from_probe(path, &String::from_utf8_lossy(&out.stdout))?;
        crate::logi!(
            "VIDEO",
            "probed {}: {}x{} @ {:.3} fps color_space={}",
            path.display(),
            description.width,
            description.height,
            description.frame_rate,
            description.color_space.as_deref().unwrap_or("-")
        );

        let mut dec = Self {
            path: path.to_path_buf(),
            ffmpeg: ffmpeg.to_string(),
            description,
            child: None,
            stdout: None,
            frame_index: 0,
        };
        dec.spawn()?;
        Ok(dec)
    }

    fn spawn(&mut self) -> Result<()> {
        self.kill();

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-v", "error", "-nostdin", "-i"])
            .arg(&self.path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| EngineError::Io {
            path: PathBuf::from(&self.ffmpeg),
            source: e,
        })?;

        if let Some(err) = child.stderr.take() {
            crate::logging::spawn_pipe_thread("ffmpeg_decode_err", "VIDEO", err, true);
        }
        self.stdout = child.stdout.take();
        if self.stdout.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::LoaderFailed {
                reason: "ffmpeg stdout unavailable".into(),
            });
        }
        self.child = Some(child);
        self.frame_index = 0;
        Ok(())
    }

    fn kill(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn description(&self) -> &VideoFrameDescription {
        &self.description
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut pixels = vec![0u8; self.description.frame_bytes()];
        let mut filled = 0;
        while filled < pixels.len() {
            match stdout.read(&mut pixels[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(EngineError::Io {
                        path: self.path.clone(),
                        source: e,
                    })
                }
            }
        }

        if filled < pixels.len() {
            if filled > 0 {
                crate::logw!(
                    "VIDEO",
                    "truncated trailing frame ({filled} of {} bytes) in {}",
                    pixels.len(),
                    self.path.display()
                );
            }
            self.kill();
            return Ok(None);
        }

        let pts = Duration::from_secs_f64(self.frame_index as f64 / self.description.frame_rate);
        self.frame_index += 1;
        Ok(Some(DecodedFrame { pixels, pts }))
    }

    fn rewind(&mut self) -> Result<()> {
        self.spawn()
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Decoder over frames held in memory: test patterns, generated content, tests.
pub struct MemoryDecoder {
    description: VideoFrameDescription,
    frames: Vec<DecodedFrame>,
    pos: usize,
    fail_after: Option<usize>,
    delivered: usize,
}

impl MemoryDecoder {
    /// Frames must match the description's frame size.
    pub fn new(description: VideoFrameDescription, frames: Vec<DecodedFrame>) -> Result<Self> {
        let expected = description.frame_bytes();
        if let Some(bad) = frames.iter().position(|f| f.pixels.len() != expected) {
            return Err(EngineError::Format(format!(
                "frame {bad} has {} bytes, expected {expected}",
                frames[bad].pixels.len()
            )));
        }
        Ok(Self {
            description,
            frames,
            pos: 0,
            fail_after: None,
            delivered: 0,
        })
    }

    /// Solid-colour frames, one per entry of `colors`, spaced at `frame_rate`.
    pub fn solid_frames(width: u32, height: u32, frame_rate: f64, colors: &[[u8; 4]]) -> Result<Self> {
        let description = VideoFrameDescription {
            width,
            height,
            pixel_format: PixelFormat::Rgba8,
            frame_rate,
            color_space: None,
        };
        let px = (width as usize) * (height as usize);
        let frames = colors
            .iter()
            .enumerate()
            .map(|(i, c)| DecodedFrame {
                pixels: c.repeat(px),
                pts: Duration::from_secs_f64(i as f64 / frame_rate),
            })
            .collect();
        Self::new(description, frames)
    }

    /// Horizontal gradient that scrolls by one column per frame.
    pub fn test_pattern(width: u32, height: u32, frame_rate: f64, frames: usize) -> Result<Self> {
        let description = VideoFrameDescription {
            width,
            height,
            pixel_format: PixelFormat::Rgba8,
            frame_rate,
            color_space: None,
        };
        let w = width.max(1) as usize;
        let out = (0..frames)
            .map(|i| {
                let mut pixels = Vec::with_capacity(description.frame_bytes());
                for y in 0..height as usize {
                    for x in 0..w {
                        let u = ((x + i) % w) as f32 / w as f32;
                        let v = y as f32 / height.max(1) as f32;
                        pixels.extend_from_slice(&[
                            (u * 255.0) as u8,
                            (v * 255.0) as u8,
                            ((1.0 - u) * 255.0) as u8,
                            255,
                        ]);
                    }
                }
                DecodedFrame {
                    pixels,
                    pts: Duration::from_secs_f64(i as f64 / frame_rate),
                }
            })
            .collect();
        Self::new(description, out)
    }

    /// Every `next_frame` after the first `n` delivered frames fails.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl FrameDecoder for MemoryDecoder {
    fn description(&self) -> &VideoFrameDescription {
        &self.description
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        if self.fail_after.is_some_and(|n| self.delivered >= n) {
            return Err(EngineError::Format("injected decode failure".into()));
        }
        let Some(frame) = self.frames.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        self.delivered += 1;
        Ok(Some(frame.clone()))
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }
}
