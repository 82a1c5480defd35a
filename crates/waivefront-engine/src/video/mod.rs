//! Video pipeline
//!
//! A [`VideoLoader`] owns one decoder and one decode thread. The thread publishes each frame
//! into a single-slot, latest-wins cell; the render thread picks up whatever is newest at
//! tick time. Frames are never queued: a slow renderer simply skips frames.
//!
//! Sequence numbers increase for the lifetime of a loader (looping does not reset them), so
//! `(loader id, sequence)` identifies a frame uniquely.

mod decoder;
mod palette;

pub use decoder::{
    description_from_probe, parse_frame_rate, DecodedFrame, FfmpegDecoder, FrameDecoder,
    MemoryDecoder,
};
pub use palette::{extract_palette, Palette, PALETTE_SIZE};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Deserialize;

use crate::error::{EngineError, Result};

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// How long a paced wait sleeps before re-checking the stop flag.
const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// Immutable for a loader's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrameDescription {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: f64,
    pub color_space: Option<String>,
}

impl VideoFrameDescription {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }

    pub fn frame_duration(&self) -> Duration {
        if self.frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.frame_rate)
        } else {
            Duration::from_secs_f64(1.0 / 30.0)
        }
    }
}

/// One published frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameData {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Presentation time within the current loop.
    pub pts: Duration,
    /// Monotonic over the loader's lifetime.
    pub sequence: u64,
    /// Restarts at 0 on every loop.
    pub frame_index: u64,
    pub loop_count: u32,
    pub loader_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// Publish each frame at its presentation time.
    #[default]
    RealTime,
    /// Publish as fast as frames decode.
    Free,
    /// One frame per `advance()`.
    Stepped,
}

/// `video.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub path: Option<String>,
    #[serde(rename = "loop")]
    pub loop_playback: bool,
    pub pacing: Pacing,
    /// Consecutive decode failures tolerated before the loader gives up.
    pub failure_threshold: u32,
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            path: None,
            loop_playback: true,
            pacing: Pacing::RealTime,
            failure_threshold: 8,
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

/// Sanitized loader state, safe to hand across threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderStatus {
    Idle,
    Running,
    Ended,
    Failed(String),
}

impl LoaderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderStatus::Idle => "idle",
            LoaderStatus::Running => "running",
            LoaderStatus::Ended => "ended",
            LoaderStatus::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
struct LoaderShared {
    latest: ArcSwapOption<FrameData>,
    status: ArcSwap<LoaderStatus>,
    palette: ArcSwapOption<Palette>,
    running: AtomicBool,
    published: AtomicU64,
    decode_errors: AtomicU64,
}

impl LoaderShared {
    fn set_status(&self, s: LoaderStatus) {
        self.status.store(Arc::new(s));
    }
}

/// Cloneable stop signal for a [`VideoLoader`].
#[derive(Debug, Clone)]
pub struct LoaderStopHandle {
    shared: Arc<LoaderShared>,
}

impl LoaderStopHandle {
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }
}

/// Decoder + decode thread + latest-frame cell.
pub struct VideoLoader {
    id: u64,
    label: String,
    description: VideoFrameDescription,
    shared: Arc<LoaderShared>,
    /// Newest frame handed to the caller; guards against ever going backwards.
    held: ArcSwapOption<FrameData>,
    step_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl VideoLoader {
    /// Open a video file through the ffmpeg tools configured in `cfg`.
    pub fn open(path: &Path, cfg: &VideoConfig) -> Result<Self> {
        let decoder = FfmpegDecoder::open(path, &cfg.ffmpeg, &cfg.ffprobe)?;
        Self::open_with(Box::new(decoder), path.display().to_string(), cfg)
    }

    /// Start a loader over any decoder.
    pub fn open_with(
        decoder: Box<dyn FrameDecoder>,
        label: impl Into<String>,
        cfg: &VideoConfig,
    ) -> Result<Self> {
        let label = label.into();
        let description = decoder.description().clone();
        if description.width == 0 || description.height == 0 {
            return Err(EngineError::UnsupportedFormat {
                path: PathBuf::from(&label),
                reason: "zero-sized frames".into(),
            });
        }

        let id = NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(LoaderShared {
            latest: ArcSwapOption::empty(),
            status: ArcSwap::from_pointee(LoaderStatus::Running),
            palette: ArcSwapOption::empty(),
            running: AtomicBool::new(true),
            published: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        });
        let (step_tx, step_rx) = crossbeam_channel::unbounded::<()>();

        let worker = DecodeWorker {
            id,
            label: label.clone(),
            decoder,
            shared: Arc::clone(&shared),
            step_rx,
            loop_playback: cfg.loop_playback,
            pacing: cfg.pacing,
            failure_threshold: cfg.failure_threshold.max(1),
        };
        let join = std::thread::Builder::new()
            .name("video-decode".to_string())
            .spawn(move || worker.run())
            .map_err(|e| EngineError::ResourceExhausted(format!("spawn decode thread: {e}")))?;

        crate::logi!(
            "VIDEO",
            "loader #{id} opened {label}: {}x{} @ {:.3} fps pacing={:?} loop={}",
            description.width,
            description.height,
            description.frame_rate,
            cfg.pacing,
            cfg.loop_playback
        );

        Ok(Self {
            id,
            label,
            description,
            shared,
            held: ArcSwapOption::empty(),
            step_tx,
            join: Some(join),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn description(&self) -> &VideoFrameDescription {
        &self.description
    }

    /// Newest published frame, `None` before the first one. Never blocks.
    ///
    /// Fails with `LoaderFailed` once the decoder has given up; the last good frame remains
    /// available through [`VideoLoader::last_frame`].
    pub fn latest_frame(&self) -> Result<Option<Arc<FrameData>>> {
        if let LoaderStatus::Failed(reason) = &**self.shared.status.load() {
            return Err(EngineError::LoaderFailed {
                reason: reason.clone(),
            });
        }
        Ok(self.last_frame())
    }

    /// Newest frame regardless of loader state.
    pub fn last_frame(&self) -> Option<Arc<FrameData>> {
        let newest = self.shared.latest.load_full();
        let held = self.held.load_full();
        match (newest, held) {
            (Some(n), Some(h)) if n.sequence < h.sequence => Some(h),
            (Some(n), _) => {
                self.held.store(Some(Arc::clone(&n)));
                Some(n)
            }
            (None, h) => h,
        }
    }

    /// Release one frame when pacing is `stepped`. Ignored otherwise.
    pub fn advance(&self) {
        let _ = self.step_tx.send(());
    }

    pub fn status(&self) -> LoaderStatus {
        LoaderStatus::clone(&self.shared.status.load())
    }

    /// Palette of the first decoded frame.
    pub fn palette(&self) -> Option<Palette> {
        self.shared.palette.load().as_deref().copied()
    }

    pub fn frames_published(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.shared.decode_errors.load(Ordering::Relaxed)
    }

    pub fn stop_handle(&self) -> LoaderStopHandle {
        LoaderStopHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for VideoLoader {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        crate::logi!("VIDEO", "loader #{} closed", self.id);
    }
}

struct DecodeWorker {
    id: u64,
    label: String,
    decoder: Box<dyn FrameDecoder>,
    shared: Arc<LoaderShared>,
    step_rx: Receiver<()>,
    loop_playback: bool,
    pacing: Pacing,
    failure_threshold: u32,
}

impl DecodeWorker {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Sleep until `deadline`, waking periodically to observe stop. False if stopped.
    fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            if !self.running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }

    /// Block for one `advance()` token. False if stopped.
    fn wait_for_step(&self) -> bool {
        loop {
            if !self.running() {
                return false;
            }
            match self.step_rx.recv_timeout(WAIT_SLICE) {
                Ok(()) => return self.running(),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn run(mut self) {
        let frame_duration = self.decoder.description().frame_duration();
        let desc = self.decoder.description().clone();

        let mut epoch = Instant::now();
        let mut sequence: u64 = 0;
        let mut frame_index: u64 = 0;
        let mut loop_count: u32 = 0;
        let mut last_pts = Duration::ZERO;
        let mut failures: u32 = 0;
        // A rewind or a failed read does not use up an `advance()`.
        let mut need_step = true;

        while self.running() {
            if self.pacing == Pacing::Stepped && need_step && !self.wait_for_step() {
                break;
            }
            need_step = true;

            // One frame per iteration; end of stream may take a rewind first.
            let decoded = match self.decoder.next_frame() {
                Ok(Some(f)) => f,
                Ok(None) => {
                    if frame_index == 0 {
                        self.fail(format!("{} contains no frames", self.label));
                        return;
                    }
                    if !self.loop_playback {
                        crate::logi!("VIDEO", "loader #{} reached end of {}", self.id, self.label);
                        self.shared.set_status(LoaderStatus::Ended);
                        return;
                    }
                    if let Err(e) = self.decoder.rewind() {
                        self.fail(format!("rewind failed: {e}"));
                        return;
                    }
                    loop_count = loop_count.saturating_add(1);
                    frame_index = 0;
                    // The next loop starts one frame after the last one shown.
                    epoch += last_pts + frame_duration;
                    need_step = false;
                    continue;
                }
                Err(e) => {
                    failures += 1;
                    self.shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                    crate::logw!(
                        "VIDEO",
                        "loader #{} decode error ({failures}/{}): {e}",
                        self.id,
                        self.failure_threshold
                    );
                    if failures >= self.failure_threshold {
                        self.fail(format!("{failures} consecutive decode failures, last: {e}"));
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                    need_step = false;
                    continue;
                }
            };
            failures = 0;

            if self.pacing == Pacing::RealTime && !self.wait_until(epoch + decoded.pts) {
                break;
            }

            if sequence == 0 {
                let palette = extract_palette(&decoded.pixels, desc.pixel_format);
                crate::logi!("VIDEO", "loader #{} palette: {:?}", self.id, palette.colors);
                self.shared.palette.store(Some(Arc::new(palette)));
            }

            last_pts = decoded.pts;
            self.shared.latest.store(Some(Arc::new(FrameData {
                pixels: decoded.pixels,
                width: desc.width,
                height: desc.height,
                pixel_format: desc.pixel_format,
                pts: decoded.pts,
                sequence,
                frame_index,
                loop_count,
                loader_id: self.id,
            })));
            self.shared.published.fetch_add(1, Ordering::Relaxed);
            sequence += 1;
            frame_index += 1;
        }
    }

    fn fail(&self, reason: String) {
        crate::loge!("VIDEO", "loader #{} failed: {reason}", self.id);
        self.shared.set_status(LoaderStatus::Failed(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const GREEN: [u8; 4] = [0, 255, 0, 255];

    fn cfg(pacing: Pacing, loop_playback: bool) -> VideoConfig {
        VideoConfig {
            pacing,
            loop_playback,
            failure_threshold: 3,
            ..VideoConfig::default()
        }
    }

    fn two_frames() -> Box<dyn FrameDecoder> {
        Box::new(MemoryDecoder::solid_frames(4, 2, 30.0, &[RED, GREEN]).unwrap())
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn stepped_playback_loops_with_monotonic_sequence() {
        let loader = VideoLoader::open_with(two_frames(), "mem", &cfg(Pacing::Stepped, true)).unwrap();
        assert!(loader.latest_frame().unwrap().is_none());

        let mut seen = Vec::new();
        for n in 1..=3u64 {
            loader.advance();
            assert!(wait_until(|| loader.frames_published() == n));
            let f = loader.latest_frame().unwrap().unwrap();
            seen.push((f.sequence, f.frame_index, f.loop_count, f.pixels[1]));
        }
        assert_eq!(seen, vec![(0, 0, 0, 0), (1, 1, 0, 255), (2, 0, 1, 0)]);
        assert_eq!(loader.status(), LoaderStatus::Running);
    }

    #[test]
    fn free_running_sequence_never_goes_backwards() {
        let loader = VideoLoader::open_with(two_frames(), "mem", &cfg(Pacing::Free, true)).unwrap();
        let mut last = 0;
        for _ in 0..500 {
            if let Some(f) = loader.latest_frame().unwrap() {
                assert!(f.sequence >= last);
                last = f.sequence;
                assert_eq!(f.loader_id, loader.id());
            }
        }
        assert!(wait_until(|| loader.frames_published() > 4));
    }

    #[test]
    fn without_loop_the_last_frame_is_held() {
        let loader = VideoLoader::open_with(two_frames(), "mem", &cfg(Pacing::Free, false)).unwrap();
        assert!(wait_until(|| loader.status() == LoaderStatus::Ended));
        let f = loader.latest_frame().unwrap().unwrap();
        assert_eq!(f.sequence, 1);
        assert_eq!(&f.pixels[..4], &GREEN);
    }

    #[test]
    fn repeated_decode_failures_fail_the_loader() {
        let dec = MemoryDecoder::solid_frames(2, 2, 30.0, &[RED, GREEN])
            .unwrap()
            .failing_after(1);
        let loader = VideoLoader::open_with(Box::new(dec), "mem", &cfg(Pacing::Free, true)).unwrap();

        assert!(wait_until(|| matches!(loader.status(), LoaderStatus::Failed(_))));
        assert!(matches!(
            loader.latest_frame(),
            Err(EngineError::LoaderFailed { .. })
        ));
        assert_eq!(loader.decode_errors(), 3);
        // The last good frame survives the failure.
        assert_eq!(loader.last_frame().unwrap().sequence, 0);
    }

    #[test]
    fn empty_source_fails() {
        let desc = VideoFrameDescription {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Rgba8,
            frame_rate: 30.0,
            color_space: None,
        };
        let dec = MemoryDecoder::new(desc, Vec::new()).unwrap();
        let loader = VideoLoader::open_with(Box::new(dec), "empty", &cfg(Pacing::Free, true)).unwrap();
        assert!(wait_until(|| matches!(loader.status(), LoaderStatus::Failed(_))));
    }

    #[test]
    fn palette_comes_from_first_frame() {
        let loader = VideoLoader::open_with(two_frames(), "mem", &cfg(Pacing::Stepped, true)).unwrap();
        assert!(loader.palette().is_none());
        loader.advance();
        assert!(wait_until(|| loader.palette().is_some()));
        assert_eq!(loader.palette().unwrap().colors[0], [1.0, 0.0, 0.0]);
    }

    #[test]
    fn realtime_pacing_follows_presentation_time() {
        let dec = MemoryDecoder::solid_frames(2, 2, 20.0, &[RED, GREEN, RED]).unwrap();
        let started = Instant::now();
        let loader = VideoLoader::open_with(Box::new(dec), "mem", &cfg(Pacing::RealTime, false)).unwrap();
        assert!(wait_until(|| loader.status() == LoaderStatus::Ended));
        // Third frame is due at 100ms.
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[test]
    fn stop_handle_ends_the_thread() {
        let loader = VideoLoader::open_with(two_frames(), "mem", &cfg(Pacing::Stepped, true)).unwrap();
        loader.stop_handle().stop();
        loader.advance();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(loader.frames_published(), 0);
    }
}
