//! Test-pattern frame source for `stub://` device ids.
//!
//! Produces an animated pattern (cycling background, grid lines every four
//! rows, a sweeping vertical bar) on a dedicated capture thread, encoded in
//! any pixel format the normalizer knows. Parameters ride on the device id:
//!
//! `stub://name?fps=30&format=nv21&width=256&height=64&frames=100`
//!
//! `frames` makes the source end by itself after that many frames, which is
//! how a device disappearing mid-session is simulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::catalog::DeviceDescriptor;
use crate::error::{BridgeError, Result};
use crate::frame::{PixelFormat, RawFrame};

use super::{CaptureRequest, FrameHandler, FrameSource, SourceEvent, STUB_SCHEME};

const DEFAULT_NATIVE_FPS: u32 = 30;
const START_TIMEOUT: Duration = Duration::from_secs(2);
/// Largest pattern edge, in pixels.
pub const MAX_DIMENSION: u32 = 8192;

/// Parameters parsed from a `stub://` device id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub native_fps: u32,
    pub format: PixelFormat,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_limit: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            native_fps: DEFAULT_NATIVE_FPS,
            format: PixelFormat::Nv21,
            width: None,
            height: None,
            frame_limit: None,
        }
    }
}

impl SyntheticConfig {
    pub fn from_device_id(id: &str) -> Result<Self> {
        let bind_error = |reason: String| BridgeError::SessionBindFailure {
            device: id.to_string(),
            reason,
        };
        let rest = id
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| bind_error("not a stub:// device".to_string()))?;
        let mut config = Self::default();
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(config);
        };

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| bind_error(format!("malformed parameter '{}'", pair)))?;
            let number = || {
                value
                    .parse::<u64>()
                    .map_err(|_| bind_error(format!("{} must be an integer", key)))
            };
            let dimension = || -> Result<u32> {
                u32::try_from(number()?)
                    .ok()
                    .filter(|edge| (1..=MAX_DIMENSION).contains(edge))
                    .ok_or_else(|| {
                        bind_error(format!("{} must be between 1 and {}", key, MAX_DIMENSION))
                    })
            };
            match key {
                "fps" => config.native_fps = number()?.clamp(1, 1000) as u32,
                "width" => config.width = Some(dimension()?),
                "height" => config.height = Some(dimension()?),
                "frames" => config.frame_limit = Some(number()?),
                "format" => config.format = parse_format(value),
                other => return Err(bind_error(format!("unknown parameter '{}'", other))),
            }
        }
        Ok(config)
    }
}

fn parse_format(value: &str) -> PixelFormat {
    match value.to_ascii_lowercase().as_str() {
        "nv21" => PixelFormat::Nv21,
        "nv12" => PixelFormat::Nv12,
        "yuyv" => PixelFormat::Yuyv,
        "rgb24" | "rgb" => PixelFormat::Rgb24,
        "bgr24" | "bgr" => PixelFormat::Bgr24,
        "rgba32" | "rgba" => PixelFormat::Rgba32,
        "bgra32" | "bgra" => PixelFormat::Bgra32,
        _ => {
            let mut fourcc = [b' '; 4];
            for (slot, byte) in fourcc.iter_mut().zip(value.bytes()) {
                *slot = byte.to_ascii_uppercase();
            }
            PixelFormat::from_fourcc(fourcc)
        }
    }
}

pub struct SyntheticSource {
    device: Option<String>,
    config: SyntheticConfig,
    width: u32,
    height: u32,
    handler: Option<FrameHandler>,
    worker: Option<Worker>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            device: None,
            config: SyntheticConfig::default(),
            width: 0,
            height: 0,
            handler: None,
            worker: None,
        }
    }

    fn device_id(&self) -> String {
        self.device.clone().unwrap_or_else(|| "stub://".to_string())
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&mut self, device: &DeviceDescriptor, request: &CaptureRequest) -> Result<()> {
        self.config = SyntheticConfig::from_device_id(&device.id)?;
        self.width = self.config.width.unwrap_or(request.width).max(1);
        self.height = self.config.height.unwrap_or(request.height).max(1);
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(BridgeError::SessionBindFailure {
                device: device.id.clone(),
                reason: format!(
                    "pattern {}x{} exceeds {} pixels per edge",
                    self.width, self.height, MAX_DIMENSION
                ),
            });
        }
        self.device = Some(device.id.clone());
        log::info!(
            "SyntheticSource: opened {} ({}x{} {} @ {} fps)",
            device.id,
            self.width,
            self.height,
            self.config.format,
            self.config.native_fps
        );
        Ok(())
    }

    fn set_frame_handler(&mut self, handler: FrameHandler) -> Result<()> {
        if self.device.is_none() {
            return Err(BridgeError::SessionBindFailure {
                device: self.device_id(),
                reason: "source is not open".to_string(),
            });
        }
        self.handler = Some(handler);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let device = self.device_id();
        let handler = self
            .handler
            .take()
            .ok_or_else(|| BridgeError::SessionBindFailure {
                device: device.clone(),
                reason: "no frame handler installed".to_string(),
            })?;

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let pattern = PatternGenerator::new(self.width, self.height, self.config.format);
        let config = self.config.clone();
        let stop_thread = stop.clone();
        let join = std::thread::Builder::new()
            .name("uvc-capture".to_string())
            .spawn(move || run_capture(pattern, config, handler, stop_thread, ready_tx))
            .map_err(|err| BridgeError::SourceStartFailure {
                device: device.clone(),
                reason: err.to_string(),
            })?;
        let worker = Worker { stop, join };

        let outcome = match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err("capture thread did not produce a first frame".to_string()),
        };
        if let Err(reason) = outcome {
            worker.stop.store(true, Ordering::SeqCst);
            let _ = worker.join.join();
            return Err(BridgeError::SourceStartFailure { device, reason });
        }
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            if worker.join.join().is_err() {
                log::warn!("SyntheticSource: capture thread panicked");
            }
        }
        self.handler = None;
        if let Some(device) = self.device.take() {
            log::info!("SyntheticSource: closed {}", device);
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_capture(
    mut pattern: PatternGenerator,
    config: SyntheticConfig,
    mut handler: FrameHandler,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<std::result::Result<(), String>>,
) {
    let period = Duration::from_secs(1) / config.native_fps.max(1);
    let (width, height, format) = (pattern.width, pattern.height, pattern.format);
    let epoch = Instant::now();
    // Consumed by the first rendered frame.
    let mut ready = Some(ready);

    let mut index: u64 = 0;
    while !stop.load(Ordering::SeqCst) {
        if config.frame_limit.is_some_and(|limit| index >= limit) {
            if let Some(ready) = ready.take() {
                let _ = ready.send(Err("test pattern has no frames".to_string()));
                return;
            }
            handler(SourceEvent::Ended {
                reason: format!("test pattern finished after {} frames", index),
            });
            return;
        }

        let scheduled = period.saturating_mul(index.min(u32::MAX as u64) as u32);
        let elapsed = epoch.elapsed();
        if scheduled > elapsed {
            std::thread::sleep(scheduled - elapsed);
            if stop.load(Ordering::SeqCst) {
                break;
            }
        }

        let buffer = pattern.render(index);
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }
        handler(SourceEvent::Frame(RawFrame::new(
            width, height, format, buffer, scheduled,
        )));
        index += 1;
    }
}

// ----------------------------------------------------------------------------
// Pattern rendering
// ----------------------------------------------------------------------------

struct PatternGenerator {
    width: u32,
    height: u32,
    format: PixelFormat,
    rgb: Vec<[u8; 3]>,
    native: Vec<u8>,
}

impl PatternGenerator {
    fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let pixels = width as usize * height as usize;
        let native_len = format.frame_len(width, height).unwrap_or(pixels * 2);
        Self {
            width,
            height,
            format,
            rgb: vec![[0; 3]; pixels],
            native: vec![0; native_len],
        }
    }

    /// Renders frame `index` into the reusable native buffer.
    fn render(&mut self, index: u64) -> &[u8] {
        let w = self.width as usize;
        let h = self.height as usize;
        let shade = (index * 4 % 256) as u8;
        let bar = (index as usize * 4) % w.max(1);

        for y in 0..h {
            for x in 0..w {
                let px = if y % 4 == 0 || x.abs_diff(bar) < 2 {
                    [255, 255, 255]
                } else {
                    [shade, shade / 2, 0]
                };
                self.rgb[y * w + x] = px;
            }
        }

        match self.format {
            PixelFormat::Rgb24 => pack(&self.rgb, &mut self.native, 3, [0, 1, 2]),
            PixelFormat::Bgr24 => pack(&self.rgb, &mut self.native, 3, [2, 1, 0]),
            PixelFormat::Rgba32 => pack(&self.rgb, &mut self.native, 4, [0, 1, 2]),
            PixelFormat::Bgra32 => pack(&self.rgb, &mut self.native, 4, [2, 1, 0]),
            PixelFormat::Nv21 => self.semi_planar(true),
            PixelFormat::Nv12 => self.semi_planar(false),
            PixelFormat::Yuyv => self.yuyv(),
            PixelFormat::Other(_) => self.native.fill(shade),
        }
        &self.native
    }

    fn semi_planar(&mut self, vu: bool) {
        let w = self.width as usize;
        let h = self.height as usize;
        for (i, px) in self.rgb.iter().enumerate() {
            self.native[i] = rgb_to_yuv(*px)[0];
        }
        let chroma_w = w.div_ceil(2);
        let base = w * h;
        for cy in 0..h.div_ceil(2) {
            for cx in 0..chroma_w {
                let [_, u, v] = rgb_to_yuv(self.rgb[(cy * 2) * w + cx * 2]);
                let at = base + (cy * chroma_w + cx) * 2;
                let (first, second) = if vu { (v, u) } else { (u, v) };
                self.native[at] = first;
                self.native[at + 1] = second;
            }
        }
    }

    fn yuyv(&mut self) {
        let w = self.width as usize;
        let row_bytes = w.div_ceil(2) * 4;
        for y in 0..self.height as usize {
            for pair in 0..w.div_ceil(2) {
                let left = self.rgb[y * w + pair * 2];
                let right = self.rgb[y * w + (pair * 2 + 1).min(w - 1)];
                let [y0, u, v] = rgb_to_yuv(left);
                let [y1, _, _] = rgb_to_yuv(right);
                let at = y * row_bytes + pair * 4;
                self.native[at..at + 4].copy_from_slice(&[y0, u, y1, v]);
            }
        }
    }
}

fn pack(rgb: &[[u8; 3]], out: &mut [u8], stride: usize, order: [usize; 3]) {
    for (px, dst) in rgb.iter().zip(out.chunks_exact_mut(stride)) {
        dst[0] = px[order[0]];
        dst[1] = px[order[1]];
        dst[2] = px[order[2]];
        if stride == 4 {
            dst[3] = 255;
        }
    }
}

/// Full-range BT.601, the inverse of the normalizer's conversion.
fn rgb_to_yuv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let v = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    [
        y.round().clamp(0.0, 255.0) as u8,
        u.round().clamp(0.0, 255.0) as u8,
        v.round().clamp(0.0, 255.0) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PermissionState;
    use crate::ingest::normalize;
    use anyhow::Result;
    use std::sync::Mutex;

    fn descriptor(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            name: "Test Pattern".to_string(),
            vendor_id: 0,
            product_id: 0,
            vendor_match: false,
            permission: PermissionState::Granted,
        }
    }

    fn request() -> CaptureRequest {
        CaptureRequest {
            width: 16,
            height: 8,
            target_fps: 15,
        }
    }

    #[test]
    fn parses_device_parameters() -> Result<()> {
        let config =
            SyntheticConfig::from_device_id("stub://cam?fps=60&format=yuyv&width=32&frames=3")?;
        assert_eq!(config.native_fps, 60);
        assert_eq!(config.format, PixelFormat::Yuyv);
        assert_eq!(config.width, Some(32));
        assert_eq!(config.height, None);
        assert_eq!(config.frame_limit, Some(3));

        assert_eq!(SyntheticConfig::from_device_id("stub://plain")?, SyntheticConfig::default());
        assert!(SyntheticConfig::from_device_id("stub://x?bogus=1").is_err());
        assert!(matches!(
            SyntheticConfig::from_device_id("stub://x?format=mjpg")?.format,
            PixelFormat::Other(_)
        ));
        Ok(())
    }

    #[test]
    fn every_format_normalizes_to_the_same_size() -> Result<()> {
        for format in [
            PixelFormat::Nv21,
            PixelFormat::Nv12,
            PixelFormat::Yuyv,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Rgba32,
            PixelFormat::Bgra32,
        ] {
            let mut pattern = PatternGenerator::new(7, 5, format);
            let native = pattern.render(3).to_vec();
            let frame = RawFrame::new(7, 5, format, &native, Duration::ZERO);
            let raster = normalize(&frame)?;
            assert_eq!((raster.width(), raster.height()), (7, 5), "{}", format);
            // Row 0 is a white grid line in every frame.
            let [r, g, b] = raster.pixel(3, 0);
            assert!(r > 240 && g > 240 && b > 240, "{}: {:?}", format, (r, g, b));
        }
        Ok(())
    }

    #[test]
    fn emits_frames_then_ends_when_limited() -> Result<()> {
        let mut source = SyntheticSource::new();
        source.open(&descriptor("stub://cam?fps=200&frames=4"), &request())?;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        source.set_frame_handler(Box::new(move |event| {
            let entry = match event {
                SourceEvent::Frame(frame) => format!("frame {}x{}", frame.width, frame.height),
                SourceEvent::Ended { .. } => "ended".to_string(),
            };
            sink.lock().unwrap().push(entry);
        }))?;
        source.start()?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while events.lock().unwrap().len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        source.close();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 5);
        assert!(events[..4].iter().all(|e| e == "frame 16x8"));
        assert_eq!(events[4], "ended");
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_dimensions() {
        for id in [
            "stub://cam?width=4294967296",
            "stub://cam?width=4294967297",
            "stub://cam?height=0",
            "stub://cam?height=100000",
        ] {
            assert!(
                matches!(
                    SyntheticConfig::from_device_id(id),
                    Err(BridgeError::SessionBindFailure { .. })
                ),
                "{}",
                id
            );
        }

        let mut source = SyntheticSource::new();
        let huge = CaptureRequest {
            width: MAX_DIMENSION + 1,
            ..request()
        };
        assert!(matches!(
            source.open(&descriptor("stub://cam"), &huge),
            Err(BridgeError::SessionBindFailure { .. })
        ));
    }

    #[test]
    fn start_reports_ready_only_after_a_frame() -> Result<()> {
        let mut source = SyntheticSource::new();
        source.open(&descriptor("stub://cam?fps=200"), &request())?;
        let frames = Arc::new(Mutex::new(0usize));
        let sink = frames.clone();
        source.set_frame_handler(Box::new(move |event| {
            if let SourceEvent::Frame(_) = event {
                *sink.lock().unwrap() += 1;
            }
        }))?;
        source.start()?;
        // The first frame is handed over right after start reports ready.
        let deadline = Instant::now() + Duration::from_secs(2);
        while *frames.lock().unwrap() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(*frames.lock().unwrap() >= 1);
        source.close();

        let mut empty = SyntheticSource::new();
        empty.open(&descriptor("stub://cam?frames=0"), &request())?;
        empty.set_frame_handler(Box::new(|_| {}))?;
        assert!(matches!(
            empty.start(),
            Err(BridgeError::SourceStartFailure { .. })
        ));
        Ok(())
    }

    #[test]
    fn start_without_handler_fails_to_bind() -> Result<()> {
        let mut source = SyntheticSource::new();
        source.open(&descriptor("stub://cam"), &request())?;
        assert!(matches!(
            source.start(),
            Err(BridgeError::SessionBindFailure { .. })
        ));
        Ok(())
    }

    #[test]
    fn close_is_idempotent() -> Result<()> {
        let mut source = SyntheticSource::new();
        source.open(&descriptor("stub://cam?fps=100"), &request())?;
        source.set_frame_handler(Box::new(|_| {}))?;
        source.start()?;
        source.close();
        source.close();
        Ok(())
    }
}
