//! V4L2 frame source.
//!
//! `open` negotiates format and frame rate on the device node; `start` moves
//! the device onto a dedicated capture thread that owns the mmap stream for
//! its whole lifetime. Frames are handed to the handler straight out of the
//! driver's buffer, which is requeued as soon as the handler returns.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;

use crate::catalog::DeviceDescriptor;
use crate::error::{BridgeError, Result};
use crate::frame::{PixelFormat, RawFrame};

use super::{CaptureRequest, FrameHandler, FrameSource, SourceEvent};

const BUFFER_COUNT: u32 = 4;
const START_TIMEOUT: Duration = Duration::from_secs(5);
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Negotiated stream parameters.
#[derive(Clone, Copy, Debug)]
struct ActiveFormat {
    width: u32,
    height: u32,
    format: PixelFormat,
}

pub struct V4l2Source {
    path: Option<String>,
    device: Option<v4l::Device>,
    active: Option<ActiveFormat>,
    handler: Option<FrameHandler>,
    worker: Option<Worker>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl Default for V4l2Source {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Source {
    pub fn new() -> Self {
        Self {
            path: None,
            device: None,
            active: None,
            handler: None,
            worker: None,
        }
    }

    fn path(&self) -> String {
        self.path.clone().unwrap_or_default()
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn open(&mut self, device: &DeviceDescriptor, request: &CaptureRequest) -> Result<()> {
        let bind_error = |reason: String| BridgeError::SessionBindFailure {
            device: device.id.clone(),
            reason,
        };

        let node = v4l::Device::with_path(&device.id)
            .map_err(|err| bind_error(format!("open device node: {}", err)))?;
        let mut format = node
            .format()
            .map_err(|err| bind_error(format!("read format: {}", err)))?;
        format.width = request.width;
        format.height = request.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match node.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Source: failed to set format on {}: {}", device.id, err);
                node.format()
                    .map_err(|err| bind_error(format!("read format after set failure: {}", err)))?
            }
        };

        if request.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(request.target_fps);
            if let Err(err) = node.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", device.id, err);
            }
        }

        let active = ActiveFormat {
            width: format.width,
            height: format.height,
            format: PixelFormat::from_fourcc(format.fourcc.repr),
        };
        log::info!(
            "V4l2Source: opened {} ({}x{} {})",
            device.id,
            active.width,
            active.height,
            active.format
        );
        self.path = Some(device.id.clone());
        self.device = Some(node);
        self.active = Some(active);
        Ok(())
    }

    fn set_frame_handler(&mut self, handler: FrameHandler) -> Result<()> {
        if self.device.is_none() {
            return Err(BridgeError::SessionBindFailure {
                device: self.path(),
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
        let path = self.path();
        let bind_error = |reason: &str| BridgeError::SessionBindFailure {
            device: path.clone(),
            reason: reason.to_string(),
        };
        let device = self.device.take().ok_or_else(|| bind_error("source is not open"))?;
        let active = self.active.ok_or_else(|| bind_error("source is not open"))?;
        let handler = self
            .handler
            .take()
            .ok_or_else(|| bind_error("no frame handler installed"))?;

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop_thread = stop.clone();
        let join = std::thread::Builder::new()
            .name("uvc-capture".to_string())
            .spawn(move || run_capture(device, active, handler, stop_thread, ready_tx))
            .map_err(|err| BridgeError::SourceStartFailure {
                device: path.clone(),
                reason: err.to_string(),
            })?;
        let worker = Worker { stop, join };

        let outcome = match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err("no frame within start timeout".to_string()),
        };
        if let Err(reason) = outcome {
            worker.stop.store(true, Ordering::SeqCst);
            let _ = worker.join.join();
            return Err(BridgeError::SourceStartFailure {
                device: path,
                reason,
            });
        }

        log::info!("V4l2Source: streaming {}", path);
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            if worker.join.join().is_err() {
                log::warn!("V4l2Source: capture thread panicked");
            }
        }
        self.handler = None;
        self.device = None;
        self.active = None;
        if let Some(path) = self.path.take() {
            log::info!("V4l2Source: closed {}", path);
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_capture(
    mut device: v4l::Device,
    active: ActiveFormat,
    mut handler: FrameHandler,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<std::result::Result<(), String>>,
) {
    let mut stream = match MmapStream::with_buffers(&mut device, Type::VideoCapture, BUFFER_COUNT)
    {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(format!("create buffer stream: {}", err)));
            return;
        }
    };
    // A stalled device must not pin this thread past a stop request.
    stream.set_timeout(DEQUEUE_TIMEOUT);

    // STREAMON happens inside the first dequeue, so ready is only reported
    // once a frame has actually arrived.
    let mut ready = Some(ready);
    while !stop.load(Ordering::SeqCst) {
        match stream.next() {
            Ok((buf, meta)) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                let timestamp = Duration::from_secs(meta.timestamp.sec.max(0) as u64)
                    + Duration::from_micros(meta.timestamp.usec.max(0) as u64);
                let used = (meta.bytesused as usize).min(buf.len());
                let data = if used > 0 { &buf[..used] } else { buf };
                handler(SourceEvent::Frame(RawFrame::new(
                    active.width,
                    active.height,
                    active.format,
                    data,
                    timestamp,
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                log::trace!("V4l2Source: no buffer within {:?}", DEQUEUE_TIMEOUT);
            }
            Err(err) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(format!("start streaming: {}", err)));
                    return;
                }
                log::warn!("V4l2Source: capture failed: {}", err);
                handler(SourceEvent::Ended {
                    reason: format!("capture failed: {}", err),
                });
                return;
            }
        }
    }
}
