//! Capture session lifecycle.
//!
//! ```text
//! Idle → Starting → Running → Stopping → Idle
//!           ↓
//!         Failed → Idle
//! ```
//!
//! A `CaptureSession` exclusively owns at most one frame source. `start`
//! always tears the previous source down (closing it joins its capture
//! thread) before resolving the next device, so two bindings never overlap.
//! `start`/`stop` must not be called from the capture thread.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::catalog::{DeviceCatalog, DeviceDescriptor, PermissionState};
use crate::delivery::EventDelivery;
use crate::error::{BridgeError, Result};
use crate::ingest::{CaptureRequest, FrameSource, FrameSourceProvider};
use crate::pipeline::{FramePipeline, PipelineStats, SessionStats};
use crate::throttle::FrameThrottle;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture parameters handed to the session at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub target_fps: u32,
    /// Preferred frame size requested from the source.
    pub width: u32,
    pub height: u32,
    /// How often a `Pending` permission is re-queried before giving up.
    pub permission_retries: u32,
    pub permission_backoff: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_fps: 15,
            width: 256,
            height: 64,
            permission_retries: 2,
            permission_backoff: Duration::from_millis(100),
        }
    }
}

// ----------------------------------------------------------------------------
// Lifecycle: state shared with the capture thread
// ----------------------------------------------------------------------------

/// Session state plus a generation counter, so a late `Ended` from a torn
/// down source cannot touch its successor.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    inner: Mutex<LifecycleInner>,
}

#[derive(Debug, Default)]
struct LifecycleInner {
    state: SessionState,
    generation: u64,
    ended_while_starting: bool,
}

impl Lifecycle {
    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    fn set(&self, state: SessionState) {
        self.lock().state = state;
    }

    pub(crate) fn begin_start(&self) -> u64 {
        let mut inner = self.lock();
        inner.state = SessionState::Starting;
        inner.generation += 1;
        inner.ended_while_starting = false;
        inner.generation
    }

    /// Starting → Running. False if the source already ended, in which case
    /// the state is Idle.
    pub(crate) fn mark_running(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != SessionState::Starting {
            return false;
        }
        if inner.ended_while_starting {
            inner.state = SessionState::Idle;
            return false;
        }
        inner.state = SessionState::Running;
        true
    }

    /// Returns the previous state.
    fn begin_stop(&self) -> SessionState {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.state = SessionState::Stopping;
        previous
    }

    /// Called from the capture thread. True if the end belongs to the live
    /// session and should be reported.
    pub(crate) fn source_ended(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        match inner.state {
            SessionState::Running => {
                inner.state = SessionState::Idle;
                true
            }
            SessionState::Starting => {
                inner.ended_while_starting = true;
                true
            }
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// CaptureSession
// ----------------------------------------------------------------------------

/// Debug lines from a control operation, waiting to be published.
#[must_use = "debug lines are lost unless published"]
pub(crate) struct Notices {
    delivery: Arc<EventDelivery>,
    lines: Vec<String>,
}

impl Notices {
    fn new(delivery: Arc<EventDelivery>) -> Self {
        Self {
            delivery,
            lines: Vec::new(),
        }
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub(crate) fn publish(mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        for line in self.lines.drain(..) {
            self.delivery.debug().log(line);
        }
    }
}

impl Drop for Notices {
    fn drop(&mut self) {
        self.flush();
    }
}

struct ActiveSource {
    device_id: String,
    source: Box<dyn FrameSource>,
}

pub struct CaptureSession {
    catalog: Arc<DeviceCatalog>,
    sources: Arc<dyn FrameSourceProvider>,
    delivery: Arc<EventDelivery>,
    config: CaptureConfig,
    lifecycle: Arc<Lifecycle>,
    active: Option<ActiveSource>,
    stats: Arc<PipelineStats>,
    last_error: Option<String>,
}

impl CaptureSession {
    pub fn new(
        catalog: Arc<DeviceCatalog>,
        sources: Arc<dyn FrameSourceProvider>,
        delivery: Arc<EventDelivery>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            catalog,
            sources,
            delivery,
            config,
            lifecycle: Arc::new(Lifecycle::default()),
            active: None,
            stats: Arc::new(PipelineStats::default()),
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Device bound to the running session.
    pub fn device_id(&self) -> Option<&str> {
        match self.state() {
            SessionState::Running => self.active.as_ref().map(|a| a.device_id.as_str()),
            _ => None,
        }
    }

    /// Counters of the current (or most recent) session.
    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Starts capturing from `device_id`, replacing any current session.
    ///
    /// Returns once the source confirms frames are flowing. On error the
    /// session is back in Idle with nothing bound.
    pub fn start(&mut self, device_id: &str, target_fps: Option<u32>) -> Result<()> {
        let (result, notices) = self.start_deferred(device_id, target_fps);
        notices.publish();
        result
    }

    /// Like `start`, but hands back the debug lines instead of publishing
    /// them, so a caller holding a lock around the session can publish
    /// after releasing it.
    pub(crate) fn start_deferred(
        &mut self,
        device_id: &str,
        target_fps: Option<u32>,
    ) -> (Result<()>, Notices) {
        let mut notices = Notices::new(self.delivery.clone());
        self.stop_into(&mut notices);

        let generation = self.lifecycle.begin_start();
        self.last_error = None;
        let result = match self.bind(device_id, target_fps, generation) {
            Ok((active, stats)) => {
                self.active = Some(active);
                self.stats = stats;
                if self.lifecycle.mark_running(generation) {
                    log::info!("CaptureSession: running on {}", device_id);
                    notices.push(format!("capture started on {}", device_id));
                }
                Ok(())
            }
            Err(err) => {
                self.lifecycle.set(SessionState::Failed);
                log::warn!("CaptureSession: start on {} failed: {}", device_id, err);
                notices.push(format!("start failed ({}): {}", err.code(), err));
                self.last_error = Some(err.to_string());
                self.lifecycle.set(SessionState::Idle);
                Err(err)
            }
        };
        (result, notices)
    }

    /// Stops the current session. No-op when nothing is bound.
    pub fn stop(&mut self) {
        self.stop_deferred().publish();
    }

    pub(crate) fn stop_deferred(&mut self) -> Notices {
        let mut notices = Notices::new(self.delivery.clone());
        self.stop_into(&mut notices);
        notices
    }

    fn stop_into(&mut self, notices: &mut Notices) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let previous = self.lifecycle.begin_stop();
        active.source.close();
        self.lifecycle.set(SessionState::Idle);

        if previous == SessionState::Running {
            log::info!("CaptureSession: stopped {}", active.device_id);
            notices.push(format!("capture stopped on {}", active.device_id));
        } else {
            log::debug!("CaptureSession: released ended source {}", active.device_id);
        }
    }

    pub(crate) fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    fn bind(
        &self,
        device_id: &str,
        target_fps: Option<u32>,
        generation: u64,
    ) -> Result<(ActiveSource, Arc<PipelineStats>)> {
        let fps = target_fps.unwrap_or(self.config.target_fps);
        if fps == 0 {
            return Err(BridgeError::Config("target fps must be positive".to_string()));
        }

        let device = self
            .catalog
            .find(device_id)
            .ok_or_else(|| BridgeError::DeviceNotFound(device_id.to_string()))?;
        self.await_permission(&device)?;

        let request = CaptureRequest {
            width: self.config.width,
            height: self.config.height,
            target_fps: fps,
        };
        let stats = Arc::new(PipelineStats::default());
        let pipeline = FramePipeline::new(
            device.id.clone(),
            FrameThrottle::from_fps(fps),
            self.delivery.clone(),
            stats.clone(),
            self.lifecycle.clone(),
            generation,
            fps as u64,
        );

        let mut source = self.sources.create(&device)?;
        log::debug!(
            "CaptureSession: binding {} via {} source",
            device.id,
            source.name()
        );
        if let Err(err) = bring_up(source.as_mut(), &device, &request, pipeline) {
            source.close();
            return Err(err);
        }

        Ok((
            ActiveSource {
                device_id: device.id,
                source,
            },
            stats,
        ))
    }

    /// Re-queries a pending permission a bounded number of times.
    fn await_permission(&self, device: &DeviceDescriptor) -> Result<()> {
        let mut permission = device.permission;
        let mut attempts = 0;
        loop {
            match permission {
                PermissionState::Granted => return Ok(()),
                PermissionState::Denied => {
                    return Err(BridgeError::PermissionDenied {
                        device: device.id.clone(),
                        reason: "access was not granted".to_string(),
                    })
                }
                PermissionState::Pending if attempts >= self.config.permission_retries => {
                    return Err(BridgeError::PermissionDenied {
                        device: device.id.clone(),
                        reason: format!("still pending after {} retries", attempts),
                    })
                }
                PermissionState::Pending => {
                    attempts += 1;
                    log::debug!(
                        "CaptureSession: permission for {} pending, retry {}/{}",
                        device.id,
                        attempts,
                        self.config.permission_retries
                    );
                    std::thread::sleep(self.config.permission_backoff);
                    permission = self.catalog.permission(&device.id)?;
                }
            }
        }
    }
}

fn bring_up(
    source: &mut dyn FrameSource,
    device: &DeviceDescriptor,
    request: &CaptureRequest,
    pipeline: FramePipeline,
) -> Result<()> {
    source.open(device, request)?;
    source.set_frame_handler(pipeline.into_handler())?;
    source.start()
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
