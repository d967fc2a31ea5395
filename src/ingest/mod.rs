//! Frame sources.
//!
//! A `FrameSource` wraps one native capture API behind a single capability
//! interface: `open` binds the input side to a device, `set_frame_handler`
//! binds the output side, `start` begins production and returns once frames
//! are flowing, and `close` releases everything.
//!
//! Sources deliver `SourceEvent`s on their own dedicated capture thread. The
//! `RawFrame` inside an event borrows the native buffer and is only valid for
//! the duration of the handler call.
//!
//! Available sources:
//! - Test-pattern source for `stub://` device ids (always available)
//! - V4L2 devices (feature: capture-v4l2)

pub mod normalize;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

pub use normalize::normalize;
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Source;

use crate::catalog::DeviceDescriptor;
use crate::error::Result;
use crate::frame::RawFrame;

/// Prefix of device ids served by the test-pattern source.
pub const STUB_SCHEME: &str = "stub://";

/// Something the capture thread reports to the pipeline.
#[derive(Debug)]
pub enum SourceEvent<'a> {
    Frame(RawFrame<'a>),
    /// The source stopped producing on its own (unplug, driver error).
    Ended { reason: String },
}

/// Callback installed by the capture session. Runs on the capture thread.
pub type FrameHandler = Box<dyn for<'a> FnMut(SourceEvent<'a>) + Send>;

/// Capture parameters negotiated at `open`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Preferred frame width; sources may deliver a different size.
    pub width: u32,
    pub height: u32,
    /// Target delivery rate. Sources may run faster; the throttle decimates.
    pub target_fps: u32,
}

/// Native capture capability.
///
/// `close` must be idempotent and must not return until the capture thread
/// has stopped and the handler has been dropped. It is never called from the
/// capture thread.
pub trait FrameSource: Send {
    /// Backend identifier, for logs.
    fn name(&self) -> &'static str;

    fn open(&mut self, device: &DeviceDescriptor, request: &CaptureRequest) -> Result<()>;

    fn set_frame_handler(&mut self, handler: FrameHandler) -> Result<()>;

    /// Starts production. Returns once the source confirms frames are flowing.
    fn start(&mut self) -> Result<()>;

    fn close(&mut self);
}

/// Creates a fresh frame source for a device.
pub trait FrameSourceProvider: Send + Sync {
    fn create(&self, device: &DeviceDescriptor) -> Result<Box<dyn FrameSource>>;

    /// Whether real hardware capture is available on this platform build.
    fn is_supported(&self) -> bool;
}

/// Routes `stub://` ids to the test-pattern source and everything else to the
/// platform backend.
#[derive(Clone, Debug, Default)]
pub struct PlatformSources;

impl FrameSourceProvider for PlatformSources {
    fn create(&self, device: &DeviceDescriptor) -> Result<Box<dyn FrameSource>> {
        if device.id.starts_with(STUB_SCHEME) {
            return Ok(Box::new(SyntheticSource::new()));
        }
        #[cfg(feature = "capture-v4l2")]
        {
            Ok(Box::new(V4l2Source::new()))
        }
        #[cfg(not(feature = "capture-v4l2"))]
        {
            Err(crate::error::BridgeError::Unsupported(
                "hardware capture requires the capture-v4l2 feature".to_string(),
            ))
        }
    }

    fn is_supported(&self) -> bool {
        cfg!(all(target_os = "linux", feature = "capture-v4l2"))
    }
}
