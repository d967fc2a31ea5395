use thiserror::Error;

use crate::frame::PixelFormat;

/// Errors surfaced by the capture pipeline and its command surface.
///
/// `start`/`stop` in an inapplicable state are no-ops, not errors, so there is
/// no `AlreadyRunning`/`AlreadyStopped` variant.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("permission denied for device {device}: {reason}")]
    PermissionDenied { device: String, reason: String },

    #[error("failed to bind capture session for {device}: {reason}")]
    SessionBindFailure { device: String, reason: String },

    #[error("frame source for {device} did not start: {reason}")]
    SourceStartFailure { device: String, reason: String },

    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),

    #[error("malformed {format} frame {width}x{height}: {reason}")]
    MalformedFrame {
        format: PixelFormat,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("raster encoding failed: {0}")]
    EncodeFailure(String),

    #[error("capture is not supported on this platform: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Stable machine-readable code, used by the CLI and the debug channel.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            BridgeError::PermissionDenied { .. } => "PERMISSION_DENIED",
            BridgeError::SessionBindFailure { .. } => "SESSION_BIND_FAILURE",
            BridgeError::SourceStartFailure { .. } => "SOURCE_START_FAILURE",
            BridgeError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            BridgeError::MalformedFrame { .. } => "MALFORMED_FRAME",
            BridgeError::EncodeFailure(_) => "ENCODE_FAILURE",
            BridgeError::Unsupported(_) => "UNSUPPORTED",
            BridgeError::Config(_) => "INVALID_CONFIG",
        }
    }

    /// Per-frame errors drop one frame and never end the session.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            BridgeError::UnsupportedFormat(_)
                | BridgeError::MalformedFrame { .. }
                | BridgeError::EncodeFailure(_)
        )
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
