//! USB video frame bridge.
//!
//! Turns a live USB video source into a throttled stream of self-contained
//! BMP images for consumers that cannot reach native camera APIs.
//!
//! # Architecture
//!
//! Data flows one way:
//!
//! ```text
//! FrameSource ─▶ FrameThrottle ─▶ normalize ─▶ bmp::encode ─▶ EventDelivery ─▶ subscriber
//! ```
//!
//! Control flows the other way: the subscriber issues `start_stream` and
//! `stop_stream` against `UsbVideoBridge`, which drives one `CaptureSession`.
//!
//! Every per-frame stage runs synchronously on the frame source's capture
//! thread. Raw buffers are borrowed for the duration of the callback only;
//! the first owned copy is the normalized raster.
//!
//! # Module Structure
//!
//! - `catalog`: device enumeration, vendor filtering, permissions
//! - `ingest`: frame source capability, test-pattern and V4L2 sources, pixel normalizer
//! - `throttle`: schedule-based frame-rate limiter
//! - `bmp`: bit-exact top-down 24-bit BMP encoder
//! - `session` / `pipeline`: capture lifecycle and the per-frame path
//! - `delivery`: single-subscriber frame and debug channels
//! - `bridge`: the synchronous command surface
//! - `config`: file + environment configuration

pub mod bmp;
pub mod bridge;
pub mod catalog;
pub mod config;
pub mod delivery;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod session;
pub mod throttle;

pub use bridge::UsbVideoBridge;
pub use catalog::{
    CatalogFilter, DeviceCatalog, DeviceDescriptor, DeviceRegistry, MemoryRegistry,
    PermissionState,
};
pub use config::BridgeConfig;
pub use delivery::{DeliveryContext, EventDelivery, Publish, SubscriptionId};
pub use error::{BridgeError, Result};
pub use frame::{CanonicalRaster, EncodedImage, PixelFormat, RawFrame};
pub use ingest::{
    CaptureRequest, FrameHandler, FrameSource, FrameSourceProvider, PlatformSources, SourceEvent,
};
pub use pipeline::SessionStats;
pub use session::{CaptureConfig, CaptureSession, SessionState};
pub use throttle::FrameThrottle;
