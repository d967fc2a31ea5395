//! Frame data model.
//!
//! - `RawFrame`: borrowed view of a native buffer. Only valid inside the
//!   frame source callback that produced it.
//! - `CanonicalRaster`: top-down, unpadded RGB24 produced by the normalizer.
//! - `EncodedImage`: immutable encoded bytes handed to event delivery.
//!
//! `RawFrame` borrows its pixel data, so the borrow checker rejects any
//! attempt to keep the buffer past the callback:
//!
//! ```compile_fail
//! use std::time::Duration;
//! use uvc_frame_bridge::{PixelFormat, RawFrame};
//!
//! let mut kept: Option<RawFrame<'static>> = None;
//! {
//!     let native = vec![0u8; 12];
//!     let frame = RawFrame::new(2, 2, PixelFormat::Rgb24, &native, Duration::ZERO);
//!     kept = Some(frame);
//! }
//! drop(kept);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Native pixel layout tag reported by a frame source.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Y plane followed by interleaved V/U at quarter resolution.
    Nv21,
    /// Y plane followed by interleaved U/V at quarter resolution.
    Nv12,
    /// Packed 4:2:2, Y0 U Y1 V.
    Yuyv,
    Rgb24,
    Bgr24,
    Rgba32,
    Bgra32,
    /// Tag the normalizer does not understand (FourCC or platform code).
    Other(u32),
}

impl PixelFormat {
    /// Maps a V4L2-style FourCC to a pixel format.
    pub fn from_fourcc(fourcc: [u8; 4]) -> Self {
        match &fourcc {
            b"NV21" => PixelFormat::Nv21,
            b"NV12" => PixelFormat::Nv12,
            b"YUYV" => PixelFormat::Yuyv,
            b"RGB3" => PixelFormat::Rgb24,
            b"BGR3" => PixelFormat::Bgr24,
            b"AB24" | b"RGBA" => PixelFormat::Rgba32,
            b"AR24" | b"BGRA" => PixelFormat::Bgra32,
            _ => PixelFormat::Other(u32::from_le_bytes(fourcc)),
        }
    }

    /// Exact buffer length for a frame of the given size, if the format is recognized.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 => {
                let chroma_w = (width as usize).div_ceil(2);
                let chroma_h = (height as usize).div_ceil(2);
                pixels.checked_add(chroma_w.checked_mul(chroma_h)?.checked_mul(2)?)
            }
            PixelFormat::Yuyv => (width as usize)
                .div_ceil(2)
                .checked_mul(4)?
                .checked_mul(height as usize),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels.checked_mul(3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => pixels.checked_mul(4),
            PixelFormat::Other(_) => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Nv21 => f.write_str("NV21"),
            PixelFormat::Nv12 => f.write_str("NV12"),
            PixelFormat::Yuyv => f.write_str("YUYV"),
            PixelFormat::Rgb24 => f.write_str("RGB24"),
            PixelFormat::Bgr24 => f.write_str("BGR24"),
            PixelFormat::Rgba32 => f.write_str("RGBA32"),
            PixelFormat::Bgra32 => f.write_str("BGRA32"),
            PixelFormat::Other(code) => {
                let bytes = code.to_le_bytes();
                if bytes.iter().all(|b| b.is_ascii_graphic()) {
                    write!(f, "{}", String::from_utf8_lossy(&bytes))
                } else {
                    write!(f, "0x{:08x}", code)
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// RawFrame: transient native buffer
// ----------------------------------------------------------------------------

/// A frame as delivered by a frame source.
///
/// The pixel slice belongs to the source and is invalidated as soon as the
/// callback returns. There is deliberately no `Clone` and no owned variant.
pub struct RawFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Monotonic capture time, relative to the source's own epoch.
    pub timestamp: Duration,
    data: &'a [u8],
}

impl<'a> RawFrame<'a> {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: &'a [u8],
        timestamp: Duration,
    ) -> Self {
        Self {
            width,
            height,
            format,
            timestamp,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for RawFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp", &self.timestamp)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// CanonicalRaster: normalized RGB24
// ----------------------------------------------------------------------------

/// Top-down, row-major RGB24 raster with no row padding.
#[derive(Clone, PartialEq, Eq)]
pub struct CanonicalRaster {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

impl CanonicalRaster {
    /// Wraps an RGB24 buffer. Returns `None` when the length does not match
    /// `width * height * 3`.
    pub fn from_rgb(width: u32, height: u32, rgb: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(3)?;
        (rgb.len() == expected).then_some(Self { width, height, rgb })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgb(&self) -> &[u8] {
        &self.rgb
    }

    /// RGB triple at (x, y). Panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        [self.rgb[offset], self.rgb[offset + 1], self.rgb[offset + 2]]
    }

    pub fn into_rgb(self) -> Vec<u8> {
        self.rgb
    }
}

impl fmt::Debug for CanonicalRaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalRaster")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// EncodedImage: immutable payload for delivery
// ----------------------------------------------------------------------------

/// Encoded frame bytes. Cheap to clone; the bytes themselves are immutable.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedImage {
    bytes: Arc<[u8]>,
}

impl EncodedImage {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl AsRef<[u8]> for EncodedImage {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedImage({} bytes)", self.bytes.len())
    }
}
