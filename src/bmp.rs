//! Uncompressed 24-bit BMP encoding.
//!
//! Layout: 14-byte file header, 40-byte BITMAPINFOHEADER with a negative
//! height (top-down rows), then BGR rows padded to a 4-byte boundary.

use crate::error::{BridgeError, Result};
use crate::frame::{CanonicalRaster, EncodedImage};

pub const HEADER_LEN: usize = 54;
const INFO_HEADER_LEN: u32 = 40;
const BITS_PER_PIXEL: u16 = 24;

/// Zero bytes appended to each row of `width` pixels.
pub fn row_padding(width: u32) -> usize {
    (4 - (width as usize * 3) % 4) % 4
}

pub fn padded_row_bytes(width: u32) -> usize {
    width as usize * 3 + row_padding(width)
}

/// Total encoded size for a raster of the given dimensions.
pub fn encoded_len(width: u32, height: u32) -> usize {
    HEADER_LEN + padded_row_bytes(width) * height as usize
}

/// Encodes a raster. Pure and deterministic.
pub fn encode(raster: &CanonicalRaster) -> Result<EncodedImage> {
    let width = raster.width();
    let height = raster.height();

    let width_i32 = i32::try_from(width)
        .map_err(|_| BridgeError::EncodeFailure(format!("width {width} too large")))?;
    let height_i32 = i32::try_from(height)
        .map_err(|_| BridgeError::EncodeFailure(format!("height {height} too large")))?;
    let data_size = padded_row_bytes(width)
        .checked_mul(height as usize)
        .ok_or_else(|| BridgeError::EncodeFailure("pixel data size overflow".to_string()))?;
    let file_size = u32::try_from(HEADER_LEN + data_size)
        .map_err(|_| BridgeError::EncodeFailure("file size exceeds 4 GiB".to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + data_size);

    // File header
    out.extend_from_slice(b"BM");
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());

    // Info header
    out.extend_from_slice(&INFO_HEADER_LEN.to_le_bytes());
    out.extend_from_slice(&width_i32.to_le_bytes());
    out.extend_from_slice(&(-height_i32).to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&BITS_PER_PIXEL.to_le_bytes());
    // compression, image size, x/y resolution, palette counts
    out.resize(HEADER_LEN, 0);

    let padding = [0u8; 3];
    let pad = row_padding(width);
    if width > 0 {
        for row in raster.rgb().chunks_exact(width as usize * 3) {
            for px in row.chunks_exact(3) {
                out.extend_from_slice(&[px[2], px[1], px[0]]);
            }
            out.extend_from_slice(&padding[..pad]);
        }
    }

    if out.len() != file_size as usize {
        return Err(BridgeError::EncodeFailure(format!(
            "encoded {} bytes, header declares {}",
            out.len(),
            file_size
        )));
    }
    Ok(EncodedImage::new(out))
}
