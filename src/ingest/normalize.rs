//! Pixel normalization into canonical top-down RGB24.
//!
//! Each call allocates exactly one output buffer and keeps no state between
//! calls.

use crate::error::{BridgeError, Result};
use crate::frame::{CanonicalRaster, PixelFormat, RawFrame};

/// Converts a native frame into a `CanonicalRaster`.
pub fn normalize(frame: &RawFrame<'_>) -> Result<CanonicalRaster> {
    normalize_to_rgb(frame.data(), frame.width, frame.height, frame.format)
}

pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<CanonicalRaster> {
    if let PixelFormat::Other(_) = format {
        return Err(BridgeError::UnsupportedFormat(format));
    }
    let malformed = |reason: String| BridgeError::MalformedFrame {
        format,
        width,
        height,
        reason,
    };
    if width == 0 || height == 0 {
        return Err(malformed("zero-sized frame".to_string()));
    }
    let expected = format
        .frame_len(width, height)
        .ok_or_else(|| malformed("frame dimensions overflow".to_string()))?;
    if pixels.len() < expected {
        return Err(malformed(format!(
            "length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        )));
    }
    // Some drivers hand out buffers rounded up to a page; trailing bytes are ignored.
    let pixels = &pixels[..expected];

    let w = width as usize;
    let h = height as usize;
    let rgb = match format {
        PixelFormat::Rgb24 => pixels.to_vec(),
        PixelFormat::Bgr24 => reorder(pixels, 3, [2, 1, 0]),
        PixelFormat::Rgba32 => reorder(pixels, 4, [0, 1, 2]),
        PixelFormat::Bgra32 => reorder(pixels, 4, [2, 1, 0]),
        PixelFormat::Nv21 => semi_planar_to_rgb(pixels, w, h, ChromaOrder::Vu),
        PixelFormat::Nv12 => semi_planar_to_rgb(pixels, w, h, ChromaOrder::Uv),
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, w, h),
        PixelFormat::Other(_) => unreachable!("rejected above"),
    };

    CanonicalRaster::from_rgb(width, height, rgb)
        .ok_or_else(|| malformed("converted raster has wrong length".to_string()))
}

fn reorder(pixels: &[u8], stride: usize, order: [usize; 3]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(pixels.len() / stride * 3);
    for px in pixels.chunks_exact(stride) {
        rgb.extend_from_slice(&[px[order[0]], px[order[1]], px[order[2]]]);
    }
    rgb
}

#[derive(Clone, Copy)]
enum ChromaOrder {
    Uv,
    Vu,
}

fn semi_planar_to_rgb(pixels: &[u8], w: usize, h: usize, order: ChromaOrder) -> Vec<u8> {
    let y_plane = w * h;
    let chroma_stride = w.div_ceil(2) * 2;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i];
            let uv_index = y_plane + (j / 2) * chroma_stride + (i / 2) * 2;
            let (u, v) = match order {
                ChromaOrder::Uv => (pixels[uv_index], pixels[uv_index + 1]),
                ChromaOrder::Vu => (pixels[uv_index + 1], pixels[uv_index]),
            };
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    rgb
}

fn yuyv_to_rgb(pixels: &[u8], w: usize, h: usize) -> Vec<u8> {
    let row_bytes = w.div_ceil(2) * 4;
    let mut rgb = vec![0u8; w * h * 3];
    for j in 0..h {
        let row = &pixels[j * row_bytes..(j + 1) * row_bytes];
        for i in 0..w {
            let group = &row[(i / 2) * 4..(i / 2) * 4 + 4];
            let y = if i % 2 == 0 { group[0] } else { group[2] };
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, group[1], group[3]));
        }
    }
    rgb
}

/// Full-range BT.601 (JFIF) conversion.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;

    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn nv21_conversion_produces_gray() -> Result<()> {
        let width = 2;
        let height = 2;
        let y_plane = vec![128u8; 4];
        let vu_plane = vec![128u8; 2];
        let nv21 = [y_plane, vu_plane].concat();

        let raster = normalize_to_rgb(&nv21, width, height, PixelFormat::Nv21)?;
        assert_eq!(raster.rgb(), vec![128u8; 12].as_slice());

        Ok(())
    }

    #[test]
    fn nv21_and_nv12_swap_chroma() -> Result<()> {
        // Strong V (red) with neutral U.
        let nv21 = [vec![100u8; 4], vec![200, 128]].concat();
        let nv12 = [vec![100u8; 4], vec![128, 200]].concat();

        let a = normalize_to_rgb(&nv21, 2, 2, PixelFormat::Nv21)?;
        let b = normalize_to_rgb(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(a, b);
        let [r, g, bl] = a.pixel(0, 0);
        assert!(r > g && r > bl, "expected a red pixel, got {:?}", (r, g, bl));
        Ok(())
    }

    #[test]
    fn yuyv_uses_per_pixel_luma() -> Result<()> {
        let yuyv = [0u8, 128, 255, 128];
        let raster = normalize_to_rgb(&yuyv, 2, 1, PixelFormat::Yuyv)?;
        assert_eq!(raster.pixel(0, 0), [0, 0, 0]);
        assert_eq!(raster.pixel(1, 0), [255, 255, 255]);
        Ok(())
    }

    #[test]
    fn rgb_pass_through_validates_length() -> Result<()> {
        let pixels = vec![1u8; 9];
        let raster = normalize_to_rgb(&pixels, 1, 3, PixelFormat::Rgb24)?;
        assert_eq!(raster.rgb(), pixels.as_slice());

        let short = normalize_to_rgb(&pixels[..8], 1, 3, PixelFormat::Rgb24);
        assert!(matches!(short, Err(BridgeError::MalformedFrame { .. })));
        Ok(())
    }

    #[test]
    fn bgr_and_bgra_are_reordered() -> Result<()> {
        let bgr = normalize_to_rgb(&[1, 2, 3], 1, 1, PixelFormat::Bgr24)?;
        assert_eq!(bgr.rgb(), &[3, 2, 1]);
        let bgra = normalize_to_rgb(&[1, 2, 3, 255], 1, 1, PixelFormat::Bgra32)?;
        assert_eq!(bgra.rgb(), &[3, 2, 1]);
        let rgba = normalize_to_rgb(&[1, 2, 3, 255], 1, 1, PixelFormat::Rgba32)?;
        assert_eq!(rgba.rgb(), &[1, 2, 3]);
        Ok(())
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        let err = normalize_to_rgb(&[0; 16], 2, 2, PixelFormat::from_fourcc(*b"MJPG"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedFormat(_)));
        assert!(err.is_per_frame());
    }
}
