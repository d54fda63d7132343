//! Pixel format conversion to packed RGB

use image::RgbImage;
use jpeg_decoder::Decoder;

use super::PreprocessError;
use crate::capture::{Frame, PixelFormat};

/// Decode or convert any supported frame into an RGB image of the frame's size.
///
/// The payload is checked against the announced geometry before any output
/// is allocated.
pub fn to_rgb(frame: &Frame) -> Result<RgbImage, PreprocessError> {
    let meta = &frame.meta;
    if meta.width == 0 || meta.height == 0 {
        return Err(PreprocessError::ShapeMismatch(format!(
            "frame {} has empty dimensions {}x{}",
            meta.id, meta.width, meta.height
        )));
    }

    let rgb = match meta.format {
        PixelFormat::Rgb24 => convert_packed(frame, 3, |row, out| out.copy_from_slice(row))?,
        PixelFormat::Bgr24 => convert_packed(frame, 3, |row, out| {
            for (src, dst) in row.chunks_exact(3).zip(out.chunks_exact_mut(3)) {
                dst.copy_from_slice(&[src[2], src[1], src[0]]);
            }
        })?,
        PixelFormat::Gray8 => convert_packed(frame, 1, |row, out| {
            for (&y, dst) in row.iter().zip(out.chunks_exact_mut(3)) {
                dst.fill(y);
            }
        })?,
        PixelFormat::Yuyv4 => {
            require_even(frame, true, false)?;
            convert_packed(frame, 2, |row, out| {
                for (src, dst) in row.chunks_exact(4).zip(out.chunks_exact_mut(6)) {
                    let (y0, u, y1, v) = (src[0], src[1], src[2], src[3]);
                    dst[..3].copy_from_slice(&yuv_to_rgb(y0, u, v));
                    dst[3..].copy_from_slice(&yuv_to_rgb(y1, u, v));
                }
            })?
        }
        PixelFormat::Nv12 => {
            require_even(frame, true, true)?;
            nv12_to_rgb(frame)?
        }
        PixelFormat::Mjpeg => return decode_jpeg(frame),
        PixelFormat::Unknown(_) => return Err(PreprocessError::FormatUnsupported(meta.format)),
    };

    RgbImage::from_raw(meta.width, meta.height, rgb).ok_or_else(|| {
        PreprocessError::ShapeMismatch(format!("frame {} does not fill its image", meta.id))
    })
}

/// Product of `factors`, or a shape mismatch if it does not fit in `usize`
fn checked_size(frame: &Frame, factors: &[usize]) -> Result<usize, PreprocessError> {
    factors
        .iter()
        .try_fold(1usize, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| {
            PreprocessError::ShapeMismatch(format!(
                "frame {} dimensions {}x{} overflow the address space",
                frame.meta.id, frame.meta.width, frame.meta.height
            ))
        })
}

/// Zeroed packed RGB output for the frame; only call once the input is validated
fn rgb_buffer(frame: &Frame) -> Result<Vec<u8>, PreprocessError> {
    let (w, h) = (frame.meta.width as usize, frame.meta.height as usize);
    Ok(vec![0u8; checked_size(frame, &[w, h, 3])?])
}

/// Convert a single packed plane row by row into RGB
fn convert_packed(
    frame: &Frame,
    bpp: usize,
    convert: impl Fn(&[u8], &mut [u8]),
) -> Result<Vec<u8>, PreprocessError> {
    let rows = packed_rows(frame, bpp)?;
    let mut rgb = rgb_buffer(frame)?;
    // w * 3 fits: the buffer above is w * h * 3 with h >= 1
    let out_row = frame.meta.width as usize * 3;
    for (row, out) in rows.zip(rgb.chunks_exact_mut(out_row)) {
        convert(row, out);
    }
    Ok(rgb)
}

/// Rows of a single packed plane, trimmed to `width * bpp` bytes
fn packed_rows(frame: &Frame, bpp: usize) -> Result<impl Iterator<Item = &[u8]>, PreprocessError> {
    let meta = &frame.meta;
    let (w, h) = (meta.width as usize, meta.height as usize);
    let row_bytes = checked_size(frame, &[w, bpp])?;
    let stride = if meta.stride == 0 {
        row_bytes
    } else {
        meta.stride as usize
    };
    check_len(frame, stride, row_bytes, h)?;

    Ok(frame.data.chunks(stride).take(h).map(move |row| &row[..row_bytes]))
}

/// The last row may omit its padding
fn check_len(frame: &Frame, stride: usize, row_bytes: usize, rows: usize) -> Result<(), PreprocessError> {
    let meta = &frame.meta;
    if stride < row_bytes {
        return Err(PreprocessError::ShapeMismatch(format!(
            "frame {} stride {} is shorter than a {}-byte row",
            meta.id, stride, row_bytes
        )));
    }
    let needed = checked_size(frame, &[stride, rows.saturating_sub(1)])?
        .checked_add(row_bytes)
        .ok_or_else(|| {
            PreprocessError::ShapeMismatch(format!("frame {} plane size overflows", meta.id))
        })?;
    if frame.data.len() < needed {
        return Err(PreprocessError::ShapeMismatch(format!(
            "frame {} is {}x{} {:?} and needs {} bytes, got {}",
            meta.id,
            meta.width,
            meta.height,
            meta.format,
            needed,
            frame.data.len()
        )));
    }
    Ok(())
}

fn require_even(frame: &Frame, width: bool, height: bool) -> Result<(), PreprocessError> {
    let meta = &frame.meta;
    if (width && meta.width % 2 != 0) || (height && meta.height % 2 != 0) {
        return Err(PreprocessError::ShapeMismatch(format!(
            "{:?} frame {} needs even dimensions, got {}x{}",
            meta.format, meta.id, meta.width, meta.height
        )));
    }
    Ok(())
}

fn nv12_to_rgb(frame: &Frame) -> Result<Vec<u8>, PreprocessError> {
    let meta = &frame.meta;
    let (w, h) = (meta.width as usize, meta.height as usize);
    let stride = if meta.stride == 0 {
        w
    } else {
        meta.stride as usize
    };
    // Luma plane followed by an interleaved UV plane of half height
    let rows = h.checked_add(h / 2).ok_or_else(|| {
        PreprocessError::ShapeMismatch(format!("frame {} plane count overflows", meta.id))
    })?;
    check_len(frame, stride, w, rows)?;
    let mut rgb = rgb_buffer(frame)?;
    let (luma, chroma) = frame.data.split_at(stride * h);

    for y in 0..h {
        let luma_row = &luma[y * stride..y * stride + w];
        let uv_row = &chroma[(y / 2) * stride..(y / 2) * stride + w];
        let out = &mut rgb[y * w * 3..(y + 1) * w * 3];
        for x in 0..w {
            let u = uv_row[x & !1];
            let v = uv_row[(x & !1) + 1];
            out[x * 3..x * 3 + 3].copy_from_slice(&yuv_to_rgb(luma_row[x], u, v));
        }
    }
    Ok(rgb)
}

/// BT.601 limited range
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

fn decode_jpeg(frame: &Frame) -> Result<RgbImage, PreprocessError> {
    let meta = &frame.meta;
    let mut decoder = Decoder::new(&frame.data[..]);
    decoder
        .read_info()
        .map_err(|e| PreprocessError::Corrupt(format!("frame {}: {}", meta.id, e)))?;
    let info = decoder
        .info()
        .ok_or_else(|| PreprocessError::Corrupt(format!("frame {}: missing JPEG header", meta.id)))?;

    // Reject before decoding so a lying header cannot size the allocation
    let (w, h) = (u32::from(info.width), u32::from(info.height));
    if (w, h) != (meta.width, meta.height) {
        return Err(PreprocessError::ShapeMismatch(format!(
            "frame {} decodes to {}x{} but was announced as {}x{}",
            meta.id, w, h, meta.width, meta.height
        )));
    }
    let pixels = decoder
        .decode()
        .map_err(|e| PreprocessError::Corrupt(format!("frame {}: {}", meta.id, e)))?;

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        _ => return Err(PreprocessError::FormatUnsupported(meta.format)),
    };

    RgbImage::from_raw(w, h, rgb).ok_or_else(|| {
        PreprocessError::Corrupt(format!("frame {}: short JPEG payload", meta.id))
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::capture::FrameId;

    fn frame(format: PixelFormat, w: u32, h: u32, data: Vec<u8>) -> Frame {
        Frame::new(FrameId(1), w, h, format, Bytes::from(data))
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let img = to_rgb(&frame(PixelFormat::Bgr24, 1, 1, vec![1, 2, 3])).unwrap();
        assert_eq!(img.as_raw(), &vec![3, 2, 1]);
    }

    #[test]
    fn stride_padding_is_skipped() {
        // 1x2 RGB with 4 bytes of padding per row
        let data = vec![10, 20, 30, 0, 0, 0, 0, 40, 50, 60];
        let f = frame(PixelFormat::Rgb24, 1, 2, data).with_stride(7);
        let img = to_rgb(&f).unwrap();
        assert_eq!(img.as_raw(), &vec![10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn yuyv_grey_maps_to_grey() {
        // Y=126 with neutral chroma is mid grey
        let img = to_rgb(&frame(PixelFormat::Yuyv4, 2, 1, vec![126, 128, 126, 128])).unwrap();
        let px = img.as_raw();
        assert!(px.iter().all(|&c| c == px[0]));
        assert!((127..=129).contains(&px[0]));
    }

    #[test]
    fn nv12_white_is_white() {
        let mut data = vec![235; 4];
        data.extend_from_slice(&[128, 128]);
        let img = to_rgb(&frame(PixelFormat::Nv12, 2, 2, data)).unwrap();
        assert!(img.as_raw().iter().all(|&c| c == 255));
    }

    #[test]
    fn short_buffer_is_a_shape_mismatch() {
        let err = to_rgb(&frame(PixelFormat::Rgb24, 2, 2, vec![0; 11])).unwrap_err();
        assert!(matches!(err, PreprocessError::ShapeMismatch(_)));
    }

    #[test]
    fn huge_announced_size_is_rejected_before_allocating() {
        let err = to_rgb(&frame(PixelFormat::Rgb24, 200_000, 200_000, vec![0; 3])).unwrap_err();
        assert!(matches!(err, PreprocessError::ShapeMismatch(_)));

        let err = to_rgb(&frame(PixelFormat::Nv12, 200_000, 200_000, vec![0; 6])).unwrap_err();
        assert!(matches!(err, PreprocessError::ShapeMismatch(_)));
    }

    #[test]
    fn overflowing_dimensions_are_a_shape_mismatch() {
        let f = frame(PixelFormat::Gray8, u32::MAX, u32::MAX, vec![0; 4]).with_stride(u32::MAX);
        assert!(matches!(to_rgb(&f), Err(PreprocessError::ShapeMismatch(_))));
    }

    #[test]
    fn odd_yuyv_width_is_a_shape_mismatch() {
        let err = to_rgb(&frame(PixelFormat::Yuyv4, 3, 1, vec![0; 6])).unwrap_err();
        assert!(matches!(err, PreprocessError::ShapeMismatch(_)));
    }

    #[test]
    fn garbage_jpeg_is_corrupt() {
        let err = to_rgb(&frame(PixelFormat::Mjpeg, 4, 4, vec![0xde, 0xad, 0xbe, 0xef])).unwrap_err();
        assert!(matches!(err, PreprocessError::Corrupt(_)));
    }

    #[test]
    fn unknown_fourcc_is_unsupported() {
        let f = frame(PixelFormat::from_fourcc(b"H264"), 2, 2, vec![0; 16]);
        assert!(matches!(to_rgb(&f), Err(PreprocessError::FormatUnsupported(_))));
    }
}
