//! Image transform engine
//!
//! Decodes an origin image, shrinks it to a target width (never enlarging)
//! and re-encodes it as lossy WebP. Animated inputs are returned untouched:
//! resizing would flatten them to their first frame.
//!
//! Everything here is CPU-bound; async callers go through
//! [`transform_blocking`], which runs on the blocking pool.

use std::io::Cursor;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Limits};
use thiserror::Error;

/// Content type of every transformed variant.
pub const OUTPUT_CONTENT_TYPE: &str = "image/webp";

/// Largest width or height we agree to decode (decompression bomb guard).
pub const MAX_DECODE_DIMENSION: u32 = 16384;

/// Largest width or height a WebP bitstream can carry.
pub const WEBP_MAX_DIMENSION: u32 = 16383;

#[derive(Error, Debug, Clone)]
pub enum TransformError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("transform task failed: {0}")]
    Task(String),
}

/// Resize parameters, already clamped by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformParams {
    pub width: u32,
    pub quality: u8,
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Bytes,
    pub content_type: String,
    /// False when the input was passed through unchanged (animated formats)
    pub transformed: bool,
}

/// Transform `input` according to `params`.
pub fn transform(
    input: &Bytes,
    content_type: &str,
    params: TransformParams,
) -> Result<TransformOutput, TransformError> {
    if is_animated(content_type, input) {
        return Ok(TransformOutput {
            bytes: input.clone(),
            content_type: content_type.to_string(),
            transformed: false,
        });
    }

    let img = decode(input)?;
    let (dst_w, dst_h) = target_dimensions(img.width(), img.height(), params.width);
    let (dst_w, dst_h) = fit_within(dst_w, dst_h, WEBP_MAX_DIMENSION);
    let resized = if (dst_w, dst_h) != (img.width(), img.height()) {
        img.resize_exact(dst_w, dst_h, FilterType::Lanczos3)
    } else {
        img
    };

    let bytes = encode_webp(&resized, params.quality)?;
    Ok(TransformOutput {
        bytes,
        content_type: OUTPUT_CONTENT_TYPE.to_string(),
        transformed: true,
    })
}

/// Run [`transform`] on the blocking thread pool.
pub async fn transform_blocking(
    input: Bytes,
    content_type: String,
    params: TransformParams,
) -> Result<TransformOutput, TransformError> {
    tokio::task::spawn_blocking(move || transform(&input, &content_type, params))
        .await
        .map_err(|e| TransformError::Task(e.to_string()))?
}

/// Output size for a width-bounded resize that preserves aspect ratio and
/// never enlarges. Both sides are at least 1px.
pub fn target_dimensions(src_w: u32, src_h: u32, target_w: u32) -> (u32, u32) {
    if src_w == 0 || src_h == 0 || target_w >= src_w {
        return (src_w, src_h);
    }
    let scale = target_w as f64 / src_w as f64;
    let new_h = (src_h as f64 * scale).round() as u32;
    (target_w.max(1), new_h.max(1))
}

/// Scale `(w, h)` down proportionally until neither side exceeds `max`.
pub fn fit_within(w: u32, h: u32, max: u32) -> (u32, u32) {
    if w <= max && h <= max {
        return (w, h);
    }
    let scale = (max as f64 / w as f64).min(max as f64 / h as f64);
    let fit = |side: u32| ((side as f64 * scale).round() as u32).clamp(1, max);
    (fit(w), fit(h))
}

/// Whether the payload is an animated image format that must not be resized.
pub fn is_animated(content_type: &str, bytes: &[u8]) -> bool {
    let mime = base_mime(content_type);
    if mime == "image/gif" || mime == "image/apng" {
        return true;
    }
    bytes.starts_with(b"GIF8") || is_animated_png(bytes) || is_animated_webp(bytes)
}

/// MIME type guessed from magic bytes.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|f| f.to_mime_type())
}

/// Lowercased MIME type without parameters.
pub fn base_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn decode(input: &[u8]) -> Result<DynamicImage, TransformError> {
    let mut reader = ImageReader::new(Cursor::new(input))
        .with_guessed_format()
        .map_err(|e| TransformError::Decode(e.to_string()))?;

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DECODE_DIMENSION);
    limits.max_image_height = Some(MAX_DECODE_DIMENSION);
    reader.limits(limits);

    reader
        .decode()
        .map_err(|e| TransformError::Decode(e.to_string()))
}

fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Bytes, TransformError> {
    let (w, h) = (img.width(), img.height());
    let quality = quality as f32;

    let encoded = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), w, h).encode_simple(false, quality)
    } else {
        let rgb = img.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), w, h).encode_simple(false, quality)
    }
    .map_err(|e| TransformError::Encode(format!("{:?}", e)))?;

    Ok(Bytes::copy_from_slice(&encoded))
}

/// APNG carries an `acTL` chunk before the first `IDAT`.
fn is_animated_png(bytes: &[u8]) -> bool {
    const SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
    if !bytes.starts_with(SIGNATURE) {
        return false;
    }

    let mut offset = SIGNATURE.len();
    while offset + 8 <= bytes.len() {
        let len = u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        match &bytes[offset + 4..offset + 8] {
            b"acTL" => return true,
            b"IDAT" | b"IEND" => return false,
            _ => {}
        }
        offset = match offset.checked_add(12).and_then(|o| o.checked_add(len)) {
            Some(next) => next,
            None => return false,
        };
    }
    false
}

/// Extended WebP (`VP8X`) with the animation flag set.
fn is_animated_webp(bytes: &[u8]) -> bool {
    bytes.len() >= 21
        && &bytes[0..4] == b"RIFF"
        && &bytes[8..12] == b"WEBP"
        && &bytes[12..16] == b"VP8X"
        && bytes[20] & 0x02 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage, RgbaImage};

    fn png(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 40, 40])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        Bytes::from(buf.into_inner())
    }

    fn gif(width: u32, height: u32) -> Bytes {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Gif).unwrap();
        Bytes::from(buf.into_inner())
    }

    fn decoded_dimensions(bytes: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(bytes).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn test_target_dimensions_downscale() {
        assert_eq!(target_dimensions(1000, 500, 400), (400, 200));
        assert_eq!(target_dimensions(1920, 1080, 800), (800, 450));
    }

    #[test]
    fn test_target_dimensions_never_upscale() {
        assert_eq!(target_dimensions(100, 50, 200), (100, 50));
        assert_eq!(target_dimensions(100, 50, 100), (100, 50));
        for target in [101, 500, 4096, u32::MAX] {
            let (w, h) = target_dimensions(100, 80, target);
            assert!(w <= 100 && h <= 80);
        }
    }

    #[test]
    fn test_target_dimensions_minimum_one_pixel() {
        assert_eq!(target_dimensions(10_000, 10, 1), (1, 1));
    }

    #[test]
    fn test_fit_within() {
        assert_eq!(fit_within(800, 400, WEBP_MAX_DIMENSION), (800, 400));
        assert_eq!(fit_within(4, 16384, WEBP_MAX_DIMENSION), (4, 16383));
        assert_eq!(fit_within(16384, 16384, WEBP_MAX_DIMENSION), (16383, 16383));
        assert_eq!(fit_within(1, 40000, 100), (1, 100));
    }

    #[test]
    fn test_transform_tall_image_fits_webp_limit() {
        let input = png(4, MAX_DECODE_DIMENSION);
        let params = TransformParams {
            width: 800,
            quality: 80,
        };
        let output = transform(&input, "image/png", params).unwrap();
        assert!(output.transformed);
        let (w, h) = decoded_dimensions(&output.bytes);
        assert_eq!(h, WEBP_MAX_DIMENSION);
        assert!((1..=4).contains(&w));
    }

    #[test]
    fn test_transform_resizes_to_webp() {
        let input = png(1000, 500);
        let out = transform(&input, "image/png", TransformParams { width: 400, quality: 80 }).unwrap();

        assert!(out.transformed);
        assert_eq!(out.content_type, OUTPUT_CONTENT_TYPE);
        assert_eq!(&out.bytes[0..4], b"RIFF");
        assert_eq!(&out.bytes[8..12], b"WEBP");
        assert_eq!(decoded_dimensions(&out.bytes), (400, 200));
    }

    #[test]
    fn test_transform_small_image_not_enlarged() {
        let input = png(120, 90);
        let out = transform(&input, "image/png", TransformParams { width: 800, quality: 75 }).unwrap();

        assert!(out.transformed);
        assert_eq!(decoded_dimensions(&out.bytes), (120, 90));
    }

    #[test]
    fn test_transform_gif_bypassed() {
        let input = gif(64, 64);
        let out = transform(&input, "image/gif", TransformParams { width: 32, quality: 80 }).unwrap();

        assert!(!out.transformed);
        assert_eq!(out.bytes, input);
        assert_eq!(out.content_type, "image/gif");
    }

    #[test]
    fn test_transform_bypass_keeps_bytes_for_any_animated_type() {
        let payload = Bytes::from_static(b"not really an image");
        for ct in ["image/gif", "IMAGE/GIF; charset=binary", "image/apng"] {
            let out = transform(&payload, ct, TransformParams { width: 10, quality: 50 }).unwrap();
            assert!(!out.transformed);
            assert_eq!(out.bytes, payload);
            assert_eq!(out.content_type, ct);
        }
    }

    #[test]
    fn test_transform_garbage_is_decode_error() {
        let input = Bytes::from_static(b"definitely not pixels");
        let err = transform(&input, "image/png", TransformParams { width: 100, quality: 80 })
            .unwrap_err();
        assert!(matches!(err, TransformError::Decode(_)));
    }

    #[test]
    fn test_is_animated_sniffs_gif_bytes() {
        let input = gif(8, 8);
        assert!(is_animated("application/octet-stream", &input));
        assert!(!is_animated("image/png", &png(8, 8)));
    }

    #[test]
    fn test_is_animated_png() {
        let mut apng = b"\x89PNG\r\n\x1a\n".to_vec();
        // IHDR (13 bytes of data)
        apng.extend_from_slice(&13u32.to_be_bytes());
        apng.extend_from_slice(b"IHDR");
        apng.extend_from_slice(&[0u8; 13]);
        apng.extend_from_slice(&[0u8; 4]);
        // acTL (8 bytes of data)
        apng.extend_from_slice(&8u32.to_be_bytes());
        apng.extend_from_slice(b"acTL");
        apng.extend_from_slice(&[0u8; 8]);
        apng.extend_from_slice(&[0u8; 4]);

        assert!(is_animated_png(&apng));
        assert!(!is_animated_png(&png(4, 4)));
        assert!(!is_animated_png(b"\x89PNG\r\n\x1a\n\xff\xff\xff\xff"));
    }

    #[test]
    fn test_is_animated_webp_flag() {
        let mut header = Vec::new();
        header.extend_from_slice(b"RIFF");
        header.extend_from_slice(&[0u8; 4]);
        header.extend_from_slice(b"WEBP");
        header.extend_from_slice(b"VP8X");
        header.extend_from_slice(&[10, 0, 0, 0]);
        header.push(0x02);
        assert!(is_animated_webp(&header));

        header[20] = 0x10;
        assert!(!is_animated_webp(&header));
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(&png(2, 2)), Some("image/png"));
        assert_eq!(sniff_content_type(&gif(2, 2)), Some("image/gif"));
        assert_eq!(sniff_content_type(b"<html>"), None);
    }

    #[test]
    fn test_base_mime() {
        assert_eq!(base_mime("Image/JPEG; q=0.9"), "image/jpeg");
        assert_eq!(base_mime(""), "");
    }

    #[tokio::test]
    async fn test_transform_blocking() {
        let out = transform_blocking(
            png(300, 300),
            "image/png".to_string(),
            TransformParams { width: 150, quality: 60 },
        )
        .await
        .unwrap();
        assert_eq!(decoded_dimensions(&out.bytes), (150, 150));
    }
}
