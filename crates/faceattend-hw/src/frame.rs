//! Encoded frame type and pixel helpers.

use crate::error::CaptureError;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, ImageReader};
use std::io::Cursor;
use std::time::{Duration, Instant};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// A captured still, JPEG-encoded and ready for upload.
#[derive(Clone, Debug)]
pub struct Frame {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub sequence: u64,
}

impl Frame {
    /// Wrap an encoded JPEG, rejecting buffers whose header cannot be read.
    pub fn from_jpeg(jpeg: Bytes, sequence: u64) -> Result<Self, CaptureError> {
        let (width, height) = jpeg_dimensions(&jpeg)?;
        Ok(Self {
            jpeg,
            width,
            height,
            captured_at: Instant::now(),
            sequence,
        })
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

/// Read width and height from a JPEG header.
pub fn jpeg_dimensions(buf: &[u8]) -> Result<(u32, u32), CaptureError> {
    if !buf.starts_with(&JPEG_SOI) {
        return Err(CaptureError::NoFrameAvailable(
            "buffer is not a JPEG image".into(),
        ));
    }
    let (w, h) = ImageReader::with_format(Cursor::new(buf), ImageFormat::Jpeg)
        .into_dimensions()
        .map_err(|e| CaptureError::NoFrameAvailable(format!("undecodable JPEG: {e}")))?;
    if w == 0 || h == 0 {
        return Err(CaptureError::NoFrameAvailable("JPEG has zero size".into()));
    }
    Ok((w, h))
}

/// Encode packed RGB8 pixels as JPEG.
pub fn encode_rgb_jpeg(
    rgb: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Bytes, FrameError> {
    encode(rgb, width, height, quality, ExtendedColorType::Rgb8)
}

/// Encode 8-bit grayscale pixels as JPEG.
pub fn encode_gray_jpeg(
    gray: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Bytes, FrameError> {
    encode(gray, width, height, quality, ExtendedColorType::L8)
}

fn encode(
    pixels: &[u8],
    width: u32,
    height: u32,
    quality: u8,
    color: ExtendedColorType,
) -> Result<Bytes, FrameError> {
    let mut out = Vec::with_capacity(pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(pixels, width, height, color)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(Bytes::from(out))
}

/// Convert packed YUYV (4:2:2) to RGB8 using BT.601 integer coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for px in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Luma of a YUYV buffer (every even byte).
pub fn yuyv_luma(yuyv: &[u8]) -> impl Iterator<Item = u8> + '_ {
    yuyv.iter().step_by(2).copied()
}

/// True when more than `threshold_pct` of the samples fall below 32.
///
/// Freshly started sensors emit black frames until exposure settles.
pub fn is_dark_frame<I>(luma: I, threshold_pct: f32) -> bool
where
    I: IntoIterator<Item = u8>,
{
    let (mut total, mut dark) = (0usize, 0usize);
    for p in luma {
        total += 1;
        if p < 32 {
            dark += 1;
        }
    }
    if total == 0 {
        return true;
    }
    (dark as f32 / total as f32) > threshold_pct
}

/// Dark-frame check against an optional threshold. `None` accepts everything.
pub fn exceeds_dark_threshold<I>(luma: I, threshold: Option<f32>) -> bool
where
    I: IntoIterator<Item = u8>,
{
    threshold.is_some_and(|pct| is_dark_frame(luma, pct))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG encode failed: {0}")]
    Encode(String),
}
