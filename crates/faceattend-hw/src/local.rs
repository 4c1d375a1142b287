//! V4L2 camera capture via the `v4l` crate.
//!
//! The device is owned by a dedicated OS thread; async callers talk to it
//! through a channel. Dropping the handle ends the thread and closes the
//! device.

use crate::error::CaptureError;
use crate::frame::{self, Frame};
use bytes::Bytes;
use std::io;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const EBUSY: i32 = 16;
const ENODEV: i32 = 19;

/// Upper bound on raw buffers dequeued per capture while skipping dark frames.
const MAX_DARK_SKIP: usize = 3;

/// Requested properties for a local camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConstraints {
    /// V4L2 device path (e.g. /dev/video0).
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    /// Frames discarded after opening while auto-exposure settles.
    pub warmup_frames: usize,
    /// Skip raw frames whose share of near-black pixels exceeds this
    /// fraction. Off by default; useful for IR sensors that blink dark.
    pub dark_threshold: Option<f32>,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            jpeg_quality: 85,
            warmup_frames: 4,
            dark_threshold: None,
        }
    }
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion JPEG; buffers are passed through untouched.
    Mjpeg,
    /// YUYV 4:2:2 packed, converted to RGB before encoding.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

struct CaptureRequest {
    reply: oneshot::Sender<Result<Frame, CaptureError>>,
}

/// Handle to a V4L2 camera running on its own thread.
pub struct LocalCamera {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    tx: Option<mpsc::Sender<CaptureRequest>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl LocalCamera {
    /// Open the device, negotiate a format and start the capture thread.
    ///
    /// Blocking; call from `spawn_blocking` in async contexts.
    pub fn open(constraints: &CameraConstraints) -> Result<Self, CaptureError> {
        let path = constraints.device.as_str();
        if !Path::new(path).exists() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{path}: no such device"
            )));
        }

        let device = Device::with_path(path).map_err(|e| open_error(path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CaptureError::DeviceUnavailable(format!("{path}: failed to query capabilities: {e}"))
        })?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{path}: not a video capture device"
            )));
        }
        tracing::info!(device = path, driver = %caps.driver, card = %caps.card, "opened camera");

        let (width, height, format) = negotiate(&device, constraints)?;
        tracing::info!(width, height, format = ?format, "negotiated format");

        let worker = Worker {
            device,
            width,
            height,
            format,
            quality: constraints.jpeg_quality,
            dark_threshold: constraints.dark_threshold,
            sequence: 0,
        };
        let warmup = constraints.warmup_frames;
        let (tx, mut rx) = mpsc::channel::<CaptureRequest>(2);

        let thread = std::thread::Builder::new()
            .name("faceattend-camera".into())
            .spawn(move || {
                let mut worker = worker;
                worker.discard(warmup);
                while let Some(req) = rx.blocking_recv() {
                    let _ = req.reply.send(worker.capture());
                }
                tracing::debug!("camera thread exiting");
            })
            .map_err(|e| {
                CaptureError::DeviceUnavailable(format!("failed to spawn camera thread: {e}"))
            })?;

        Ok(Self {
            device_path: path.to_string(),
            width,
            height,
            format,
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Grab and encode one frame.
    pub async fn capture_frame(&self) -> Result<Frame, CaptureError> {
        let closed = || CaptureError::DeviceUnavailable("camera released".into());
        let tx = self.tx.as_ref().ok_or_else(closed)?;
        let (reply, rx) = oneshot::channel();
        tx.send(CaptureRequest { reply })
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    /// Stop the capture thread and wait until the device is closed.
    pub async fn shutdown(mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        tracing::debug!(device = %self.device_path, "camera released");
    }
}

fn open_error(path: &str, e: io::Error) -> CaptureError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        CaptureError::PermissionDenied(format!("{path}: {e}"))
    } else if e.raw_os_error() == Some(EBUSY) {
        CaptureError::DeviceUnavailable(format!("{path}: device busy"))
    } else {
        CaptureError::DeviceUnavailable(format!("{path}: {e}"))
    }
}

/// Try MJPEG first (no re-encode), then YUYV, then GREY.
fn negotiate(
    device: &Device,
    constraints: &CameraConstraints,
) -> Result<(u32, u32, PixelFormat), CaptureError> {
    let candidates = [
        (FourCC::new(b"MJPG"), PixelFormat::Mjpeg),
        (FourCC::new(b"YUYV"), PixelFormat::Yuyv),
        (FourCC::new(b"GREY"), PixelFormat::Grey),
    ];

    for (fourcc, format) in candidates {
        let mut fmt = device.format().map_err(|e| {
            CaptureError::DeviceUnavailable(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = fourcc;
        fmt.width = constraints.width;
        fmt.height = constraints.height;

        match device.set_format(&fmt) {
            Ok(negotiated) if negotiated.fourcc == fourcc => {
                return Ok((negotiated.width, negotiated.height, format));
            }
            Ok(negotiated) => {
                tracing::debug!(requested = ?fourcc, got = ?negotiated.fourcc, "format rejected");
            }
            Err(e) => {
                tracing::debug!(requested = ?fourcc, error = %e, "set_format failed");
            }
        }
    }

    Err(CaptureError::DeviceUnavailable(
        "no supported pixel format (need MJPG, YUYV or GREY)".into(),
    ))
}

struct Worker {
    device: Device,
    width: u32,
    height: u32,
    format: PixelFormat,
    quality: u8,
    dark_threshold: Option<f32>,
    sequence: u64,
}

impl Worker {
    fn discard(&self, count: usize) {
        if count == 0 {
            return;
        }
        tracing::debug!(count, "discarding warmup frames");
        let Ok(mut stream) = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
        else {
            return;
        };
        for _ in 0..count {
            if stream.next().is_err() {
                break;
            }
        }
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(stream_error)?;

        for _ in 0..MAX_DARK_SKIP {
            let (buf, meta) = stream.next().map_err(stream_error)?;
            let used = (meta.bytesused as usize).min(buf.len());
            let data = if used > 0 { &buf[..used] } else { buf };

            match self.encode(data)? {
                Some(jpeg) => {
                    self.sequence += 1;
                    return Frame::from_jpeg(jpeg, self.sequence);
                }
                None => tracing::debug!(seq = meta.sequence, "skipping dark frame"),
            }
        }

        Err(CaptureError::NoFrameAvailable(
            "camera produced only dark frames".into(),
        ))
    }

    /// JPEG for `data`, or `None` when the frame is too dark to be useful.
    fn encode(&self, data: &[u8]) -> Result<Option<Bytes>, CaptureError> {
        let encode_err = |e: frame::FrameError| CaptureError::NoFrameAvailable(e.to_string());
        match self.format {
            PixelFormat::Mjpeg => Ok(Some(Bytes::copy_from_slice(data))),
            PixelFormat::Yuyv => {
                if frame::exceeds_dark_threshold(frame::yuyv_luma(data), self.dark_threshold) {
                    return Ok(None);
                }
                let rgb = frame::yuyv_to_rgb(data, self.width, self.height).map_err(encode_err)?;
                frame::encode_rgb_jpeg(&rgb, self.width, self.height, self.quality)
                    .map(Some)
                    .map_err(encode_err)
            }
            PixelFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                if data.len() < pixels {
                    return Err(CaptureError::NoFrameAvailable(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        data.len()
                    )));
                }
                let gray = &data[..pixels];
                if frame::exceeds_dark_threshold(gray.iter().copied(), self.dark_threshold) {
                    return Ok(None);
                }
                frame::encode_gray_jpeg(gray, self.width, self.height, self.quality)
                    .map(Some)
                    .map_err(encode_err)
            }
        }
    }
}

fn stream_error(e: io::Error) -> CaptureError {
    if e.raw_os_error() == Some(ENODEV) {
        CaptureError::DeviceUnavailable(format!("camera disconnected: {e}"))
    } else {
        CaptureError::NoFrameAvailable(format!("failed to dequeue buffer: {e}"))
    }
}
