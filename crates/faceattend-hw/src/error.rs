use thiserror::Error;

/// Failures while acquiring a video source or pulling a frame from it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("insecure context: {0}")]
    InsecureContext(String),
    #[error("unsupported stream protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("camera connection timed out: {0}")]
    ConnectionTimeout(String),
    #[error("invalid camera address: {0}")]
    InvalidUrl(String),
    #[error("no frame available: {0}")]
    NoFrameAvailable(String),
}

impl CaptureError {
    /// Errors that end a capture loop. Everything else is worth retrying.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ConnectionTimeout(_) | Self::NoFrameAvailable(_)
        )
    }

    /// Short actionable hint for the operator.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::DeviceUnavailable(_) => {
                "No camera found, or it is in use by another application. Check the device path or camera address."
            }
            Self::PermissionDenied(_) => {
                "Camera access denied. Add your user to the 'video' group or fix the device permissions."
            }
            Self::InsecureContext(_) => {
                "Local camera frames can only be sent over HTTPS. Enable HTTPS on the API or use a loopback address."
            }
            Self::UnsupportedProtocol(_) => {
                "This stream type cannot be read directly. Use an HTTP MJPEG (/videofeed) or snapshot (/shot.jpg) URL instead."
            }
            Self::ConnectionTimeout(_) => {
                "The camera did not respond. Check the IP and port, and that the camera is on the same network."
            }
            Self::InvalidUrl(_) => {
                "Invalid camera address. Use an IP, IP:port, or a full http(s) URL."
            }
            Self::NoFrameAvailable(_) => {
                "The camera has not produced a frame yet. Wait for the stream to start and try again."
            }
        }
    }
}
