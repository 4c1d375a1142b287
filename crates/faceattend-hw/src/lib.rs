//! faceattend-hw: Image capture from local and remote cameras.
//!
//! Local V4L2 devices are driven from a dedicated thread. Remote IP cameras
//! are resolved, probed and kept alive by a watchdog. `CaptureSession` owns
//! whichever one is active.

pub mod error;
pub mod feed;
pub mod frame;
pub mod local;
pub mod remote;
pub mod session;

pub use error::CaptureError;
pub use feed::{FeedTuning, MjpegParser, RemoteCamera};
pub use frame::Frame;
pub use local::{CameraConstraints, LocalCamera, PixelFormat};
pub use remote::{resolve_remote, RemoteEndpoint, StreamKind};
pub use session::{CaptureSession, FrameSource, RetryPolicy, SecurityContext};
