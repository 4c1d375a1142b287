//! The single active video source and the `FrameSource` seam used by the scheduler.

use crate::error::CaptureError;
use crate::feed::{FeedTuning, RemoteCamera};
use crate::frame::Frame;
use crate::local::{CameraConstraints, LocalCamera};
use crate::remote::{self, RemoteEndpoint};
use async_trait::async_trait;
use reqwest::Url;
use std::time::Duration;

/// Anything that can hand out still frames on demand.
#[async_trait]
pub trait FrameSource: Send {
    async fn capture_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Nudge a stalled source back to life.
    async fn resume(&mut self) {}

    /// Release the underlying device or stream. Must be idempotent.
    async fn release(&mut self);
}

/// Whether frames from a local camera may leave the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityContext {
    Secure,
    Insecure(String),
}

impl SecurityContext {
    /// Secure when frames go to an HTTPS or loopback endpoint.
    pub fn for_endpoint(url: &Url) -> Self {
        let host = url
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']');
        let loopback = host.eq_ignore_ascii_case("localhost")
            || host
                .parse::<std::net::IpAddr>()
                .is_ok_and(|ip| ip.is_loopback());
        if url.scheme() == "https" || loopback {
            Self::Secure
        } else {
            Self::Insecure(format!("{} is neither HTTPS nor loopback", url))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

enum ActiveSource {
    Local(LocalCamera),
    Remote(RemoteCamera),
}

#[derive(Debug, Clone)]
enum Target {
    Local(CameraConstraints),
    Remote(RemoteEndpoint),
}

/// Exclusive owner of the one active camera.
///
/// Connecting a new source releases the previous one first. After
/// `release()` the session remembers its target and re-acquires it on the
/// next capture.
pub struct CaptureSession {
    client: reqwest::Client,
    tuning: FeedTuning,
    security: SecurityContext,
    retry: RetryPolicy,
    active: Option<ActiveSource>,
    target: Option<Target>,
}

impl CaptureSession {
    pub fn new(security: SecurityContext) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(remote::PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(client, security)
    }

    /// The client must not carry a total request timeout; MJPEG responses never end.
    pub fn with_client(client: reqwest::Client, security: SecurityContext) -> Self {
        Self {
            client,
            tuning: FeedTuning::default(),
            security,
            retry: RetryPolicy::default(),
            active: None,
            target: None,
        }
    }

    pub fn with_tuning(mut self, tuning: FeedTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Connect by a single string: a `/dev/...` path is a local device,
    /// anything else a remote camera address.
    pub async fn connect(&mut self, camera: &str) -> Result<(), CaptureError> {
        if camera.trim_start().starts_with("/dev/") {
            let constraints = CameraConstraints {
                device: camera.trim().to_string(),
                ..CameraConstraints::default()
            };
            self.connect_local(constraints).await
        } else {
            self.connect_remote(camera).await.map(|_| ())
        }
    }

    pub async fn connect_local(
        &mut self,
        constraints: CameraConstraints,
    ) -> Result<(), CaptureError> {
        if let SecurityContext::Insecure(reason) = &self.security {
            return Err(CaptureError::InsecureContext(reason.clone()));
        }
        self.shutdown_active().await;
        self.target = None;
        self.acquire(Target::Local(constraints)).await
    }

    pub async fn connect_remote(&mut self, address: &str) -> Result<RemoteEndpoint, CaptureError> {
        let endpoint = remote::resolve_remote(address)?;
        self.shutdown_active().await;
        self.target = None;
        let endpoint = remote::probe(&self.client, endpoint, self.tuning.probe_timeout).await?;
        self.acquire(Target::Remote(endpoint.clone())).await?;
        Ok(endpoint)
    }

    async fn acquire(&mut self, target: Target) -> Result<(), CaptureError> {
        let source = match &target {
            Target::Local(constraints) => {
                let constraints = constraints.clone();
                let camera = tokio::task::spawn_blocking(move || LocalCamera::open(&constraints))
                    .await
                    .map_err(|e| {
                        CaptureError::DeviceUnavailable(format!("camera open panicked: {e}"))
                    })??;
                ActiveSource::Local(camera)
            }
            Target::Remote(endpoint) => {
                let camera =
                    RemoteCamera::open(self.client.clone(), endpoint.clone(), self.tuning)?;
                camera.wait_for_frame(self.tuning.probe_timeout).await?;
                ActiveSource::Remote(camera)
            }
        };
        self.active = Some(source);
        self.target = Some(target);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// Human-readable name of the current target.
    pub fn describe(&self) -> Option<String> {
        self.target.as_ref().map(|t| match t {
            Target::Local(c) => c.device.clone(),
            Target::Remote(e) => match e.kind {
                Some(kind) => format!("{} ({kind})", e.url),
                None => e.url.to_string(),
            },
        })
    }

    async fn shutdown_active(&mut self) {
        match self.active.take() {
            Some(ActiveSource::Local(camera)) => camera.shutdown().await,
            Some(ActiveSource::Remote(camera)) => camera.release(),
            None => {}
        }
    }

    async fn grab(&mut self) -> Result<Frame, CaptureError> {
        match &self.active {
            Some(ActiveSource::Local(camera)) => camera.capture_frame().await,
            Some(ActiveSource::Remote(camera)) => camera.latest_frame(),
            None => Err(CaptureError::DeviceUnavailable("no camera connected".into())),
        }
    }
}

#[async_trait]
impl FrameSource for CaptureSession {
    /// Grab a frame, retrying `NoFrameAvailable` with exponential backoff.
    async fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.active.is_none() {
            let target = self.target.clone().ok_or_else(|| {
                CaptureError::DeviceUnavailable("no camera connected".into())
            })?;
            tracing::info!("re-acquiring released camera");
            self.acquire(target).await?;
        }

        let mut delay = self.retry.base_delay;
        let mut attempt = 1;
        loop {
            match self.grab().await {
                Err(CaptureError::NoFrameAvailable(reason)) if attempt < self.retry.attempts => {
                    tracing::debug!(attempt, reason = %reason, "no frame yet; retrying");
                    self.resume().await;
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn resume(&mut self) {
        if let Some(ActiveSource::Remote(camera)) = &self.active {
            camera.resume();
        }
    }

    async fn release(&mut self) {
        self.shutdown_active().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_jpeg;
    use axum::body::Body;
    use axum::extract::{RawQuery, State};
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    async fn snapshot_server(hits: Arc<AtomicUsize>) -> std::net::SocketAddr {
        let jpeg = sample_jpeg(16, 16);
        let app = Router::new().route(
            "/shot.jpg",
            get(move || {
                let jpeg = jpeg.clone();
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ([(header::CONTENT_TYPE, "image/jpeg")], jpeg)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    type Queries = Arc<Mutex<Vec<Option<String>>>>;

    /// MJPEG endpoint that sends one frame per connection and then goes quiet.
    async fn one_frame_then_stall(
        State((jpeg, queries)): State<(Bytes, Queries)>,
        RawQuery(query): RawQuery,
    ) -> impl IntoResponse {
        queries.lock().unwrap().push(query);
        let mut part = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        part.extend_from_slice(&jpeg);
        part.extend_from_slice(b"\r\n");
        let first =
            futures::stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(part)) });
        let stalled = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        (
            [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
            Body::from_stream(first.chain(stalled)),
        )
    }

    async fn stalling_mjpeg_server(queries: Queries) -> std::net::SocketAddr {
        let app = Router::new()
            .route("/videofeed", get(one_frame_then_stall))
            .with_state((sample_jpeg(16, 16), queries));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Frames go stale quickly; the watchdog itself checks too rarely to matter.
    fn stalling_tuning() -> FeedTuning {
        FeedTuning {
            probe_timeout: Duration::from_secs(2),
            mjpeg_stall: Duration::from_millis(200),
            watchdog_period: Duration::from_secs(60),
            ..FeedTuning::default()
        }
    }

    fn tuning() -> FeedTuning {
        FeedTuning {
            static_poll_interval: Duration::from_millis(50),
            static_stall: Duration::from_secs(2),
            ..FeedTuning::default()
        }
    }

    #[test]
    fn test_security_context() {
        let secure = |s: &str| SecurityContext::for_endpoint(&Url::parse(s).unwrap());
        assert_eq!(secure("https://api.example.com"), SecurityContext::Secure);
        assert_eq!(secure("http://localhost:8000"), SecurityContext::Secure);
        assert_eq!(secure("http://127.0.0.1:8000"), SecurityContext::Secure);
        assert_eq!(secure("http://[::1]:8000"), SecurityContext::Secure);
        assert!(matches!(
            secure("http://10.0.0.2:8000"),
            SecurityContext::Insecure(_)
        ));
    }

    #[tokio::test]
    async fn test_local_camera_refused_in_insecure_context() {
        let mut session = CaptureSession::new(SecurityContext::Insecure("plain http".into()));
        let err = session
            .connect_local(CameraConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::InsecureContext(_)));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_capture_without_connection() {
        let mut session = CaptureSession::new(SecurityContext::Secure);
        let err = session.capture_frame().await.unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
        session.release().await;
        session.release().await;
    }

    #[tokio::test]
    async fn test_remote_capture_release_and_reacquire() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = snapshot_server(hits.clone()).await;

        let mut session = CaptureSession::new(SecurityContext::Secure).with_tuning(tuning());
        session
            .connect(&format!("http://{addr}/shot.jpg"))
            .await
            .unwrap();
        assert!(session.describe().unwrap().contains("static-jpeg"));

        let frame = session.capture_frame().await.unwrap();
        assert_eq!((frame.width, frame.height), (16, 16));

        session.release().await;
        assert!(!session.is_connected());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), before, "feed kept polling after release");

        // Re-acquired transparently from the remembered target.
        let frame = session.capture_frame().await.unwrap();
        assert_eq!(frame.width, 16);
        assert!(session.is_connected());
        session.release().await;
    }

    #[tokio::test]
    async fn test_switching_sources_releases_previous() {
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let a = snapshot_server(hits_a.clone()).await;
        let b = snapshot_server(hits_b.clone()).await;

        let mut session = CaptureSession::new(SecurityContext::Secure).with_tuning(tuning());
        session.connect(&format!("http://{a}/shot.jpg")).await.unwrap();
        session.connect(&format!("http://{b}/shot.jpg")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let before = hits_a.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits_a.load(Ordering::SeqCst), before);
        assert!(hits_b.load(Ordering::SeqCst) > 0);
        session.release().await;
    }

    #[tokio::test]
    async fn test_rtsp_rejected_before_release() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = snapshot_server(hits).await;
        let mut session = CaptureSession::new(SecurityContext::Secure).with_tuning(tuning());
        session.connect(&format!("http://{addr}/shot.jpg")).await.unwrap();

        let err = session.connect("rtsp://10.0.0.1/stream").await.unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedProtocol(_)));
        assert!(session.is_connected(), "bad address must not drop the working camera");
        session.release().await;
    }

    #[tokio::test]
    async fn test_stale_frame_retried_after_resume() {
        let queries: Queries = Arc::new(Mutex::new(Vec::new()));
        let addr = stalling_mjpeg_server(queries.clone()).await;

        let mut session = CaptureSession::new(SecurityContext::Secure)
            .with_tuning(stalling_tuning())
            .with_retry(RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(100),
            });
        session.connect(&addr.to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        // The first attempt sees a stale frame, resumes the feed and retries.
        let frame = session.capture_frame().await.unwrap();
        assert_eq!((frame.width, frame.height), (16, 16));

        let seen = queries.lock().unwrap().clone();
        assert_eq!(seen.len(), 2, "expected one reconnect, saw {seen:?}");
        assert_eq!(seen[0], None);
        assert!(seen[1].as_deref().unwrap_or("").starts_with("_t="));
        session.release().await;
    }

    #[tokio::test]
    async fn test_single_attempt_surfaces_no_frame() {
        let queries: Queries = Arc::new(Mutex::new(Vec::new()));
        let addr = stalling_mjpeg_server(queries.clone()).await;

        let mut session = CaptureSession::new(SecurityContext::Secure)
            .with_tuning(stalling_tuning())
            .with_retry(RetryPolicy {
                attempts: 1,
                base_delay: Duration::from_millis(150),
            });
        session.connect(&addr.to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let err = session.capture_frame().await.unwrap_err();
        assert!(matches!(err, CaptureError::NoFrameAvailable(_)));
        assert_eq!(queries.lock().unwrap().len(), 1, "no retry means no resume");
        session.release().await;
    }
}
