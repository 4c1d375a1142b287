//! Remote camera feeds.
//!
//! A feed task keeps the newest decodable JPEG of a remote camera in a
//! `watch` channel. A watchdog restarts the feed with a cache-busting query
//! parameter when frames stop arriving. Both tasks share one cancellation
//! token and stop together when the camera is released.

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::remote::{self, RemoteEndpoint, StreamKind};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Url;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const CACHE_BUST_PARAM: &str = "_t";
/// A single JPEG larger than this is treated as a corrupt stream.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Timing knobs for remote feeds.
#[derive(Debug, Clone, Copy)]
pub struct FeedTuning {
    pub probe_timeout: Duration,
    /// Per-request timeout for snapshot polling.
    pub request_timeout: Duration,
    pub static_poll_interval: Duration,
    /// No new frame for this long restarts a snapshot feed.
    pub static_stall: Duration,
    /// No new frame for this long restarts an MJPEG feed.
    pub mjpeg_stall: Duration,
    pub watchdog_period: Duration,
}

impl Default for FeedTuning {
    fn default() -> Self {
        Self {
            probe_timeout: remote::PROBE_TIMEOUT,
            request_timeout: Duration::from_secs(5),
            static_poll_interval: Duration::from_millis(500),
            static_stall: Duration::from_secs(4),
            mjpeg_stall: Duration::from_secs(10),
            watchdog_period: Duration::from_secs(1),
        }
    }
}

impl FeedTuning {
    pub fn stall_threshold(&self, kind: StreamKind) -> Duration {
        match kind {
            StreamKind::StaticJpeg => self.static_stall,
            StreamKind::Mjpeg | StreamKind::Hls => self.mjpeg_stall,
        }
    }
}

const SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];
const EOI: [u8; 2] = [0xFF, 0xD9];
/// Bytes kept while waiting for the next SOI, enough for a part header.
const MAX_HEADER_BYTES: usize = 4096;

/// Splits a multipart MJPEG byte stream into JPEG images.
///
/// A part's `Content-Length` header, when present, delimits the image; this
/// keeps embedded EXIF thumbnails intact. Without one the image ends at the
/// first EOI marker after its SOI.
#[derive(Debug)]
pub struct MjpegParser {
    buf: BytesMut,
    max_frame: usize,
}

impl MjpegParser {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
        }
    }

    /// Feed a chunk; returns every JPEG completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &SOI, 0) else {
                if self.buf.len() > MAX_HEADER_BYTES {
                    // Keep a possible partial marker.
                    let _ = self.buf.split_to(self.buf.len() - 2);
                }
                break;
            };
            let declared = content_length(&self.buf[..start])
                .filter(|&len| len >= SOI.len() && len <= self.max_frame);
            let end = match declared {
                Some(len) if self.buf.len() >= start + len => Some(start + len),
                Some(_) => None,
                None => find(&self.buf, &EOI, start + SOI.len()).map(|e| e + EOI.len()),
            };
            match end {
                Some(end) => {
                    let _ = self.buf.split_to(start);
                    frames.push(self.buf.split_to(end - start).freeze());
                }
                None => {
                    if self.buf.len() - start > self.max_frame {
                        tracing::warn!(bytes = self.buf.len(), "oversized MJPEG part discarded");
                        self.buf.clear();
                    }
                    break;
                }
            }
        }
        frames
    }
}

/// The last `Content-Length` value in a block of part headers.
fn content_length(headers: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(headers)
        .lines()
        .rev()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// `url` with a fresh `_t=<millis>` query parameter.
pub fn cache_busted(url: &Url) -> Url {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != CACHE_BUST_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut busted = url.clone();
    busted
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(CACHE_BUST_PARAM, &millis.to_string());
    busted
}

/// A connected remote camera.
pub struct RemoteCamera {
    endpoint: RemoteEndpoint,
    kind: StreamKind,
    stall_threshold: Duration,
    latest: watch::Receiver<Option<Frame>>,
    resume: Arc<Notify>,
    cancel: CancellationToken,
}

impl RemoteCamera {
    /// Resolve, probe, start the feed and wait for its first frame.
    pub async fn connect(
        client: reqwest::Client,
        address: &str,
        tuning: FeedTuning,
    ) -> Result<Self, CaptureError> {
        let endpoint = remote::resolve_remote(address)?;
        let endpoint = remote::probe(&client, endpoint, tuning.probe_timeout).await?;
        let camera = Self::open(client, endpoint, tuning)?;
        camera.wait_for_frame(tuning.probe_timeout).await?;
        Ok(camera)
    }

    /// Start feeding from an already classified endpoint.
    pub fn open(
        client: reqwest::Client,
        endpoint: RemoteEndpoint,
        tuning: FeedTuning,
    ) -> Result<Self, CaptureError> {
        let kind = endpoint.kind.ok_or_else(|| {
            CaptureError::UnsupportedProtocol(format!("{}: unknown stream type", endpoint.url))
        })?;
        if kind == StreamKind::Hls {
            return Err(CaptureError::UnsupportedProtocol(format!(
                "{}: HLS playback needs a video decoder; use the camera's MJPEG or snapshot URL",
                endpoint.url
            )));
        }

        let (tx, latest) = watch::channel(None);
        let resume = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        tokio::spawn(supervise(Supervisor {
            client,
            url: endpoint.url.clone(),
            kind,
            tuning,
            tx,
            resume: resume.clone(),
            cancel: cancel.clone(),
        }));

        tracing::info!(url = %endpoint.url, kind = %kind, "remote camera feed started");
        Ok(Self {
            endpoint,
            kind,
            stall_threshold: tuning.stall_threshold(kind),
            latest,
            resume,
            cancel,
        })
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The newest frame, unless the feed has not produced one recently.
    pub fn latest_frame(&self) -> Result<Frame, CaptureError> {
        match &*self.latest.borrow() {
            Some(frame) if frame.age() <= self.stall_threshold => Ok(frame.clone()),
            Some(frame) => Err(CaptureError::NoFrameAvailable(format!(
                "stream stalled for {}ms",
                frame.age().as_millis()
            ))),
            None => Err(CaptureError::NoFrameAvailable(
                "waiting for the first frame".into(),
            )),
        }
    }

    /// Wait until the feed has published at least one frame.
    pub async fn wait_for_frame(&self, timeout: Duration) -> Result<(), CaptureError> {
        let mut rx = self.latest.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CaptureError::DeviceUnavailable(format!(
                "{}: feed stopped",
                self.endpoint.url
            ))),
            Err(_) => Err(CaptureError::ConnectionTimeout(format!(
                "{}: no frame within {}s",
                self.endpoint.url,
                timeout.as_secs()
            ))),
        }
    }

    /// Ask the watchdog to restart the feed now instead of waiting for a stall.
    pub fn resume(&self) {
        self.resume.notify_one();
    }

    /// Stop the feed and watchdog. Idempotent.
    pub fn release(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(url = %self.endpoint.url, "remote camera released");
            self.cancel.cancel();
        }
    }
}

impl Drop for RemoteCamera {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    client: reqwest::Client,
    url: Url,
    kind: StreamKind,
    tuning: FeedTuning,
    tx: watch::Sender<Option<Frame>>,
    resume: Arc<Notify>,
    cancel: CancellationToken,
}

/// Liveness watchdog: owns the feed task and restarts it on stalls.
async fn supervise(sup: Supervisor) {
    let sequence = Arc::new(AtomicU64::new(0));
    let threshold = sup.tuning.stall_threshold(sup.kind);
    let mut restarts = 0u64;

    let mut feed_token = sup.cancel.child_token();
    spawn_feed(&sup, sup.url.clone(), feed_token.clone(), sequence.clone());
    let mut started_at = Instant::now();

    let mut check = tokio::time::interval(sup.tuning.watchdog_period);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let forced = tokio::select! {
            _ = sup.cancel.cancelled() => break,
            _ = sup.resume.notified() => true,
            _ = check.tick() => false,
        };

        if !forced {
            let last_frame = sup.tx.borrow().as_ref().map(|f| f.captured_at);
            let last_activity = last_frame.map_or(started_at, |t| t.max(started_at));
            if last_activity.elapsed() <= threshold {
                continue;
            }
        }

        restarts += 1;
        tracing::warn!(
            url = %sup.url,
            restarts,
            forced,
            "camera feed stalled; reconnecting"
        );
        feed_token.cancel();
        feed_token = sup.cancel.child_token();
        spawn_feed(&sup, cache_busted(&sup.url), feed_token.clone(), sequence.clone());
        started_at = Instant::now();
    }

    feed_token.cancel();
    tracing::debug!(url = %sup.url, "camera watchdog exiting");
}

fn spawn_feed(sup: &Supervisor, url: Url, token: CancellationToken, sequence: Arc<AtomicU64>) {
    let client = sup.client.clone();
    let tx = sup.tx.clone();
    match sup.kind {
        StreamKind::Mjpeg | StreamKind::Hls => {
            tokio::spawn(run_mjpeg_feed(client, url, tx, token, sequence));
        }
        StreamKind::StaticJpeg => {
            let tuning = sup.tuning;
            tokio::spawn(run_snapshot_feed(client, url, tx, token, sequence, tuning));
        }
    }
}

fn publish(tx: &watch::Sender<Option<Frame>>, jpeg: Bytes, sequence: &AtomicU64) {
    let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
    match Frame::from_jpeg(jpeg, seq) {
        Ok(frame) => {
            tx.send_replace(Some(frame));
        }
        Err(e) => tracing::trace!(error = %e, "dropping undecodable frame"),
    }
}

async fn run_mjpeg_feed(
    client: reqwest::Client,
    url: Url,
    tx: watch::Sender<Option<Frame>>,
    token: CancellationToken,
    sequence: Arc<AtomicU64>,
) {
    let resp = tokio::select! {
        _ = token.cancelled() => return,
        resp = client.get(url.clone()).send() => resp,
    };
    let resp = match resp {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            tracing::warn!(url = %url, status = %r.status(), "MJPEG request rejected");
            return;
        }
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "MJPEG request failed");
            return;
        }
    };

    let mut body = resp.bytes_stream();
    let mut parser = MjpegParser::new(MAX_FRAME_BYTES);
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return,
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for jpeg in parser.push(&bytes) {
                    publish(&tx, jpeg, &sequence);
                }
            }
            Some(Err(e)) => {
                tracing::warn!(url = %url, error = %e, "MJPEG stream error");
                return;
            }
            None => {
                tracing::debug!(url = %url, "MJPEG stream ended");
                return;
            }
        }
    }
}

async fn run_snapshot_feed(
    client: reqwest::Client,
    url: Url,
    tx: watch::Sender<Option<Frame>>,
    token: CancellationToken,
    sequence: Arc<AtomicU64>,
    tuning: FeedTuning,
) {
    let mut ticker = tokio::time::interval(tuning.static_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let fetch = fetch_snapshot(&client, cache_busted(&url), tuning.request_timeout);
        let result = tokio::select! {
            _ = token.cancelled() => return,
            r = fetch => r,
        };
        match result {
            Ok(jpeg) => publish(&tx, jpeg, &sequence),
            Err(e) => tracing::debug!(url = %url, error = %e, "snapshot fetch failed"),
        }
    }
}

async fn fetch_snapshot(
    client: &reqwest::Client,
    url: Url,
    timeout: Duration,
) -> Result<Bytes, reqwest::Error> {
    client
        .get(url)
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await
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
    use std::sync::Mutex;

    #[test]
    fn test_parser_splits_multipart_stream() {
        let a = sample_jpeg(8, 8);
        let b = sample_jpeg(16, 8);
        let mut stream = Vec::new();
        for jpeg in [&a, &b] {
            stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            stream.extend_from_slice(jpeg);
            stream.extend_from_slice(b"\r\n");
        }

        let mut parser = MjpegParser::new(MAX_FRAME_BYTES);
        let mut frames = Vec::new();
        for chunk in stream.chunks(7) {
            frames.extend(parser.push(chunk));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], a);
        assert_eq!(frames[1], b);
    }

    #[test]
    fn test_parser_discards_oversized_part() {
        let mut junk = vec![0xFF, 0xD8, 0xFF];
        junk.extend(vec![0u8; 64]);
        let jpeg = sample_jpeg(8, 8);

        // The unterminated part is dropped, so it cannot swallow the next image.
        let mut parser = MjpegParser::new(16);
        assert!(parser.push(&junk).is_empty());
        assert_eq!(parser.push(&jpeg), vec![jpeg]);
    }

    /// `base` with an APP1 segment carrying `thumb` inserted after its SOI.
    fn with_exif_thumbnail(base: &[u8], thumb: &[u8]) -> Vec<u8> {
        let mut app1 = b"Exif\0\0".to_vec();
        app1.extend_from_slice(thumb);
        let len = (app1.len() + 2) as u16;
        let mut out = base[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&app1);
        out.extend_from_slice(&base[2..]);
        out
    }

    #[test]
    fn test_parser_uses_content_length_over_markers() {
        let jpeg = with_exif_thumbnail(&sample_jpeg(16, 16), &sample_jpeg(4, 4));
        let next = sample_jpeg(8, 8);
        let mut stream = Vec::new();
        for part in [&jpeg[..], &next[..]] {
            stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n");
            let length = format!("Content-Length: {}\r\n\r\n", part.len());
            stream.extend_from_slice(length.as_bytes());
            stream.extend_from_slice(part);
            stream.extend_from_slice(b"\r\n");
        }

        let mut parser = MjpegParser::new(MAX_FRAME_BYTES);
        let mut frames = Vec::new();
        for chunk in stream.chunks(5) {
            frames.extend(parser.push(chunk));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &jpeg[..]);
        assert_eq!(frames[1], next);
    }

    #[test]
    fn test_content_length_header_lookup() {
        assert_eq!(content_length(b"--b\r\ncontent-length:  42\r\n\r\n"), Some(42));
        assert_eq!(content_length(b"--b\r\nContent-Type: image/jpeg\r\n\r\n"), None);
        assert_eq!(content_length(b"Content-Length: nope\r\n"), None);
    }

    #[test]
    fn test_parser_ignores_leading_noise() {
        let jpeg = sample_jpeg(8, 8);
        let mut data = b"garbage before".to_vec();
        data.extend_from_slice(&jpeg);
        let mut parser = MjpegParser::new(MAX_FRAME_BYTES);
        assert_eq!(parser.push(&data), vec![jpeg]);
    }

    #[test]
    fn test_cache_busted_replaces_param() {
        let url = Url::parse("http://cam/shot.jpg?res=hi&_t=1").unwrap();
        let busted = cache_busted(&url);
        let pairs: Vec<_> = busted.query_pairs().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "res");
        assert_eq!(pairs[1].0, "_t");
        assert_ne!(pairs[1].1, "1");
    }

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn fast_tuning() -> FeedTuning {
        FeedTuning {
            probe_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(1),
            static_poll_interval: Duration::from_millis(50),
            static_stall: Duration::from_millis(300),
            mjpeg_stall: Duration::from_millis(300),
            watchdog_period: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_snapshot_feed_publishes_frames() {
        let jpeg = sample_jpeg(24, 12);
        let app = Router::new().route(
            "/shot.jpg",
            get(move || {
                let jpeg = jpeg.clone();
                async move { ([(header::CONTENT_TYPE, "image/jpeg")], jpeg) }
            }),
        );
        let addr = serve(app).await;

        let camera = RemoteCamera::connect(
            reqwest::Client::new(),
            &format!("http://{addr}/shot.jpg"),
            fast_tuning(),
        )
        .await
        .unwrap();
        assert_eq!(camera.kind(), StreamKind::StaticJpeg);

        let frame = camera.latest_frame().unwrap();
        assert_eq!((frame.width, frame.height), (24, 12));
        camera.release();
        camera.release();
    }

    type Queries = Arc<Mutex<Vec<Option<String>>>>;

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

    #[tokio::test]
    async fn test_watchdog_reconnects_stalled_mjpeg_with_cache_buster() {
        let queries: Queries = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/videofeed", get(one_frame_then_stall))
            .with_state((sample_jpeg(8, 8), queries.clone()));
        let addr = serve(app).await;

        let camera = RemoteCamera::connect(
            reqwest::Client::new(),
            &format!("{addr}"),
            fast_tuning(),
        )
        .await
        .unwrap();
        assert!(camera.latest_frame().is_ok());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let seen = queries.lock().unwrap().clone();
        assert!(seen.len() >= 2, "expected a reconnect, saw {seen:?}");
        assert_eq!(seen[0], None);
        assert!(seen[1].as_deref().unwrap_or("").starts_with("_t="));
        camera.release();
    }

    #[tokio::test]
    async fn test_hls_is_classified_but_not_opened() {
        let endpoint = remote::resolve_remote("http://cam/live.m3u8").unwrap();
        assert_eq!(endpoint.kind, Some(StreamKind::Hls));
        let err = RemoteCamera::open(reqwest::Client::new(), endpoint, FeedTuning::default())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::UnsupportedProtocol(_)));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_frames() {
        let app = Router::new().route(
            "/videofeed",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
                    Body::from_stream(futures::stream::pending::<Result<Bytes, std::io::Error>>()),
                )
            }),
        );
        let addr = serve(app).await;
        let tuning = FeedTuning {
            probe_timeout: Duration::from_millis(200),
            ..fast_tuning()
        };
        let err = RemoteCamera::connect(reqwest::Client::new(), &addr.to_string(), tuning)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::ConnectionTimeout(_)));
    }
}
