//! Remote IP-camera addressing: normalization, stream classification and probing.

use crate::error::CaptureError;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use std::fmt;
use std::time::Duration;

/// Default port of Android "IP Webcam"-style apps.
pub const DEFAULT_CAMERA_PORT: u16 = 8080;
/// MJPEG path served by those apps.
pub const DEFAULT_STREAM_PATH: &str = "/videofeed";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Paths tried, in order, when a URL points at a camera's root.
const KNOWN_PATHS: [&str; 5] = ["/videofeed", "/video", "/mjpeg", "/shot.jpg", "/snapshot.jpg"];

const UNSUPPORTED_SCHEMES: [&str; 9] = [
    "rtsp", "rtsps", "rtmp", "rtmps", "rtp", "udp", "srt", "mms", "webrtc",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `multipart/x-mixed-replace` JPEG stream.
    Mjpeg,
    /// HTTP Live Streaming playlist.
    Hls,
    /// Single JPEG per request.
    StaticJpeg,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mjpeg => "mjpeg",
            Self::Hls => "hls",
            Self::StaticJpeg => "static-jpeg",
        })
    }
}

/// A concrete fetchable camera endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub url: Url,
    /// `None` until the URL shape or a probe tells us what it serves.
    pub kind: Option<StreamKind>,
}

/// Normalize a user-supplied camera address without touching the network.
///
/// Accepts a bare IP or host (`192.168.1.10`), `host:port`, or a full
/// http(s) URL. Shorthand forms resolve straight to the MJPEG feed of a
/// camera app.
pub fn resolve_remote(address: &str) -> Result<RemoteEndpoint, CaptureError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(CaptureError::InvalidUrl("empty address".into()));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(CaptureError::InvalidUrl(format!("{trimmed}: contains whitespace")));
    }

    if let Some((scheme, _)) = trimmed.split_once("://") {
        let scheme = scheme.to_ascii_lowercase();
        return match scheme.as_str() {
            "http" | "https" => {
                let url = parse_http(trimmed)?;
                let kind = classify_url(&url);
                Ok(RemoteEndpoint { url, kind })
            }
            s if UNSUPPORTED_SCHEMES.contains(&s) => Err(CaptureError::UnsupportedProtocol(
                format!("{s}:// streams cannot be read over HTTP; expose an MJPEG or snapshot URL"),
            )),
            s => Err(CaptureError::InvalidUrl(format!("unknown scheme {s}://"))),
        };
    }

    if trimmed.contains('/') {
        let url = parse_http(&format!("http://{trimmed}"))?;
        let kind = classify_url(&url);
        return Ok(RemoteEndpoint { url, kind });
    }

    // `host` or `host:port` shorthand.
    let has_port = match trimmed.strip_prefix('[') {
        Some(v6) => v6.contains("]:"),
        None => trimmed.contains(':'),
    };
    let mut url = parse_http(&format!("http://{trimmed}"))?;
    if !has_port {
        url.set_port(Some(DEFAULT_CAMERA_PORT))
            .map_err(|_| CaptureError::InvalidUrl(trimmed.to_string()))?;
    }
    url.set_path(DEFAULT_STREAM_PATH);
    Ok(RemoteEndpoint {
        url,
        kind: Some(StreamKind::Mjpeg),
    })
}

fn parse_http(raw: &str) -> Result<Url, CaptureError> {
    let url = Url::parse(raw).map_err(|e| CaptureError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.host_str() {
        Some(h) if !h.is_empty() => Ok(url),
        _ => Err(CaptureError::InvalidUrl(format!("{raw}: missing host"))),
    }
}

/// Guess the stream type from the URL alone.
pub fn classify_url(url: &Url) -> Option<StreamKind> {
    let path = url.path().to_ascii_lowercase();
    let query = url.query().unwrap_or("").to_ascii_lowercase();

    if path.ends_with(".m3u8") {
        return Some(StreamKind::Hls);
    }
    if path.ends_with(".jpg")
        || path.ends_with(".jpeg")
        || path.contains("shot")
        || query.contains("action=snapshot")
    {
        return Some(StreamKind::StaticJpeg);
    }
    if path.contains("videofeed")
        || path.contains("mjpg")
        || path.contains("mjpeg")
        || path == "/video"
        || query.contains("action=stream")
    {
        return Some(StreamKind::Mjpeg);
    }
    None
}

/// Map a response `Content-Type` to a stream kind.
pub fn classify_content_type(content_type: &str) -> Option<StreamKind> {
    let ct = content_type.trim().to_ascii_lowercase();
    if ct.starts_with("multipart/x-mixed-replace") {
        Some(StreamKind::Mjpeg)
    } else if ct.starts_with("image/jpeg") || ct.starts_with("image/jpg") {
        Some(StreamKind::StaticJpeg)
    } else if ct.contains("mpegurl") {
        Some(StreamKind::Hls)
    } else {
        None
    }
}

/// Fill in `endpoint.kind`, hitting the network only when the URL shape
/// was inconclusive.
pub async fn probe(
    client: &reqwest::Client,
    endpoint: RemoteEndpoint,
    timeout: Duration,
) -> Result<RemoteEndpoint, CaptureError> {
    if endpoint.kind.is_some() {
        return Ok(endpoint);
    }

    let at_root = matches!(endpoint.url.path(), "" | "/");
    if !at_root {
        let kind = probe_one(client, &endpoint.url, timeout).await?;
        return Ok(RemoteEndpoint {
            url: endpoint.url,
            kind: Some(kind),
        });
    }

    let mut last_err = None;
    for path in KNOWN_PATHS {
        let mut url = endpoint.url.clone();
        url.set_path(path);
        match probe_one(client, &url, timeout).await {
            Ok(kind) => {
                tracing::info!(url = %url, kind = %kind, "camera endpoint discovered");
                return Ok(RemoteEndpoint {
                    url,
                    kind: Some(kind),
                });
            }
            Err(e @ CaptureError::UnsupportedProtocol(_)) => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        CaptureError::UnsupportedProtocol(format!("{}: no known stream endpoint", endpoint.url))
    }))
}

async fn probe_one(
    client: &reqwest::Client,
    url: &Url,
    timeout: Duration,
) -> Result<StreamKind, CaptureError> {
    tracing::debug!(url = %url, "probing camera endpoint");
    let resp = match tokio::time::timeout(timeout, client.get(url.clone()).send()).await {
        Err(_) => {
            return Err(CaptureError::ConnectionTimeout(format!(
                "{url}: no response within {}s",
                timeout.as_secs()
            )))
        }
        Ok(Err(e)) if e.is_timeout() => {
            return Err(CaptureError::ConnectionTimeout(format!("{url}: {e}")))
        }
        Ok(Err(e)) => return Err(CaptureError::DeviceUnavailable(format!("{url}: {e}"))),
        Ok(Ok(resp)) => resp,
    };

    if !resp.status().is_success() {
        return Err(CaptureError::UnsupportedProtocol(format!(
            "{url}: HTTP {}",
            resp.status()
        )));
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    classify_content_type(&content_type).ok_or_else(|| {
        CaptureError::UnsupportedProtocol(format!(
            "{url}: unrecognized content type {content_type:?}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::routing::get;
    use axum::Router;

    #[test]
    fn test_ip_port_shorthand_resolves_to_videofeed() {
        let ep = resolve_remote("192.168.1.10:8080").unwrap();
        assert_eq!(ep.url.as_str(), "http://192.168.1.10:8080/videofeed");
        assert_eq!(ep.kind, Some(StreamKind::Mjpeg));
    }

    #[test]
    fn test_bare_ip_gets_default_port() {
        let ep = resolve_remote(" 10.0.0.7 ").unwrap();
        assert_eq!(ep.url.as_str(), "http://10.0.0.7:8080/videofeed");
        assert_eq!(ep.kind, Some(StreamKind::Mjpeg));
    }

    #[test]
    fn test_explicit_default_http_port_is_kept() {
        let ep = resolve_remote("cam.local:80").unwrap();
        assert_eq!(ep.url.port_or_known_default(), Some(80));
    }

    #[test]
    fn test_rtsp_is_unsupported() {
        let err = resolve_remote("rtsp://192.168.1.10:554/stream").unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedProtocol(_)));
    }

    #[test]
    fn test_invalid_addresses() {
        for bad in ["", "   ", "not a url", "http://", "ftp2://x", "192.168.1.10:notaport"] {
            let err = resolve_remote(bad).unwrap_err();
            assert!(
                matches!(err, CaptureError::InvalidUrl(_)),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_url_shapes() {
        let kind = |s: &str| resolve_remote(s).unwrap().kind;
        assert_eq!(kind("http://cam/live/index.m3u8"), Some(StreamKind::Hls));
        assert_eq!(kind("http://cam:8080/shot.jpg"), Some(StreamKind::StaticJpeg));
        assert_eq!(kind("https://cam/cgi-bin/snapshot.cgi"), Some(StreamKind::StaticJpeg));
        assert_eq!(kind("http://cam/?action=stream"), Some(StreamKind::Mjpeg));
        assert_eq!(kind("http://cam/video.mjpg"), Some(StreamKind::Mjpeg));
        assert_eq!(kind("cam.local:81/videofeed"), Some(StreamKind::Mjpeg));
        assert_eq!(kind("http://cam/"), None);
        assert_eq!(kind("http://cam/stream"), None);
    }

    #[test]
    fn test_content_type_classification() {
        assert_eq!(
            classify_content_type("multipart/x-mixed-replace; boundary=frame"),
            Some(StreamKind::Mjpeg)
        );
        assert_eq!(classify_content_type("image/jpeg"), Some(StreamKind::StaticJpeg));
        assert_eq!(
            classify_content_type("application/vnd.apple.mpegurl"),
            Some(StreamKind::Hls)
        );
        assert_eq!(classify_content_type("text/html"), None);
    }

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_probe_known_shape_skips_network() {
        // Nothing listens on port 9; a network probe would fail.
        let ep = resolve_remote("127.0.0.1:9").unwrap();
        let probed = probe(&reqwest::Client::new(), ep.clone(), PROBE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(probed, ep);
    }

    #[tokio::test]
    async fn test_probe_by_content_type() {
        let app = Router::new().route(
            "/cam",
            get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], "x") }),
        );
        let addr = serve(app).await;
        let ep = resolve_remote(&format!("http://{addr}/cam")).unwrap();
        assert_eq!(ep.kind, None);

        let probed = probe(&reqwest::Client::new(), ep, PROBE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(probed.kind, Some(StreamKind::StaticJpeg));
    }

    #[tokio::test]
    async fn test_probe_root_discovers_known_path() {
        let app = Router::new().route(
            "/shot.jpg",
            get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], "x") }),
        );
        let addr = serve(app).await;
        let ep = resolve_remote(&format!("http://{addr}/")).unwrap();

        let probed = probe(&reqwest::Client::new(), ep, PROBE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(probed.url.path(), "/shot.jpg");
        assert_eq!(probed.kind, Some(StreamKind::StaticJpeg));
    }

    #[tokio::test]
    async fn test_probe_html_is_unsupported() {
        let app = Router::new().route(
            "/page",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }),
        );
        let addr = serve(app).await;
        let ep = resolve_remote(&format!("http://{addr}/page")).unwrap();
        let err = probe(&reqwest::Client::new(), ep, PROBE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedProtocol(_)));
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let addr = serve(app).await;
        let ep = resolve_remote(&format!("http://{addr}/slow")).unwrap();
        let err = probe(&reqwest::Client::new(), ep, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::ConnectionTimeout(_)));
    }
}
