//! Submits captured frames to the recognition endpoint.

use crate::context::ApiContext;
use async_trait::async_trait;
use bytes::Bytes;
use faceattend_core::{FailureKind, RecognizeResponse, SubmitFailure, SubmitOutcome};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns one JPEG into a recognition outcome. Failures are values, not errors.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn submit_frame(&self, jpeg: Bytes) -> SubmitOutcome;
}

/// HTTP client for the attendance service's recognize endpoint.
pub struct AttendanceClient {
    http: reqwest::Client,
    ctx: Arc<ApiContext>,
    timeout: Duration,
}

impl AttendanceClient {
    pub fn new(ctx: Arc<ApiContext>, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), ctx, timeout)
    }

    pub fn with_client(http: reqwest::Client, ctx: Arc<ApiContext>, timeout: Duration) -> Self {
        Self { http, ctx, timeout }
    }

    async fn post(&self, jpeg: Bytes) -> Result<(StatusCode, Bytes), SubmitFailure> {
        let part = Part::bytes(Vec::from(jpeg))
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| SubmitFailure::new(FailureKind::Network, e.to_string()))?;
        let form = Form::new().part("image", part);

        let mut req = self
            .http
            .post(self.ctx.recognize_url())
            .timeout(self.timeout)
            .multipart(form);
        if let Some(token) = self.ctx.token() {
            req = req.bearer_auth(&token).header(ADMIN_TOKEN_HEADER, token);
        }

        let resp = req.send().await.map_err(|e| self.transport_failure(e))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.transport_failure(e))?;
        Ok((status, body))
    }

    fn transport_failure(&self, e: reqwest::Error) -> SubmitFailure {
        if e.is_timeout() {
            SubmitFailure::new(
                FailureKind::Timeout,
                format!(
                    "no response within {}s; the server may be overloaded",
                    self.timeout.as_secs()
                ),
            )
        } else {
            SubmitFailure::new(
                FailureKind::Network,
                format!("cannot reach {}: {e}", self.ctx.api_base()),
            )
        }
    }
}

#[async_trait]
impl Recognizer for AttendanceClient {
    async fn submit_frame(&self, jpeg: Bytes) -> SubmitOutcome {
        let started = Instant::now();
        let size = jpeg.len();

        let (status, body) = match self.post(jpeg).await {
            Ok(r) => r,
            Err(failure) => {
                tracing::warn!(
                    kind = ?failure.kind,
                    error = %failure.message,
                    "frame submission failed"
                );
                return SubmitOutcome::Failed(failure);
            }
        };

        if matches!(
            status,
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            tracing::warn!(status = status.as_u16(), "recognition service overloaded");
            return SubmitOutcome::Failed(SubmitFailure::new(
                FailureKind::Timeout,
                format!("server returned {status}; it may be overloaded"),
            ));
        }
        if !status.is_success() {
            let message = error_message(&body).unwrap_or_else(|| status.to_string());
            tracing::warn!(
                status = status.as_u16(),
                error = %message,
                "recognition request rejected"
            );
            return SubmitOutcome::Failed(SubmitFailure::new(
                FailureKind::Server(status.as_u16()),
                message,
            ));
        }

        match RecognizeResponse::from_slice(&body) {
            Ok(resp) => {
                let result = resp.into_result(Instant::now());
                tracing::debug!(
                    bytes = size,
                    recognized = result.recognized_count(),
                    unrecognized = result.unrecognized_count,
                    server_ms = result.processing_time_ms,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "frame recognized"
                );
                SubmitOutcome::Recognized(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, "undecodable recognition response");
                SubmitOutcome::Failed(SubmitFailure::new(FailureKind::Decode, e.to_string()))
            }
        }
    }
}

/// `detail` or `error` from a JSON error body.
fn error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    ["detail", "error", "message"].iter().find_map(|key| match value.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    })
}
