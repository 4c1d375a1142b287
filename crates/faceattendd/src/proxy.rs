//! Same-origin HTTP gateway in front of the attendance service.
//!
//! `/api/<path>` is relayed to `<api_base>/<path>` with the caller's auth
//! and content headers. Status, end-to-end headers and body come back
//! unchanged, with CORS headers added.

use crate::client::ADMIN_TOKEN_HEADER;
use crate::context::ApiContext;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, RawQuery, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;

const API_PREFIX: &str = "/api/";

/// Request headers relayed upstream.
const FORWARDED: [&str; 4] = ["authorization", "x-admin-token", "content-type", "accept"];

/// Connection-scoped response headers that must not be relayed.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("upstream did not respond within {0}s")]
    Timeout(u64),
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        with_cors((status, Json(json!({ "error": self.to_string() }))).into_response())
    }
}

#[derive(Clone)]
pub struct GatewayState {
    ctx: Arc<ApiContext>,
    http: reqwest::Client,
    timeout: Duration,
    max_body: usize,
}

impl GatewayState {
    pub fn new(ctx: Arc<ApiContext>, timeout: Duration, max_body: usize) -> Self {
        Self {
            ctx,
            http: reqwest::Client::new(),
            timeout,
            max_body,
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    let limit = state.max_body;
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/{*path}", any(forward))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

/// Serve the gateway until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: GatewayState,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, upstream = %state.ctx.api_base(), "gateway listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn forward(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    if method == Method::OPTIONS {
        return Ok(with_cors(StatusCode::OK.into_response()));
    }

    let rest = uri.path().strip_prefix(API_PREFIX).unwrap_or_default();
    let mut url = state.ctx.endpoint(rest);
    url.set_query(query.as_deref());
    tracing::debug!(%method, %url, bytes = body.len(), "relaying request");

    let mut req = state.http.request(method, url).timeout(state.timeout);
    for name in FORWARDED {
        for value in headers.get_all(name) {
            req = req.header(name, value.clone());
        }
    }
    let caller_authenticated =
        headers.contains_key(header::AUTHORIZATION) || headers.contains_key(ADMIN_TOKEN_HEADER);
    if !caller_authenticated {
        if let Some(token) = state.ctx.token() {
            req = req.bearer_auth(&token).header(ADMIN_TOKEN_HEADER, token);
        }
    }
    if !body.is_empty() {
        req = req.body(body);
    }

    let upstream = req.send().await.map_err(|e| classify(&state, e))?;
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let bytes = upstream.bytes().await.map_err(|e| classify(&state, e))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    let out = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    Ok(with_cors(response))
}

fn classify(state: &GatewayState, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        tracing::warn!(timeout_secs = state.timeout.as_secs(), "upstream timed out");
        GatewayError::Timeout(state.timeout.as_secs())
    } else {
        tracing::warn!(error = %e, "upstream request failed");
        GatewayError::Upstream(e.to_string())
    }
}

fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type, Accept, X-Admin-Token"),
    );
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static("600"),
    );
    response
}
