//! Request logging middleware.
//!
//! One line per request with method, path, status and latency. For the SSE
//! flip stream the latency covers the handler only (headers sent), not the
//! lifetime of the stream.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

/// Polled by load balancers; not worth a log line
const QUIET_PATHS: &[&str] = &["/health"];

pub async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if QUIET_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    let streaming = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            client_ip = %addr.ip(),
            "Request failed (5xx)"
        );
    } else if status >= 400 {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            client_ip = %addr.ip(),
            "Request completed (4xx)"
        );
    } else if streaming {
        info!(
            method = %method,
            path = %path,
            client_ip = %addr.ip(),
            "📡 Flip stream opened"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            "Request completed"
        );
    }

    response
}
