//! Request metrics interceptor.
//!
//! Records one latency observation and one request count per request through
//! the `metrics` facade; the exporter is installed separately.

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::http::context::route_of;

pub const HANDLE_SECONDS: &str = "server_handle_seconds";
pub const HANDLE_TOTAL: &str = "server_handle_total";

/// Header naming the calling application.
pub const APP_HEADER: &str = "app";

pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = format!("{}.{}", req.method(), route_of(&req));
    let peer = req
        .headers()
        .get(APP_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(req).await;

    let code = response.status().canonical_reason().unwrap_or("Unknown");
    metrics::histogram!(
        HANDLE_SECONDS,
        "type" => "http",
        "method" => method.clone(),
        "peer" => peer.clone()
    )
    .record(started.elapsed().as_secs_f64());
    metrics::counter!(
        HANDLE_TOTAL,
        "type" => "http",
        "method" => method,
        "peer" => peer,
        "code" => code
    )
    .increment(1);

    response
}
