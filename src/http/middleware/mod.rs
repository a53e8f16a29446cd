//! Built-in interceptors.
//!
//! # Data Flow
//! ```text
//! Request
//!     → gzip (enable_gzip)
//!     → recovery.rs (panics, faults, access/slow records)
//!     → proxy_headers.rs (client IP, forwarded scheme/host)
//!     → timeout.rs (context_timeout_ms > 0)
//!     → metrics.rs (enable_metric_interceptor)
//!     → trace.rs (enable_trace_interceptor + registered tracer)
//!     → user filters
//!     → handler
//! ```
//!
//! # Design Decisions
//! - The order is fixed when the router is built
//! - Every interceptor is a plain `from_fn` middleware; the last layer added
//!   is the outermost one

pub mod metrics;
pub mod proxy_headers;
pub mod recovery;
pub mod timeout;
pub mod trace;

use std::sync::Arc;

use axum::http::HeaderName;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use tower_http::compression::CompressionLayer;

use crate::config::ServerConfig;

pub use recovery::{install_panic_hook, Recover, RecoveryState};
pub use trace::TraceState;

const DEFAULT_TRACE_ID_HEADER: &str = "x-trace-id";

/// Wrap `router` with the interceptors enabled in `config`.
pub fn apply_interceptors(mut router: Router, config: &ServerConfig) -> Router {
    let trace_id_header = HeaderName::from_bytes(config.trace_id_header.as_bytes())
        .unwrap_or_else(|_| HeaderName::from_static(DEFAULT_TRACE_ID_HEADER));

    if config.enable_trace_interceptor {
        let state = Arc::new(TraceState {
            trace_id_header: trace_id_header.clone(),
        });
        router = router.layer(from_fn_with_state(state, trace::trace_middleware));
    }
    if config.enable_metric_interceptor {
        router = router.layer(from_fn(metrics::metrics_middleware));
    }
    if let Some(timeout) = config.context_timeout() {
        router = router.layer(from_fn_with_state(timeout, timeout::timeout_middleware));
    }
    router = router.layer(from_fn(proxy_headers::proxy_headers_middleware));

    install_panic_hook();
    let recovery = Arc::new(RecoveryState {
        access_log: config.enable_access_interceptor,
        slow_threshold: config.slow_log_threshold(),
        capture: config.access_log_capture.clone(),
        trace_id_header,
    });
    router = router.layer(from_fn_with_state(recovery, recovery::recovery_middleware));

    if config.enable_gzip {
        router = router.layer(CompressionLayer::new().gzip(true));
    }

    tracing::debug!(
        trace = config.enable_trace_interceptor,
        metrics = config.enable_metric_interceptor,
        context_timeout_ms = config.context_timeout_ms,
        gzip = config.enable_gzip,
        "Interceptors applied"
    );
    router
}
