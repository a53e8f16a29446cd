//! Metrics exposition.
//!
//! The metric interceptor records through the `metrics` facade:
//! - `server_handle_seconds` (histogram): `type`, `method`, `peer`
//! - `server_handle_total` (counter): the same labels plus `code`
//!
//! [`init_metrics`] installs a Prometheus recorder that serves them over HTTP.
//! Without a recorder the interceptor's updates are dropped.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .inspect_err(|err| tracing::error!(address = %addr, error = %err, "Failed to install Prometheus exporter"))?;

    tracing::info!(address = %addr, "Prometheus metrics exporter started");
    Ok(())
}
