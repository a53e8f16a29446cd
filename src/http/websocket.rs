//! WebSocket upgrade handling.
//!
//! # Responsibilities
//! - Reject cross-origin upgrades unless any origin is allowed
//! - Complete the handshake and hand the connection to a callback
//! - Report handshake failures to the same callback
//!
//! # Data Flow
//! ```text
//! HTTP request ──handshake ok──→ callback(Ok(WebSocketConn { socket, ctx }))
//!              ──handshake err─→ callback(Err(UpgradeError)) + rejection response
//! ```
//!
//! # Design Decisions
//! - The callback owns the socket; it closes when the callback returns
//! - Panics inside the callback are caught and logged, never propagated

use std::future::Future;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{self, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::config::ServerConfig;
use crate::http::context::RequestContext;
use crate::http::middleware::recovery::Recover;

/// Why an upgrade did not produce a connection.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("origin {origin:?} does not match host {host:?}")]
    CrossOrigin { origin: String, host: String },
    #[error("websocket handshake rejected: {0}")]
    Handshake(String),
    #[error("websocket upgrade failed: {0}")]
    Upgrade(#[source] axum::Error),
}

/// An established connection together with the request that opened it.
#[derive(Debug)]
pub struct WebSocketConn {
    pub socket: ws::WebSocket,
    pub ctx: RequestContext,
}

/// Upgrade settings shared by WebSocket routes.
#[derive(Debug, Clone, Default)]
pub struct WebSocket {
    allow_any_origin: bool,
    read_buffer_size: usize,
    write_buffer_size: usize,
}

impl WebSocket {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            allow_any_origin: config.enable_websocket_check_origin,
            read_buffer_size: config.websocket_read_buffer_size,
            write_buffer_size: config.websocket_write_buffer_size,
        }
    }

    pub fn allow_any_origin(mut self, allow: bool) -> Self {
        self.allow_any_origin = allow;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Promote the request to a WebSocket and run `handler` with the outcome.
    pub async fn upgrade<F, Fut>(&self, ctx: RequestContext, handler: F) -> Response
    where
        F: FnOnce(Result<WebSocketConn, UpgradeError>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.allow_any_origin {
            if let Err(err) = check_same_origin(ctx.request()) {
                tracing::warn!(error = %err, "Rejected WebSocket upgrade");
                run_handler(handler, Err(err)).await;
                return (StatusCode::FORBIDDEN, "cross-origin websocket request").into_response();
            }
        }

        let (mut parts, body) = ctx.into_request().into_parts();
        let mut upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => {
                tracing::debug!(reason = %rejection.body_text(), "WebSocket handshake rejected");
                run_handler(handler, Err(UpgradeError::Handshake(rejection.body_text()))).await;
                return rejection.into_response();
            }
        };
        let ctx = RequestContext::new(Request::from_parts(parts, body));

        if self.read_buffer_size > 0 {
            upgrade = upgrade.read_buffer_size(self.read_buffer_size);
        }
        if self.write_buffer_size > 0 {
            upgrade = upgrade.write_buffer_size(self.write_buffer_size);
        }

        let handler = Arc::new(Mutex::new(Some(handler)));
        let on_failure = Arc::clone(&handler);
        upgrade
            .on_failed_upgrade(move |err| {
                tracing::warn!(error = %err, "WebSocket upgrade failed");
                let taken = on_failure.lock().expect("websocket handler lock poisoned").take();
                if let Some(handler) = taken {
                    tokio::spawn(run_handler(handler, Err(UpgradeError::Upgrade(err))));
                }
            })
            .on_upgrade(move |socket| async move {
                let taken = handler.lock().expect("websocket handler lock poisoned").take();
                if let Some(handler) = taken {
                    run_handler(handler, Ok(WebSocketConn { socket, ctx })).await;
                }
            })
    }
}

async fn run_handler<F, Fut>(handler: F, outcome: Result<WebSocketConn, UpgradeError>)
where
    F: FnOnce(Result<WebSocketConn, UpgradeError>) -> Fut,
    Fut: Future<Output = ()>,
{
    if let Err(fault) = Recover::new(handler(outcome)).await {
        tracing::error!(
            error = %fault,
            stack = %fault.stack(),
            "WebSocket handler panicked"
        );
    }
}

/// Accept requests without an `Origin`, or whose origin names the host the
/// request was sent to.
fn check_same_origin(req: &Request) -> Result<(), UpgradeError> {
    let Some(origin) = req.headers().get(header::ORIGIN) else {
        return Ok(());
    };
    let origin = String::from_utf8_lossy(origin.as_bytes()).into_owned();
    let host = request_host(req.headers(), req.uri()).unwrap_or_default();
    let mismatch = || UpgradeError::CrossOrigin {
        origin: origin.clone(),
        host: host.clone(),
    };

    let url = Url::parse(&origin).map_err(|_| mismatch())?;
    let origin_host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(mismatch)?;
    let origin_port = url.port_or_known_default();

    let (host_name, host_port) = split_authority(&host);
    let host_port = host_port.or(origin_port.filter(|_| url.port().is_none()));
    if origin_host.eq_ignore_ascii_case(host_name) && origin_port == host_port {
        Ok(())
    } else {
        Err(mismatch())
    }
}

fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
}

/// `host[:port]`, IPv6 literals in brackets.
fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((ip, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (ip, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, port.parse().ok()),
        _ => (authority, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(host: &str, origin: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/ws").header(header::HOST, host);
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn missing_origin_is_same_origin() {
        assert!(check_same_origin(&request("example.com", None)).is_ok());
    }

    #[test]
    fn origin_host_compared_case_insensitively() {
        assert!(check_same_origin(&request("Example.COM:8080", Some("http://example.com:8080"))).is_ok());
        assert!(check_same_origin(&request("example.com", Some("https://example.com"))).is_ok());
        assert!(check_same_origin(&request("[::1]:9090", Some("http://[::1]:9090"))).is_ok());
    }

    #[test]
    fn foreign_origin_is_rejected() {
        let err = check_same_origin(&request("example.com", Some("http://evil.test"))).unwrap_err();
        assert!(matches!(err, UpgradeError::CrossOrigin { .. }));

        assert!(check_same_origin(&request("example.com:8080", Some("http://example.com:9090"))).is_err());
        assert!(check_same_origin(&request("example.com", Some("null"))).is_err());
    }

    #[test]
    fn authority_splitting() {
        assert_eq!(split_authority("[::1]:9090"), ("::1", Some(9090)));
        assert_eq!(split_authority("localhost"), ("localhost", None));
        assert_eq!(split_authority("localhost:80"), ("localhost", Some(80)));
    }
}
