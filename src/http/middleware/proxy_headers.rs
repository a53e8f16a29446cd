//! Reverse-proxy header interceptor.
//!
//! Pins the resolved client IP on the request and rewrites the URI scheme and
//! host with the values a proxy reported, so handlers see what the client
//! actually addressed.

use axum::extract::Request;
use axum::http::uri::{Authority, Scheme};
use axum::http::{header, HeaderValue, Uri};
use axum::middleware::Next;
use axum::response::Response;

use crate::http::context::client_ip_of;
use crate::http::forwarded;

pub async fn proxy_headers_middleware(mut req: Request, next: Next) -> Response {
    client_ip_of(&mut req);

    let scheme = forwarded::scheme(req.headers());
    let host = forwarded::host(req.headers()).map(str::to_string);

    if let Some(host) = &host {
        if let Ok(value) = HeaderValue::from_str(host) {
            req.headers_mut().insert(header::HOST, value);
        }
    }
    if scheme.is_some() || host.is_some() {
        let rewritten = rewrite_uri(req.uri(), scheme.as_deref(), host.as_deref());
        match rewritten {
            Some(uri) => *req.uri_mut() = uri,
            None => tracing::debug!(
                uri = %req.uri(),
                scheme = ?scheme,
                host = ?host,
                "Ignoring unusable forwarded scheme or host"
            ),
        }
    }

    next.run(req).await
}

/// The request URI made absolute with the forwarded scheme and host.
fn rewrite_uri(uri: &Uri, scheme: Option<&str>, host: Option<&str>) -> Option<Uri> {
    let mut parts = uri.clone().into_parts();
    if let Some(host) = host {
        parts.authority = Some(host.parse::<Authority>().ok()?);
    }
    if let Some(scheme) = scheme {
        parts.scheme = Some(scheme.parse::<Scheme>().ok()?);
    }
    // an absolute URI needs both parts
    if parts.scheme.is_some() != parts.authority.is_some() {
        return None;
    }
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse().ok()?);
    }
    Uri::from_parts(parts).ok()
}
