//! Client identity behind reverse proxies.
//!
//! Pure functions over request headers. The client IP is taken, in order, from
//! `X-Forwarded-For` (first entry), `X-Real-IP`, the RFC 7239 `Forwarded: for=`
//! parameter, and finally the socket peer address. The scheme follows the same
//! pattern over `X-Forwarded-Proto`, `X-Forwarded-Scheme` and `Forwarded: proto=`.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_SCHEME: &str = "x-forwarded-scheme";
pub const X_REAL_IP: &str = "x-real-ip";
pub const FORWARDED: &str = "forwarded";

/// Characters that end a `for=` value in a `Forwarded` header.
const FOR_TERMINATORS: &[char] = &['(', ')', ';', '|', ',', ' '];

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the client IP. Returns an empty string when nothing usable is found.
pub fn client_ip(headers: &HeaderMap, remote: Option<&str>) -> String {
    if let Some(fwd) = header(headers, X_FORWARDED_FOR) {
        // later entries are proxies closer to us
        let first = fwd.split(',').next().unwrap_or(fwd).trim();
        return strip_port(first);
    }
    if let Some(real) = header(headers, X_REAL_IP) {
        return strip_port(real);
    }
    if let Some(value) = header(headers, FORWARDED).and_then(forwarded_for) {
        return strip_port(&value);
    }
    remote.map(split_host).unwrap_or_default()
}

/// Resolve the scheme requested by the client, lowercased, if a proxy told us.
pub fn scheme(headers: &HeaderMap) -> Option<String> {
    if let Some(proto) = header(headers, X_FORWARDED_PROTO) {
        return Some(proto.to_ascii_lowercase());
    }
    if let Some(proto) = header(headers, X_FORWARDED_SCHEME) {
        return Some(proto.to_ascii_lowercase());
    }
    header(headers, FORWARDED).and_then(forwarded_proto)
}

/// Host the client addressed, as reported by the proxy.
pub fn host(headers: &HeaderMap) -> Option<&str> {
    header(headers, X_FORWARDED_HOST)
}

/// Host part of a `host:port` string; empty when it is not one.
pub fn split_host(addr: &str) -> String {
    let addr = addr.trim();
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() => {
            host.to_string()
        }
        _ => String::new(),
    }
}

/// Header values may or may not carry a port; keep only the address.
fn strip_port(value: &str) -> String {
    let value = value.trim().trim_matches('"');
    if let Ok(sock) = value.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    let bare = value.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return bare.to_string();
    }
    match split_host(value) {
        host if host.is_empty() => value.to_string(),
        host => host,
    }
}

/// Position right after the first case-insensitive occurrence of `key`.
fn find_param(value: &str, key: &str) -> Option<usize> {
    value
        .to_ascii_lowercase()
        .find(key)
        .map(|idx| idx + key.len())
}

fn forwarded_for(value: &str) -> Option<String> {
    let start = find_param(value, "for=")?;
    let rest = &value[start..];
    let end = rest.find(FOR_TERMINATORS).unwrap_or(rest.len());
    let token = rest[..end].trim_matches('"');
    (!token.is_empty()).then(|| token.to_string())
}

fn forwarded_proto(value: &str) -> Option<String> {
    let start = find_param(value, "proto=")?;
    let rest = value[start..].to_ascii_lowercase();
    if rest.starts_with("https") {
        Some("https".to_string())
    } else if rest.starts_with("http") {
        Some("http".to_string())
    } else {
        None
    }
}
