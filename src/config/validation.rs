//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (network kinds, host syntax, buffer sizes)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::IpAddr;

use crate::config::schema::ServerConfig;

/// Networks the listener can bind.
pub const SUPPORTED_NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6"];

/// Largest accepted WebSocket buffer.
pub const MAX_WEBSOCKET_BUFFER: usize = 64 * 1024 * 1024;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !SUPPORTED_NETWORKS.contains(&config.network.as_str()) {
        errors.push(ValidationError {
            field: "network",
            message: format!("unsupported network {:?}", config.network),
        });
    }

    if !config.host.is_empty() && !config.enable_local_main_ip {
        match config.host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) if config.network == "tcp6" => errors.push(ValidationError {
                field: "host",
                message: "IPv4 host with tcp6 network".to_string(),
            }),
            Ok(IpAddr::V6(_)) if config.network == "tcp4" => errors.push(ValidationError {
                field: "host",
                message: "IPv6 host with tcp4 network".to_string(),
            }),
            Ok(_) => {}
            // hostnames are resolved at bind time
            Err(_) if is_hostname(&config.host) => {}
            Err(_) => errors.push(ValidationError {
                field: "host",
                message: format!("invalid host {:?}", config.host),
            }),
        }
    }

    if config.trace_id_header.is_empty()
        || axum::http::HeaderName::from_bytes(config.trace_id_header.as_bytes()).is_err()
    {
        errors.push(ValidationError {
            field: "trace_id_header",
            message: format!("invalid header name {:?}", config.trace_id_header),
        });
    }

    for (field, size) in [
        ("websocket_read_buffer_size", config.websocket_read_buffer_size),
        ("websocket_write_buffer_size", config.websocket_write_buffer_size),
    ] {
        if size > MAX_WEBSOCKET_BUFFER {
            errors.push(ValidationError {
                field,
                message: format!("{size} exceeds {MAX_WEBSOCKET_BUFFER} bytes"),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}
