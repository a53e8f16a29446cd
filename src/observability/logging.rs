//! Structured logging.
//!
//! # Responsibilities
//! - Install the process-wide `tracing` subscriber
//! - Pick the level from `RUST_LOG`, falling back to the given default
//!
//! # Design Decisions
//! - JSON for production, the compact fmt layer for development
//! - Access records use the `access` target so they can be routed apart

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Error returned when a global subscriber is already installed.
pub type LoggingError = tracing_subscriber::util::TryInitError;

/// Install the global subscriber. `default_directive` applies when
/// `RUST_LOG` is unset, e.g. `"rest_server=info,access=info"`.
pub fn init_logging(default_directive: &str, json: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
}
