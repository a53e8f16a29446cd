//! Component lifecycle errors.

use std::net::SocketAddr;

/// Errors surfaced by [`Component`](crate::http::Component) and its container.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound. Startup must not continue.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// `start` or `info` was called before `init`.
    #[error("component {0:?} is not initialized")]
    NotInitialized(String),

    /// `stop` or `graceful_stop` was called before `start` built the server.
    #[error("component {0:?} has not been started")]
    NotStarted(String),

    /// `start` was called while the component is already serving.
    #[error("component {0:?} is already serving")]
    AlreadyStarted(String),

    /// `start` was called again after the component was stopped.
    #[error("component {0:?} was already stopped")]
    AlreadyStopped(String),

    /// The graceful-stop deadline passed with connections still open.
    #[error("graceful stop timed out with {remaining} connection(s) in flight")]
    ShutdownTimeout { remaining: u64 },

    /// The HTTP method cannot be routed.
    #[error("unsupported route method {0}")]
    Method(axum::http::Method),

    /// The route cannot be registered (bad path or duplicate).
    #[error("invalid route {method} {path}: {reason}")]
    Route {
        method: axum::http::Method,
        path: String,
        reason: &'static str,
    },

    /// The serve loop failed on the listener.
    #[error("serve on {address} failed: {source}")]
    Serve {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl ServerError {
    /// Whether the orchestrator must abort instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Bind { .. } | ServerError::NotInitialized(_))
    }
}
