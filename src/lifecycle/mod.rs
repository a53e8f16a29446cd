//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Container → build → init (bind) → shared Component
//!
//! Run (this module):
//!     start in a task → wait for Shutdown → graceful_stop → stop on timeout
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accepting, drain, then close what is left
//! - Draining has a deadline; connections still open at the deadline are dropped

pub mod shutdown;
pub mod signals;
pub mod startup;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio::time::Instant;

use crate::error::ServerError;
use crate::http::Component;

pub use shutdown::Shutdown;
pub use startup::prepare;

/// Serve `component` until `shutdown` fires, then drain for up to `grace`.
pub async fn run(component: Arc<Component>, shutdown: &Shutdown, grace: Duration) -> Result<(), ServerError> {
    let mut stop = shutdown.subscribe();
    let mut serving = {
        let component = Arc::clone(&component);
        tokio::spawn(async move { component.start().await })
    };

    tokio::select! {
        result = &mut serving => return joined(result),
        _ = stop.recv() => {}
    }

    tracing::info!(name = %component.name(), grace_ms = grace.as_millis() as u64, "Stopping component");
    match component.graceful_stop(Instant::now() + grace).await {
        Ok(()) => {}
        Err(ServerError::ShutdownTimeout { remaining }) => {
            tracing::warn!(name = %component.name(), remaining, "Closing connections left after grace period");
            component.stop()?;
        }
        Err(ServerError::NotStarted(_)) => {
            serving.abort();
            tracing::info!(name = %component.name(), "Shutdown before serving began");
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    joined(serving.await)
}

fn joined(result: Result<Result<(), ServerError>, JoinError>) -> Result<(), ServerError> {
    match result {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => Ok(()),
    }
}
