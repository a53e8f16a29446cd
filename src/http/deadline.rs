//! Per-request deadlines.
//!
//! A [`RequestDeadline`] travels in the request extensions. Handlers observe it
//! cooperatively: nothing is aborted when it passes, but [`RequestDeadline::cancelled`]
//! resolves so long-running work can stop early.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline and cancellation signal of one request.
#[derive(Debug, Clone)]
pub struct RequestDeadline {
    at: Instant,
    cancelled: watch::Receiver<bool>,
}

/// Cancels the paired [`RequestDeadline`] when dropped.
#[derive(Debug)]
pub struct CancelGuard(watch::Sender<bool>);

impl RequestDeadline {
    /// A deadline at `at` and the guard that cancels it.
    pub fn at(at: Instant) -> (Self, CancelGuard) {
        let (tx, rx) = watch::channel(false);
        (Self { at, cancelled: rx }, CancelGuard(tx))
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> (Self, CancelGuard) {
        Self::at(Instant::now() + timeout)
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Whether the owner released the deadline (the request finished or timed out).
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow() || self.is_expired()
    }

    /// Resolves once the deadline passes or the request is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        tokio::select! {
            _ = rx.wait_for(|c| *c) => {}
            _ = tokio::time::sleep_until(self.at) => {}
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}
