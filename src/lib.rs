//! Embeddable HTTP server component.
//!
//! A [`Container`] collects routes, filters and configuration; `build` wraps
//! the router with the built-in interceptors (recovery and access log, proxy
//! headers, request timeout, metrics, tracing) and yields a [`Component`]
//! with an `init` / `start` / `stop` / `graceful_stop` lifecycle.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::ServerConfig;
pub use error::ServerError;
pub use http::{Component, Container, FilterContext, RequestContext};
pub use lifecycle::Shutdown;
