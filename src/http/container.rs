//! Route and filter registration.
//!
//! # Responsibilities
//! - Hold the configuration of a component before it is built
//! - Register routes and typed filters
//! - Assemble the router with the built-in interceptors in `build`
//!
//! # Design Decisions
//! - The container is owned by the caller; there is no process-wide router
//! - Filters are applied in `build` so they cover every route, first
//!   registered runs first

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use axum::extract::Request;
use axum::handler::Handler;
use axum::http::Method;
use axum::middleware::{from_fn, Next};
use axum::response::Response;
use axum::routing::{on, MethodFilter};
use axum::Router;

use crate::config::{load_config, ConfigError, ServerConfig};
use crate::error::ServerError;
use crate::http::context::FilterContext;
use crate::http::middleware::apply_interceptors;
use crate::http::server::Component;
use crate::http::websocket::WebSocket;
use crate::net::local_main_ip;

type Layering = Box<dyn FnOnce(Router) -> Router + Send>;

/// Builder of a [`Component`].
pub struct Container {
    name: String,
    config: ServerConfig,
    router: Router,
    routes: Vec<(Method, String)>,
    filters: Vec<Layering>,
}

impl Default for Container {
    fn default() -> Self {
        Self::with_config(ServerConfig::default())
    }
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            name: String::new(),
            config,
            router: Router::new(),
            routes: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Container configured from the table at `key` of a TOML file; the
    /// component is named after the key.
    pub fn load(path: &Path, key: &str) -> Result<Self, ConfigError> {
        let mut config = load_config(path, key)?;
        if config.enable_local_main_ip {
            config.host = match local_main_ip() {
                Ok(ip) => ip.to_string(),
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to resolve local main IP, binding all interfaces");
                    String::new()
                }
            };
        }
        tracing::info!(key = %key, address = %config.address(), "Server config loaded");

        let mut container = Self::with_config(config);
        container.name = key.to_string();
        Ok(container)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.config.network = network.into();
        self
    }

    pub fn with_read_header_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_header_timeout_ms = millis(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout_ms = millis(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout_ms = millis(timeout);
        self
    }

    pub fn with_context_timeout(mut self, timeout: Duration) -> Self {
        self.config.context_timeout_ms = millis(timeout);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Register `handler` for `method` on `path` (axum path syntax, e.g. `/users/{id}`).
    pub fn route<H, T>(&mut self, method: Method, path: &str, handler: H) -> Result<&mut Self, ServerError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let filter = MethodFilter::try_from(method.clone()).map_err(|_| ServerError::Method(method.clone()))?;
        if !path.starts_with('/') {
            return Err(ServerError::Route {
                method,
                path: path.to_string(),
                reason: "path must start with '/'",
            });
        }
        if self.routes.iter().any(|(m, p)| *m == method && p == path) {
            return Err(ServerError::Route {
                method,
                path: path.to_string(),
                reason: "already registered",
            });
        }

        self.router = std::mem::take(&mut self.router).route(path, on(filter, handler));
        self.routes.push((method, path.to_string()));
        Ok(self)
    }

    pub fn get<H, T>(&mut self, path: &str, handler: H) -> Result<&mut Self, ServerError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.route(Method::GET, path, handler)
    }

    pub fn post<H, T>(&mut self, path: &str, handler: H) -> Result<&mut Self, ServerError>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.route(Method::POST, path, handler)
    }

    /// Run `filter` around every route. It continues the chain with
    /// [`FilterContext::process_filter`] or answers on its own.
    pub fn filter<F, Fut>(&mut self, filter: F) -> &mut Self
    where
        F: Fn(FilterContext) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.filters.push(Box::new(move |router: Router| {
            router.layer(from_fn(move |req: Request, next: Next| {
                let filter = filter.clone();
                async move { filter(FilterContext::new(req, next)).await }
            }))
        }));
        self
    }

    /// Upgrade settings for WebSocket routes, from this container's config.
    pub fn websocket(&self) -> WebSocket {
        WebSocket::from_config(&self.config)
    }

    /// Assemble the component: user filters innermost, then the built-in
    /// interceptors.
    pub fn build(self) -> Component {
        let mut router = self.router;
        for layer in self.filters.into_iter().rev() {
            router = layer(router);
        }
        let router = apply_interceptors(router, &self.config);
        Component::new(self.name, self.config, router, self.routes)
    }
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}
