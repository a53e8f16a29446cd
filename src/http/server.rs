//! HTTP server component.
//!
//! # Responsibilities
//! - Bind the listener in `init` and publish the resolved address
//! - Serve the assembled router in `start`
//! - Stop immediately (`stop`) or after draining (`graceful_stop`) from any task
//! - Log registered routes with their comments
//! - Describe the service for discovery
//!
//! # Design Decisions
//! - Lifecycle is one state machine behind a mutex that is never held across
//!   an await point
//! - `start` takes the listener out of the state, so the socket closes when
//!   serving ends
//! - Route comments are registered through `&mut self`, before the component
//!   is shared between tasks

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::http::Method;
use axum::Router;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::http::serve::{self, ServeOptions, ServeSignal};
use crate::net::{ConnectionTracker, Listener, ListenerError};

/// Component family reported in logs.
pub const PACKAGE_NAME: &str = "server.http";

/// Role of a service in discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Provider,
}

/// Discovery metadata of a bound component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub scheme: &'static str,
    pub address: SocketAddr,
    pub kind: ServiceKind,
}

#[derive(Debug, Clone)]
struct ServeHandle {
    signal: Arc<watch::Sender<ServeSignal>>,
    tracker: ConnectionTracker,
}

enum ServeState {
    Unbound,
    Bound(Listener),
    Serving(ServeHandle),
    Stopped(ServeHandle),
}

/// An HTTP server bound to one address.
pub struct Component {
    name: String,
    config: ServerConfig,
    router: Router,
    routes: Vec<(Method, String)>,
    route_comments: HashMap<String, String>,
    local_addr: Option<SocketAddr>,
    state: Mutex<ServeState>,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("address", &self.config.address())
            .field("routes", &self.routes.len())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Key of a route comment: lowercase method, `@`, path.
pub fn comment_key(method: &Method, path: &str) -> String {
    format!("{}@{}", method.as_str().to_ascii_lowercase(), path)
}

impl Component {
    pub(crate) fn new(name: String, config: ServerConfig, router: Router, routes: Vec<(Method, String)>) -> Self {
        Self {
            name,
            config,
            router,
            routes,
            route_comments: HashMap::new(),
            local_addr: None,
            state: Mutex::new(ServeState::Unbound),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn package_name(&self) -> &'static str {
        PACKAGE_NAME
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The assembled router, interceptors included.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Registered `(method, path)` pairs in registration order.
    pub fn routes(&self) -> &[(Method, String)] {
        &self.routes
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Connections currently open, including ones still draining after a stop.
    pub fn active_connections(&self) -> u64 {
        match &*self.state.lock().expect("serve state lock poisoned") {
            ServeState::Serving(handle) | ServeState::Stopped(handle) => handle.tracker.active_count(),
            _ => 0,
        }
    }

    /// Bind the listener. Port `0` picks an ephemeral port, written back
    /// into the config.
    pub fn init(&mut self) -> Result<(), ServerError> {
        let state = self.state.get_mut().expect("serve state lock poisoned");
        if !matches!(state, ServeState::Unbound) {
            return Ok(());
        }

        let address = self.config.address();
        let listener = Listener::bind(&self.config).map_err(|err| {
            let source = match err {
                ListenerError::Bind(source) => source,
                ListenerError::Resolve(msg) => io::Error::new(io::ErrorKind::AddrNotAvailable, msg),
            };
            ServerError::Bind { address, source }
        })?;

        let local_addr = listener.local_addr();
        self.config.port = local_addr.port();
        self.local_addr = Some(local_addr);
        *state = ServeState::Bound(listener);

        tracing::info!(name = %self.name, address = %local_addr, "Component initialized");
        Ok(())
    }

    /// Attach a description to a route, logged by `start`.
    pub fn register_route_comment(&mut self, method: Method, path: &str, comment: impl Into<String>) {
        self.route_comments.insert(comment_key(&method, path), comment.into());
    }

    /// Serve until stopped. Returns `Ok(())` after `stop` or `graceful_stop`.
    pub async fn start(&self) -> Result<(), ServerError> {
        for (method, path) in &self.routes {
            match self.route_comments.get(&comment_key(method, path)) {
                Some(info) => tracing::info!(%method, path = %path, info = %info, "add route"),
                None => tracing::info!(%method, path = %path, "add route"),
            }
        }

        let (listener, handle) = {
            let mut state = self.state.lock().expect("serve state lock poisoned");
            match std::mem::replace(&mut *state, ServeState::Unbound) {
                ServeState::Bound(listener) => {
                    let (tx, _) = watch::channel(ServeSignal::Serve);
                    let handle = ServeHandle {
                        signal: Arc::new(tx),
                        tracker: ConnectionTracker::new(),
                    };
                    *state = ServeState::Serving(handle.clone());
                    (listener, handle)
                }
                ServeState::Unbound => return Err(ServerError::NotInitialized(self.name.clone())),
                serving @ ServeState::Serving(_) => {
                    *state = serving;
                    return Err(ServerError::AlreadyStarted(self.name.clone()));
                }
                stopped @ ServeState::Stopped(_) => {
                    *state = stopped;
                    return Err(ServerError::AlreadyStopped(self.name.clone()));
                }
            }
        };

        let address = listener.local_addr();
        let listener = listener
            .into_tokio()
            .map_err(|source| ServerError::Serve { address, source })?;
        let options = ServeOptions {
            read_header_timeout: self.config.read_header_timeout(),
            read_timeout: self.config.read_timeout(),
            write_timeout: self.config.write_timeout(),
        };

        serve::serve(
            listener,
            self.router.clone(),
            options,
            handle.tracker.clone(),
            handle.signal.subscribe(),
        )
        .await
        .map_err(|source| ServerError::Serve { address, source })?;

        tracing::info!(name = %self.name, address = %address, "HTTP server stopped");
        Ok(())
    }

    /// Stop accepting and drop every open connection.
    pub fn stop(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock().expect("serve state lock poisoned");
        match std::mem::replace(&mut *state, ServeState::Unbound) {
            ServeState::Serving(handle) | ServeState::Stopped(handle) => {
                handle.signal.send_replace(ServeSignal::Close);
                tracing::info!(
                    name = %self.name,
                    connections = handle.tracker.active_count(),
                    "Component stopped"
                );
                *state = ServeState::Stopped(handle);
                Ok(())
            }
            other => {
                *state = other;
                Err(ServerError::NotStarted(self.name.clone()))
            }
        }
    }

    /// Stop accepting and wait for open connections to finish, up to
    /// `deadline`. Connections still open at the deadline are left running.
    pub async fn graceful_stop(&self, deadline: Instant) -> Result<(), ServerError> {
        let tracker = {
            let mut state = self.state.lock().expect("serve state lock poisoned");
            match std::mem::replace(&mut *state, ServeState::Unbound) {
                ServeState::Serving(handle) | ServeState::Stopped(handle) => {
                    handle.signal.send_if_modified(|signal| {
                        if *signal == ServeSignal::Serve {
                            *signal = ServeSignal::Drain;
                            true
                        } else {
                            false
                        }
                    });
                    let tracker = handle.tracker.clone();
                    *state = ServeState::Stopped(handle);
                    tracker
                }
                other => {
                    *state = other;
                    return Err(ServerError::NotStarted(self.name.clone()));
                }
            }
        };

        tracing::info!(
            name = %self.name,
            connections = tracker.active_count(),
            "Draining connections"
        );
        match tokio::time::timeout_at(deadline, tracker.drained()).await {
            Ok(()) => {
                tracing::info!(name = %self.name, "Component drained");
                Ok(())
            }
            Err(_) => {
                let remaining = tracker.active_count();
                tracing::warn!(name = %self.name, remaining, "Graceful stop deadline passed");
                Err(ServerError::ShutdownTimeout { remaining })
            }
        }
    }

    /// Discovery metadata; requires `init`.
    pub fn info(&self) -> Result<ServiceInfo, ServerError> {
        let address = self
            .local_addr
            .ok_or_else(|| ServerError::NotInitialized(self.name.clone()))?;
        Ok(ServiceInfo {
            name: self.name.clone(),
            scheme: "http",
            address,
            kind: ServiceKind::Provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(port: u16) -> Component {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port,
            ..ServerConfig::default()
        };
        Component::new("test".into(), config, Router::new(), Vec::new())
    }

    #[test]
    fn comment_key_lowercases_method() {
        assert_eq!(comment_key(&Method::GET, "/users/{id}"), "get@/users/{id}");
    }

    #[test]
    fn info_requires_init() {
        let mut comp = component(0);
        assert!(matches!(comp.info(), Err(ServerError::NotInitialized(_))));

        comp.init().unwrap();
        let info = comp.info().unwrap();
        assert_eq!(info.scheme, "http");
        assert_eq!(info.kind, ServiceKind::Provider);
        assert_ne!(info.address.port(), 0);
        assert_eq!(comp.config().port, info.address.port());
    }

    #[tokio::test]
    async fn stop_before_start_is_rejected() {
        let mut comp = component(0);
        comp.init().unwrap();
        assert!(matches!(comp.stop(), Err(ServerError::NotStarted(_))));
        let deadline = Instant::now() + std::time::Duration::from_millis(10);
        assert!(matches!(comp.graceful_stop(deadline).await, Err(ServerError::NotStarted(_))));
    }

    #[tokio::test]
    async fn start_requires_init() {
        let comp = component(0);
        assert!(matches!(comp.start().await, Err(ServerError::NotInitialized(_))));
    }

    #[test]
    fn bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut comp = component(taken.local_addr().unwrap().port());
        let err = comp.init().unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.is_fatal());
    }
}
