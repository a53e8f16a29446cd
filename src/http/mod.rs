//! HTTP server subsystem.
//!
//! # Data Flow
//! ```text
//! Container (routes, filters, config)
//!     → build: middleware/ interceptors wrap the router
//!     → server.rs Component (init binds, start serves)
//!     → serve.rs accept loop, one hyper connection per socket
//!     → context.rs RequestContext / FilterContext in handlers and filters
//!     → websocket.rs for upgraded routes
//! ```

pub mod binding;
pub mod container;
pub mod context;
pub mod deadline;
pub mod fault;
pub mod forwarded;
pub mod middleware;
pub mod serve;
pub mod server;
pub mod websocket;

pub use binding::{BindingError, Codec};
pub use container::Container;
pub use context::{FilterContext, RequestContext};
pub use deadline::RequestDeadline;
pub use fault::Fault;
pub use server::{Component, ServiceInfo, ServiceKind};
pub use websocket::{UpgradeError, WebSocket, WebSocketConn};
