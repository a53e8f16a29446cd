//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Component::init
//!     → listener.rs (bind, resolve ephemeral port)
//! Component::start
//!     → accept loop (http/serve.rs)
//!     → connection.rs (tracking guard, write deadline)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Each connection tracked for graceful shutdown
//! - The write inactivity timeout lives on the socket; read limits apply
//!   to the request head (hyper) and body (http/serve.rs)

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker, TimeoutIo};
pub use listener::{local_main_ip, Listener, ListenerError};
