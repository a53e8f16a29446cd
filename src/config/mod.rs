//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (select table by key, deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated)
//!     → Container / Component
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → AccessLogCapture::follow applies the body-capture toggles
//! ```
//!
//! # Design Decisions
//! - Everything except the access-log capture toggles is fixed once the
//!   component is initialized
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{AccessLogCapture, CaptureFlags, ServerConfig};
pub use watcher::ConfigWatcher;
