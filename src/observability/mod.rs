//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Interceptors produce:
//!     → logging.rs (access, slow and error records via `tracing`)
//!     → metrics.rs (handle latency and totals via `metrics`)
//!     → tracing.rs (OpenTelemetry server spans)
//! ```
//!
//! # Design Decisions
//! - Each sink is installed by the embedding application; the interceptors
//!   only emit
//! - Server spans are recorded only once a tracer provider is registered

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use self::logging::init_logging;
pub use self::metrics::init_metrics;
pub use self::tracing::{is_global_tracer_registered, register_tracer_provider};
