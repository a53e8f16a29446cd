//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the component from its container
//! - Bind its listener before any traffic is served
//!
//! # Design Decisions
//! - Fail fast: a bind failure is fatal and logged as such
//! - The component is shared only after `init`, so route comments and the
//!   resolved port are settled by then

use std::sync::Arc;

use crate::error::ServerError;
use crate::http::{Component, Container};

/// Build and bind. Route comments are attached before binding.
pub fn prepare<F>(container: Container, configure: F) -> Result<Arc<Component>, ServerError>
where
    F: FnOnce(&mut Component),
{
    let mut component = container.build();
    configure(&mut component);

    if let Err(err) = component.init() {
        if err.is_fatal() {
            tracing::error!(name = %component.name(), error = %err, "Component initialization failed, aborting");
        }
        return Err(err);
    }
    Ok(Arc::new(component))
}
