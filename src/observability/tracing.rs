//! Distributed tracing support.
//!
//! # Responsibilities
//! - Register the process-wide OpenTelemetry tracer provider
//! - Report whether one was registered (the trace interceptor is a no-op otherwise)
//! - Extract trace context from incoming request headers
//!
//! # Design Decisions
//! - The exporter and propagator are chosen by the embedding application
//! - The global tracer API cannot tell a no-op provider from a real one, so
//!   registration goes through [`register_tracer_provider`]

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::HeaderMap;
use opentelemetry::global;
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::{Span, Tracer, TracerProvider};

/// Instrumentation scope of server spans.
pub const TRACER_NAME: &str = "rest-server";

static REGISTERED: AtomicBool = AtomicBool::new(false);

/// Install `provider` as the global tracer provider.
pub fn register_tracer_provider<P, T, S>(provider: P)
where
    S: Span + Send + Sync + 'static,
    T: Tracer<Span = S> + Send + Sync + 'static,
    P: TracerProvider<Tracer = T> + Send + Sync + 'static,
{
    global::set_tracer_provider(provider);
    REGISTERED.store(true, Ordering::Release);
    tracing::info!(tracer = TRACER_NAME, "Global tracer provider registered");
}

pub fn is_global_tracer_registered() -> bool {
    REGISTERED.load(Ordering::Acquire)
}

/// Reads propagation fields from request headers.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Parent context carried by `headers`, per the global propagator.
pub fn extract_context(headers: &HeaderMap) -> opentelemetry::Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}
