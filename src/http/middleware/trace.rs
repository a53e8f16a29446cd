//! Server span interceptor.
//!
//! Opens one server-kind span per request, parented on the context the
//! client propagated, and reports the trace id back in a response header.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::trace::{SpanBuilder, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{global, KeyValue};

use crate::http::context::{client_ip_of, route_of, TraceContext};
use crate::observability::tracing::{extract_context, is_global_tracer_registered, TRACER_NAME};

#[derive(Debug, Clone)]
pub struct TraceState {
    pub trace_id_header: HeaderName,
}

pub async fn trace_middleware(
    State(state): State<Arc<TraceState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if !is_global_tracer_registered() {
        return next.run(req).await;
    }

    let parent = extract_context(req.headers());
    let route = route_of(&req);
    let method = req.method().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let client_ip = client_ip_of(&mut req);

    let attributes = vec![
        KeyValue::new("rpc.system", "http"),
        KeyValue::new("http.url", req.uri().to_string()),
        KeyValue::new("http.target", req.uri().path().to_string()),
        KeyValue::new("http.method", method.clone()),
        KeyValue::new("http.user_agent", user_agent),
        KeyValue::new("http.client_ip", client_ip),
        KeyValue::new("http.full_path", route.clone()),
    ];
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer.build_with_context(
        SpanBuilder::from_name(format!("{method}.{route}"))
            .with_kind(SpanKind::Server)
            .with_attributes(attributes),
        &parent,
    );
    let cx = parent.with_span(span);
    let trace = TraceContext(cx.clone());
    let trace_id = trace.trace_id();
    req.extensions_mut().insert(trace);

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        if !trace_id.is_empty() {
            response
                .headers_mut()
                .insert(state.trace_id_header.clone(), value);
        }
    }

    let status = response.status();
    let span = cx.span();
    span.set_attribute(KeyValue::new("http.status_code", i64::from(status.as_u16())));
    if status.is_server_error() {
        span.set_status(Status::error(status.to_string()));
    }
    span.end();

    response
}
