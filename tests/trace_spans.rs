//! Server spans with a registered tracer provider.

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tower::ServiceExt;

use rest_server::http::{Container, RequestContext};
use rest_server::observability::{is_global_tracer_registered, register_tracer_provider};
use rest_server::ServerConfig;

async fn traced(ctx: RequestContext) -> String {
    ctx.trace_context()
        .map(|trace| trace.trace_id())
        .unwrap_or_default()
}

#[tokio::test]
async fn trace_id_is_reported_in_header() {
    register_tracer_provider(SdkTracerProvider::builder().build());
    assert!(is_global_tracer_registered());

    let mut container = Container::with_config(ServerConfig {
        trace_id_header: "x-trace-id".into(),
        ..ServerConfig::default()
    });
    container.get("/traced", traced).unwrap();
    container.get("/broken", || async { StatusCode::BAD_GATEWAY }).unwrap();
    let router = container.build().router();

    let request = Request::builder().uri("/traced").body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let header = response.headers()["x-trace-id"].to_str().unwrap().to_string();
    assert_eq!(header.len(), 32);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body, header.as_bytes());

    let request = Request::builder().uri("/broken").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers().contains_key("x-trace-id"));
}

#[tokio::test]
async fn propagated_parent_keeps_trace_id() {
    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );
    register_tracer_provider(SdkTracerProvider::builder().build());

    let mut container = Container::new();
    container.get("/traced", traced).unwrap();
    let router = container.build().router();

    let request = Request::builder()
        .uri("/traced")
        .header("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers()["x-trace-id"],
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );
}
