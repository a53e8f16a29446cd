//! Interceptor chain behaviour through the built router.

mod common;

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use tracing::Level;

use common::capture_logs;
use rest_server::config::CaptureFlags;
use rest_server::http::{Container, Fault, FilterContext, RequestContext, RequestDeadline};
use rest_server::ServerConfig;

fn config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    }
}

async fn hello(mut ctx: RequestContext) -> Response {
    let ip = ctx.client_ip();
    ctx.write(StatusCode::OK, &json!({ "client_ip": ip }))
}

async fn explode() -> &'static str {
    panic!("handler exploded")
}

async fn failing() -> Result<&'static str, Fault> {
    Err(Fault::msg("database unreachable"))
}

async fn sleepy() -> &'static str {
    tokio::time::sleep(Duration::from_millis(200)).await;
    "done"
}

async fn echo(mut ctx: RequestContext) -> Response {
    match ctx.bind::<Order>().await {
        Ok(order) => ctx.write(StatusCode::OK, &order),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    item: String,
}

fn router(config: ServerConfig) -> Router {
    let mut container = Container::with_config(config);
    container
        .get("/hello", hello)
        .unwrap()
        .get("/panic", explode)
        .unwrap()
        .get("/fail", failing)
        .unwrap()
        .get("/sleep", sleepy)
        .unwrap()
        .post("/echo", echo)
        .unwrap();
    container.build().router()
}

fn get(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn success_emits_one_access_record() {
    let (logs, _guard) = capture_logs();
    let response = router(config()).oneshot(get("/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let records = logs.access("access");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.level, Level::INFO);
    assert_eq!(record.field("event"), Some("normal"));
    assert_eq!(record.field("code"), Some("200"));
    assert_eq!(record.field("route"), Some("/hello"));
    assert_eq!(record.field("method"), Some("GET./hello"));
    assert!(logs.access("slow").is_empty());
}

#[tokio::test]
async fn access_log_can_be_disabled() {
    let (logs, _guard) = capture_logs();
    let config = ServerConfig {
        enable_access_interceptor: false,
        ..config()
    };
    let response = router(config).oneshot(get("/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(logs.access("access").is_empty());
}

#[tokio::test]
async fn panic_is_answered_500_with_error_record() {
    let (logs, _guard) = capture_logs();
    let response = router(config()).oneshot(get("/panic")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body(response).await.is_empty());

    let records = logs.access("access");
    assert_eq!(records.len(), 1, "error record replaces the access record");
    let record = &records[0];
    assert_eq!(record.level, Level::ERROR);
    assert_eq!(record.field("event"), Some("recover"));
    assert_eq!(record.field("code"), Some("500"));
    assert!(record.field("error").unwrap().contains("handler exploded"));
    assert!(!record.field("stack").unwrap().is_empty());
}

#[tokio::test]
async fn panic_under_deadline_is_recovered() {
    let (logs, _guard) = capture_logs();
    let config = ServerConfig {
        context_timeout_ms: 1_000,
        ..config()
    };
    let response = router(config).oneshot(get("/panic")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let records = logs.access("access");
    assert_eq!(records.len(), 1);
    assert!(records[0].field("error").unwrap().contains("handler exploded"));
}

#[tokio::test]
async fn fault_result_is_answered_500() {
    let (logs, _guard) = capture_logs();
    let response = router(config()).oneshot(get("/fail")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let records = logs.access("access");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].level, Level::ERROR);
    assert_eq!(records[0].field("error"), Some("database unreachable"));
}

#[tokio::test]
async fn slow_requests_are_warned() {
    let (logs, _guard) = capture_logs();
    let config = ServerConfig {
        slow_log_threshold_ms: 20,
        ..config()
    };
    let response = router(config).oneshot(get("/sleep")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let slow = logs.access("slow");
    assert_eq!(slow.len(), 1);
    assert_eq!(slow[0].level, Level::WARN);
    assert_eq!(logs.access("access").len(), 1);
}

#[tokio::test]
async fn deadline_answers_504_early() {
    let config = ServerConfig {
        context_timeout_ms: 50,
        ..config()
    };
    let started = Instant::now();
    let response = router(config).oneshot(get("/sleep")).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_millis(180));
    assert_eq!(body(response).await, b"request deadline exceeded");
}

#[tokio::test]
async fn existing_deadline_is_kept() {
    let config = ServerConfig {
        context_timeout_ms: 20,
        ..config()
    };
    let router = router(config).layer(from_fn(|mut req: Request, next: Next| async move {
        let (deadline, _cancel) = RequestDeadline::after(Duration::from_secs(5));
        req.extensions_mut().insert(deadline);
        next.run(req).await
    }));

    let response = router.oneshot(get("/sleep")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn forwarded_client_ip_is_used() {
    let (logs, _guard) = capture_logs();
    let request = Request::builder()
        .uri("/hello")
        .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
        .body(Body::empty())
        .unwrap();
    let response = router(config()).oneshot(request).await.unwrap();

    let value: Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(value["client_ip"], "203.0.113.7");
    assert_eq!(logs.access("access")[0].field("ip"), Some("203.0.113.7"));
}

#[tokio::test]
async fn msgpack_round_trip() {
    let order = Order {
        id: 7,
        item: "coffee".into(),
    };
    let request = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, "application/x-msgpack")
        .header(header::ACCEPT, "application/x-msgpack")
        .body(Body::from(rmp_serde::to_vec_named(&order).unwrap()))
        .unwrap();
    let response = router(config()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-msgpack");

    let decoded: Order = rmp_serde::from_slice(&body(response).await).unwrap();
    assert_eq!(decoded, order);
}

#[tokio::test]
async fn json_binding_and_unsupported_media() {
    let request = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"id":1,"item":"tea"}"#))
        .unwrap();
    let response = router(config()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value: Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(value, json!({ "id": 1, "item": "tea" }));

    let request = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("tea"))
        .unwrap();
    let response = router(config()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn request_capture_attaches_payload() {
    let (logs, _guard) = capture_logs();
    let config = config();
    config.access_log_capture.store(CaptureFlags {
        request_body: true,
        response_body: true,
    });
    let request = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"id":2,"item":"milk"}"#))
        .unwrap();
    let response = router(config).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(logs.access("access").is_empty(), "record waits for the response body");
    body(response).await;

    let record = &logs.access("access")[0];
    let req: Value = serde_json::from_str(record.field("req").unwrap()).unwrap();
    assert_eq!(req["payload"], r#"{"id":2,"item":"milk"}"#);
    let res: Value = serde_json::from_str(record.field("res").unwrap()).unwrap();
    assert!(res["payload"].as_str().unwrap().contains("milk"));
}

#[tokio::test]
async fn response_capture_streams_chunks_through() {
    let (logs, _guard) = capture_logs();
    let config = config();
    config.access_log_capture.store(CaptureFlags {
        request_body: false,
        response_body: true,
    });
    let (tx, rx) = mpsc::unbounded_channel::<&'static str>();
    let rx = Arc::new(Mutex::new(Some(rx)));
    let mut container = Container::with_config(config);
    container
        .get("/events", move || {
            let rx = rx.lock().unwrap().take().expect("one request only");
            async move {
                let chunks = stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
                });
                Body::from_stream(chunks)
            }
        })
        .unwrap();

    let response = container.build().router().oneshot(get("/events")).await.unwrap();
    let mut frames = response.into_body().into_data_stream();

    tx.send("first;").unwrap();
    let first = tokio::time::timeout(Duration::from_secs(1), frames.next())
        .await
        .expect("first chunk held back")
        .unwrap()
        .unwrap();
    assert_eq!(&first[..], b"first;");
    assert!(logs.access("access").is_empty());

    tx.send("second").unwrap();
    drop(tx);
    let rest: Vec<_> = frames.collect().await;
    assert_eq!(rest.len(), 1);

    let records = logs.access("access");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].field("size"), Some("12"));
    let res: Value = serde_json::from_str(records[0].field("res").unwrap()).unwrap();
    assert_eq!(res["payload"], "first;second");
}

#[tokio::test]
async fn terminated_responses_skip_capture() {
    let (logs, _guard) = capture_logs();
    let config = ServerConfig {
        context_timeout_ms: 50,
        ..config()
    };
    config.access_log_capture.store(CaptureFlags {
        request_body: false,
        response_body: true,
    });
    let response = router(config).oneshot(get("/sleep")).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    let records = logs.access("access");
    assert_eq!(records.len(), 1, "logged without waiting for the body");
    assert_eq!(records[0].field("code"), Some("504"));
    assert_eq!(records[0].field("res"), Some(""));
}

#[tokio::test]
async fn filters_run_in_registration_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut container = Container::with_config(config());
    container.get("/hello", hello).unwrap();
    for name in ["first", "second"] {
        let order = Arc::clone(&order);
        container.filter(move |ctx: FilterContext| {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(name);
                ctx.process_filter().await
            }
        });
    }

    let response = container.build().router().oneshot(get("/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[tokio::test]
async fn filter_can_abort() {
    let mut container = Container::with_config(config());
    container.get("/hello", hello).unwrap();
    container.filter(|ctx: FilterContext| async move {
        if ctx.ctx().headers().contains_key("x-token") {
            ctx.process_filter().await
        } else {
            ctx.abort(StatusCode::UNAUTHORIZED.into_response())
        }
    });
    let router = container.build().router();

    let response = router.clone().oneshot(get("/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/hello")
        .header("x-token", "t")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn gzip_compresses_responses() {
    let mut container = Container::with_config(ServerConfig {
        enable_gzip: true,
        ..config()
    });
    container.get("/big", || async { "x".repeat(4096) }).unwrap();

    let request = Request::builder()
        .uri("/big")
        .header(header::ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let response = container.build().router().oneshot(request).await.unwrap();
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
}
