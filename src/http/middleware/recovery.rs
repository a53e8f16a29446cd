//! Panic recovery and access logging.
//!
//! # Responsibilities
//! - Catch panics and handler faults from the rest of the chain
//! - Answer them with one 500, never re-panicking
//! - Emit the per-request "access" record and the "slow" warning
//! - Capture request/response payloads for the log when enabled
//!
//! # Design Decisions
//! - Outermost interceptor, so its record covers the whole chain
//! - Both bodies are tee'd as they stream, so capture never buffers a whole
//!   payload; with response capture on, the access record is emitted once the
//!   response body finishes or is dropped
//! - Responses cut short by an interceptor (`ChainTerminated`) are logged
//!   without a response payload
//! - Stacks are recorded by a process-wide panic hook that stays silent
//!   inside a recovery scope and defers to the previous hook elsewhere

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Once};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes, HttpBody};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::config::AccessLogCapture;
use crate::http::context::{client_ip_of, is_terminated, peer_ip_of, route_of};
use crate::http::fault::{trim_stack, Fault};

/// Payload kept per body for the access log.
const CAPTURE_LIMIT: usize = 64 * 1024;

thread_local! {
    static SCOPE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install the stack-recording panic hook once per process.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if SCOPE_DEPTH.with(Cell::get) > 0 {
                record_panic_stack();
            } else {
                previous(info);
            }
        }));
    });
}

#[inline(never)]
fn record_panic_stack() {
    let stack = trim_stack(&Backtrace::force_capture().to_string());
    PANIC_STACK.with(|slot| *slot.borrow_mut() = Some(stack));
}

struct ScopeGuard;

impl ScopeGuard {
    fn enter() -> Self {
        SCOPE_DEPTH.with(|d| d.set(d.get() + 1));
        ScopeGuard
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Future adapter turning a panic in `F` into a [`Fault`].
pub struct Recover<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Recover<F> {
    pub fn new(inner: F) -> Self {
        install_panic_hook();
        Self { inner: Box::pin(inner) }
    }
}

impl<F: Future> Future for Recover<F> {
    type Output = Result<F::Output, Fault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        let polled = {
            let _scope = ScopeGuard::enter();
            panic::catch_unwind(AssertUnwindSafe(move || inner.poll(cx)))
        };
        match polled {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => {
                let stack = PANIC_STACK.with(|slot| slot.borrow_mut().take());
                Poll::Ready(Err(Fault::from_panic(payload, stack)))
            }
        }
    }
}

/// Settings of the recovery interceptor.
#[derive(Debug, Clone)]
pub struct RecoveryState {
    pub access_log: bool,
    pub slow_threshold: Option<Duration>,
    pub capture: AccessLogCapture,
    pub trace_id_header: HeaderName,
}

/// Fields shared by the access and slow records.
struct AccessRecord {
    method: String,
    route: String,
    uri: String,
    ip: String,
    peer_ip: String,
    size: u64,
    cost: Duration,
    tid: String,
    code: u16,
    req: Option<Value>,
    res: Option<Value>,
}

macro_rules! access_event {
    ($level:expr, $record:expr, $event:expr, $message:literal $(, $key:ident = $value:expr)*) => {{
        let record = &$record;
        let req = record.req.as_ref().map(serde_json::Value::to_string).unwrap_or_default();
        let res = record.res.as_ref().map(serde_json::Value::to_string).unwrap_or_default();
        tracing::event!(
            target: "access",
            $level,
            r#type = "http",
            method = %record.method,
            route = %record.route,
            addr = %record.uri,
            ip = %record.ip,
            peer_ip = %record.peer_ip,
            size = record.size,
            cost_ms = record.cost.as_secs_f64() * 1000.0,
            tid = %record.tid,
            code = record.code,
            event = $event,
            req = %req,
            res = %res,
            $($key = %$value,)*
            $message
        )
    }};
}

pub async fn recovery_middleware(
    State(state): State<Arc<RecoveryState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let flags = state.capture.load();

    let ip = client_ip_of(&mut req);
    let peer_ip = peer_ip_of(&req);
    let route = route_of(&req);
    let method = format!("{}.{}", req.method(), route);
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let req_headers = flags.request_body.then(|| headers_json(req.headers()));

    let payload = Arc::new(Mutex::new(Vec::new()));
    let req = tee_request(req, Arc::clone(&payload));

    let outcome = match Recover::new(next.run(req)).await {
        Ok(response) => match response.extensions().get::<Fault>().cloned() {
            Some(fault) => Err((fault, Some(response))),
            None => Ok(response),
        },
        Err(fault) => Err((fault, None)),
    };

    let mut record = AccessRecord {
        method,
        route,
        uri,
        ip,
        peer_ip,
        size: 0,
        cost: Duration::ZERO,
        tid: String::new(),
        code: 0,
        req: req_headers.map(|metadata| {
            let captured = payload.lock().expect("request capture lock poisoned");
            let text = String::from_utf8_lossy(&captured).into_owned();
            json!({ "metadata": metadata, "payload": text })
        }),
        res: None,
    };

    match outcome {
        Ok(response) => {
            record.cost = started.elapsed();
            record.size = response_size(&response);
            record.tid = trace_id(&state.trace_id_header, response.headers());
            record.code = response.status().as_u16();
            log_slow(&state, &record);
            if !state.access_log {
                return response;
            }
            if flags.response_body && !is_terminated(&response) {
                return tee_response(response, record);
            }
            access_event!(tracing::Level::INFO, record, "normal", "access");
            response
        }
        Err((fault, original)) => recovered(&state, record, started, fault, original),
    }
}

/// Failure path: one 500 and one error record.
fn recovered(
    state: &RecoveryState,
    mut record: AccessRecord,
    started: Instant,
    fault: Fault,
    original: Option<Response>,
) -> Response {
    let mut response = if fault.is_dead_connection() {
        (StatusCode::INTERNAL_SERVER_ERROR, fault.to_string()).into_response()
    } else {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    };
    if let Some(value) = original
        .as_ref()
        .and_then(|r| r.headers().get(&state.trace_id_header))
    {
        response
            .headers_mut()
            .insert(state.trace_id_header.clone(), value.clone());
    }

    record.cost = started.elapsed();
    record.size = response_size(&response);
    record.tid = trace_id(&state.trace_id_header, response.headers());
    record.code = response.status().as_u16();

    log_slow(state, &record);
    access_event!(
        tracing::Level::ERROR,
        record,
        "recover",
        "access",
        error = fault,
        stack = fault.stack()
    );
    response
}

fn log_slow(state: &RecoveryState, record: &AccessRecord) {
    if let Some(threshold) = state.slow_threshold {
        if record.cost > threshold {
            access_event!(tracing::Level::WARN, *record, "normal", "slow");
        }
    }
}

fn tee_request(req: Request, sink: Arc<Mutex<Vec<u8>>>) -> Request {
    let (parts, body) = req.into_parts();
    let stream = body.into_data_stream().inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            let mut captured = sink.lock().expect("request capture lock poisoned");
            let room = CAPTURE_LIMIT.saturating_sub(captured.len());
            captured.extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
    });
    Request::from_parts(parts, Body::from_stream(stream))
}

/// Holds the access record of a captured response until its body is done.
struct ResponseCapture {
    record: AccessRecord,
    metadata: Value,
    captured: Vec<u8>,
    sent: u64,
}

impl ResponseCapture {
    fn push(&mut self, bytes: &Bytes) {
        self.sent += bytes.len() as u64;
        let room = CAPTURE_LIMIT.saturating_sub(self.captured.len());
        self.captured.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }
}

impl Drop for ResponseCapture {
    fn drop(&mut self) {
        let payload = String::from_utf8_lossy(&self.captured).into_owned();
        self.record.res = Some(json!({
            "metadata": std::mem::take(&mut self.metadata),
            "payload": payload,
        }));
        self.record.size = self.sent;
        access_event!(tracing::Level::INFO, self.record, "normal", "access");
    }
}

fn tee_response(response: Response, record: AccessRecord) -> Response {
    let (mut parts, body) = response.into_parts();
    // The stream wrapper loses the exact size hint; keep the framing.
    if let Some(len) = body.size_hint().exact().filter(|len| *len > 0) {
        parts
            .headers
            .entry(header::CONTENT_LENGTH)
            .or_insert_with(|| HeaderValue::from(len));
    }
    let mut capture = ResponseCapture {
        metadata: headers_json(&parts.headers),
        record,
        captured: Vec::new(),
        sent: 0,
    };
    let stream = body.into_data_stream().inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            capture.push(bytes);
        }
    });
    Response::from_parts(parts, Body::from_stream(stream))
}

fn response_size(response: &Response) -> u64 {
    response.body().size_hint().exact().unwrap_or_else(|| {
        response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    })
}

fn trace_id(name: &HeaderName, headers: &HeaderMap) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn headers_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for name in headers.keys() {
        let values: Vec<Value> = headers
            .get_all(name)
            .iter()
            .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        map.insert(name.as_str().to_string(), Value::Array(values));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recover_catches_panics_with_stack() {
        let result = Recover::new(async {
            tokio::task::yield_now().await;
            panic!("handler exploded");
        })
        .await;
        let fault = result.unwrap_err();
        assert_eq!(fault.message(), "handler exploded");
        assert!(!fault.stack().is_empty());
        assert!(!fault.stack().contains("record_panic_stack"));
    }

    #[tokio::test]
    async fn recover_passes_output_through() {
        let value = Recover::new(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn response_capture_is_bounded() {
        let record = AccessRecord {
            method: "GET./big".into(),
            route: "/big".into(),
            uri: "/big".into(),
            ip: String::new(),
            peer_ip: String::new(),
            size: 0,
            cost: Duration::ZERO,
            tid: String::new(),
            code: 200,
            req: None,
            res: None,
        };
        let mut capture = ResponseCapture {
            record,
            metadata: Value::Null,
            captured: Vec::new(),
            sent: 0,
        };
        capture.push(&Bytes::from(vec![b'x'; CAPTURE_LIMIT]));
        capture.push(&Bytes::from_static(b"tail"));
        assert_eq!(capture.captured.len(), CAPTURE_LIMIT);
        assert_eq!(capture.sent, CAPTURE_LIMIT as u64 + 4);
    }

    #[test]
    fn headers_keep_every_value() {
        let mut headers = HeaderMap::new();
        headers.append("accept", "a".parse().unwrap());
        headers.append("accept", "b".parse().unwrap());
        assert_eq!(headers_json(&headers), json!({ "accept": ["a", "b"] }));
    }
}
