//! Demo server.
//!
//! Serves a small API through the component and its interceptors:
//!
//! ```text
//! GET  /hello          greeting with the resolved client IP
//! POST /echo           decodes JSON or MessagePack and writes it back
//! GET  /slow?ms=N      sleeps N ms, giving up at the request deadline
//! GET  /panic          panics; answered 500 by the recovery interceptor
//! GET  /ws             WebSocket echo
//! ```
//!
//! With `--config`, settings come from the table at `--key` of a TOML file,
//! and body capture for the access log follows edits to that file.

use std::path::PathBuf;
use std::time::Duration;

use axum::extract::ws::Message;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;

use rest_server::config::ConfigWatcher;
use rest_server::http::{Container, FilterContext, RequestContext, UpgradeError, WebSocketConn};
use rest_server::lifecycle::{self, Shutdown};
use rest_server::observability::{init_logging, init_metrics};

#[derive(Parser, Debug)]
#[command(name = "rest-server", about = "Demo HTTP server component")]
struct Args {
    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Table of the config file holding the server settings.
    #[arg(short, long, default_value = "server.http")]
    key: String,

    /// Port used when no config file is given.
    #[arg(short, long, default_value_t = 9090)]
    port: u16,

    /// Prometheus scrape address, e.g. 127.0.0.1:9100.
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,

    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Seconds allowed for in-flight requests at shutdown.
    #[arg(long, default_value_t = 10)]
    grace_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SlowQuery {
    #[serde(default)]
    ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging("rest_server=info,access=info", args.json_logs)?;

    tracing::info!("rest-server v{} starting", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = args.metrics_addr {
        init_metrics(addr)?;
    }

    let mut container = match &args.config {
        Some(path) => Container::load(path, &args.key)?,
        None => Container::new().with_name("demo").with_port(args.port),
    };
    let capture = container.config().access_log_capture.clone();

    let websocket = container.websocket();
    container
        .get("/hello", hello)?
        .post("/echo", echo)?
        .get("/slow", slow)?
        .get("/panic", explode)?
        .get("/ws", move |ctx: RequestContext| {
            let websocket = websocket.clone();
            async move { websocket.upgrade(ctx, echo_socket).await }
        })?;
    container.filter(served_by);

    let component = lifecycle::prepare(container, |component| {
        component.register_route_comment(Method::GET, "/hello", "greeting");
        component.register_route_comment(Method::POST, "/echo", "codec round trip");
        component.register_route_comment(Method::GET, "/ws", "websocket echo");
    })?;

    // Dropping the watcher stops it, so it lives until main returns.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, &args.key);
            tokio::spawn(capture.follow(updates));
            Some(watcher.run()?)
        }
        None => None,
    };

    let shutdown = Shutdown::new();
    shutdown.trigger_on_signal();
    lifecycle::run(component, &shutdown, Duration::from_secs(args.grace_secs)).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn hello(mut ctx: RequestContext) -> Response {
    let ip = ctx.client_ip();
    ctx.write(StatusCode::OK, &json!({ "message": "hello", "client_ip": ip }))
}

async fn echo(mut ctx: RequestContext) -> Response {
    match ctx.bind::<serde_json::Value>().await {
        Ok(value) => ctx.write(StatusCode::OK, &value),
        Err(err) => err.into_response(),
    }
}

async fn slow(ctx: RequestContext) -> Response {
    let query = match ctx.bind_query::<SlowQuery>() {
        Ok(query) => query,
        Err(err) => return err.into_response(),
    };
    let sleep = tokio::time::sleep(Duration::from_millis(query.ms));
    match ctx.deadline() {
        Some(deadline) => tokio::select! {
            _ = sleep => {}
            _ = deadline.cancelled() => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
        },
        None => sleep.await,
    }
    ctx.write(StatusCode::OK, &json!({ "slept_ms": query.ms }))
}

async fn explode() -> Response {
    panic!("demo panic")
}

async fn echo_socket(conn: Result<WebSocketConn, UpgradeError>) {
    let mut conn = match conn {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!(error = %err, "WebSocket upgrade refused");
            return;
        }
    };
    while let Some(Ok(message)) = conn.socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
        if conn.socket.send(message).await.is_err() {
            break;
        }
    }
}

async fn served_by(ctx: FilterContext) -> Response {
    let mut response = ctx.process_filter().await;
    response
        .headers_mut()
        .insert("x-served-by", HeaderValue::from_static("rest-server"));
    response
}
