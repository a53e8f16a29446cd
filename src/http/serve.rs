//! Accept loop and per-connection serving.
//!
//! # Responsibilities
//! - Accept TCP connections until told to stop
//! - Serve each connection with hyper (HTTP/1.1, HTTP/2, upgrades)
//! - Apply the header-read, body-read and write timeouts
//! - Drain or abort connections on the stop signal
//!
//! # Design Decisions
//! - One watch channel carries the stop signal to the loop and every connection
//! - `Drain` lets in-flight requests finish; `Close` drops the connection
//! - Each connection holds a tracker guard so graceful stop can wait for it
//! - Read limits cover receiving the request only: the head through hyper's
//!   `header_read_timeout` (falling back to the read timeout), the body
//!   through a deadline on its frames. A handler may take as long as it needs.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::Router;
use futures_util::StreamExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tower::ServiceExt;

use crate::net::{ConnectionGuard, ConnectionTracker, TimeoutIo};

/// What the accept loop and the connections should be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSignal {
    Serve,
    /// Stop accepting; finish in-flight requests, then close.
    Drain,
    /// Stop accepting and drop every connection now.
    Close,
}

/// Per-connection I/O limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServeOptions {
    pub read_header_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Wait until the signal moves away from `current`.
///
/// A dropped sender counts as `Drain` for serving connections.
async fn next_signal(rx: &mut watch::Receiver<ServeSignal>, current: ServeSignal) -> ServeSignal {
    loop {
        let value = *rx.borrow_and_update();
        if value != current {
            return value;
        }
        if rx.changed().await.is_err() {
            if current == ServeSignal::Serve {
                return ServeSignal::Drain;
            }
            std::future::pending::<()>().await;
        }
    }
}

/// Serve `router` on `listener` until the signal leaves `Serve`.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    options: ServeOptions,
    tracker: ConnectionTracker,
    mut signal: watch::Receiver<ServeSignal>,
) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "HTTP server starting");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            stop = next_signal(&mut signal, ServeSignal::Serve) => {
                tracing::info!(address = %local_addr, signal = ?stop, "HTTP server stopped accepting");
                break;
            }
        };

        let (stream, remote_addr) = match accepted {
            Ok(conn) => conn,
            Err(err) if is_connection_error(&err) => continue,
            Err(err) => {
                tracing::error!(error = %err, "Accept error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let guard = tracker.track();
        tracing::trace!(connection_id = %guard.id(), remote = %remote_addr, "Connection accepted");
        tokio::spawn(serve_connection(
            stream,
            remote_addr,
            router.clone(),
            options,
            signal.clone(),
            guard,
        ));
    }

    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    router: Router,
    options: ServeOptions,
    mut signal: watch::Receiver<ServeSignal>,
    guard: ConnectionGuard,
) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::trace!(error = %err, "Failed to set TCP_NODELAY");
    }
    let io = TokioIo::new(TimeoutIo::new(stream, options.write_timeout));

    let read_timeout = options.read_timeout;
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(remote_addr));
        let req = match read_timeout {
            Some(timeout) => req.map(|body| read_within(Body::new(body), Instant::now() + timeout)),
            None => req.map(Body::new),
        };
        router.clone().oneshot(req)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    if let Some(timeout) = options.read_header_timeout.or(options.read_timeout) {
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(timeout);
    }

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let mut state = ServeSignal::Serve;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(connection_id = %guard.id(), error = %err, "Connection error");
                }
                break;
            }
            next = next_signal(&mut signal, state) => match next {
                ServeSignal::Drain => {
                    conn.as_mut().graceful_shutdown();
                    state = ServeSignal::Drain;
                }
                ServeSignal::Close => {
                    tracing::debug!(connection_id = %guard.id(), "Connection aborted");
                    break;
                }
                ServeSignal::Serve => state = ServeSignal::Serve,
            }
        }
    }
}

/// Fail the request body if it is not fully received by `deadline`.
fn read_within(body: Body, deadline: Instant) -> Body {
    if body.is_end_stream() {
        return body;
    }
    let frames = body.into_data_stream();
    let stream = futures_util::stream::unfold(Some(frames), move |frames| async move {
        let mut frames = frames?;
        match tokio::time::timeout_at(deadline, frames.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(frames))),
            Ok(None) => None,
            Err(_) => {
                let err = io::Error::new(io::ErrorKind::TimedOut, "request body read timed out");
                Some((Err(axum::Error::new(err)), None))
            }
        }
    });
    Body::from_stream(stream)
}

/// Errors that concern one connection only, as opposed to the listener.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_signal_reports_changes() {
        let (tx, mut rx) = watch::channel(ServeSignal::Serve);
        tx.send_replace(ServeSignal::Drain);
        assert_eq!(next_signal(&mut rx, ServeSignal::Serve).await, ServeSignal::Drain);

        tx.send_replace(ServeSignal::Close);
        assert_eq!(next_signal(&mut rx, ServeSignal::Drain).await, ServeSignal::Close);
    }

    #[tokio::test]
    async fn stalled_body_read_times_out() {
        let stalled = Body::from_stream(futures_util::stream::pending::<Result<axum::body::Bytes, io::Error>>());
        let body = read_within(stalled, Instant::now() + Duration::from_millis(20));
        assert!(axum::body::to_bytes(body, usize::MAX).await.is_err());
    }

    #[tokio::test]
    async fn body_read_within_deadline_passes() {
        let body = read_within(Body::from("payload"), Instant::now() + Duration::from_secs(1));
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"payload");
    }

    #[tokio::test]
    async fn dropped_sender_drains() {
        let (tx, mut rx) = watch::channel(ServeSignal::Serve);
        drop(tx);
        assert_eq!(next_signal(&mut rx, ServeSignal::Serve).await, ServeSignal::Drain);
    }
}
