//! Handler failures.
//!
//! Route handlers return `Result<_, Fault>`. Any error converts into a
//! [`Fault`] with `?`, capturing a stack trace at the conversion site. Caught
//! panics become faults too, so the recovery interceptor treats both the same
//! way: one 500 response and one error record.

use std::any::Any;
use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// How a fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Returned as an error value.
    Error,
    /// Caught while unwinding.
    Panic,
}

#[derive(Debug)]
struct Inner {
    kind: FaultKind,
    message: String,
    io_kind: Option<io::ErrorKind>,
    stack: String,
}

/// An unexpected failure inside the chain, cheap to clone.
#[derive(Debug, Clone)]
pub struct Fault(Arc<Inner>);

const DEAD_CONNECTION_PHRASES: &[&str] = &["broken pipe", "connection reset by peer"];

impl Fault {
    /// Fault from any error, capturing the current stack.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let io_kind = io_error_kind(&error);
        Self(Arc::new(Inner {
            kind: FaultKind::Error,
            message: error_chain(&error),
            io_kind,
            stack: trim_stack(&Backtrace::force_capture().to_string()),
        }))
    }

    /// Fault from a plain message, capturing the current stack.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(Inner {
            kind: FaultKind::Error,
            message: message.into(),
            io_kind: None,
            stack: trim_stack(&Backtrace::force_capture().to_string()),
        }))
    }

    /// Fault from a panic payload and the stack recorded when it was raised.
    pub fn from_panic(payload: Box<dyn Any + Send>, stack: Option<String>) -> Self {
        let (message, io_kind) = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (s.to_string(), None)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            (s.clone(), None)
        } else if let Some(e) = payload.downcast_ref::<io::Error>() {
            (e.to_string(), Some(e.kind()))
        } else if let Some(f) = payload.downcast_ref::<Fault>() {
            return f.clone();
        } else {
            ("panic with non-string payload".to_string(), None)
        };

        Self(Arc::new(Inner {
            kind: FaultKind::Panic,
            message,
            io_kind,
            stack: stack.unwrap_or_default(),
        }))
    }

    pub fn kind(&self) -> FaultKind {
        self.0.kind
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn stack(&self) -> &str {
        &self.0.stack
    }

    /// The peer is gone (broken pipe or reset); a response may not reach it.
    pub fn is_dead_connection(&self) -> bool {
        if matches!(
            self.0.io_kind,
            Some(io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset)
        ) {
            return true;
        }
        let message = self.0.message.to_lowercase();
        DEAD_CONNECTION_PHRASES.iter().any(|p| message.contains(p))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.message)
    }
}

impl<E> From<E> for Fault
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Fault::new(error)
    }
}

/// A bare 500 carrying the fault for the recovery interceptor.
impl IntoResponse for Fault {
    fn into_response(self) -> Response {
        let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
        response.extensions_mut().insert(self);
        response
    }
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn io_error_kind(error: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = err.source();
    }
    None
}

/// Frames that only ever appear above the faulting code: panic entry points
/// and the stack capture itself. The catch site further down is not listed.
const MACHINERY: &[&str] = &[
    "std::backtrace",
    "core::panicking",
    "std::panicking::begin_panic",
    "std::panicking::rust_panic",
    "std::panic::panic_any",
    "rust_begin_unwind",
    "__rust_end_short_backtrace",
    "__rust_start_panic",
    "http::fault::Fault",
    "recovery::record_panic_stack",
];

/// Drop the leading frames that only describe how the stack was captured.
pub(crate) fn trim_stack(raw: &str) -> String {
    let mut frames: Vec<Vec<&str>> = Vec::new();
    for line in raw.lines() {
        if is_frame_header(line) || frames.is_empty() {
            frames.push(vec![line]);
        } else if let Some(frame) = frames.last_mut() {
            frame.push(line);
        }
    }

    let skip = frames
        .iter()
        .rposition(|frame| MACHINERY.iter().any(|m| frame[0].contains(m)))
        .map_or(0, |idx| idx + 1);

    if skip >= frames.len() {
        return raw.to_string();
    }
    frames[skip..]
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_frame_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    match trimmed.split_once(':') {
        Some((index, _)) => !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}
