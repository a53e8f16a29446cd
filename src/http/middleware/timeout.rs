//! Request deadline enforcement.
//!
//! # Responsibilities
//! - Install a [`RequestDeadline`] on requests that carry none
//! - Answer 504 as soon as the deadline passes, without waiting for the handler
//!
//! # Design Decisions
//! - The rest of the chain runs on its own task; on expiry that task is left
//!   running detached and its late response is dropped, so only one response
//!   is ever written
//! - Cancellation is signalled through the deadline's drop guard on every exit
//! - Panics from the detached task are re-raised here for the recovery
//!   interceptor, stack included

use std::panic;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::http::context::{route_of, terminate};
use crate::http::deadline::RequestDeadline;
use crate::http::middleware::recovery::Recover;

pub async fn timeout_middleware(
    State(timeout): State<Duration>,
    mut req: Request,
    next: Next,
) -> Response {
    if req.extensions().get::<RequestDeadline>().is_some() {
        return next.run(req).await;
    }

    let (deadline, _cancel) = RequestDeadline::after(timeout);
    let expires = deadline.instant();
    req.extensions_mut().insert(deadline);

    let method = req.method().clone();
    let route = route_of(&req);
    let mut task = tokio::spawn(Recover::new(next.run(req)));

    tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(response)) => response,
            Ok(Err(fault)) => panic::resume_unwind(Box::new(fault)),
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(err) => {
                tracing::warn!(error = %err, %method, route = %route, "Request task cancelled");
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        },
        _ = tokio::time::sleep_until(expires) => {
            tracing::debug!(
                %method,
                route = %route,
                timeout_ms = timeout.as_millis() as u64,
                "Request deadline exceeded"
            );
            terminate((StatusCode::GATEWAY_TIMEOUT, "request deadline exceeded").into_response())
        }
    }
}
