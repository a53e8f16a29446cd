//! Typed request context.
//!
//! # Responsibilities
//! - Wrap one in-flight request for route handlers and filters
//! - Memoize derived values as typed extensions (client IP, body bytes)
//! - Bind entities from the request and write entities to the response
//! - Adapt typed filters onto the router's `from_fn` middleware signature
//!
//! # Design Decisions
//! - A value once stored in the extensions is authoritative for the request
//! - Chain termination is an explicit response marker, not a filter index

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequest, MatchedPath, Query, Request};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::trace::TraceContextExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::http::binding::{BindingError, Codec};
use crate::http::deadline::RequestDeadline;
use crate::http::forwarded;

/// Upper bound for a buffered request body.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Resolved client IP, set once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// The fully read request body, kept so it can be read again.
#[derive(Debug, Clone)]
pub struct CapturedBody(pub Bytes);

/// Span context of a traced request.
#[derive(Debug, Clone)]
pub struct TraceContext(pub opentelemetry::Context);

impl TraceContext {
    /// Hex trace id, empty when the span is not sampled or invalid.
    pub fn trace_id(&self) -> String {
        let span = self.0.span();
        let span_context = span.span_context();
        if span_context.is_valid() {
            span_context.trace_id().to_string()
        } else {
            String::new()
        }
    }
}

/// Marks a response produced by an interceptor that cut the chain short.
#[derive(Debug, Clone, Copy)]
pub struct ChainTerminated;

/// Mark `response` as terminal.
pub fn terminate(mut response: Response) -> Response {
    response.extensions_mut().insert(ChainTerminated);
    response
}

/// Recovery logs terminated responses without a response snapshot.
pub fn is_terminated(response: &Response) -> bool {
    response.extensions().get::<ChainTerminated>().is_some()
}

/// Client IP of `request`, resolved from proxy headers on first use.
pub fn client_ip_of(request: &mut Request) -> String {
    if let Some(ClientIp(ip)) = request.extensions().get::<ClientIp>() {
        return ip.clone();
    }
    let remote = peer_addr(request).map(|addr| addr.to_string());
    let ip = forwarded::client_ip(request.headers(), remote.as_deref());
    request.extensions_mut().insert(ClientIp(ip.clone()));
    ip
}

/// IP of the socket peer; empty when the connection info is unknown.
pub fn peer_ip_of(request: &Request) -> String {
    peer_addr(request).map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Route template the router selected, e.g. `/users/{id}`. Empty for fallbacks.
pub fn route_of(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_default()
}

/// Typed façade over one request.
#[derive(Debug)]
pub struct RequestContext {
    request: Request,
}

impl RequestContext {
    pub fn new(request: Request) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn into_request(self) -> Request {
        self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// Client IP behind reverse proxies. Memoized on first call.
    pub fn client_ip(&mut self) -> String {
        client_ip_of(&mut self.request)
    }

    pub fn peer_ip(&self) -> String {
        peer_ip_of(&self.request)
    }

    pub fn matched_path(&self) -> Option<&str> {
        self.request.extensions().get::<MatchedPath>().map(MatchedPath::as_str)
    }

    pub fn deadline(&self) -> Option<&RequestDeadline> {
        self.request.extensions().get::<RequestDeadline>()
    }

    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.request.extensions().get::<TraceContext>()
    }

    /// Typed extension lookup for values set by filters.
    pub fn extension<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.request.extensions().get::<T>()
    }

    pub fn insert_extension<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.request.extensions_mut().insert(value);
    }

    /// The request body. The first call reads it; later calls return the
    /// same bytes and the request keeps a readable copy.
    pub async fn body_bytes(&mut self) -> Result<Bytes, BindingError> {
        if let Some(CapturedBody(bytes)) = self.request.extensions().get::<CapturedBody>() {
            return Ok(bytes.clone());
        }
        let body = std::mem::take(self.request.body_mut());
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|err| BindingError::Body(err.to_string()))?;
        *self.request.body_mut() = Body::from(bytes.clone());
        self.request.extensions_mut().insert(CapturedBody(bytes.clone()));
        Ok(bytes)
    }

    /// Decode the query string.
    pub fn bind_query<T: DeserializeOwned>(&self) -> Result<T, BindingError> {
        Query::<T>::try_from_uri(self.request.uri())
            .map(|Query(value)| value)
            .map_err(|rejection| BindingError::Query(rejection.body_text()))
    }

    /// Decode the request entity: the query string for `GET`/`HEAD`, the body
    /// otherwise, using the reader picked by `Content-Type`.
    pub async fn bind<T: DeserializeOwned>(&mut self) -> Result<T, BindingError> {
        if matches!(*self.request.method(), Method::GET | Method::HEAD) {
            return self.bind_query();
        }
        let codec = Codec::for_content_type(self.request.headers())?;
        let bytes = self.body_bytes().await?;
        codec.decode(&bytes)
    }

    /// Encode `value` with the writer picked by `Accept`.
    pub fn write<T: Serialize + ?Sized>(&self, status: StatusCode, value: &T) -> Response {
        Codec::for_accept(self.request.headers()).write(status, value)
    }
}

impl<S> FromRequest<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::new(req))
    }
}

/// Context handed to a typed filter: the request plus the rest of the chain.
pub struct FilterContext {
    ctx: RequestContext,
    next: Next,
}

impl FilterContext {
    pub fn new(request: Request, next: Next) -> Self {
        Self {
            ctx: RequestContext::new(request),
            next,
        }
    }

    pub fn ctx(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut RequestContext {
        &mut self.ctx
    }

    /// Continue with the next filter, or the handler after the last one.
    pub async fn process_filter(self) -> Response {
        self.next.run(self.ctx.into_request()).await
    }

    /// Answer without running the rest of the chain.
    pub fn abort(self, response: Response) -> Response {
        terminate(response)
    }

    pub fn into_parts(self) -> (RequestContext, Next) {
        (self.ctx, self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::response::IntoResponse;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Page {
        page: u32,
    }

    fn request(method: Method, uri: &str, body: &'static str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn body_bytes_can_be_read_twice() {
        let mut ctx = RequestContext::new(request(Method::POST, "/", "{\"page\":2}"));
        let first = ctx.body_bytes().await.unwrap();
        let second = ctx.body_bytes().await.unwrap();
        assert_eq!(first, second);

        let rest = axum::body::to_bytes(ctx.into_request().into_body(), 1024).await.unwrap();
        assert_eq!(&rest[..], b"{\"page\":2}");
    }

    #[tokio::test]
    async fn bind_uses_query_for_get() {
        let mut ctx = RequestContext::new(request(Method::GET, "/items?page=3", ""));
        assert_eq!(ctx.bind::<Page>().await.unwrap(), Page { page: 3 });
    }

    #[tokio::test]
    async fn bind_decodes_json_body() {
        let mut ctx = RequestContext::new(request(Method::POST, "/items", "{\"page\":4}"));
        assert_eq!(ctx.bind::<Page>().await.unwrap(), Page { page: 4 });
    }

    #[test]
    fn client_ip_is_memoized() {
        let mut req = request(Method::GET, "/", "");
        req.headers_mut()
            .insert(forwarded::X_REAL_IP, "8.8.8.8".parse().unwrap());
        let mut ctx = RequestContext::new(req);
        assert_eq!(ctx.client_ip(), "8.8.8.8");

        ctx.request_mut().headers_mut().remove(forwarded::X_REAL_IP);
        assert_eq!(ctx.client_ip(), "8.8.8.8");
    }

    #[test]
    fn peer_ip_reads_connect_info() {
        let mut req = request(Method::GET, "/", "");
        assert_eq!(peer_ip_of(&req), "");
        req.extensions_mut()
            .insert(ConnectInfo("10.0.0.5:443".parse::<SocketAddr>().unwrap()));
        assert_eq!(peer_ip_of(&req), "10.0.0.5");
        assert_eq!(client_ip_of(&mut req), "10.0.0.5");
    }

    #[test]
    fn terminate_marks_response() {
        let response = terminate(StatusCode::GATEWAY_TIMEOUT.into_response());
        assert!(is_terminated(&response));
        assert!(!is_terminated(&StatusCode::OK.into_response()));
    }
}
