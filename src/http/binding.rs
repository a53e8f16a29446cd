//! Entity readers and writers.
//!
//! Two encodings are built in: JSON (preferred) and MessagePack. The reader is
//! picked from `Content-Type`, the writer from `Accept`. The codecs themselves
//! are `serde_json` and `rmp-serde`.

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const MIME_JSON: &str = "application/json; charset=utf-8";
pub const MIME_MSGPACK: &str = "application/x-msgpack";

/// Failure to read or write an entity.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("unsupported media type {0:?}")]
    UnsupportedMediaType(String),
    #[error("failed to read request body: {0}")]
    Body(String),
    #[error("invalid JSON entity: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid MessagePack entity: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode MessagePack entity: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("invalid query string: {0}")]
    Query(String),
}

impl BindingError {
    pub fn status(&self) -> StatusCode {
        match self {
            BindingError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            BindingError::MsgPackEncode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for BindingError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// A built-in entity encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    MsgPack,
}

impl Codec {
    pub fn mime(self) -> &'static str {
        match self {
            Codec::Json => MIME_JSON,
            Codec::MsgPack => MIME_MSGPACK,
        }
    }

    /// Reader for a request. A missing `Content-Type` reads as JSON.
    pub fn for_content_type(headers: &HeaderMap) -> Result<Self, BindingError> {
        let Some(value) = headers.get(header::CONTENT_TYPE) else {
            return Ok(Codec::Json);
        };
        let raw = value.to_str().unwrap_or_default();
        let essence = raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        match essence.as_str() {
            "" | "application/json" => Ok(Codec::Json),
            MIME_MSGPACK | "application/msgpack" => Ok(Codec::MsgPack),
            _ if essence.ends_with("+json") => Ok(Codec::Json),
            _ => Err(BindingError::UnsupportedMediaType(raw.to_string())),
        }
    }

    /// Writer for a response: MessagePack only when the client asks for it
    /// and does not also accept JSON.
    pub fn for_accept(headers: &HeaderMap) -> Self {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let wants_msgpack = accept.contains(MIME_MSGPACK) || accept.contains("application/msgpack");
        let wants_json = accept.contains("application/json") || accept.contains("*/*");
        if wants_msgpack && !wants_json {
            Codec::MsgPack
        } else {
            Codec::Json
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, BindingError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes, BindingError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?.into()),
            Codec::MsgPack => Ok(rmp_serde::to_vec_named(value)?.into()),
        }
    }

    /// Encode `value` into a response with `status` and the codec's content type.
    pub fn write<T: Serialize + ?Sized>(self, status: StatusCode, value: &T) -> Response {
        match self.encode(value) {
            Ok(body) => {
                let mut response = (status, body).into_response();
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static(self.mime()));
                response
            }
            Err(err) => {
                tracing::error!(error = %err, codec = ?self, "Failed to encode response entity");
                err.into_response()
            }
        }
    }
}
