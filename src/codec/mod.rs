//! Wire serialization: JSON, msgpack and form bodies, plus the SSE line
//! format.  The codec for a request is chosen by its `Content-Type`; replies
//! reuse the request's codec unless a handler overrides the MIME type.

pub mod form;
pub mod json;
pub mod msgpack;
pub mod sse;

use crate::error::{Result, RpcError};
use crate::value::Value;

pub const MIME_JSON: &str = "application/json";
pub const MIME_MSGPACK: &str = "application/x-msgpack";
pub const MIME_FORM: &str = "application/x-www-form-urlencoded";
pub const MIME_SSE: &str = "text/event-stream";
/// Reply marker: the body is a JSON list of descriptor placeholders and the
/// descriptors ride along as ancillary data (local socket only).
pub const MIME_FDS: &str = "application/x-fd-magic";

/// A reply encoder/decoder, selected per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    Msgpack,
    Sse,
}

impl Codec {
    /// The codec that serves a given MIME type, if any.
    pub fn for_mime(mime: &str) -> Option<Codec> {
        match mime {
            MIME_JSON => Some(Codec::Json),
            MIME_MSGPACK => Some(Codec::Msgpack),
            MIME_SSE => Some(Codec::Sse),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Codec::Json => MIME_JSON,
            Codec::Msgpack => MIME_MSGPACK,
            Codec::Sse => MIME_SSE,
        }
    }

    pub fn encode(self, value: &Value) -> Result<Vec<u8>> {
        match self {
            Codec::Json => json::to_json(value, false),
            Codec::Msgpack => msgpack::to_msgpack(value),
            Codec::Sse => sse::to_event(value),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<Value> {
        match self {
            Codec::Json => json::from_json(bytes),
            Codec::Msgpack => msgpack::from_msgpack(bytes),
            Codec::Sse => sse::from_event(bytes),
        }
    }
}

/// Decode a request body by its `Content-Type`.  Form bodies are only legal
/// on POST, which the dispatcher enforces before calling this.
pub fn decode_body(mime: &str, body: &[u8]) -> Result<Value> {
    match mime {
        MIME_JSON => json::from_json(body),
        MIME_MSGPACK => msgpack::from_msgpack(body),
        MIME_FORM => form::from_form(body),
        other => Err(RpcError::BadValue(format!("unhandled POST MIME type: {other}"))),
    }
}
