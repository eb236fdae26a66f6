//! Error taxonomy for the RPC runtime.
//!
//! One enum covers both sides of the wire: the server maps a variant to an
//! HTTP status when building a response, and the client maps a status back
//! to a variant when interpreting one.  The CLI maps variants to process
//! exit codes.

use crate::value::Value;

/// A variable the remote handler needs before it can proceed (HTTP 423).
#[derive(Debug, Clone, PartialEq)]
pub struct NeededVar {
    pub name: String,
    pub vtype: String,
    pub default: Option<Value>,
    pub comment: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The worker could not be reached (and auto-start, if any, failed).
    #[error("service is not running")]
    NotRunning,

    /// Authentication failed, or a private method was addressed without
    /// the access secret (HTTP 401/403/407).
    #[error("permission denied: {0}")]
    Permission(String),

    /// No handler is registered under the requested name (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// The request or an argument value was rejected (HTTP 4xx).
    #[error("bad value: {0}")]
    BadValue(String),

    /// The handler needs more information before it can serve the request
    /// (HTTP 423).  Carries the variables it is missing.
    #[error("need info: {error}")]
    NeedInfo {
        error: String,
        resource: Option<String>,
        needed_vars: Vec<NeededVar>,
    },

    /// The handler redirected the caller elsewhere (HTTP 302).
    #[error("redirected to {0}")]
    Redirect(String),

    /// The remote handler failed (HTTP 5xx).  Detail beyond the message is
    /// only present when the request was authenticated.
    #[error("remote error: {0}")]
    Remote(String),

    /// A chunked stream ended without the zero-length terminator.
    #[error("incomplete result, missing end-of-stream marker")]
    IncompleteStream,

    /// A request-read soft timer (headers or whole request) expired.
    #[error("request timed out")]
    Timeout,

    /// The peer's bytes could not be parsed as one HTTP/1.1 request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The transport cannot carry this payload (e.g. descriptors on TCP).
    #[error("transport error: {0}")]
    Transport(String),

    /// A value could not be encoded or decoded with the selected codec.
    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// The status code a worker answers with when a handler (or the
    /// dispatcher itself) fails with this error.
    pub fn http_code(&self) -> u16 {
        match self {
            RpcError::Permission(_) => 403,
            RpcError::NotFound(_) => 404,
            RpcError::BadValue(_) | RpcError::MalformedRequest(_) | RpcError::Codec(_) => 400,
            RpcError::NeedInfo { .. } => 423,
            RpcError::Redirect(_) => 302,
            _ => 500,
        }
    }

    /// Project a non-2xx response back into an error, the inverse of
    /// [`RpcError::http_code`].  `detail` is the decoded `error` field of
    /// the response body, when one was present.
    pub fn from_http_code(code: u16, detail: String) -> Self {
        match code {
            401 | 403 | 407 => RpcError::Permission(detail),
            404 => RpcError::NotFound(detail),
            423 => RpcError::NeedInfo {
                error: detail,
                resource: None,
                needed_vars: Vec::new(),
            },
            300..=399 => RpcError::Redirect(detail),
            400..=499 => RpcError::BadValue(detail),
            _ => RpcError::Remote(format!("HTTP {code}: {detail}")),
        }
    }

    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            RpcError::NotRunning => 1,
            RpcError::NotFound(_) => 2,
            RpcError::BadValue(_)
            | RpcError::MalformedRequest(_)
            | RpcError::Codec(_)
            | RpcError::NeedInfo { .. } => 3,
            RpcError::Io(_)
            | RpcError::Timeout
            | RpcError::IncompleteStream
            | RpcError::Redirect(_)
            | RpcError::Transport(_) => 4,
            RpcError::Permission(_) => 5,
            RpcError::Remote(_) => 6,
        }
    }

}

pub type Result<T> = std::result::Result<T, RpcError>;
