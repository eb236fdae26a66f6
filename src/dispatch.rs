//! Request dispatch: one accepted connection in, one response out.
//!
//! The session reads and authenticates the request, resolves the handler
//! (private raw, private api, public raw, public api, then the service's
//! fallback), decodes and coerces arguments, translates descriptor
//! placeholders, and serializes the reply.  Streaming handlers are wrapped
//! in chunked framing; raw handlers get the writer.
//!
//! Reply redirection: a request whose body carries `reply_to_first_fd`
//! swaps the response writer to the first positional descriptor, answers
//! the original connection with `202 Accepted`, and continues on the new
//! writer with the bytes-sent counter seeded from the caller.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;

use crate::codec::{self, Codec, MIME_JSON, MIME_SSE};
use crate::config::Config;
use crate::error::{Result, RpcError};
use crate::http;
use crate::registry::{ApiReply, Args, MethodKind, MethodTable, StreamFn};
use crate::request::{Conn, Req, Request};
use crate::value::{FdSpec, FdValue, Map, Value};

pub const REPLY_TO_FIRST_FD: &str = "reply_to_first_fd";

/// State shared by every session of one worker.
pub struct WorkerShared {
    pub config: std::sync::RwLock<Config>,
    pub methods: std::sync::OnceLock<MethodTable>,
    pub secret: String,
    pub url: String,
    pub start_time: u64,
    /// Notified once to stop the accept loop.
    pub shutdown: tokio::sync::Notify,
    pub fallback: Box<dyn Fn(&Req) -> Option<MethodKind> + Send + Sync>,
    pub shutdown_hook: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
}

impl WorkerShared {
    pub fn methods(&self) -> &MethodTable {
        self.methods.get().expect("method table installed at startup")
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// The secret's presence anywhere in the received head (request line or a
/// header) authenticates the request.
pub fn is_authed(head: &str, headers: &std::collections::BTreeMap<String, String>, secret: &str) -> bool {
    !secret.is_empty()
        && (head.contains(secret)
            || headers.iter().any(|(k, v)| k.contains(secret) || v.contains(secret)))
}

/// Strip the `/<secret>/` prefix off a path, when present.
pub fn strip_secret(path: &str, secret: &str) -> String {
    let prefixed = format!("/{secret}/");
    if format!("{path}/").starts_with(&prefixed) {
        path[secret.len() + 1..].to_owned()
    } else {
        path.to_owned()
    }
}

/// The dispatch name: first non-empty path segment, or `web_root`.
pub fn method_name(path: &str) -> &str {
    let name = path.strip_prefix('/').unwrap_or(path).split('/').next().unwrap_or("");
    if name.is_empty() { "web_root" } else { name }
}

// ---------------------------------------------------------------------------
// Session entry point
// ---------------------------------------------------------------------------

/// Serve one connection: parse, dispatch, log, close.
pub async fn serve_connection(shared: Arc<WorkerShared>, mut conn: Conn) {
    let (limits, url_path) = {
        let config = shared.config.read().unwrap();
        (config.http_limits(), config.worker_url_path.clone())
    };

    let want_fds = conn.fds_ok();
    let peer = conn.origin();
    let (message, _tail) = match http::read_message(&mut conn, &limits, want_fds).await {
        Ok(parsed) => parsed,
        Err(RpcError::Timeout) => {
            tracing::warn!(%peer, "request read timed out");
            return;
        }
        Err(e) => {
            let body = codec::json::to_json(&error_value(&e.to_string()), false)
                .unwrap_or_else(|_| b"{}\n".to_vec());
            let mut head = http::response_head(400, MIME_JSON, &[]);
            head.extend_from_slice(&body);
            let _ = conn.send(&head).await;
            tracing::warn!(%peer, error = %e, "malformed request");
            return;
        }
    };

    let (method, raw_path) = match message.method_and_path() {
        Ok(pair) => (pair.0.to_owned(), pair.1.to_owned()),
        Err(e) => {
            tracing::warn!(%peer, error = %e, "bad request line");
            return;
        }
    };

    // Static URL prefix, then authentication, then the secret strip.
    let mut path = raw_path.clone();
    let mut prefix_ok = true;
    if !url_path.is_empty() {
        match path.strip_prefix(&format!("/{url_path}")) {
            Some(rest) => path = rest.to_owned(),
            None => prefix_ok = false,
        }
    }
    let authed = is_authed(&message.head, &message.headers, &shared.secret);
    if authed {
        path = strip_secret(&path, &shared.secret);
    }

    let mut request = Request::new(
        conn,
        authed,
        method,
        path,
        message.headers,
        message.body,
        message.fds,
        MIME_JSON,
        Codec::Json,
    );

    if !prefix_ok {
        let e = RpcError::NotFound(raw_path);
        write_error(&mut request, &e).await;
        request.log();
        return;
    }

    dispatch(&shared, &mut request).await;
    let _ = request.conn.flush().await;
    request.log();

    // The connection's descriptor may have been handed to another worker;
    // give the delegate a moment before the close.
    if request.req.delegated() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(shared: &Arc<WorkerShared>, request: &mut Request) {
    let name = method_name(request.req.path()).to_owned();

    let kind = match shared.methods().resolve(&name, request.req.authed()) {
        Some(method) => {
            request.handler = method.name.clone();
            request.is_generator = method.kind.is_stream();
            Some((method.kind.clone(), method.params.clone()))
        }
        None => {
            request.handler = name.clone();
            (shared.fallback)(&request.req).map(|kind| (kind, Vec::new()))
        }
    };
    let Some((kind, params)) = kind else {
        let e = if request.req.authed() {
            RpcError::NotFound(name)
        } else {
            RpcError::Permission("Sorry".into())
        };
        write_error(request, &e).await;
        return;
    };

    match prepare_args(request, &params).await {
        Ok(args) => run_handler(request, kind, args).await,
        Err(e) => write_error(request, &e).await,
    }
}

/// Decode the body, pick the response codec, translate descriptor
/// placeholders, apply reply redirection, and coerce to the schema.
async fn prepare_args(
    request: &mut Request,
    params: &[crate::registry::ParamSpec],
) -> Result<Args> {
    let mut args = Args::default();
    if request.req.method() == "POST" {
        let ctype = request.headers.get("Content-Type").cloned().unwrap_or_default();
        match ctype.as_str() {
            codec::MIME_MSGPACK => {
                request.req.set_mimetype(codec::MIME_MSGPACK, Codec::Msgpack);
                args = Args::from_body(codec::decode_body(&ctype, &request.body)?);
            }
            codec::MIME_JSON | codec::MIME_FORM => {
                args = Args::from_body(codec::decode_body(&ctype, &request.body)?);
            }
            other => {
                tracing::warn!(mimetype = other, "unhandled POST MIME type");
            }
        }
    }

    if !request.fds.is_empty() {
        translate_fd_args(&mut args.positional, &mut request.fds)?;

        // The marker's presence requests redirection; its integer value
        // seeds the bytes-sent counter (0 is a valid seed).
        if let Some(marker) = args.named.remove(REPLY_TO_FIRST_FD) {
            if !matches!(marker, Value::Null | Value::Bool(false)) {
                redirect_reply(request, &mut args, marker.as_u64().unwrap_or(0)).await?;
            }
        }
    }

    args.apply_schema(params)?;
    Ok(args)
}

/// Substitute placeholders in the positional list with the received
/// descriptors, in order.  Each placeholder consumes exactly one.
fn translate_fd_args(positional: &mut [Value], fds: &mut Vec<std::os::fd::OwnedFd>) -> Result<()> {
    for slot in positional.iter_mut() {
        let Some(spec) = slot.as_str().and_then(FdSpec::from_magic) else {
            continue;
        };
        if fds.is_empty() {
            return Err(RpcError::BadValue("more descriptor placeholders than descriptors".into()));
        }
        *slot = Value::Fd(FdValue::received(spec, fds.remove(0)));
    }
    Ok(())
}

/// Swap the response writer to the first positional descriptor, answer the
/// old connection with 202, and seed the bytes-sent counter.
async fn redirect_reply(request: &mut Request, args: &mut Args, seed: u64) -> Result<()> {
    if args.positional.is_empty() {
        return Err(RpcError::BadValue("reply_to_first_fd without a descriptor".into()));
    }
    let Value::Fd(fdv) = args.positional.remove(0) else {
        return Err(RpcError::BadValue("first positional argument is not a descriptor".into()));
    };

    let new_conn = match fdv.spec() {
        FdSpec::Socket { family, .. } if *family == libc::AF_UNIX => {
            Conn::Unix(fdv.to_unix_stream()?)
        }
        FdSpec::Socket { .. } => Conn::Tcp(fdv.to_tcp_stream()?),
        FdSpec::File { .. } => Conn::File(tokio::fs::File::from_std(fdv.to_file()?)),
    };

    let mut ack = http::response_head(202, MIME_JSON, &[]);
    ack.extend_from_slice(b"{\"replied_to_first_fd\": true}\n");
    let mut old_conn = std::mem::replace(&mut request.conn, new_conn);
    old_conn.send(&ack).await?;
    old_conn.flush().await?;
    drop(old_conn);

    request.req.seed_sent(seed);
    request.req.set_conn_fd(request.conn.fd_value().ok());
    Ok(())
}

// ---------------------------------------------------------------------------
// Handler execution
// ---------------------------------------------------------------------------

async fn run_handler(request: &mut Request, kind: MethodKind, args: Args) {
    match kind {
        MethodKind::Api(f) => {
            let result = f(request.req.clone(), args).await;
            match result {
                Ok(reply) => {
                    if let Err(e) = write_api_reply(request, reply).await {
                        write_error(request, &e).await;
                    }
                }
                Err(e) => write_error(request, &e).await,
            }
        }
        MethodKind::Stream(f) => run_stream(request, f, args).await,
        MethodKind::Raw(f) => {
            let result = f(request, args).await;
            if let Err(e) = result {
                write_error(request, &e).await;
            }
        }
    }
}

async fn write_api_reply(request: &mut Request, reply: ApiReply) -> Result<()> {
    match reply {
        ApiReply::Value(value) => {
            let codec = request.req.codec();
            let body = codec.encode(&value)?;
            let mimetype = request.req.mimetype();
            request.req.set_code(200);
            let mut out = http::response_head(200, &mimetype, &[]);
            out.extend_from_slice(&body);
            request.write(&out).await
        }
        ApiReply::Http(result) => {
            let code = result.http_code.unwrap_or(200);
            request.req.set_code(code);
            let mut extra: Vec<(&str, &str)> = Vec::new();
            if let Some(target) = &result.redirect_to {
                extra.push(("Location", target.as_str()));
            }
            let mut out = http::response_head(code, &result.mimetype, &extra);
            out.extend_from_slice(&result.data);
            request.write(&out).await
        }
        ApiReply::Fds(fd_values) => {
            if !request.conn.fds_ok() {
                return Err(RpcError::Transport(
                    "cannot send file descriptors over TCP".into(),
                ));
            }
            let placeholders =
                Value::Array(fd_values.iter().map(|f| Value::Str(f.spec().to_magic())).collect());
            let body = codec::json::to_json(&placeholders, false)?;
            // The envelope goes out as a plain JSON placeholder list; the
            // descriptors ride as ancillary data on the same send.
            let mut out = http::response_head(200, MIME_JSON, &[]);
            out.extend_from_slice(&body);
            let raw: Vec<std::os::fd::RawFd> = fd_values.iter().map(FdValue::raw_fd).collect();
            request.req.set_code(200);
            let sent = request.conn.send_with_fds(&out, &raw).await?;
            request.req.add_sent(sent as u64);
            Ok(())
        }
    }
}

/// Drive a streaming handler with chunked framing.
///
/// The first item may override the MIME type (SSE switches the encoder); a
/// clean end emits the zero-length terminator.  Failures after the head are
/// sent as a final error chunk with no terminator, so receivers see an
/// incomplete stream.
async fn run_stream(request: &mut Request, f: StreamFn, args: Args) {
    let req = request.req.clone();
    let mut stream = f(req.clone(), args);

    let mut codec = req.codec();
    let mut resp_mime = req.mimetype();
    let mut events = false;
    // A seeded counter means an upstream worker already sent the head.
    let mut head_sent = req.sent() > 0;
    let mut first = true;

    loop {
        match stream.next().await {
            Some(Ok(item)) => {
                let mut passthrough = false;
                if let Some(mime) = &item.mimetype {
                    if !first {
                        let e = RpcError::Remote("stream switched MIME type mid-flight".into());
                        stream_fail(request, &e, head_sent, events).await;
                        return;
                    }
                    resp_mime = mime.clone();
                    if mime == MIME_SSE {
                        codec = Codec::Sse;
                        events = true;
                    } else {
                        passthrough = true;
                    }
                    req.set_mimetype(&resp_mime, codec);
                }
                if !head_sent {
                    req.set_code(200);
                    if request.write(&http::chunked_head(200, &resp_mime)).await.is_err() {
                        return;
                    }
                    head_sent = true;
                }
                let encoded = if passthrough {
                    match &item.data {
                        Value::Bytes(b) => Ok(b.clone()),
                        Value::Str(s) => Ok(s.clone().into_bytes()),
                        other => codec.encode(other),
                    }
                } else {
                    codec.encode(&item.data)
                };
                let encoded = match encoded {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        stream_fail(request, &e, head_sent, events).await;
                        return;
                    }
                };
                if request.write(&http::chunk(&encoded)).await.is_err() {
                    // Broken pipe: stop producing, no terminator.
                    tracing::debug!("stream consumer went away");
                    return;
                }
                let _ = request.conn.flush().await;
                first = false;
            }
            Some(Err(e)) => {
                stream_fail(request, &e, head_sent, events).await;
                return;
            }
            None => {
                if !head_sent {
                    req.set_code(200);
                    let _ = request.write(&http::chunked_head(200, &resp_mime)).await;
                }
                // The delegate owns end-of-stream once the reply was
                // handed downstream.
                if !req.delegated() {
                    let _ = request.write(&http::chunk(b"")).await;
                }
                req.set_code(200);
                return;
            }
        }
    }
}

/// Emit a streaming failure: a full error response when nothing was sent
/// yet, otherwise an error chunk, and never the clean terminator.
async fn stream_fail(request: &mut Request, e: &RpcError, head_sent: bool, events: bool) {
    if !head_sent {
        write_error(request, e).await;
        return;
    }
    let mut body = error_body(e, request.req.authed());
    if events {
        let mut wrapped = Map::new();
        wrapped.insert("event".into(), Value::Str("error".into()));
        wrapped.insert("data".into(), body);
        body = Value::Map(wrapped);
    }
    let codec = request.req.codec();
    if let Ok(encoded) = codec.encode(&body) {
        let _ = request.write(&http::chunk(&encoded)).await;
    }
    request.req.set_code(e.http_code());
    // Deliberately no terminator: the stream exploded.
}

// ---------------------------------------------------------------------------
// Error responses
// ---------------------------------------------------------------------------

fn error_value(message: &str) -> Value {
    let mut map = Map::new();
    map.insert("error".into(), Value::Str(message.to_owned()));
    Value::Map(map)
}

/// The structured error payload: `{error}`, plus `resource`/`needed_vars`
/// for 423, plus failure detail when the request was authenticated.
pub fn error_body(e: &RpcError, authed: bool) -> Value {
    let mut map = Map::new();
    match e {
        RpcError::NeedInfo { error, resource, needed_vars } => {
            map.insert("error".into(), Value::Str(error.clone()));
            if let Some(resource) = resource {
                map.insert("resource".into(), Value::Str(resource.clone()));
            }
            let vars = needed_vars
                .iter()
                .map(|v| {
                    let mut var = Map::new();
                    var.insert("name".into(), Value::Str(v.name.clone()));
                    var.insert("type".into(), Value::Str(v.vtype.clone()));
                    var.insert("default".into(), v.default.clone().unwrap_or(Value::Null));
                    var.insert(
                        "comment".into(),
                        v.comment.clone().map(Value::Str).unwrap_or(Value::Null),
                    );
                    Value::Map(var)
                })
                .collect();
            map.insert("needed_vars".into(), Value::Array(vars));
        }
        RpcError::NotFound(_) => {
            map.insert("error".into(), Value::Str("Not Found".into()));
        }
        RpcError::Permission(_) => {
            map.insert("error".into(), Value::Str("Sorry".into()));
        }
        other => {
            map.insert("error".into(), Value::Str(other.to_string()));
            if authed && other.http_code() >= 500 {
                map.insert("traceback".into(), Value::Str(format!("{other:?}")));
            }
        }
    }
    Value::Map(map)
}

async fn write_error(request: &mut Request, e: &RpcError) {
    let code = e.http_code();
    request.req.set_code(code);
    let body = error_body(e, request.req.authed());
    let codec = request.req.codec();
    let encoded = codec.encode(&body).unwrap_or_else(|_| b"{}\n".to_vec());
    let mut extra: Vec<(&str, &str)> = Vec::new();
    if let RpcError::Redirect(target) = e {
        extra.push(("Location", target.as_str()));
    }
    let mimetype = request.req.mimetype();
    let mut out = http::response_head(code, &mimetype, &extra);
    out.extend_from_slice(&encoded);
    if let Err(write_err) = request.write(&out).await {
        tracing::debug!(error = %write_err, "error response not delivered");
    }
}
