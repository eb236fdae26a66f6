//! The call side: connect to a running worker and invoke its handlers.
//!
//! # Connection strategy
//! 1. Read the worker's url-file for the advertised `host:port` and secret.
//! 2. Prefer the local-domain socket once any call has succeeded (or when
//!    the TCP listener is disabled); descriptors can only cross there.
//! 3. On connection failure, reconnect up to `max_tries` times; each retry
//!    may auto-launch the worker process.
//!
//! A loopback client dispatches to an in-process method table instead and
//! never touches the wire; the external contract is otherwise identical.

use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use crate::codec::{self, Codec, MIME_JSON, MIME_MSGPACK, MIME_SSE};
use crate::config::Config;
use crate::dispatch::{REPLY_TO_FIRST_FD, WorkerShared};
use crate::error::{NeededVar, Result, RpcError};
use crate::http::{self, Transport};
use crate::registry::{ApiReply, Args, MethodKind, StreamItem};
use crate::request::{Conn, Req};
use crate::value::{FdSpec, FdValue, Map, Value, str_args};

// ---------------------------------------------------------------------------
// Call options
// ---------------------------------------------------------------------------

/// Redirect the eventual reply onto a caller-supplied descriptor.  The
/// current call then completes with the 202 acknowledgement only.
pub struct ReplyTo {
    pub fd: FdValue,
    /// Bytes the delegator has already written on that descriptor.
    pub seed: u64,
    /// When delegating our own request's writer, marked once the remote
    /// accepted, so the local stream leaves end-of-stream to the remote.
    delegator: Option<Req>,
}

impl ReplyTo {
    /// Delegate a request we are currently serving.
    pub fn request(req: &Req) -> Result<ReplyTo> {
        Ok(ReplyTo { fd: req.fd_value()?, seed: req.sent(), delegator: Some(req.clone()) })
    }

    /// Delegate to an arbitrary descriptor.
    pub fn fd(fd: FdValue) -> ReplyTo {
        ReplyTo { fd, seed: 0, delegator: None }
    }
}

/// Per-call knobs, mirroring the worker-side option names.
pub struct CallOptions {
    /// Force JSON bodies (binary-pack otherwise, when preferred).
    pub use_json: bool,
    /// Reconnect budget; 0 means a single attempt (the liveness probe).
    pub max_tries: u32,
    /// Permit the local-domain socket.
    pub allow_unix: bool,
    pub reply_to: Option<ReplyTo>,
}

impl Default for CallOptions {
    fn default() -> Self {
        CallOptions { use_json: false, max_tries: 2, allow_unix: true, reply_to: None }
    }
}

impl CallOptions {
    pub fn json() -> CallOptions {
        CallOptions { use_json: true, ..Default::default() }
    }

    pub fn reply_to(reply_to: ReplyTo) -> CallOptions {
        CallOptions { reply_to: Some(reply_to), ..Default::default() }
    }
}

// ---------------------------------------------------------------------------
// Call results
// ---------------------------------------------------------------------------

/// A call's outcome: one value, or a lazy stream of them.
pub enum CallResult {
    Value(Value),
    Stream(CallStream),
}

impl std::fmt::Debug for CallResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallResult::Value(v) => f.debug_tuple("Value").field(v).finish(),
            CallResult::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

impl CallResult {
    /// The unary value; an error if the reply was a stream.
    pub fn value(self) -> Result<Value> {
        match self {
            CallResult::Value(v) => Ok(v),
            CallResult::Stream(_) => {
                Err(RpcError::BadValue("expected a value, got a stream".into()))
            }
        }
    }

    /// The stream; an error if the reply was unary.
    pub fn stream(self) -> Result<CallStream> {
        match self {
            CallResult::Stream(s) => Ok(s),
            CallResult::Value(_) => {
                Err(RpcError::BadValue("expected a stream, got a value".into()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CallClient
// ---------------------------------------------------------------------------

pub struct CallClient {
    config: Config,
    name: String,
    url: Option<String>,
    /// Any prior success marks the worker reachable; from then on the
    /// local socket is preferred so descriptors can cross.
    connected_before: bool,
    inventory: Option<Value>,
    loopback: Option<Arc<WorkerShared>>,
    child: Option<std::process::Child>,
}

impl CallClient {
    pub fn new(config: Config) -> CallClient {
        let name = format!("{}/{}", config.app_name, config.worker_name);
        CallClient {
            config,
            name,
            url: None,
            connected_before: false,
            inventory: None,
            loopback: None,
            child: None,
        }
    }

    /// Build a loopback client over an in-process worker: calls dispatch
    /// straight into the method table, bypassing the wire entirely.
    pub fn loopback<S: crate::registry::RpcService>(service: S, config: Config) -> CallClient {
        let shared = crate::server::build_shared(Arc::new(service), config.clone(), "loopback");
        let mut client = CallClient::new(config);
        client.loopback = Some(shared);
        client
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// The method inventory learned from the last authed ping.
    pub fn inventory(&self) -> Option<&Value> {
        self.inventory.as_ref()
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback.is_some()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Establish a connection with the running worker, optionally launching
    /// it when absent.  Retries with a small growing back-off.
    pub async fn connect(&mut self, auto_start: bool, retries: u32) -> Result<()> {
        if self.loopback.is_some() {
            return Ok(());
        }
        let mut may_start = auto_start;
        for tried in 0..=retries {
            match self.try_ping().await {
                Ok(pong) => {
                    if let Some(methods) = pong.get("methods") {
                        self.inventory = Some(methods.clone());
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(error = %e, tried, "connect attempt failed");
                }
            }

            if may_start {
                may_start = false;
                self.spawn_worker()?;
            }
            if tried < retries {
                tokio::time::sleep(Duration::from_millis(50 + u64::from(tried) * 150)).await;
            }
        }
        tracing::error!(
            url = self.url.as_deref().unwrap_or("-"),
            urlfile = %self.config.url_file().display(),
            "failed to connect"
        );
        Err(RpcError::NotRunning)
    }

    async fn try_ping(&mut self) -> Result<Value> {
        let url = std::fs::read_to_string(self.config.url_file())
            .map_err(|_| RpcError::NotRunning)?
            .trim()
            .to_owned();
        self.url = Some(url);
        self.ping().await
    }

    /// The liveness probe: a call that never retries or auto-launches.
    pub async fn ping(&mut self) -> Result<Value> {
        if let Some(shared) = &self.loopback {
            let mut pong = Map::new();
            pong.insert("pong".into(), Value::Bool(true));
            pong.insert("loopback".into(), Value::Bool(true));
            pong.insert("methods".into(), shared.methods().inventory());
            return Ok(Value::Map(pong));
        }
        // A fresh probe: allow either transport to answer.
        self.connected_before = false;
        let result = self
            .call(
                "ping",
                Vec::new(),
                Map::new(),
                CallOptions { max_tries: 0, ..Default::default() },
            )
            .await?;
        result.value()
    }

    /// Ask the worker to shut down.
    pub async fn quitquitquit(&mut self) -> Result<Value> {
        if let Some(shared) = &self.loopback {
            (shared.shutdown_hook)().await;
            return Ok(Value::Bool(true));
        }
        let result = self
            .call(
                "quitquitquit",
                Vec::new(),
                Map::new(),
                CallOptions { max_tries: 0, ..Default::default() },
            )
            .await?;
        result.value()
    }

    /// Launch the worker process: this executable, running `serve` with our
    /// configuration.
    fn spawn_worker(&mut self) -> Result<()> {
        if let Some(child) = &mut self.child {
            let _ = child.try_wait();
        }
        let exe = std::env::current_exe()?;
        tracing::info!(exe = %exe.display(), "launching worker process");
        let child = std::process::Command::new(exe)
            .args(self.config.to_args())
            .arg("serve")
            .stdin(std::process::Stdio::null())
            .spawn()?;
        self.child = Some(child);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // call()
    // -----------------------------------------------------------------------

    /// Invoke `name` with positional `args` and named `kwargs`.
    pub async fn call(
        &mut self,
        name: &str,
        mut args: Vec<Value>,
        mut kwargs: Map,
        opts: CallOptions,
    ) -> Result<CallResult> {
        let t0 = Instant::now();

        let mut delegator = None;
        if let Some(reply_to) = opts.reply_to {
            delegator = reply_to.delegator;
            kwargs.insert(REPLY_TO_FIRST_FD.into(), Value::UInt(reply_to.seed));
            args.insert(0, Value::Fd(reply_to.fd));
        }

        if let Some(shared) = &self.loopback {
            let shared = shared.clone();
            return loopback_call(&shared, name, args, kwargs).await;
        }

        let use_json = opts.use_json || !self.config.worker_prefer_msgpack;

        // Connect, with the retry budget; each retry may auto-launch.
        let mut attempt = 0;
        let (path, conn) = loop {
            match self.open_conn(opts.allow_unix).await {
                Ok(ok) => break ok,
                Err(e) => {
                    if attempt >= opts.max_tries {
                        return Err(e);
                    }
                    attempt += 1;
                    // Boxed: connect() pings, which comes back through
                    // call(); the indirection keeps the future finite.
                    Box::pin(self.connect(opts.max_tries > 0, 1)).await?;
                }
            }
        };

        let result = self.call_on_conn(conn, &path, name, &args, kwargs, use_json).await;

        let code = match &result {
            Ok(_) => {
                self.connected_before = true;
                if let Some(req) = delegator {
                    req.set_delegated();
                }
                200
            }
            Err(e) => e.http_code(),
        };
        let elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;
        if result.is_ok() {
            tracing::debug!(name, args = %str_args(&args), code, elapsed_ms, "call");
        } else {
            tracing::error!(name, args = %str_args(&args), code, elapsed_ms, "call");
        }
        result
    }

    async fn call_on_conn(
        &mut self,
        mut conn: Conn,
        path: &str,
        name: &str,
        args: &[Value],
        mut kwargs: Map,
        use_json: bool,
    ) -> Result<CallResult> {
        let fds: Vec<RawFd> = args.iter().filter_map(|a| a.as_fd()).map(FdValue::raw_fd).collect();
        kwargs.insert("_args".into(), Value::Array(args.to_vec()));
        let body = Value::Map(kwargs);

        let (mimetype, payload) = if use_json {
            (MIME_JSON, codec::json::to_json(&body, false)?)
        } else {
            (MIME_MSGPACK, codec::msgpack::to_msgpack(&body)?)
        };

        let mut request = format!(
            "POST {path}/{name} HTTP/1.1\nConnection: close\nContent-Type: {mimetype}\nContent-Length: {}\n\n",
            payload.len()
        )
        .into_bytes();
        request.extend_from_slice(&payload);

        if fds.is_empty() {
            conn.send(&request).await?;
            conn.flush().await?;
        } else {
            if !conn.fds_ok() {
                return Err(RpcError::Transport(
                    "cannot send file descriptors over TCP".into(),
                ));
            }
            conn.send_with_fds(&request, &fds).await?;
        }

        // One response, possibly chunked, possibly carrying descriptors.
        let limits = self.config.http_limits();
        let want_fds = conn.fds_ok();
        let (response, tail) = http::read_response(&mut conn, &limits, want_fds).await?;
        let code = response.status_code()?;
        let ctype = response.header("Content-Type").unwrap_or(MIME_JSON).to_owned();
        let chunked = response.is_chunked();

        let mut result = Value::Null;
        if !response.body.is_empty() && !chunked {
            result = decode_reply(&ctype, &response.body)?;
        }
        let mut rfds = response.fds;
        if !rfds.is_empty() && !chunked {
            result = zip_fd_reply(result, &mut rfds)?;
        }

        if (200..300).contains(&code) {
            let is_error = result.get("error").is_some();
            if !is_error {
                if chunked {
                    return Ok(CallResult::Stream(CallStream::wire(
                        conn,
                        Codec::for_mime(&ctype),
                        tail,
                        rfds,
                    )));
                }
                return Ok(CallResult::Value(result));
            }
            // A 2xx with an error body is still a failure.
            return Err(remote_error(500, &result));
        }
        Err(remote_error(code, &result))
    }

    /// Open a connection, preferring the local socket when it is both
    /// allowed and trusted (a previous success, or no TCP listener).
    async fn open_conn(&mut self, allow_unix: bool) -> Result<(String, Conn)> {
        let url = self.url.clone().ok_or(RpcError::NotRunning)?;
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| RpcError::BadValue(format!("unsupported URL: {url}")))?;
        let (host_port, path) = rest.split_once('/').unwrap_or((rest, ""));
        let path = format!("/{path}");

        let prefer_unix = allow_unix && (self.connected_before || !self.config.worker_use_tcp);
        if prefer_unix {
            match tokio::net::UnixStream::connect(self.config.sock_file()).await {
                Ok(stream) => return Ok((path, Conn::Unix(stream))),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "unix socket connection failed");
                }
            }
        }

        if !self.config.worker_use_tcp {
            return Err(RpcError::NotRunning);
        }
        let stream = tokio::net::TcpStream::connect(host_port).await?;
        Ok((path, Conn::Tcp(stream)))
    }
}

// ---------------------------------------------------------------------------
// Reply decoding
// ---------------------------------------------------------------------------

fn decode_reply(ctype: &str, body: &[u8]) -> Result<Value> {
    match ctype {
        MIME_MSGPACK => codec::msgpack::from_msgpack(body),
        MIME_JSON => codec::json::from_json(body),
        MIME_SSE => codec::sse::from_event(body),
        other => {
            let mut map = Map::new();
            map.insert("mimetype".into(), Value::Str(other.to_owned()));
            map.insert("data".into(), Value::Bytes(body.to_vec()));
            Ok(Value::Map(map))
        }
    }
}

/// Zip a placeholder list with the received descriptors, reconstructing
/// live values in order.
fn zip_fd_reply(result: Value, rfds: &mut Vec<OwnedFd>) -> Result<Value> {
    let placeholders = match result {
        Value::Array(items) => items,
        other => vec![other],
    };
    let mut out = Vec::with_capacity(placeholders.len());
    for item in placeholders {
        match item.as_str().and_then(FdSpec::from_magic) {
            Some(spec) if !rfds.is_empty() => {
                out.push(Value::Fd(FdValue::received(spec, rfds.remove(0))));
            }
            _ => out.push(item),
        }
    }
    Ok(Value::Array(out))
}

/// Map a failed response to the local error taxonomy, logging any remote
/// detail the worker attached.
fn remote_error(code: u16, body: &Value) -> RpcError {
    if let Some(Value::Str(traceback)) = body.get("traceback") {
        tracing::error!(remote = %traceback, "remote failure detail");
    }
    let detail = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("(no detail)")
        .to_owned();
    if code == 423 {
        let resource = body.get("resource").and_then(Value::as_str).map(str::to_owned);
        let needed_vars = body
            .get("needed_vars")
            .and_then(Value::as_array)
            .map(|vars| {
                vars.iter()
                    .map(|v| NeededVar {
                        name: v
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        vtype: v
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("any")
                            .to_owned(),
                        default: v.get("default").cloned(),
                        comment: v.get("comment").and_then(Value::as_str).map(str::to_owned),
                    })
                    .collect()
            })
            .unwrap_or_default();
        return RpcError::NeedInfo { error: detail, resource, needed_vars };
    }
    RpcError::from_http_code(code, detail)
}

// ---------------------------------------------------------------------------
// CallStream: lazy chunked decoding
// ---------------------------------------------------------------------------

enum StreamSource {
    Wire {
        conn: Option<Conn>,
        buffer: Vec<u8>,
        codec: Option<Codec>,
        finished: bool,
    },
    Local(BoxStream<'static, Result<StreamItem>>),
}

/// A streamed reply: decoded chunks on demand.  A stream whose terminator
/// never arrives fails with `IncompleteStream`.
pub struct CallStream {
    source: StreamSource,
    /// Descriptors that arrived with the response head, surfaced as the
    /// first item.
    pending_fds: Option<Vec<OwnedFd>>,
}

impl CallStream {
    fn wire(conn: Conn, codec: Option<Codec>, tail: Vec<u8>, rfds: Vec<OwnedFd>) -> CallStream {
        CallStream {
            source: StreamSource::Wire {
                conn: Some(conn),
                buffer: tail,
                codec,
                finished: false,
            },
            pending_fds: if rfds.is_empty() { None } else { Some(rfds) },
        }
    }

    fn local(stream: BoxStream<'static, Result<StreamItem>>) -> CallStream {
        CallStream { source: StreamSource::Local(stream), pending_fds: None }
    }

    /// The next decoded item; `None` at a clean end of stream.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        if let Some(fds) = self.pending_fds.take() {
            let mut map = Map::new();
            map.insert(
                "received_fds".into(),
                Value::Array(
                    fds.into_iter()
                        .map(|fd| {
                            Value::Fd(FdValue::received(FdSpec::File { mode: "rb".into() }, fd))
                        })
                        .collect(),
                ),
            );
            return Some(Ok(Value::Map(map)));
        }

        match &mut self.source {
            StreamSource::Local(stream) => match stream.next().await {
                Some(Ok(item)) => Some(Ok(item.data)),
                Some(Err(e)) => Some(Err(e)),
                None => None,
            },
            StreamSource::Wire { conn, buffer, codec, finished } => {
                if *finished {
                    return None;
                }
                loop {
                    if let Some((chunk, used)) = http::split_chunk(buffer) {
                        buffer.drain(..used);
                        if chunk.is_empty() {
                            // Clean end of stream.
                            *finished = true;
                            *conn = None;
                            return None;
                        }
                        let value = match codec {
                            Some(c) => match c.decode(&chunk) {
                                Ok(v) => v,
                                Err(e) => return Some(Err(e)),
                            },
                            None => Value::Bytes(chunk),
                        };
                        if let Some(detail) = error_chunk(&value) {
                            // The producer aborted mid-stream; no
                            // terminator will follow.
                            tracing::error!(remote = %detail, "stream aborted by remote error");
                            *finished = true;
                            *conn = None;
                            return Some(Err(RpcError::IncompleteStream));
                        }
                        return Some(Ok(value));
                    }

                    let Some(active) = conn.as_mut() else {
                        *finished = true;
                        return Some(Err(RpcError::IncompleteStream));
                    };
                    match active.recv(8192, false).await {
                        Ok((data, _)) if data.is_empty() => {
                            *conn = None;
                        }
                        Ok((data, _)) => buffer.extend_from_slice(&data),
                        Err(_) => {
                            *conn = None;
                        }
                    }
                }
            }
        }
    }

    /// Drain the stream into a vector (small streams, tests).
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

/// Detect a mid-stream error chunk (either the plain or the SSE framing).
fn error_chunk(value: &Value) -> Option<String> {
    if let Some(Value::Str(e)) = value.get("error") {
        return Some(e.clone());
    }
    if value.get("event").and_then(Value::as_str) == Some("error") {
        return Some(
            value
                .get("data")
                .and_then(|d| d.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("(unknown)")
                .to_owned(),
        );
    }
    None
}

// ---------------------------------------------------------------------------
// Loopback dispatch
// ---------------------------------------------------------------------------

async fn loopback_call(
    shared: &Arc<WorkerShared>,
    name: &str,
    args: Vec<Value>,
    kwargs: Map,
) -> Result<CallResult> {
    let method = shared
        .methods()
        .resolve(name, true)
        .ok_or_else(|| RpcError::NotFound(name.to_owned()))?;

    let mut call_args = Args { positional: args, named: kwargs };
    call_args.named.remove("_args");
    call_args.apply_schema(&method.params)?;

    let req = Req::detached(&format!("/{name}"));
    match &method.kind {
        MethodKind::Api(f) => {
            let reply = f(req, call_args).await?;
            let value = match reply {
                ApiReply::Value(v) => v,
                ApiReply::Http(result) => {
                    let mut map = Map::new();
                    map.insert("mimetype".into(), Value::Str(result.mimetype));
                    map.insert("data".into(), Value::Bytes(result.data));
                    Value::Map(map)
                }
                ApiReply::Fds(fds) => Value::Array(fds.into_iter().map(Value::Fd).collect()),
            };
            Ok(CallResult::Value(value))
        }
        MethodKind::Stream(f) => Ok(CallResult::Stream(CallStream::local(f(req, call_args)))),
        MethodKind::Raw(_) => Err(RpcError::BadValue(format!(
            "raw handler {name} needs a wire connection"
        ))),
    }
}
