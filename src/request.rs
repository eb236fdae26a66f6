//! Per-request state, and the connection it answers on.
//!
//! A [`Request`] owns the response writer and the decoded message; the
//! [`Req`] handle inside it is shared with the running handler, which may
//! need the request's origin, its bytes-sent counter (streaming), or the
//! connection's own descriptor (reply redirection).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::Instant;

use crate::codec::Codec;
use crate::error::{Result, RpcError};
use crate::fdpass;
use crate::http::Transport;
use crate::value::{FdSpec, FdValue};

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Where a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Tcp(SocketAddr),
    /// The local-domain listener; the only origin descriptors may cross.
    UnixDomain,
    /// A TLS-wrapped TCP connection (the TLS listener add-on).
    Tls(SocketAddr),
}

impl Origin {
    pub fn fds_ok(&self) -> bool {
        matches!(self, Origin::UnixDomain)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Tcp(addr) => write!(f, "{addr}"),
            Origin::UnixDomain => write!(f, "unix-domain"),
            Origin::Tls(addr) => write!(f, "tls:{addr}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Conn: the byte pipe a request is served on
// ---------------------------------------------------------------------------

/// A connection (or, after reply redirection, whatever writer the reply was
/// redirected to).
pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
    /// A plain file target, used only as a redirected reply writer.
    File(tokio::fs::File),
}

impl Conn {
    pub fn origin(&self) -> Origin {
        match self {
            Conn::Tcp(s) => s
                .peer_addr()
                .map(Origin::Tcp)
                .unwrap_or_else(|_| Origin::Tcp(([0, 0, 0, 0], 0).into())),
            Conn::Unix(_) => Origin::UnixDomain,
            Conn::File(_) => Origin::UnixDomain,
        }
    }

    pub fn fds_ok(&self) -> bool {
        matches!(self, Conn::Unix(_))
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Conn::Tcp(s) => s.write_all(data).await?,
            Conn::Unix(s) => s.write_all(data).await?,
            Conn::File(f) => f.write_all(data).await?,
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Conn::Tcp(s) => s.flush().await?,
            Conn::Unix(s) => s.flush().await?,
            Conn::File(f) => f.flush().await?,
        }
        Ok(())
    }

    /// Send bytes with descriptors attached; only the local socket can.
    pub async fn send_with_fds(&mut self, data: &[u8], fds: &[RawFd]) -> Result<usize> {
        match self {
            Conn::Unix(s) => fdpass::send_with_fds(s, data, fds).await,
            _ => Err(RpcError::Transport("cannot send file descriptors over TCP".into())),
        }
    }

    /// Duplicate this connection's descriptor into a transferable value.
    pub fn fd_value(&self) -> Result<FdValue> {
        let (spec, fd) = match self {
            Conn::Tcp(s) => {
                let family = match s.local_addr()? {
                    SocketAddr::V4(_) => libc::AF_INET,
                    SocketAddr::V6(_) => libc::AF_INET6,
                };
                let spec = FdSpec::Socket { family, stype: libc::SOCK_STREAM, proto: 0 };
                (spec, s.as_fd().try_clone_to_owned()?)
            }
            Conn::Unix(s) => {
                let spec = FdSpec::Socket {
                    family: libc::AF_UNIX,
                    stype: libc::SOCK_STREAM,
                    proto: 0,
                };
                (spec, s.as_fd().try_clone_to_owned()?)
            }
            Conn::File(f) => {
                (FdSpec::File { mode: "wb".into() }, f.as_fd().try_clone_to_owned()?)
            }
        };
        Ok(FdValue::received(spec, fd))
    }

    pub fn raw_fd(&self) -> RawFd {
        match self {
            Conn::Tcp(s) => s.as_raw_fd(),
            Conn::Unix(s) => s.as_raw_fd(),
            Conn::File(f) => f.as_raw_fd(),
        }
    }
}

impl Transport for Conn {
    async fn recv(&mut self, max: usize, want_fds: bool) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
        match self {
            Conn::Unix(s) if want_fds => fdpass::recv_with_fds(s, max, fdpass::RECV_DEADLINE).await,
            Conn::Unix(s) => {
                let mut buf = vec![0u8; max];
                let n = s.read(&mut buf).await?;
                buf.truncate(n);
                Ok((buf, Vec::new()))
            }
            Conn::Tcp(s) => {
                let mut buf = vec![0u8; max];
                let n = s.read(&mut buf).await?;
                buf.truncate(n);
                Ok((buf, Vec::new()))
            }
            Conn::File(f) => {
                let mut buf = vec![0u8; max];
                let n = f.read(&mut buf).await?;
                buf.truncate(n);
                Ok((buf, Vec::new()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Req: the handle handlers see
// ---------------------------------------------------------------------------

struct ReqShared {
    origin: Origin,
    authed: bool,
    method: String,
    path: String,
    /// (response MIME type, encoder); streaming may override via first item.
    mimetype: std::sync::Mutex<(String, Codec)>,
    sent: AtomicU64,
    code: AtomicU32,
    /// Set when the reply writer was handed to a downstream worker; the
    /// local stream wrapper must then leave end-of-stream to the delegate.
    delegated: AtomicBool,
    /// The connection's own descriptor, for reply redirection.  Updated
    /// when the writer is swapped, so chained delegation hands on the
    /// current writer rather than the original one.
    conn_fd: std::sync::Mutex<Option<FdValue>>,
}

/// Cheaply cloneable request handle, shared between the session and the
/// running handler.
#[derive(Clone)]
pub struct Req(Arc<ReqShared>);

impl Req {
    pub fn authed(&self) -> bool {
        self.0.authed
    }

    pub fn origin(&self) -> &Origin {
        &self.0.origin
    }

    pub fn method(&self) -> &str {
        &self.0.method
    }

    /// The URL path with the prefix and secret already stripped.
    pub fn path(&self) -> &str {
        &self.0.path
    }

    /// The selected response MIME type.
    pub fn mimetype(&self) -> String {
        self.0.mimetype.lock().unwrap().0.clone()
    }

    pub fn codec(&self) -> Codec {
        self.0.mimetype.lock().unwrap().1
    }

    pub fn set_mimetype(&self, mimetype: &str, codec: Codec) {
        *self.0.mimetype.lock().unwrap() = (mimetype.to_owned(), codec);
    }

    pub fn sent(&self) -> u64 {
        self.0.sent.load(Ordering::Relaxed)
    }

    pub fn add_sent(&self, n: u64) {
        self.0.sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Seed the counter (reply redirection carries the upstream's count).
    pub fn seed_sent(&self, n: u64) {
        self.0.sent.store(n, Ordering::Relaxed);
    }

    pub fn code(&self) -> u16 {
        self.0.code.load(Ordering::Relaxed) as u16
    }

    pub fn set_code(&self, code: u16) {
        self.0.code.store(code.into(), Ordering::Relaxed);
    }

    pub fn delegated(&self) -> bool {
        self.0.delegated.load(Ordering::Relaxed)
    }

    pub fn set_delegated(&self) {
        self.0.delegated.store(true, Ordering::Relaxed);
    }

    /// This request's connection as a transferable descriptor (what a
    /// handler passes as `reply_to` when delegating its reply downstream).
    pub fn fd_value(&self) -> Result<FdValue> {
        self.0
            .conn_fd
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RpcError::Transport("request connection has no descriptor".into()))
    }

    /// Track a writer swap (reply redirection).
    pub fn set_conn_fd(&self, fd: Option<FdValue>) {
        *self.0.conn_fd.lock().unwrap() = fd;
    }

    /// A request handle with no connection behind it (loopback dispatch).
    /// Loopback calls are in-process, so they count as authenticated and
    /// local.
    pub fn detached(path: &str) -> Req {
        Req(Arc::new(ReqShared {
            origin: Origin::UnixDomain,
            authed: true,
            method: "POST".to_owned(),
            path: path.to_owned(),
            mimetype: std::sync::Mutex::new((crate::codec::MIME_JSON.to_owned(), Codec::Json)),
            sent: AtomicU64::new(0),
            code: AtomicU32::new(200),
            delegated: AtomicBool::new(false),
            conn_fd: std::sync::Mutex::new(None),
        }))
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Everything the session knows about one in-flight request.
pub struct Request {
    pub conn: Conn,
    pub req: Req,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Descriptors received with the request, in arrival order.
    pub fds: Vec<OwnedFd>,
    /// Set at dispatch, for the log line.
    pub handler: String,
    pub is_generator: bool,
    t0: Instant,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Conn,
        authed: bool,
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
        fds: Vec<OwnedFd>,
        mimetype: &str,
        codec: Codec,
    ) -> Request {
        let origin = conn.origin();
        let conn_fd = conn.fd_value().ok();
        Request {
            conn,
            req: Req(Arc::new(ReqShared {
                origin,
                authed,
                method,
                path,
                mimetype: std::sync::Mutex::new((mimetype.to_owned(), codec)),
                sent: AtomicU64::new(0),
                // Failing to update this is an error.
                code: AtomicU32::new(500),
                delegated: AtomicBool::new(false),
                conn_fd: std::sync::Mutex::new(conn_fd),
            })),
            headers,
            body,
            fds,
            handler: String::new(),
            is_generator: false,
            t0: Instant::now(),
        }
    }

    /// Write through to the connection, counting the bytes.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.conn.send(data).await?;
        self.req.add_sent(data.len() as u64);
        Ok(())
    }

    pub fn elapsed_us(&self) -> u128 {
        self.t0.elapsed().as_micros()
    }

    /// One line per request: method, path, status, bytes, time, peer.
    pub fn log(&self) {
        let code = self.req.code();
        let method = self.req.method();
        let path = self.req.path();
        let sent = self.req.sent();
        let elapsed_us = self.elapsed_us();
        let peer = self.req.origin().to_string();
        if (200..300).contains(&code) {
            tracing::debug!(method, path, code, sent, elapsed_us, peer, "http request");
        } else {
            tracing::warn!(method, path, code, sent, elapsed_us, peer, "http request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unix_conn_reports_local_origin_and_fds_ok() {
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = Conn::Unix(a);
        assert_eq!(conn.origin(), Origin::UnixDomain);
        assert!(conn.fds_ok());
        assert!(conn.origin().fds_ok());
    }

    #[tokio::test]
    async fn tcp_conn_refuses_descriptor_sends() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let mut conn = Conn::Tcp(client);
        assert!(!conn.fds_ok());
        let err = conn.send_with_fds(b"x", &[0]).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn request_counts_written_bytes() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut request = Request::new(
            Conn::Unix(a),
            true,
            "GET".into(),
            "/meow".into(),
            BTreeMap::new(),
            Vec::new(),
            Vec::new(),
            crate::codec::MIME_JSON,
            Codec::Json,
        );
        request.write(b"12345").await.unwrap();
        assert_eq!(request.req.sent(), 5);

        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"12345");
    }

    #[tokio::test]
    async fn request_exposes_its_connection_descriptor() {
        let (a, _b) = UnixStream::pair().unwrap();
        let request = Request::new(
            Conn::Unix(a),
            true,
            "POST".into(),
            "/ping_pong".into(),
            BTreeMap::new(),
            Vec::new(),
            Vec::new(),
            crate::codec::MIME_JSON,
            Codec::Json,
        );
        let fdv = request.req.fd_value().unwrap();
        assert!(fdv.spec().is_socket());
    }
}
