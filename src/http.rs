//! HTTP/1.1 frame codec: one request (or response) per connection.
//!
//! The head parser accepts either CRLF or LF line endings; the first
//! newline seen fixes the style for the rest of the head.  Keep-alive is not
//! supported: a `Content-Length` smaller than the bytes already buffered is
//! treated as an error rather than the start of a next request.
//!
//! Chunked framing is `hexlen\r\n<bytes>\r\n`, terminated by a zero-length
//! chunk.  A stream that ends without the terminator is surfaced to readers
//! as an incomplete result.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Result, RpcError};

/// Soft limits applied while reading one message.
#[derive(Debug, Clone)]
pub struct HttpLimits {
    /// Reject messages whose total size exceeds this (default 1 MiB).
    pub max_size: usize,
    /// Deadline for the head to arrive (default 1 s).
    pub timeout1: Duration,
    /// Deadline for the whole message (default 15 s).
    pub timeout2: Duration,
}

impl Default for HttpLimits {
    fn default() -> Self {
        HttpLimits {
            max_size: 1024 * 1024,
            timeout1: Duration::from_secs(1),
            timeout2: Duration::from_secs(15),
        }
    }
}

/// Byte source feeding the parser.  `recv` returns the next batch of bytes
/// plus any descriptors that arrived as ancillary data (local sockets only);
/// an empty batch means end-of-stream.
pub trait Transport {
    fn recv(
        &mut self,
        max: usize,
        want_fds: bool,
    ) -> impl Future<Output = Result<(Vec<u8>, Vec<OwnedFd>)>> + Send;
}

/// One parsed HTTP message: the request (or status) line, the header
/// mapping with names exactly as received, the body, and any descriptors
/// that rode along.
#[derive(Debug)]
pub struct Message {
    pub head: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Method and path of a request line.
    pub fn method_and_path(&self) -> Result<(&str, &str)> {
        let mut parts = self.head.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(method), Some(path)) => Ok((method, path)),
            _ => Err(RpcError::MalformedRequest(format!("bad request line: {}", self.head))),
        }
    }

    /// Status code of a response line.
    pub fn status_code(&self) -> Result<u16> {
        self.head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RpcError::MalformedRequest(format!("bad status line: {}", self.head)))
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding") == Some("chunked")
    }
}

/// Read and parse one request.  `want_fds` enables ancillary-data
/// collection on transports that support it.
///
/// The body is exactly `Content-Length` bytes; keep-alive is not supported,
/// so surplus bytes beyond it are an error (a chunked continuation is the
/// one legal tail, returned for the chunk reader to continue from).
pub async fn read_message<T: Transport>(
    transport: &mut T,
    limits: &HttpLimits,
    want_fds: bool,
) -> Result<(Message, Vec<u8>)> {
    read_framed(transport, limits, want_fds, false).await
}

/// Read and parse one response.  Responses announce no `Content-Length`
/// (`Connection: close` delimits them), so a non-chunked body runs until
/// end-of-stream; a chunked response returns at the head, with any buffered
/// surplus as the tail.
pub async fn read_response<T: Transport>(
    transport: &mut T,
    limits: &HttpLimits,
    want_fds: bool,
) -> Result<(Message, Vec<u8>)> {
    read_framed(transport, limits, want_fds, true).await
}

async fn read_framed<T: Transport>(
    transport: &mut T,
    limits: &HttpLimits,
    want_fds: bool,
    is_response: bool,
) -> Result<(Message, Vec<u8>)> {
    let start = Instant::now();
    let head_deadline = start + limits.timeout1;
    let full_deadline = start + limits.timeout2;

    let mut buffer: Vec<u8> = Vec::with_capacity(8192);
    let mut fds: Vec<OwnedFd> = Vec::new();
    let mut head_end: Option<(usize, usize)> = None; // (head length, separator length)

    // Phase 1: accumulate until the blank line ending the head.
    while head_end.is_none() {
        let deadline = head_deadline.min(full_deadline);
        let (data, mut new_fds) = recv_deadline(transport, deadline, want_fds).await?;
        if data.is_empty() {
            return Err(RpcError::MalformedRequest("header not found in HTTP data".into()));
        }
        buffer.extend_from_slice(&data);
        fds.append(&mut new_fds);
        if buffer.len() > limits.max_size {
            return Err(RpcError::MalformedRequest("request too large".into()));
        }
        head_end = find_head_end(&buffer);
    }

    let (head_len, sep_len) = head_end.unwrap();
    let head_text = std::str::from_utf8(&buffer[..head_len])
        .map_err(|_| RpcError::MalformedRequest("head is not UTF-8".into()))?
        .to_owned();

    let mut lines = head_text.lines();
    let head = lines
        .next()
        .ok_or_else(|| RpcError::MalformedRequest("empty head".into()))?
        .to_owned();
    let mut headers = BTreeMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(": ")
            .ok_or_else(|| RpcError::MalformedRequest(format!("bad header line: {line:?}")))?;
        headers.insert(name.to_owned(), value.to_owned());
    }

    // Phase 2: the body.  Chunked bodies are left to the chunk reader,
    // which continues from the returned tail.
    let body_start = head_len + sep_len;
    let chunked = headers.get("Transfer-Encoding").is_some_and(|t| t == "chunked");
    let content_length: Option<usize> = match headers.get("Content-Length") {
        Some(text) => Some(text.parse().map_err(|_| {
            RpcError::MalformedRequest(format!("bad Content-Length: {text}"))
        })?),
        None => None,
    };

    if is_response && content_length.is_none() && !chunked {
        // No length, no chunking: the close delimits the body.
        loop {
            if buffer.len() > limits.max_size {
                return Err(RpcError::MalformedRequest("response too large".into()));
            }
            let (data, mut new_fds) = recv_deadline(transport, full_deadline, want_fds).await?;
            if data.is_empty() {
                break;
            }
            buffer.extend_from_slice(&data);
            fds.append(&mut new_fds);
        }
        let body = buffer.split_off(body_start);
        return Ok((Message { head, headers, body, fds }, Vec::new()));
    }

    let content_length = content_length.unwrap_or(0);
    while buffer.len() < body_start + content_length {
        if body_start + content_length > limits.max_size {
            return Err(RpcError::MalformedRequest("request too large".into()));
        }
        let (data, mut new_fds) = recv_deadline(transport, full_deadline, want_fds).await?;
        if data.is_empty() {
            let missing = body_start + content_length - buffer.len();
            return Err(RpcError::MalformedRequest(format!(
                "HTTP data incomplete, expected {missing} more bytes"
            )));
        }
        buffer.extend_from_slice(&data);
        fds.append(&mut new_fds);
    }

    let mut body = buffer.split_off(body_start);
    let tail = body.split_off(content_length.min(body.len()));
    // Surplus bytes after a request are the next request's, but there is
    // no keep-alive, so only a chunked continuation may follow.
    if !tail.is_empty() && !chunked && !is_response {
        return Err(RpcError::MalformedRequest(format!(
            "{} surplus bytes after request body",
            tail.len()
        )));
    }

    Ok((Message { head, headers, body, fds }, tail))
}

async fn recv_deadline<T: Transport>(
    transport: &mut T,
    deadline: Instant,
    want_fds: bool,
) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
    match tokio::time::timeout_at(deadline, transport.recv(65536, want_fds)).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    }
}

/// Locate the blank line ending the head.  Returns (head length, separator
/// length); the separator is twice the detected line ending.
fn find_head_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let nl = buffer.iter().position(|b| *b == b'\n')?;
    let crlf = nl > 0 && buffer[nl - 1] == b'\r';
    let sep: &[u8] = if crlf { b"\r\n\r\n" } else { b"\n\n" };
    let at = buffer.windows(sep.len()).position(|w| w == sep)?;
    Some((at, sep.len()))
}

// ---------------------------------------------------------------------------
// Response building
// ---------------------------------------------------------------------------

fn status_line(code: u16) -> String {
    let phrase = match code {
        200 => "OK",
        202 => "Accepted",
        302 => "Found",
        400 => "Invalid Request",
        403 => "Access Denied",
        404 => "Not Found",
        423 => "Locked",
        500 => "Internal Error",
        _ => "Unknown",
    };
    format!("HTTP/1.1 {code} {phrase}\n")
}

/// A complete response head: status line, `Content-Type`,
/// `Connection: close`, any extra headers, and the blank line.
pub fn response_head(code: u16, mimetype: &str, extra_headers: &[(&str, &str)]) -> Vec<u8> {
    let mut head = status_line(code);
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\n"));
    }
    head.push_str(&format!("Content-Type: {mimetype}\nConnection: close\n\n"));
    head.into_bytes()
}

/// The head of a chunked response.
pub fn chunked_head(code: u16, mimetype: &str) -> Vec<u8> {
    let mut head = status_line(code);
    head.push_str(&format!(
        "Transfer-Encoding: chunked\nContent-Type: {mimetype}\nConnection: close\n\n"
    ));
    head.into_bytes()
}

/// Frame one chunk.  An empty `data` produces the end-of-stream terminator.
pub fn chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Try to cut one chunk off the front of `buffer`.
///
/// `Some((data, consumed))` when a complete chunk is buffered; an empty
/// `data` is the terminator.  `None` means more bytes are needed; the cut
/// requires the full `len + 2` bytes so the trailing CRLF is consumed too.
pub fn split_chunk(buffer: &[u8]) -> Option<(Vec<u8>, usize)> {
    let line_end = buffer.windows(2).position(|w| w == b"\r\n")?;
    let len_text = std::str::from_utf8(&buffer[..line_end]).ok()?;
    let len = usize::from_str_radix(len_text.trim(), 16).ok()?;
    let data_start = line_end + 2;
    if buffer.len() >= data_start + len + 2 {
        let data = buffer[data_start..data_start + len].to_vec();
        Some((data, data_start + len + 2))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds a canned byte stream in fixed-size pieces.
    struct ByteFeed {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl ByteFeed {
        fn new(data: &[u8], step: usize) -> Self {
            ByteFeed { data: data.to_vec(), pos: 0, step }
        }
    }

    impl Transport for ByteFeed {
        async fn recv(&mut self, max: usize, _want_fds: bool) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
            let end = (self.pos + self.step.min(max)).min(self.data.len());
            let piece = self.data[self.pos..end].to_vec();
            self.pos = end;
            Ok((piece, Vec::new()))
        }
    }

    fn limits() -> HttpLimits {
        HttpLimits::default()
    }

    #[tokio::test]
    async fn parses_a_crlf_request_with_body() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\n{\"a\":";
        let mut feed = ByteFeed::new(raw, 7);
        let (msg, tail) = read_message(&mut feed, &limits(), false).await.unwrap();
        assert_eq!(msg.method_and_path().unwrap(), ("POST", "/x"));
        assert_eq!(msg.header("Content-Type"), Some("application/json"));
        assert_eq!(msg.body, b"{\"a\":");
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn parses_an_lf_only_request() {
        let raw = b"GET /secret/meow HTTP/1.1\nHost: x\n\n";
        let mut feed = ByteFeed::new(raw, 64);
        let (msg, _) = read_message(&mut feed, &limits(), false).await.unwrap();
        assert_eq!(msg.method_and_path().unwrap(), ("GET", "/secret/meow"));
        assert_eq!(msg.header("Host"), Some("x"));
        assert!(msg.body.is_empty());
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected() {
        let mut raw = b"POST / HTTP/1.1\n".to_vec();
        raw.extend(std::iter::repeat_n(b'x', 4096));
        let mut feed = ByteFeed::new(&raw, 512);
        let small = HttpLimits { max_size: 1024, ..limits() };
        let err = read_message(&mut feed, &small, false).await.unwrap_err();
        assert!(matches!(err, RpcError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn surplus_bytes_after_the_body_are_an_error() {
        let raw = b"POST / HTTP/1.1\nContent-Length: 2\n\nokEXTRA";
        let mut feed = ByteFeed::new(raw, 64);
        let err = read_message(&mut feed, &limits(), false).await.unwrap_err();
        assert!(matches!(err, RpcError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let raw = b"POST / HTTP/1.1\nContent-Length: 10\n\nshort";
        let mut feed = ByteFeed::new(raw, 64);
        let err = read_message(&mut feed, &limits(), false).await.unwrap_err();
        assert!(matches!(err, RpcError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn header_timeout_fires() {
        struct Stalled;
        impl Transport for Stalled {
            async fn recv(&mut self, _: usize, _: bool) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok((Vec::new(), Vec::new()))
            }
        }
        tokio::time::pause();
        let tight = HttpLimits { timeout1: Duration::from_millis(20), ..limits() };
        let err = read_message(&mut Stalled, &tight, false).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
    }

    #[tokio::test]
    async fn response_body_runs_to_the_close() {
        let raw = b"HTTP/1.1 200 OK\nContent-Type: application/json\nConnection: close\n\n{\"pong\": true}\n";
        let mut feed = ByteFeed::new(raw, 10);
        let (msg, tail) = read_response(&mut feed, &limits(), false).await.unwrap();
        assert_eq!(msg.status_code().unwrap(), 200);
        assert_eq!(msg.body, b"{\"pong\": true}\n");
        assert!(tail.is_empty());
    }

    #[tokio::test]
    async fn chunked_response_returns_at_the_head_with_tail() {
        let mut raw = b"HTTP/1.1 200 OK\nTransfer-Encoding: chunked\nContent-Type: application/json\nConnection: close\n\n".to_vec();
        raw.extend(chunk(b"{\"n\":1}"));
        let mut feed = ByteFeed::new(&raw, 4096);
        let (msg, tail) = read_response(&mut feed, &limits(), false).await.unwrap();
        assert!(msg.is_chunked());
        assert!(msg.body.is_empty());
        let (data, _) = split_chunk(&tail).unwrap();
        assert_eq!(data, b"{\"n\":1}");
    }

    #[test]
    fn response_head_layout() {
        let head = response_head(200, "text/plain", &[]);
        let text = String::from_utf8(head).unwrap();
        assert_eq!(text, "HTTP/1.1 200 OK\nContent-Type: text/plain\nConnection: close\n\n");

        let redirect = response_head(302, "application/json", &[("Location", "/elsewhere")]);
        let text = String::from_utf8(redirect).unwrap();
        assert!(text.starts_with("HTTP/1.1 302 Found\nLocation: /elsewhere\n"));
    }

    #[test]
    fn chunks_frame_and_split() {
        let framed = chunk(b"hello");
        assert_eq!(framed, b"5\r\nhello\r\n");
        let (data, used) = split_chunk(&framed).unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(used, framed.len());
    }

    #[test]
    fn terminator_is_a_zero_chunk() {
        assert_eq!(chunk(b""), b"0\r\n\r\n");
        let (data, used) = split_chunk(b"0\r\n\r\n").unwrap();
        assert!(data.is_empty());
        assert_eq!(used, 5);
    }

    #[test]
    fn split_needs_the_trailing_crlf() {
        // 5-byte chunk with only len+1 trailing bytes buffered: not yet.
        assert!(split_chunk(b"5\r\nhello\r").is_none());
        assert!(split_chunk(b"5\r\nhello\r\n").is_some());
    }

    #[test]
    fn split_chunk_across_concatenated_chunks() {
        let mut buf = chunk(b"one");
        buf.extend(chunk(b"two"));
        let (first, used) = split_chunk(&buf).unwrap();
        assert_eq!(first, b"one");
        let (second, _) = split_chunk(&buf[used..]).unwrap();
        assert_eq!(second, b"two");
    }
}
