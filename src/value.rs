//! Dynamic value model for RPC arguments and results.
//!
//! Arguments and results travel as self-describing values (the codecs in
//! [`crate::codec`] map them onto JSON, msgpack and form bodies).  Open file
//! descriptors are carried as [`Value::Fd`], a tagged sum type in memory,
//! serialized to the literal magic placeholder strings only at the wire
//! boundary, with the live descriptors travelling out-of-band as ancillary
//! data on the local socket.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::{Result, RpcError};

/// Placeholder prefix for a plain file descriptor; the suffix is the
/// opener's mode string (`_FD_BRE_MAGIC_-rb`).
pub const MAGIC_FD: &str = "_FD_BRE_MAGIC_";
/// Placeholder prefix for a socket; the suffix is the decimal
/// family/type/protocol triple (`_SO_BRE_MAGIC_-1-1-0`).
pub const MAGIC_SOCK: &str = "_SO_BRE_MAGIC_";

// ---------------------------------------------------------------------------
// FdSpec: what kind of descriptor a placeholder stands for
// ---------------------------------------------------------------------------

/// The wire-visible description of a transferred descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdSpec {
    /// A regular file, with the mode string it was opened with.
    File { mode: String },
    /// A socket, described by its address family, type and protocol.
    Socket { family: i32, stype: i32, proto: i32 },
}

impl FdSpec {
    /// Render the magic placeholder string for this descriptor.
    pub fn to_magic(&self) -> String {
        match self {
            FdSpec::File { mode } => format!("{MAGIC_FD}-{mode}"),
            FdSpec::Socket { family, stype, proto } => {
                format!("{MAGIC_SOCK}-{family}-{stype}-{proto}")
            }
        }
    }

    /// Parse a magic placeholder string; `None` if `s` is an ordinary string.
    pub fn from_magic(s: &str) -> Option<FdSpec> {
        if let Some(rest) = s.strip_prefix(MAGIC_SOCK) {
            let mut parts = rest.strip_prefix('-')?.splitn(3, '-');
            let family = parts.next()?.parse().ok()?;
            let stype = parts.next()?.parse().ok()?;
            let proto = parts.next()?.parse().ok()?;
            return Some(FdSpec::Socket { family, stype, proto });
        }
        if let Some(rest) = s.strip_prefix(MAGIC_FD) {
            return Some(FdSpec::File { mode: rest.strip_prefix('-')?.to_owned() });
        }
        None
    }

    pub fn is_socket(&self) -> bool {
        matches!(self, FdSpec::Socket { .. })
    }
}

// ---------------------------------------------------------------------------
// FdValue: a spec plus a live duplicated descriptor
// ---------------------------------------------------------------------------

/// A descriptor argument or result.
///
/// Holds the placeholder spec and a duplicated `OwnedFd`.  The duplicate
/// keeps the value independent of the caller's handle; the kernel reference
/// is dropped with the last clone.
#[derive(Debug, Clone)]
pub struct FdValue {
    spec: FdSpec,
    fd: Arc<OwnedFd>,
}

impl FdValue {
    /// Wrap a file opened for reading (mode `rb`).
    pub fn file_read(file: &File) -> std::io::Result<FdValue> {
        Self::file(file, "rb")
    }

    /// Wrap a file opened for writing (mode `wb`).
    pub fn file_write(file: &File) -> std::io::Result<FdValue> {
        Self::file(file, "wb")
    }

    /// Wrap a file with an explicit mode string.
    pub fn file(file: &File, mode: &str) -> std::io::Result<FdValue> {
        Ok(FdValue {
            spec: FdSpec::File { mode: mode.to_owned() },
            fd: Arc::new(file.as_fd().try_clone_to_owned()?),
        })
    }

    /// Wrap a TCP stream (the family is taken from its local address).
    pub fn tcp_stream(sock: &std::net::TcpStream) -> std::io::Result<FdValue> {
        let family = match sock.local_addr()? {
            std::net::SocketAddr::V4(_) => libc::AF_INET,
            std::net::SocketAddr::V6(_) => libc::AF_INET6,
        };
        Ok(FdValue {
            spec: FdSpec::Socket { family, stype: libc::SOCK_STREAM, proto: 0 },
            fd: Arc::new(sock.as_fd().try_clone_to_owned()?),
        })
    }

    /// Wrap a Unix-domain stream socket.
    pub fn unix_stream<F: AsFd>(sock: &F) -> std::io::Result<FdValue> {
        Ok(FdValue {
            spec: FdSpec::Socket { family: libc::AF_UNIX, stype: libc::SOCK_STREAM, proto: 0 },
            fd: Arc::new(sock.as_fd().try_clone_to_owned()?),
        })
    }

    /// Pair a received descriptor with the placeholder spec that announced it.
    pub fn received(spec: FdSpec, fd: OwnedFd) -> FdValue {
        FdValue { spec, fd: Arc::new(fd) }
    }

    pub fn spec(&self) -> &FdSpec {
        &self.spec
    }

    /// The raw descriptor, for handing to `sendmsg`.  The fd stays owned by
    /// this value.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicate the underlying descriptor into a standalone `OwnedFd`.
    pub fn dup(&self) -> Result<OwnedFd> {
        Ok(self.fd.try_clone()?)
    }

    /// Take the descriptor as a `std::fs::File` (regular-file specs).
    pub fn to_file(&self) -> Result<File> {
        match &self.spec {
            FdSpec::File { .. } => Ok(File::from(self.dup()?)),
            FdSpec::Socket { .. } => {
                Err(RpcError::BadValue("descriptor is a socket, not a file".into()))
            }
        }
    }

    /// Take the descriptor as a nonblocking `tokio` Unix stream.
    pub fn to_unix_stream(&self) -> Result<tokio::net::UnixStream> {
        match &self.spec {
            FdSpec::Socket { family, .. } if *family == libc::AF_UNIX => {
                let std_stream = std::os::unix::net::UnixStream::from(self.dup()?);
                std_stream.set_nonblocking(true)?;
                Ok(tokio::net::UnixStream::from_std(std_stream)?)
            }
            _ => Err(RpcError::BadValue("descriptor is not a unix-domain socket".into())),
        }
    }

    /// Take the descriptor as a nonblocking `tokio` TCP stream.
    pub fn to_tcp_stream(&self) -> Result<tokio::net::TcpStream> {
        match &self.spec {
            FdSpec::Socket { family, .. }
                if *family == libc::AF_INET || *family == libc::AF_INET6 =>
            {
                let std_stream = std::net::TcpStream::from(self.dup()?);
                std_stream.set_nonblocking(true)?;
                Ok(tokio::net::TcpStream::from_std(std_stream)?)
            }
            _ => Err(RpcError::BadValue("descriptor is not a TCP socket".into())),
        }
    }
}

impl PartialEq for FdValue {
    // Placeholder identity; the live descriptor does not take part.
    fn eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

pub type Map = BTreeMap<String, Value>;

/// A self-describing RPC value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(Map),
    Fd(FdValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_fd(&self) -> Option<&FdValue> {
        match self {
            Value::Fd(fd) => Some(fd),
            _ => None,
        }
    }

    /// Map field lookup; `Null` maps and non-maps yield `None`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// "1", "t", "true", "y", "yes" (any case) are true; all else false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => {
                matches!(s.to_ascii_lowercase().as_str(), "1" | "t" | "true" | "y" | "yes")
            }
            Value::Int(i) => *i != 0,
            Value::UInt(u) => *u != 0,
            Value::Float(f) => *f != 0.0,
            Value::Null => false,
            Value::Bytes(b) => !b.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Fd(_) => true,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v.into())
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::UInt(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::Array(v)
    }
}
impl From<Map> for Value {
    fn from(v: Map) -> Value {
        Value::Map(v)
    }
}
impl From<FdValue> for Value {
    fn from(v: FdValue) -> Value {
        Value::Fd(v)
    }
}

/// Parse an integer the way CLI inputs write them: decimal, `0x`, `0o` or
/// `0b`, with an optional leading sign.
pub fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()?
    } else {
        digits.parse().ok()?
    };
    Some(if neg { -value } else { value })
}

/// Compact, truncated rendering of an argument list for log lines.
pub fn str_args(args: &[Value]) -> String {
    fn trunc(s: &str, l: usize) -> String {
        if s.len() > l { format!("{}..", &s[..l - 2]) } else { s.to_owned() }
    }

    fn fmt(v: &Value) -> String {
        match v {
            Value::Null => "null".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => format!("{f:.3}"),
            Value::Str(s) => format!("'{}'", trunc(s, 16)),
            Value::Bytes(b) => format!("<bytes({})>", b.len()),
            Value::Array(a) => format!("<list({})>", a.len()),
            Value::Map(m) => format!("<dict({})>", m.len()),
            Value::Fd(fd) => format!("<fd {}>", fd.spec().to_magic()),
        }
    }

    args.iter().map(fmt).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_placeholders_round_trip() {
        let file = FdSpec::File { mode: "rb".into() };
        assert_eq!(file.to_magic(), "_FD_BRE_MAGIC_-rb");
        assert_eq!(FdSpec::from_magic("_FD_BRE_MAGIC_-rb"), Some(file));

        let sock = FdSpec::Socket { family: 1, stype: 1, proto: 0 };
        assert_eq!(sock.to_magic(), "_SO_BRE_MAGIC_-1-1-0");
        assert_eq!(FdSpec::from_magic("_SO_BRE_MAGIC_-1-1-0"), Some(sock));

        assert_eq!(FdSpec::from_magic("just a string"), None);
        assert_eq!(FdSpec::from_magic("_SO_BRE_MAGIC_-x-y-z"), None);
    }

    #[test]
    fn truthy_matches_the_fixed_true_set() {
        for s in ["1", "t", "true", "y", "yes", "TRUE", "Yes", "T"] {
            assert!(Value::Str(s.into()).truthy(), "{s} should be true");
        }
        for s in ["0", "f", "false", "n", "no", "nope", ""] {
            assert!(!Value::Str(s.into()).truthy(), "{s} should be false");
        }
        assert!(Value::Bool(true).truthy());
        assert!(!Value::Null.truthy());
    }

    #[test]
    fn integers_parse_in_all_spelled_bases() {
        assert_eq!(parse_int("0xF"), Some(15));
        assert_eq!(parse_int("0xa"), Some(10));
        assert_eq!(parse_int("0b10"), Some(2));
        assert_eq!(parse_int("0o17"), Some(15));
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-0x10"), Some(-16));
        assert_eq!(parse_int("nope"), None);
    }

    #[test]
    fn fd_value_from_file_resolves_and_dups() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"mrow").unwrap();
        let file = File::open(tmp.path()).unwrap();
        let fdv = FdValue::file_read(&file).unwrap();
        assert_eq!(fdv.spec(), &FdSpec::File { mode: "rb".into() });
        drop(file); // the FdValue's dup must stay alive

        let mut reopened = fdv.to_file().unwrap();
        use std::io::Read;
        let mut buf = String::new();
        reopened.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "mrow");
    }

    #[test]
    fn str_args_truncates_long_strings() {
        let rendered = str_args(&[
            Value::Str("a-very-long-string-indeed".into()),
            Value::Int(7),
            Value::Array(vec![Value::Null; 3]),
        ]);
        assert_eq!(rendered, "'a-very-long-st..', 7, <list(3)>");
    }
}
