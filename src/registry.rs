//! The handler registry.
//!
//! Handlers are registered under a plain name with an authentication class
//! and a shape: unary (`api`), streaming (`stream`, a lazy finite sequence)
//! or raw (`raw`, which takes the response writer).  Lookup order for a
//! request is fixed: private raw, private api, public raw, public api,
//! with private entries only when the request is authenticated.
//!
//! Each entry carries an ordered parameter schema (name, type tag, default)
//! used to coerce string-typed CLI/query inputs before the handler runs.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, Stream, StreamExt};

use crate::error::{Result, RpcError};
use crate::request::{Req, Request};
use crate::value::{Map, Value, parse_int};

// ---------------------------------------------------------------------------
// Auth class and parameter schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// Reachable only with the access secret.
    Private,
    /// Reachable without authentication.
    Public,
}

/// Type tag driving argument coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Any,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
}

impl ParamType {
    pub fn tag(self) -> &'static str {
        match self {
            ParamType::Any => "any",
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Str => "str",
            ParamType::Bytes => "bytes",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub ptype: ParamType,
    pub default: Option<Value>,
}

/// A required parameter.
pub fn param(name: &str, ptype: ParamType) -> ParamSpec {
    ParamSpec { name: name.to_owned(), ptype, default: None }
}

/// An optional parameter with a default.
pub fn opt_param(name: &str, ptype: ParamType, default: impl Into<Value>) -> ParamSpec {
    ParamSpec { name: name.to_owned(), ptype, default: Some(default.into()) }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Decoded call arguments: the `_args` positional list plus named values.
#[derive(Debug, Default, Clone)]
pub struct Args {
    pub positional: Vec<Value>,
    pub named: Map,
}

impl Args {
    /// Split a decoded request body into positional and named arguments.
    pub fn from_body(body: Value) -> Args {
        let mut named = match body {
            Value::Map(m) => m,
            _ => Map::new(),
        };
        let positional = match named.remove("_args") {
            Some(Value::Array(items)) => items,
            Some(single) => vec![single],
            None => Vec::new(),
        };
        Args { positional, named }
    }

    pub fn pos(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// Bind positionals to schema slots and coerce everything typed.
    ///
    /// After this, every schema parameter that was supplied (positionally or
    /// by name) or has a default is available via [`Args::get`].
    pub fn apply_schema(&mut self, params: &[ParamSpec]) -> Result<()> {
        for (i, spec) in params.iter().enumerate() {
            if let Some(value) = self.positional.get(i) {
                let coerced = coerce(value.clone(), spec.ptype)?;
                self.positional[i] = coerced.clone();
                self.named.entry(spec.name.clone()).or_insert(coerced);
            } else if let Some(value) = self.named.get(&spec.name) {
                let coerced = coerce(value.clone(), spec.ptype)?;
                self.named.insert(spec.name.clone(), coerced);
            } else if let Some(default) = &spec.default {
                self.named.insert(spec.name.clone(), default.clone());
            } else {
                return Err(RpcError::BadValue(format!("missing argument: {}", spec.name)));
            }
        }
        Ok(())
    }
}

/// Coerce one value to a tagged type.  Only string inputs are converted;
/// values already of a compatible shape pass through.
pub fn coerce(value: Value, ptype: ParamType) -> Result<Value> {
    let coerced = match (ptype, value) {
        (ParamType::Any | ParamType::Str, v) => v,
        (ParamType::Bool, v) => Value::Bool(v.truthy()),
        (ParamType::Int, Value::Str(s)) => Value::Int(
            parse_int(&s).ok_or_else(|| RpcError::BadValue(format!("not an integer: {s:?}")))?,
        ),
        (ParamType::Int, v @ (Value::Int(_) | Value::UInt(_))) => v,
        (ParamType::Int, other) => {
            return Err(RpcError::BadValue(format!("not an integer: {other:?}")));
        }
        (ParamType::Float, Value::Str(s)) => Value::Float(
            s.trim()
                .parse()
                .map_err(|_| RpcError::BadValue(format!("not a number: {s:?}")))?,
        ),
        (ParamType::Float, v @ (Value::Float(_) | Value::Int(_) | Value::UInt(_))) => v,
        (ParamType::Float, other) => {
            return Err(RpcError::BadValue(format!("not a number: {other:?}")));
        }
        (ParamType::Bytes, Value::Str(s)) => Value::Bytes(s.into_bytes()),
        (ParamType::Bytes, v) => v,
    };
    Ok(coerced)
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A unary handler result carrying its own MIME type (and optionally a
/// status code or redirect target).
#[derive(Debug, Clone)]
pub struct HttpResult {
    pub mimetype: String,
    pub data: Vec<u8>,
    pub http_code: Option<u16>,
    pub redirect_to: Option<String>,
}

/// What a unary handler returns.
pub enum ApiReply {
    /// A plain value, encoded with the request-selected encoder.
    Value(Value),
    /// Pre-encoded data with an explicit MIME type.
    Http(HttpResult),
    /// Open descriptors: the FD-result envelope (local connections only).
    Fds(Vec<crate::value::FdValue>),
}

impl ApiReply {
    pub fn value(v: impl Into<Value>) -> ApiReply {
        ApiReply::Value(v.into())
    }

    pub fn mime(mimetype: &str, data: impl Into<Vec<u8>>) -> ApiReply {
        ApiReply::Http(HttpResult {
            mimetype: mimetype.to_owned(),
            data: data.into(),
            http_code: None,
            redirect_to: None,
        })
    }

    pub fn redirect(target: &str) -> ApiReply {
        ApiReply::Http(HttpResult {
            mimetype: crate::codec::MIME_JSON.to_owned(),
            data: Vec::new(),
            http_code: Some(302),
            redirect_to: Some(target.to_owned()),
        })
    }
}

/// One item of a streaming handler's sequence.  Only the first item may set
/// a MIME type; the framing layer rejects later switches.
pub struct StreamItem {
    pub mimetype: Option<String>,
    pub data: Value,
}

impl StreamItem {
    pub fn value(v: impl Into<Value>) -> StreamItem {
        StreamItem { mimetype: None, data: v.into() }
    }

    pub fn mime(mimetype: &str, v: impl Into<Value>) -> StreamItem {
        StreamItem { mimetype: Some(mimetype.to_owned()), data: v.into() }
    }
}

// ---------------------------------------------------------------------------
// Handler kinds
// ---------------------------------------------------------------------------

pub type ApiFn = Arc<dyn Fn(Req, Args) -> BoxFuture<'static, Result<ApiReply>> + Send + Sync>;
pub type StreamFn = Arc<dyn Fn(Req, Args) -> BoxStream<'static, Result<StreamItem>> + Send + Sync>;
pub type RawFn =
    Arc<dyn for<'a> Fn(&'a mut Request, Args) -> BoxFuture<'a, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub enum MethodKind {
    Api(ApiFn),
    Stream(StreamFn),
    Raw(RawFn),
}

impl MethodKind {
    pub fn is_raw(&self) -> bool {
        matches!(self, MethodKind::Raw(_))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, MethodKind::Stream(_))
    }
}

#[derive(Clone)]
pub struct Method {
    pub name: String,
    pub auth: Auth,
    pub params: Vec<ParamSpec>,
    pub help: Option<String>,
    pub kind: MethodKind,
}

// ---------------------------------------------------------------------------
// MethodTable
// ---------------------------------------------------------------------------

/// The per-worker handler table.  A name maps to at most one handler per
/// (auth, raw-ness) slot; re-registration replaces the previous entry.
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: Vec<Method>,
}

impl MethodTable {
    pub fn new() -> MethodTable {
        MethodTable::default()
    }

    /// Register a unary handler.
    pub fn api<F, Fut>(&mut self, name: &str, auth: Auth, params: Vec<ParamSpec>, help: &str, f: F)
    where
        F: Fn(Req, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiReply>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(Method {
            name: name.to_owned(),
            auth,
            params,
            help: help_of(help),
            kind: MethodKind::Api(Arc::new(move |req, args| f(req, args).boxed())),
        });
    }

    /// Register a streaming handler.
    pub fn stream<F, St>(
        &mut self,
        name: &str,
        auth: Auth,
        params: Vec<ParamSpec>,
        help: &str,
        f: F,
    ) where
        F: Fn(Req, Args) -> St + Send + Sync + 'static,
        St: Stream<Item = Result<StreamItem>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(Method {
            name: name.to_owned(),
            auth,
            params,
            help: help_of(help),
            kind: MethodKind::Stream(Arc::new(move |req, args| f(req, args).boxed())),
        });
    }

    /// Register a raw handler, which takes direct control of the writer.
    pub fn raw<F>(&mut self, name: &str, auth: Auth, params: Vec<ParamSpec>, help: &str, f: F)
    where
        F: for<'a> Fn(&'a mut Request, Args) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.insert(Method {
            name: name.to_owned(),
            auth,
            params,
            help: help_of(help),
            kind: MethodKind::Raw(Arc::new(f)),
        });
    }

    pub fn insert(&mut self, method: Method) {
        self.methods.retain(|m| {
            !(m.name == method.name
                && m.auth == method.auth
                && m.kind.is_raw() == method.kind.is_raw())
        });
        self.methods.push(method);
    }

    /// Merge another table in (capability modules contribute this way).
    pub fn merge(&mut self, other: MethodTable) {
        for method in other.methods {
            self.insert(method);
        }
    }

    /// Resolve a name for a request: private raw, private api, public raw,
    /// public api; first match wins, private only when authed.
    pub fn resolve(&self, name: &str, authed: bool) -> Option<&Method> {
        let slots: [(Auth, bool); 4] = [
            (Auth::Private, true),
            (Auth::Private, false),
            (Auth::Public, true),
            (Auth::Public, false),
        ];
        for (auth, raw) in slots {
            if auth == Auth::Private && !authed {
                continue;
            }
            if let Some(m) = self
                .methods
                .iter()
                .find(|m| m.name == name && m.auth == auth && m.kind.is_raw() == raw)
            {
                return Some(m);
            }
        }
        None
    }

    /// All distinct names, resolved as an authed request would see them.
    pub fn commands(&self) -> Vec<&Method> {
        let mut names: Vec<&str> = self.methods.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.into_iter().filter_map(|n| self.resolve(n, true)).collect()
    }

    /// The method inventory advertised by an authed ping: per name, the
    /// argument names, option (defaulted) names, shape, and help text.
    pub fn inventory(&self) -> Value {
        let mut out = Map::new();
        for method in self.commands() {
            let mut info = Map::new();
            info.insert(
                "args".into(),
                Value::Array(
                    method.params.iter().map(|p| Value::Str(p.name.clone())).collect(),
                ),
            );
            info.insert(
                "options".into(),
                Value::Array(
                    method
                        .params
                        .iter()
                        .filter(|p| p.default.is_some())
                        .map(|p| Value::Str(p.name.clone()))
                        .collect(),
                ),
            );
            info.insert(
                "types".into(),
                Value::Array(
                    method.params.iter().map(|p| Value::Str(p.ptype.tag().into())).collect(),
                ),
            );
            info.insert("is_generator".into(), Value::Bool(method.kind.is_stream()));
            info.insert(
                "auth".into(),
                Value::Str(match method.auth {
                    Auth::Private => "private".into(),
                    Auth::Public => "public".into(),
                }),
            );
            if let Some(help) = &method.help {
                info.insert("help".into(), Value::Str(help.clone()));
            }
            out.insert(method.name.clone(), Value::Map(info));
        }
        Value::Map(out)
    }
}

fn help_of(help: &str) -> Option<String> {
    if help.is_empty() { None } else { Some(help.to_owned()) }
}

// ---------------------------------------------------------------------------
// Service trait and capability modules
// ---------------------------------------------------------------------------

/// A worker's user-supplied side: registers handlers, may route unmatched
/// names, and may clean up on shutdown.
pub trait RpcService: Send + Sync + Sized + 'static {
    /// Populate the method table.  Called once at startup (service side)
    /// or at loopback setup (library side).
    fn register(self: &Arc<Self>, methods: &mut MethodTable);

    /// Last-resort routing when no table entry matched.  Returning a kind
    /// serves the request with it; `None` yields 404 (authed) or 403.
    fn fallback(self: &Arc<Self>, req: &Req) -> Option<MethodKind> {
        let _ = req;
        None
    }

    /// Cleanup hook awaited during shutdown.
    fn shutdown(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

/// A composable bundle of handlers (the framework's add-ons, such as metrics or
/// web front-ends, contribute through this rather than subclassing).
pub trait Capability: Send + Sync {
    fn register(&self, methods: &mut MethodTable);
}
