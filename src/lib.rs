//! whisker: a micro-framework for cooperating worker processes.
//!
//! A worker exposes user handlers as HTTP/1.1 RPC endpoints on a TCP socket
//! and a local-domain socket, authenticated by a per-worker secret embedded
//! in the URL.  Streaming handlers answer with chunked transfer encoding;
//! on the local socket, open file descriptors (including listening sockets)
//! travel between processes as ancillary data.
//!
//! The call side connects to a running worker, preferring the local socket
//! once it is known good, auto-launching the worker when asked, or runs
//! handlers in-process (loopback) when embedding as a library.

pub mod builtins;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fdpass;
pub mod http;
pub mod registry;
pub mod request;
pub mod server;
pub mod value;

pub use client::{CallClient, CallOptions, CallResult, CallStream, ReplyTo};
pub use config::Config;
pub use error::{NeededVar, Result, RpcError};
pub use registry::{
    ApiReply, Args, Auth, Capability, HttpResult, MethodKind, MethodTable, ParamSpec, ParamType,
    RpcService, StreamItem, opt_param, param,
};
pub use request::{Conn, Origin, Req, Request};
pub use server::Worker;
pub use value::{FdSpec, FdValue, Map, Value};
