//! Shared test services and harness helpers.
//!
//! `CatService` is the sample worker the suites drive: a public meow, an
//! authenticated purr stream with typed parameters, an argument echo, and
//! handlers that fail in the ways the framework must surface.

use std::path::Path;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use whisker::{
    ApiReply, Args, Auth, CallClient, Config, MethodKind, MethodTable, ParamType, Req,
    RpcError, RpcService, StreamItem, Value, Worker, opt_param,
};

/// The sample worker.  `fallback_meow` mirrors a service that routes any
/// unknown name to a default handler.
pub struct CatService {
    pub worker_name: String,
    pub fallback_meow: bool,
}

impl CatService {
    pub fn new(worker_name: &str) -> CatService {
        CatService { worker_name: worker_name.to_owned(), fallback_meow: false }
    }
}

pub const MEOW_BODY: &str = "Meow world, meow!\n";

impl RpcService for CatService {
    fn register(self: &Arc<Self>, methods: &mut MethodTable) {
        methods.api(
            "meow",
            Auth::Public,
            Vec::new(),
            "/meow\n\nThis endpoint requires no authentication!",
            |_req, _args| async { Ok(ApiReply::mime("text/plain", MEOW_BODY)) },
        );

        methods.api(
            "slow_meow",
            Auth::Public,
            Vec::new(),
            "/slow_meow\n\nSame as above, but slower.",
            |_req, _args| async {
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                Ok(ApiReply::mime("text/plain", MEOW_BODY))
            },
        );

        methods.api(
            "web_root",
            Auth::Public,
            Vec::new(),
            "/\n\nA placeholder at the root of the web server.",
            |_req, _args| async {
                Ok(ApiReply::mime(
                    "text/html",
                    "<html><body><h1>Hello Kitty World!</h1></body></html>",
                ))
            },
        );

        let svc = self.clone();
        methods.stream(
            "purr",
            Auth::Private,
            vec![
                opt_param("count", ParamType::Int, 1),
                opt_param("purr", ParamType::Str, "purr"),
                opt_param("caps", ParamType::Bool, false),
            ],
            "/purr [--count=<N>] [--purr=<sound>] [--caps=<bool>]\n\n\
             Authenticated streaming endpoint; one chunk per purr.",
            move |_req, args| {
                let name = svc.worker_name.clone();
                async_stream::stream! {
                    let count = args.get("count").and_then(Value::as_i64).unwrap_or(1);
                    let sound =
                        args.get("purr").and_then(Value::as_str).unwrap_or("purr").to_owned();
                    let caps = args.get("caps").and_then(Value::as_bool).unwrap_or(false);
                    for i in 0..count.max(0) {
                        let mut purr = sound.repeat(usize::try_from(i + 1).unwrap_or(1));
                        if caps {
                            purr = purr.to_uppercase();
                        }
                        let mut item = whisker::Map::new();
                        item.insert("purr".into(), Value::Str(purr));
                        item.insert(
                            "_format".into(),
                            Value::Str(format!("{name} says %(purr)s")),
                        );
                        yield Ok(StreamItem::value(Value::Map(item)));
                        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    }
                }
                .boxed()
            },
        );

        methods.api(
            "echo",
            Auth::Private,
            Vec::new(),
            "/echo\n\nReturn the decoded arguments untouched.",
            |_req, args: Args| async move {
                let mut out = whisker::Map::new();
                out.insert("args".into(), Value::Array(args.positional.clone()));
                out.insert("kwargs".into(), Value::Map(args.named.clone()));
                Ok(ApiReply::Value(Value::Map(out)))
            },
        );

        methods.api(
            "freakout",
            Auth::Private,
            Vec::new(),
            "/freakout\n\nRaise an error.",
            |_req, _args| async {
                Err::<ApiReply, _>(RpcError::Remote("Nothing is good enough for me!".into()))
            },
        );

        methods.stream(
            "stumble",
            Auth::Private,
            Vec::new(),
            "/stumble\n\nYield one value, then fall over mid-stream.",
            |_req, _args| {
                async_stream::stream! {
                    yield Ok(StreamItem::value("one step"));
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    yield Err(RpcError::Remote("tripped over the yarn".into()));
                }
                .boxed()
            },
        );

        methods.api(
            "need_more",
            Auth::Private,
            Vec::new(),
            "/need_more\n\nAlways asks for a missing variable.",
            |_req, _args| async {
                Err::<ApiReply, _>(RpcError::NeedInfo {
                    error: "missing credentials".into(),
                    resource: Some("yarn-basket".into()),
                    needed_vars: vec![whisker::NeededVar {
                        name: "password".into(),
                        vtype: "str".into(),
                        default: None,
                        comment: Some("the basket key".into()),
                    }],
                })
            },
        );

        // A public/private pair under one name, for shadowing checks.
        methods.api(
            "greet",
            Auth::Public,
            Vec::new(),
            "",
            |_req, _args| async { Ok(ApiReply::value("hello stranger")) },
        );
        methods.api(
            "greet",
            Auth::Private,
            Vec::new(),
            "",
            |_req, _args| async { Ok(ApiReply::value("hello friend")) },
        );
    }

    fn fallback(self: &Arc<Self>, _req: &Req) -> Option<MethodKind> {
        if !self.fallback_meow {
            return None;
        }
        Some(MethodKind::Api(Arc::new(|_req, _args| {
            async { Ok(ApiReply::mime("text/plain", MEOW_BODY)) }.boxed()
        })))
    }
}

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

/// A config rooted in a private state dir, listening on a kernel-chosen
/// port.
pub fn test_config(state_dir: &Path, worker_name: &str) -> Config {
    let mut config = Config::new("whiskertest");
    config.app_state_dir = state_dir.to_path_buf();
    config.app_data_dir = state_dir.to_path_buf();
    config.worker_name = worker_name.to_owned();
    config.worker_listen_port = 0;
    config
}

/// Run a worker in-process.  The task ends when the worker shuts down.
pub fn start_worker<S: RpcService>(service: S, config: Config) -> tokio::task::JoinHandle<()> {
    let worker = Worker::new(service, config);
    tokio::spawn(async move {
        if let Err(e) = worker.serve().await {
            eprintln!("worker exited with error: {e}");
        }
    })
}

/// Connect to a worker that is (or is about to be) up, waiting through its
/// startup with the client's own retry back-off.
pub async fn connect(config: &Config) -> CallClient {
    let mut client = CallClient::new(config.clone());
    client.connect(false, 20).await.expect("worker did not come up");
    client
}

/// The advertised URL, split into (host:port, path).
pub fn parse_url(url: &str) -> (String, String) {
    let rest = url.strip_prefix("http://").expect("http url");
    match rest.split_once('/') {
        Some((host_port, path)) => (host_port.to_owned(), format!("/{path}")),
        None => (rest.to_owned(), "/".to_owned()),
    }
}
