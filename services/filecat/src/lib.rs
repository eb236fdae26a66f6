//! filecat: a worker that shares file descriptors.
//!
//! `cat` reads a descriptor the caller sends over; `read` opens a path and
//! hands the descriptor back; `play_with`/`ping_pong` bounce a reply between
//! two filecats, with each hop delegating its response writer to the next
//! (reply redirection), so the stream lands on the original caller without
//! relaying through the middle.

use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tokio::io::AsyncReadExt;
use whisker::{
    ApiReply, Auth, CallClient, CallOptions, Config, MethodTable, ParamType, ReplyTo, Result,
    RpcError, RpcService, StreamItem, Value, opt_param, param,
};

pub struct FileCat {
    config: Config,
    /// A connected client for the partner filecat, when playing.
    other: tokio::sync::Mutex<Option<CallClient>>,
}

impl FileCat {
    pub fn new(config: &Config) -> FileCat {
        FileCat { config: config.clone(), other: tokio::sync::Mutex::new(None) }
    }

    pub fn worker_name(&self) -> &str {
        &self.config.worker_name
    }
}

async fn read_fd_contents(value: &Value) -> Result<Vec<u8>> {
    let fd = value
        .as_fd()
        .ok_or_else(|| RpcError::BadValue("expected a file descriptor argument".into()))?;
    let mut file = tokio::fs::File::from_std(fd.to_file()?);
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await?;
    Ok(contents)
}

impl RpcService for FileCat {
    fn register(self: &Arc<Self>, methods: &mut MethodTable) {
        methods.api(
            "cat",
            Auth::Private,
            vec![param("fd", ParamType::Any)],
            "/cat <fd>\n\nReturns the output read from an open file descriptor.",
            |_req, args| async move {
                let contents = read_fd_contents(
                    args.pos(0).ok_or_else(|| RpcError::BadValue("missing fd".into()))?,
                )
                .await?;
                Ok(ApiReply::Value(Value::Bytes(contents)))
            },
        );

        methods.api(
            "cat_pair",
            Auth::Private,
            vec![param("first", ParamType::Any), param("second", ParamType::Any)],
            "/cat_pair <fd> <fd>\n\nRead two descriptors, in argument order.",
            |_req, args| async move {
                let mut out = Vec::new();
                for i in 0..2 {
                    let contents = read_fd_contents(
                        args.pos(i).ok_or_else(|| RpcError::BadValue("missing fd".into()))?,
                    )
                    .await?;
                    out.push(Value::Bytes(contents));
                }
                Ok(ApiReply::Value(Value::Array(out)))
            },
        );

        methods.api(
            "read",
            Auth::Private,
            vec![param("path", ParamType::Str)],
            "/read <path>\n\nReturns a file descriptor opened for reading.",
            |_req, args| async move {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::BadValue("missing path".into()))?;
                let file = std::fs::File::open(path)?;
                Ok(ApiReply::Fds(vec![whisker::FdValue::file_read(&file)?]))
            },
        );

        let svc = self.clone();
        methods.api(
            "play_with",
            Auth::Private,
            vec![param("other_worker_name", ParamType::Str)],
            "/play_with <worker>\n\nConnect to another filecat for ping-pong.",
            move |_req, args| {
                let svc = svc.clone();
                async move {
                    let name = args
                        .get("other_worker_name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| RpcError::BadValue("missing worker name".into()))?;
                    let mut config = svc.config.clone();
                    config.worker_name = name.to_owned();
                    let mut client = CallClient::new(config);
                    client.connect(false, 3).await?;
                    *svc.other.lock().await = Some(client);
                    Ok(ApiReply::value(true))
                }
            },
        );

        let svc = self.clone();
        methods.stream(
            "ping_pong",
            Auth::Private,
            vec![param("ball", ParamType::Str), opt_param("count", ParamType::Int, 5)],
            "/ping_pong <ball> [--count=<N>]\n\nPlay ping-pong with the partner filecat.",
            move |req, args| {
                let svc = svc.clone();
                async_stream::stream! {
                    let me = svc.config.worker_name.clone();
                    let ball = args
                        .get("ball")
                        .and_then(Value::as_str)
                        .unwrap_or("ball")
                        .to_owned();
                    let count = args.get("count").and_then(Value::as_i64).unwrap_or(5) - 1;

                    let mut other = svc.other.lock().await;
                    let Some(partner) = other.as_mut().filter(|_| count >= 1) else {
                        yield Ok(StreamItem::value(format!("I am {me}, I am keeping {ball}")));
                        return;
                    };

                    yield Ok(StreamItem::value(format!("I am {me}, sending {ball} back!")));

                    let reply_to = match ReplyTo::request(&req) {
                        Ok(rt) => rt,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };
                    let mut kwargs = whisker::Map::new();
                    kwargs.insert("count".into(), Value::Int(count));
                    let result = partner
                        .call(
                            "ping_pong",
                            vec![Value::Str(ball)],
                            kwargs,
                            CallOptions::reply_to(reply_to),
                        )
                        .await;
                    match result {
                        Ok(ack) => {
                            let acked = ack
                                .value()
                                .ok()
                                .and_then(|v| v.get("replied_to_first_fd").cloned())
                                .is_some_and(|v| v.truthy());
                            if !acked {
                                yield Err(RpcError::Remote("delegating reply failed".into()));
                            }
                        }
                        Err(e) => yield Err(e),
                    }
                }
                .boxed()
            },
        );
    }

    fn shutdown(self: &Arc<Self>) -> futures_util::future::BoxFuture<'static, ()> {
        let svc = self.clone();
        async move {
            if svc.other.lock().await.take().is_some() {
                tracing::debug!("released partner connection");
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_the_descriptor_surface() {
        let config = Config::new("filecat");
        let svc = Arc::new(FileCat::new(&config));
        let mut table = MethodTable::new();
        svc.register(&mut table);

        // Every handler is private; nothing is reachable without the secret.
        for name in ["cat", "cat_pair", "read", "play_with", "ping_pong"] {
            assert!(table.resolve(name, true).is_some(), "{name} registered");
            assert!(table.resolve(name, false).is_none(), "{name} gated");
        }
        assert!(table.resolve("ping_pong", true).unwrap().kind.is_stream());
        assert!(!table.resolve("read", true).unwrap().kind.is_stream());
    }

    #[test]
    fn worker_name_comes_from_the_config() {
        let mut config = Config::new("filecat");
        config.worker_name = "milton".to_owned();
        let svc = FileCat::new(&config);
        assert_eq!(svc.worker_name(), "milton");
    }
}
