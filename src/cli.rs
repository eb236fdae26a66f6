//! The command-line surface a worker binary exposes.
//!
//! `<app> [--json|--raw|--tcp|--json-rpc] <command> [<args ...>]`
//!
//! Built-in commands: `serve` (foreground service loop), `start`, `stop`,
//! `restart`, `ping`, `config`, `help [<cmd>]`.  Any registered handler
//! name is also a command; `--key=val` arguments become call options when
//! the method declares them.
//!
//! Exit codes: 0 ok, 1 not running, 2 key error, 3 bad value, 4 I/O error,
//! 5 permission denied, 6 runtime error.

use std::io::Write;

use clap::{Arg, ArgAction, Command};

use crate::builtins::usage_text;
use crate::client::{CallClient, CallOptions, CallResult};
use crate::config::Config;
use crate::error::RpcError;
use crate::registry::{MethodTable, RpcService};
use crate::server::{Worker, init_logging};
use crate::value::{Map, Value};

/// Run the CLI for a service.  Returns the process exit code.
pub async fn run<S, F>(app_name: &str, argv: Vec<String>, make_service: F) -> i32
where
    S: RpcService,
    F: FnOnce(&Config) -> S,
{
    // Config flags first (non-strict: everything else passes through).
    let mut config = Config::new(app_name);
    let rest = match config.configure(&argv, false) {
        Ok(rest) => rest,
        Err(e) => {
            eprintln!("{app_name}: {e}");
            return 3;
        }
    };
    init_logging(&config);

    let matches = Command::new(app_name.to_owned())
        .about("A whisker RPC worker")
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .help("Print results as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("raw")
                .short('r')
                .long("raw")
                .help("Print results unformatted")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tcp")
                .short('t')
                .long("tcp")
                .help("Avoid the local-domain socket")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json-rpc")
                .short('J')
                .long("json-rpc")
                .help("Use JSON bodies on the wire")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("rest")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true),
        )
        .try_get_matches_from(std::iter::once(app_name.to_owned()).chain(rest));
    let matches = match matches {
        Ok(m) => m,
        Err(e) => {
            let _ = e.print();
            return 3;
        }
    };

    let print_json = matches.get_flag("json");
    let print_raw = matches.get_flag("raw");
    let no_unix = matches.get_flag("tcp");
    let use_json = matches.get_flag("json-rpc");

    let mut rest: Vec<String> =
        matches.get_many::<String>("rest").map(|v| v.cloned().collect()).unwrap_or_default();
    if rest.is_empty() {
        let table = local_table(make_service(&config));
        println!("{}", usage_text(app_name, &command_names(&table)));
        return 1;
    }
    let command = rest.remove(0);

    let name = format!("{}/{}", config.app_name, config.worker_name);
    match command.as_str() {
        "serve" => match Worker::new(make_service(&config), config.clone()).serve().await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{name}: {e}");
                e.exit_code()
            }
        },
        "start" => {
            let mut client = CallClient::new(config.clone());
            match client.connect(true, 5).await {
                Ok(()) => {
                    if let Some(url) = client.url() {
                        println!("{name}: Running at {url}");
                    }
                    let sock = config.sock_file();
                    if config.worker_use_unixdomain && sock.exists() {
                        println!("{name}: Running at {}", sock.display());
                    }
                    0
                }
                Err(e) => fail(&name, &command, &e),
            }
        }
        "stop" => {
            let mut client = CallClient::new(config);
            match client.connect(false, 0).await {
                Ok(()) => match client.quitquitquit().await {
                    Ok(_) => {
                        println!("{name}: Stopped");
                        0
                    }
                    Err(e) => fail(&name, &command, &e),
                },
                Err(RpcError::NotRunning) => {
                    println!("{name}: Not running");
                    0
                }
                Err(e) => fail(&name, &command, &e),
            }
        }
        "restart" => {
            let mut client = CallClient::new(config.clone());
            if client.connect(false, 0).await.is_ok() {
                let _ = client.quitquitquit().await;
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            let mut client = CallClient::new(config);
            match client.connect(true, 5).await {
                Ok(()) => {
                    if let Some(url) = client.url() {
                        println!("{name}: Running at {url}");
                    }
                    0
                }
                Err(e) => fail(&name, &command, &e),
            }
        }
        _ => {
            call_command(
                app_name,
                &name,
                config,
                make_service,
                &command,
                rest,
                CliFlags { print_json, print_raw, no_unix, use_json },
            )
            .await
        }
    }
}

struct CliFlags {
    print_json: bool,
    print_raw: bool,
    no_unix: bool,
    use_json: bool,
}

#[allow(clippy::too_many_arguments)]
async fn call_command<S, F>(
    app_name: &str,
    name: &str,
    config: Config,
    make_service: F,
    command: &str,
    rest: Vec<String>,
    flags: CliFlags,
) -> i32
where
    S: RpcService,
    F: FnOnce(&Config) -> S,
{
    let mut client = CallClient::new(config.clone());
    if let Err(e) = client.connect(false, 3).await {
        // Help still works against the local table when nothing runs.
        if command == "help" {
            let table = local_table(make_service(&config));
            let topic = rest.first().map(String::as_str).unwrap_or("");
            if topic.is_empty() {
                println!("{}", usage_text(app_name, &command_names(&table)));
            } else {
                let text = table
                    .resolve(topic, true)
                    .and_then(|m| m.help.clone())
                    .unwrap_or_else(|| "No Help Available".to_owned());
                println!("{text}");
            }
            return 0;
        }
        if matches!(e, RpcError::NotRunning) {
            eprintln!("{name}: Not running: Start it first?");
            return 1;
        }
        return fail(name, command, &e);
    }

    // Split the remaining words into positional args and --key=val options,
    // gated on the option names the method inventory advertises.
    let allowed = allowed_options(&client, command);
    let mut args = Vec::new();
    let mut kwargs = Map::new();
    for word in rest {
        if let Some(kv) = word.strip_prefix("--") {
            if let Some((key, val)) = kv.split_once('=') {
                let key = key.replace('-', "_");
                if !allowed.iter().any(|a| a == &key) {
                    eprintln!("{name} {command} failed: Unrecognized option: --{key}");
                    return 3;
                }
                kwargs.insert(key, Value::Str(val.to_owned()));
                continue;
            }
        }
        args.push(Value::Str(word));
    }

    let opts = CallOptions {
        use_json: flags.use_json,
        allow_unix: !flags.no_unix,
        ..Default::default()
    };
    match client.call(command, args, kwargs, opts).await {
        Ok(CallResult::Value(value)) => {
            print_result(&value, flags.print_raw, flags.print_json);
            0
        }
        Ok(CallResult::Stream(mut stream)) => {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => print_result(&value, flags.print_raw, flags.print_json),
                    Err(e) => return fail(name, command, &e),
                }
            }
            0
        }
        Err(e) => fail(name, command, &e),
    }
}

fn fail(name: &str, command: &str, e: &RpcError) -> i32 {
    eprintln!("{name} {command} failed: {e}");
    e.exit_code()
}

fn local_table<S: RpcService>(service: S) -> MethodTable {
    let mut table = MethodTable::new();
    std::sync::Arc::new(service).register(&mut table);
    table
}

fn command_names(table: &MethodTable) -> Vec<String> {
    let mut names: Vec<String> = table.commands().iter().map(|m| m.name.clone()).collect();
    names.sort();
    names
}

/// Option names a method accepts, from the inventory learned at connect.
fn allowed_options(client: &CallClient, command: &str) -> Vec<String> {
    client
        .inventory()
        .and_then(|inv| inv.get(command))
        .and_then(|info| info.get("args"))
        .and_then(Value::as_array)
        .map(|args| {
            args.iter().filter_map(Value::as_str).map(str::to_owned).collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Result printing
// ---------------------------------------------------------------------------

/// Render one result the way the CLI prints it: `--json` and `--raw` win,
/// byte results go to stdout untouched, and maps honour their `_format`
/// mini-template (`%(key)s` substitution).
pub fn print_result(value: &Value, print_raw: bool, print_json: bool) {
    if print_json {
        if let Ok(encoded) = crate::codec::json::to_json(value, true) {
            let _ = std::io::stdout().write_all(&encoded);
        }
        return;
    }
    if print_raw {
        println!("{value:?}");
        return;
    }
    match value {
        Value::Bytes(bytes) => {
            let _ = std::io::stdout().write_all(bytes);
            let _ = std::io::stdout().flush();
        }
        Value::Str(text) => println!("{text}"),
        Value::Map(map) => {
            if let Some(Value::Str(data)) = map.get("data") {
                // A {mimetype, data} envelope renders as its payload.
                println!("{data}");
            } else if let Some(data) = map.get("data").and_then(Value::as_bytes) {
                let _ = std::io::stdout().write_all(data);
                let _ = std::io::stdout().flush();
            } else {
                println!("{}", text_format(map));
            }
        }
        other => {
            if let Ok(encoded) = crate::codec::json::to_json(other, true) {
                let _ = std::io::stdout().write_all(&encoded);
            }
        }
    }
}

/// Apply the `_format` template of a result map: every `%(key)s` becomes
/// the rendering of that key's value.
pub fn text_format(map: &Map) -> String {
    let template = match map.get("_format") {
        Some(Value::Str(t)) => t.clone(),
        _ => {
            return map
                .iter()
                .map(|(k, v)| format!("{k}: {}", render_scalar(v)))
                .collect::<Vec<_>>()
                .join("\n");
        }
    };
    let mut out = template;
    for (key, val) in map {
        if key == "_format" {
            continue;
        }
        out = out.replace(&format!("%({key})s"), &render_scalar(val));
    }
    out
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Null => "null".to_owned(),
        other => crate::codec::json::to_json(other, true)
            .map(|b| String::from_utf8_lossy(&b).trim_end().to_owned())
            .unwrap_or_default(),
    }
}
