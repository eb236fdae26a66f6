//! Handlers every worker carries: ping, config, help, quitquitquit.

use std::sync::{Arc, Weak};

use futures_util::FutureExt;

use crate::dispatch::WorkerShared;
use crate::error::{Result, RpcError};
use crate::http;
use crate::registry::{ApiReply, Args, Auth, MethodTable, ParamType, opt_param};
use crate::request::Request;
use crate::value::{Map, Value};

pub fn register(table: &mut MethodTable, shared: &Arc<WorkerShared>) {
    let weak = Arc::downgrade(shared);
    table.raw(
        "ping",
        Auth::Public,
        Vec::new(),
        "/ping\n\nCheck whether the worker is running (public) and which \
         methods it offers (requires authentication).",
        move |request, _args| ping_raw(weak.clone(), request).boxed(),
    );

    let weak = Arc::downgrade(shared);
    table.api(
        "config",
        Auth::Private,
        vec![
            opt_param("key", ParamType::Str, ""),
            opt_param("value", ParamType::Str, ""),
        ],
        "/config [--key=<option> --value=<val>]\n\nShow the current \
         configuration, or update one option.",
        move |_req, args| config_api(weak.clone(), args),
    );

    let weak = Arc::downgrade(shared);
    table.api(
        "help",
        Auth::Private,
        vec![opt_param("command", ParamType::Str, "")],
        "/help [command]\n\nHelp for a registered method, or an overview of \
         the command-line interface.",
        move |_req, args| help_api(weak.clone(), args),
    );

    let weak = Arc::downgrade(shared);
    table.api(
        "quitquitquit",
        Auth::Private,
        Vec::new(),
        "/quitquitquit\n\nShut down the worker.",
        move |_req, _args| quit_api(weak.clone()),
    );
}

fn upgrade(weak: &Weak<WorkerShared>) -> Result<Arc<WorkerShared>> {
    weak.upgrade().ok_or_else(|| RpcError::Remote("worker state is gone".into()))
}

// ---------------------------------------------------------------------------
// ping
// ---------------------------------------------------------------------------

async fn ping_raw(weak: Weak<WorkerShared>, request: &mut Request) -> Result<()> {
    if request.req.authed() {
        let shared = upgrade(&weak)?;
        let mut body = Map::new();
        body.insert("pong".into(), Value::Bool(true));
        body.insert("conn".into(), Value::Str(request.req.origin().to_string()));
        body.insert("uptime".into(), Value::UInt(uptime(&shared)));
        body.insert("methods".into(), shared.methods().inventory());
        body.insert(
            "_format".into(),
            Value::Str("Pong via %(conn)s! (see JSON for full method list)".into()),
        );
        let encoded = request.req.codec().encode(&Value::Map(body))?;
        request.req.set_code(200);
        let mut out = http::response_head(200, &request.req.mimetype(), &[]);
        out.extend_from_slice(&encoded);
        request.write(&out).await
    } else {
        // Not authed: do less work and let nothing of the caller's in.
        request.req.set_code(200);
        let mut out = http::response_head(200, "text/plain", &[]);
        out.extend_from_slice(b"Pong\n");
        request.write(&out).await
    }
}

fn uptime(shared: &WorkerShared) -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .saturating_sub(shared.start_time)
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn config_api(weak: Weak<WorkerShared>, args: Args) -> Result<ApiReply> {
    let shared = upgrade(&weak)?;
    let key = args.get("key").and_then(Value::as_str).unwrap_or("").to_owned();
    if !key.is_empty() {
        let value = args.get("value").and_then(Value::as_str).unwrap_or("").to_owned();
        // The single cooperative critical section config mutation needs.
        let mut config = shared.config.write().unwrap();
        config.set(&key, &value)?;
    }
    let config = shared.config.read().unwrap();
    let mut body = Map::new();
    body.insert("config".into(), config.as_value());
    body.insert("_format".into(), Value::Str(config.to_args().join("\n")));
    Ok(ApiReply::Value(Value::Map(body)))
}

// ---------------------------------------------------------------------------
// help
// ---------------------------------------------------------------------------

async fn help_api(weak: Weak<WorkerShared>, args: Args) -> Result<ApiReply> {
    let shared = upgrade(&weak)?;
    let command = args.get("command").and_then(Value::as_str).unwrap_or("");
    let methods = shared.methods();

    if command.is_empty() {
        let app_name = shared.config.read().unwrap().app_name.clone();
        let mut names: Vec<String> = methods
            .commands()
            .iter()
            .map(|m| m.name.clone())
            .filter(|n| !matches!(n.as_str(), "ping" | "help" | "config" | "quitquitquit"))
            .collect();
        names.sort();
        return Ok(ApiReply::Value(Value::Str(usage_text(&app_name, &names))));
    }

    let text = methods
        .resolve(command, true)
        .and_then(|m| m.help.clone())
        .unwrap_or_else(|| "No Help Available".to_owned());
    Ok(ApiReply::Value(Value::Str(format!("{text}\n"))))
}

/// The CLI overview (`help` with no command, and the `--help` output).
pub fn usage_text(app_name: &str, commands: &[String]) -> String {
    let mut lines = vec![
        format!("Usage: {app_name} [--json|--raw|--tcp] <command> [<args ...>]"),
        String::new(),
        "Commands:".to_owned(),
        String::new(),
        "    config          - Display the current configuration".to_owned(),
        format!("    help <command>  - Get help about a {app_name} command"),
        format!("    ping            - Check whether {app_name} is running"),
        "    serve           - Run the worker in the foreground".to_owned(),
        "    start           - Start the background worker".to_owned(),
        "    stop            - Stop the background worker".to_owned(),
        "    restart         - Stop and Start!".to_owned(),
        String::new(),
    ];
    if !commands.is_empty() {
        let mut row = "API Commands: ".to_owned();
        let mut first = true;
        for command in commands {
            if row.len() + command.len() > 75 {
                lines.push(row);
                row = "   ".to_owned();
            } else if !first {
                row.push_str(", ");
            }
            row.push_str(command);
            first = false;
        }
        lines.push(row);
        lines.push(String::new());
    }
    lines.push("Any API method can be invoked as a command; add --json or --raw".to_owned());
    lines.push("to alter the output format, --tcp to avoid the local socket.".to_owned());
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// quitquitquit
// ---------------------------------------------------------------------------

async fn quit_api(weak: Weak<WorkerShared>) -> Result<ApiReply> {
    let shared = upgrade(&weak)?;
    // Let the goodbye reach the wire before the accept loop stops.
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        shared.shutdown.notify_waiters();
    });
    Ok(ApiReply::value("Goodbye"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_text_wraps_the_command_list() {
        let commands: Vec<String> =
            ["cat", "read", "play_with", "ping_pong"].iter().map(|s| (*s).to_owned()).collect();
        let text = usage_text("filecat", &commands);
        assert!(text.contains("Usage: filecat"));
        assert!(text.contains("API Commands: cat, read, play_with, ping_pong"));
    }

    #[test]
    fn usage_text_without_api_commands() {
        let text = usage_text("bare", &[]);
        assert!(!text.contains("API Commands"));
        assert!(text.contains("stop"));
    }
}
