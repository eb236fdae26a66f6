//! Worker bring-up, state files, shutdown, capability composition, and
//! loopback equivalence.

use std::os::unix::fs::MetadataExt;

use whisker::{
    ApiReply, Auth, CallClient, CallOptions, Capability, MethodTable, RpcError, Value, Worker,
};
use whisker_test_utils::{CatService, connect, start_worker, test_config};

#[tokio::test]
async fn state_files_are_created_tight_and_removed_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let handle = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let url_file = config.url_file();
    let sock_file = config.sock_file();
    assert!(url_file.exists());
    assert!(sock_file.exists());
    let url_mode = std::fs::metadata(&url_file).unwrap().mode() & 0o777;
    assert!(url_mode <= 0o600, "url file mode {url_mode:o}");
    let sock_mode = std::fs::metadata(&sock_file).unwrap().mode() & 0o777;
    assert!(sock_mode <= 0o600, "sock file mode {sock_mode:o}");

    let goodbye = client.quitquitquit().await.unwrap();
    assert_eq!(goodbye, Value::Str("Goodbye".into()));

    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("worker loop should stop")
        .unwrap();
    assert!(!url_file.exists(), "url file should be removed");
    assert!(!sock_file.exists(), "sock file should be removed");

    let mut fresh = CallClient::new(config);
    let err = fresh.connect(false, 0).await.unwrap_err();
    assert!(matches!(err, RpcError::NotRunning), "{err:?}");
}

#[tokio::test]
async fn bring_up_is_idempotent_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());

    let first = connect(&config).await;
    let url_before = std::fs::read_to_string(config.url_file()).unwrap();

    // N connects against a live worker: N pongs, the same single worker.
    for _ in 0..3 {
        let mut again = CallClient::new(config.clone());
        again.connect(true, 2).await.unwrap();
        let pong = again.ping().await.unwrap();
        assert_eq!(pong.get("pong"), Some(&Value::Bool(true)));
    }
    let url_after = std::fs::read_to_string(config.url_file()).unwrap();
    assert_eq!(url_before, url_after, "the worker was not replaced");
    drop(first);
}

#[tokio::test]
async fn loopback_matches_the_wire_for_wire_free_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut wire = connect(&config).await;

    let lb_dir = tempfile::tempdir().unwrap();
    let lb_config = test_config(lb_dir.path(), "Kitty");
    let mut loopback = CallClient::loopback(CatService::new("Kitty"), lb_config);
    assert!(loopback.is_loopback());

    // Unary with an explicit MIME type.
    let via_wire = wire
        .call("meow", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    let via_loopback = loopback
        .call("meow", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(via_wire, via_loopback);

    // Streaming with typed arguments.
    let mut kwargs = whisker::Map::new();
    kwargs.insert("count".into(), Value::Str("0x3".into()));
    let via_wire = wire
        .call("purr", Vec::new(), kwargs.clone(), CallOptions::default())
        .await
        .unwrap()
        .stream()
        .unwrap()
        .collect()
        .await
        .unwrap();
    let via_loopback = loopback
        .call("purr", Vec::new(), kwargs, CallOptions::default())
        .await
        .unwrap()
        .stream()
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(via_wire, via_loopback);
    assert_eq!(via_wire.len(), 3);
}

#[tokio::test]
async fn config_handler_dumps_and_patches_options() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let dump = client
        .call("config", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    let options = dump.get("config").unwrap();
    assert_eq!(options.get("worker_name").unwrap().as_str(), Some("Kitty"));

    let mut kwargs = whisker::Map::new();
    kwargs.insert("key".into(), Value::Str("worker_log_level".into()));
    kwargs.insert("value".into(), Value::Str("debug".into()));
    client
        .call("config", Vec::new(), kwargs, CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();

    let dump = client
        .call("config", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(
        dump.get("config").unwrap().get("worker_log_level").unwrap().as_str(),
        Some("debug")
    );
}

#[tokio::test]
async fn capability_modules_contribute_handlers() {
    struct Stretching;
    impl Capability for Stretching {
        fn register(&self, methods: &mut MethodTable) {
            methods.api(
                "stretch",
                Auth::Private,
                Vec::new(),
                "/stretch\n\nHave a nice stretch.",
                |_req, _args| async { Ok(ApiReply::mime("text/plain", "Streeeeeeeetch!\n")) },
            );
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let worker =
        Worker::new(CatService::new("Kitty"), config.clone()).with_capability(Stretching);
    tokio::spawn(worker.serve());

    let mut client = connect(&config).await;
    let result = client
        .call("stretch", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(result.get("data").unwrap().as_bytes().unwrap(), b"Streeeeeeeetch!\n");
    // The base service's handlers are still there alongside.
    assert!(client.ping().await.unwrap().get("methods").unwrap().get("stretch").is_some());
}

#[tokio::test]
async fn help_covers_registered_methods() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let mut kwargs = whisker::Map::new();
    kwargs.insert("command".into(), Value::Str("purr".into()));
    let help = client
        .call("help", Vec::new(), kwargs, CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    assert!(help.as_str().unwrap().contains("/purr"), "{help:?}");

    let overview = client
        .call("help", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    let text = overview.as_str().unwrap();
    assert!(text.contains("Usage: whiskertest"), "{text}");
    assert!(text.contains("purr"), "{text}");
}
