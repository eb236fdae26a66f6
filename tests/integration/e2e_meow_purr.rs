//! End-to-end: a CatService worker served in-process, driven both through
//! the call client and through raw HTTP bytes on the TCP listener.
//!
//! # Coverage
//! - meow: `GET /<secret>/meow` answers 200 `text/plain` with the exact body.
//! - purr: 3 chunks with growing purrs and the worker-name format string.
//! - type coercion: positional `"0xa"` becomes 10, `caps="n"` becomes false.
//! - ping: static pong unauthenticated, method inventory when authed.
//! - dispatch: private shadows public only for authed requests; unknown
//!   names 403/404 or hit the service fallback.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use whisker::{CallOptions, Value};
use whisker_test_utils::{CatService, MEOW_BODY, connect, parse_url, start_worker, test_config};

/// One shot of raw HTTP/1.1: write the request, read to close.
async fn raw_http(host_port: &str, request: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(host_port).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(std::time::Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response should arrive")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn meow_answers_exact_plain_text() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let client = connect(&config).await;
    let (host_port, path) = parse_url(client.url().unwrap());

    let response = raw_http(&host_port, &format!("GET {path}/meow HTTP/1.1\r\n\r\n")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.contains("Content-Type: text/plain"), "{response}");
    assert!(response.contains("Connection: close"), "{response}");
    assert!(response.ends_with(MEOW_BODY), "{response}");
}

#[tokio::test]
async fn meow_is_public_and_purr_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let client = connect(&config).await;
    let (host_port, _path) = parse_url(client.url().unwrap());

    let response = raw_http(&host_port, "GET /meow HTTP/1.1\r\n\r\n").await;
    assert!(response.ends_with(MEOW_BODY), "{response}");

    // No secret, private handler: 403 with the terse body.
    let response = raw_http(&host_port, "GET /purr HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 403"), "{response}");
    assert!(response.contains("\"error\":\"Sorry\""), "{response}");
}

#[tokio::test]
async fn purr_streams_three_chunks_then_a_clean_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let mut kwargs = whisker::Map::new();
    kwargs.insert("count".into(), Value::Int(3));
    kwargs.insert("purr".into(), Value::Str("p".into()));
    let stream = client
        .call("purr", Vec::new(), kwargs, CallOptions::default())
        .await
        .unwrap()
        .stream()
        .unwrap();
    let items = stream.collect().await.unwrap();

    assert_eq!(items.len(), 3);
    for (i, item) in items.iter().enumerate() {
        let purr = item.get("purr").unwrap().as_str().unwrap();
        assert_eq!(purr, "p".repeat(i + 1));
        let format = item.get("_format").unwrap().as_str().unwrap();
        assert_eq!(format, "Kitty says %(purr)s");
    }
}

#[tokio::test]
async fn purr_coerces_hex_count_and_true_set_bools() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let mut kwargs = whisker::Map::new();
    kwargs.insert("caps".into(), Value::Str("n".into()));
    let stream = client
        .call(
            "purr",
            vec![Value::Str("0xa".into())],
            kwargs,
            CallOptions::default(),
        )
        .await
        .unwrap()
        .stream()
        .unwrap();
    let items = stream.collect().await.unwrap();

    assert_eq!(items.len(), 10);
    // "n" is not in the true-set, so no upper-casing happened.
    let last = items[9].get("purr").unwrap().as_str().unwrap();
    assert_eq!(last, "p".repeat(10).as_str());
}

#[tokio::test]
async fn ping_is_static_without_auth_and_rich_with() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;
    let (host_port, _path) = parse_url(client.url().unwrap());

    let response = raw_http(&host_port, "GET /ping HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("Pong\n"), "{response}");

    let pong = client.ping().await.unwrap();
    assert_eq!(pong.get("pong"), Some(&Value::Bool(true)));
    let methods = pong.get("methods").unwrap();
    let purr = methods.get("purr").expect("purr advertised");
    assert_eq!(purr.get("is_generator"), Some(&Value::Bool(true)));
    let args: Vec<&str> = purr
        .get("args")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(args, ["count", "purr", "caps"]);
}

#[tokio::test]
async fn private_greet_shadows_public_only_when_authed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;
    let (host_port, _path) = parse_url(client.url().unwrap());

    let authed = client
        .call("greet", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(authed, Value::Str("hello friend".into()));

    let response = raw_http(&host_port, "GET /greet HTTP/1.1\r\n\r\n").await;
    assert!(response.contains("hello stranger"), "{response}");
    assert!(!response.contains("hello friend"), "{response}");
}

#[tokio::test]
async fn unknown_names_404_or_hit_the_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;
    let err = client
        .call("no_such_thing", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, whisker::RpcError::NotFound(_)), "{err:?}");

    // A service with a catch-all fallback meows instead.
    let dir2 = tempfile::tempdir().unwrap();
    let config2 = test_config(dir2.path(), "Catchall");
    let mut service = CatService::new("Catchall");
    service.fallback_meow = true;
    let _worker = start_worker(service, config2.clone());
    let mut client2 = connect(&config2).await;
    let result = client2
        .call("no_such_thing", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(
        result.get("data").unwrap().as_bytes().unwrap(),
        MEOW_BODY.as_bytes()
    );
}

#[tokio::test]
async fn echo_round_trips_arguments_in_both_codecs() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let args = vec![
        Value::Int(-5),
        Value::UInt(u64::MAX),
        Value::Str("mew".into()),
        Value::Bytes(vec![0, 255, 7]),
        Value::Float(1.5),
    ];
    let mut kwargs = whisker::Map::new();
    kwargs.insert("nested".into(), Value::Array(vec![Value::Bool(true), Value::Null]));

    for opts in [CallOptions::default(), CallOptions::json()] {
        let result = client
            .call("echo", args.clone(), kwargs.clone(), opts)
            .await
            .unwrap()
            .value()
            .unwrap();
        assert_eq!(result.get("args").unwrap().as_array().unwrap(), &args[..]);
        assert_eq!(
            result.get("kwargs").unwrap().get("nested").unwrap(),
            kwargs.get("nested").unwrap()
        );
    }
}

#[tokio::test]
async fn web_root_serves_the_empty_path() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let client = connect(&config).await;
    let (host_port, path) = parse_url(client.url().unwrap());

    let response = raw_http(&host_port, &format!("GET {path}/ HTTP/1.1\r\n\r\n")).await;
    assert!(response.contains("Hello Kitty World!"), "{response}");
}
