//! End-to-end descriptor passing between filecat workers.
//!
//! # Coverage
//! - `cat`: a descriptor sent with the call is read by the worker.
//! - `read`: the worker opens a file and hands the descriptor back.
//! - Descriptors refuse to travel over TCP, loudly.
//! - Ordering: placeholders consume the ancillary list in argument order.
//! - `ping_pong`: reply redirection carries the response writer across two
//!   workers and the stream lands on the original caller.

use std::io::Read;

use filecat::FileCat;
use whisker::{CallOptions, FdValue, Value};
use whisker_test_utils::{connect, start_worker, test_config};

#[tokio::test]
async fn cat_reads_a_descriptor_we_send() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "milton");
    let _worker = start_worker(FileCat::new(&config), config.clone());
    let mut client = connect(&config).await;

    let payload = dir.path().join("story.txt");
    std::fs::write(&payload, b"THIS STRING is the story").unwrap();
    let file = std::fs::File::open(&payload).unwrap();
    let fd = FdValue::file_read(&file).unwrap();

    let result = client
        .call("cat", vec![Value::Fd(fd)], whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(result.as_bytes().unwrap(), b"THIS STRING is the story");
}

#[tokio::test]
async fn read_returns_an_open_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "milton");
    let _worker = start_worker(FileCat::new(&config), config.clone());
    let mut client = connect(&config).await;

    let payload = dir.path().join("deep.txt");
    std::fs::write(&payload, b"THAT STRING sits on disk").unwrap();

    let result = client
        .call(
            "read",
            vec![Value::Str(payload.display().to_string())],
            whisker::Map::new(),
            CallOptions::default(),
        )
        .await
        .unwrap()
        .value()
        .unwrap();

    let fds = result.as_array().unwrap();
    assert_eq!(fds.len(), 1);
    let fd = fds[0].as_fd().expect("a live descriptor");
    let mut contents = String::new();
    fd.to_file().unwrap().read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "THAT STRING sits on disk");
}

#[tokio::test]
async fn descriptors_refuse_to_travel_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "milton");
    let _worker = start_worker(FileCat::new(&config), config.clone());
    let mut client = connect(&config).await;

    let payload = dir.path().join("secret.txt");
    std::fs::write(&payload, b"not for tcp").unwrap();
    let file = std::fs::File::open(&payload).unwrap();
    let fd = FdValue::file_read(&file).unwrap();

    let err = client
        .call(
            "cat",
            vec![Value::Fd(fd)],
            whisker::Map::new(),
            CallOptions { allow_unix: false, ..Default::default() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, whisker::RpcError::Transport(_)), "{err:?}");
}

#[tokio::test]
async fn descriptor_order_matches_argument_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "milton");
    let _worker = start_worker(FileCat::new(&config), config.clone());
    let mut client = connect(&config).await;

    let first_path = dir.path().join("first.txt");
    let second_path = dir.path().join("second.txt");
    std::fs::write(&first_path, b"file one").unwrap();
    std::fs::write(&second_path, b"file two").unwrap();
    let first = std::fs::File::open(&first_path).unwrap();
    let second = std::fs::File::open(&second_path).unwrap();

    let result = client
        .call(
            "cat_pair",
            vec![
                Value::Fd(FdValue::file_read(&first).unwrap()),
                Value::Fd(FdValue::file_read(&second).unwrap()),
            ],
            whisker::Map::new(),
            CallOptions::default(),
        )
        .await
        .unwrap()
        .value()
        .unwrap();

    let pair = result.as_array().unwrap();
    assert_eq!(pair[0].as_bytes().unwrap(), b"file one");
    assert_eq!(pair[1].as_bytes().unwrap(), b"file two");
}

#[tokio::test]
async fn ping_pong_redirects_replies_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config1 = test_config(dir.path(), "milton");
    let config2 = test_config(dir.path(), "meowzer");
    let _worker = start_worker(FileCat::new(&config1), config1.clone());
    let _worker = start_worker(FileCat::new(&config2), config2.clone());

    let mut kitty1 = connect(&config1).await;
    let mut kitty2 = connect(&config2).await;

    let ok = kitty1
        .call(
            "play_with",
            vec![Value::Str("meowzer".into())],
            whisker::Map::new(),
            CallOptions::default(),
        )
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(ok, Value::Bool(true));
    let ok = kitty2
        .call(
            "play_with",
            vec![Value::Str("milton".into())],
            whisker::Map::new(),
            CallOptions::default(),
        )
        .await
        .unwrap()
        .value()
        .unwrap();
    assert_eq!(ok, Value::Bool(true));

    let mut kwargs = whisker::Map::new();
    kwargs.insert("count".into(), Value::Int(4));
    let stream = kitty1
        .call(
            "ping_pong",
            vec![Value::Str("mousey".into())],
            kwargs,
            CallOptions::default(),
        )
        .await
        .unwrap()
        .stream()
        .unwrap();
    let items = tokio::time::timeout(std::time::Duration::from_secs(10), stream.collect())
        .await
        .expect("ping-pong should finish")
        .unwrap();

    assert_eq!(items.len(), 4, "{items:?}");
    let lines: Vec<&str> = items.iter().map(|i| i.as_str().unwrap()).collect();
    for line in &lines {
        assert!(line.contains("mousey"), "{line}");
    }
    assert!(lines[0].contains("milton"), "{lines:?}");
    assert!(lines[1].contains("meowzer"), "{lines:?}");
    assert!(lines[2].contains("milton"), "{lines:?}");
    assert!(lines[3].contains("meowzer"), "{lines:?}");
    assert!(lines[3].contains("keeping"), "{lines:?}");
}
