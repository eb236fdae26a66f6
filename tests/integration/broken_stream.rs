//! Chunked-stream integrity.
//!
//! A stream completed normally ends with a zero-length chunk and the reader
//! never sees an error; a producer that dies mid-stream leaves the
//! terminator out, and the reader gets `IncompleteStream`.

use whisker::{CallOptions, RpcError, Value};
use whisker_test_utils::{CatService, connect, start_worker, test_config};

#[tokio::test]
async fn clean_streams_never_raise_incomplete() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let mut kwargs = whisker::Map::new();
    kwargs.insert("count".into(), Value::Int(2));
    let stream = client
        .call("purr", Vec::new(), kwargs, CallOptions::default())
        .await
        .unwrap()
        .stream()
        .unwrap();
    let items = stream.collect().await.expect("terminated stream decodes cleanly");
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn aborted_stream_yields_then_fails_incomplete() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let mut stream = client
        .call("stumble", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap()
        .stream()
        .unwrap();

    let first = stream.next().await.expect("one item").unwrap();
    assert_eq!(first, Value::Str("one step".into()));

    let second = stream.next().await.expect("a failure, not a clean end");
    assert!(matches!(second, Err(RpcError::IncompleteStream)), "{second:?}");
}

#[tokio::test]
async fn unary_errors_surface_with_their_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let err = client
        .call("freakout", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(detail) => assert!(detail.contains("Nothing is good enough"), "{detail}"),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn need_info_carries_its_variables_across_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "Kitty");
    let _worker = start_worker(CatService::new("Kitty"), config.clone());
    let mut client = connect(&config).await;

    let err = client
        .call("need_more", Vec::new(), whisker::Map::new(), CallOptions::default())
        .await
        .unwrap_err();
    match err {
        RpcError::NeedInfo { resource, needed_vars, .. } => {
            assert_eq!(resource.as_deref(), Some("yarn-basket"));
            assert_eq!(needed_vars.len(), 1);
            assert_eq!(needed_vars[0].name, "password");
            assert_eq!(needed_vars[0].vtype, "str");
        }
        other => panic!("expected NeedInfo, got {other:?}"),
    }
}
