mod common;

use common::{
    closed_port, collector, init_tracing, loopback_config, recv, small_engine, spawn_ws,
    stays_quiet,
};
use lotusx_engine::{WsResult, WsToken};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokens_are_unique_and_valid() {
    init_tracing();
    let engine = small_engine(loopback_config(0, closed_port())).build().unwrap();

    let mut tokens = HashSet::new();
    for _ in 0..50 {
        let token = engine.start_web_socket("btcusdt@markPrice", |_| {});
        assert!(token.is_valid());
        assert_ne!(token, WsToken::INVALID);
        assert!(tokens.insert(token));
    }
    assert_eq!(tokens.len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_arrive_in_wire_order_under_load() {
    init_tracing();
    let frames: Vec<String> = (0..200).map(|i| format!(r#"{{"seq":{}}}"#, i)).collect();
    let (port, mut paths) = spawn_ws(frames).await;
    let engine = small_engine(loopback_config(0, port))
        .ws_dispatch(4, 2)
        .build()
        .unwrap();

    let (tx, mut seqs) = mpsc::unbounded_channel();
    let token = engine.start_web_socket("btcusdt@aggTrade", move |result| {
        if let Some(seq) = result.json().and_then(|v| v["seq"].as_u64()) {
            // slower than the wire, so the queue fills and workers overlap
            std::thread::sleep(Duration::from_micros(200));
            let _ = tx.send(seq);
        }
    });
    assert_eq!(recv(&mut paths).await, "/ws/btcusdt@aggTrade");

    let mut received = Vec::with_capacity(200);
    for _ in 0..200 {
        received.push(recv(&mut seqs).await);
    }
    assert_eq!(received, (0..200).collect::<Vec<u64>>());
    assert!(engine.stop_web_socket(token));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_is_idempotent_and_cleans_registry() {
    init_tracing();
    let (port, mut paths) = spawn_ws(vec![r#"{"e":"markPriceUpdate"}"#.to_string()]).await;
    let engine = small_engine(loopback_config(0, port)).build().unwrap();

    let (callback, mut results) = collector();
    let token = engine.start_web_socket("btcusdt@markPrice", callback);
    recv(&mut paths).await;
    assert!(recv(&mut results).await.is_success());
    assert!(engine.is_stream_open(token));

    assert!(engine.stop_web_socket(token));
    assert!(!engine.stop_web_socket(token));
    assert!(!engine.stop_web_socket(WsToken::INVALID));

    assert!(recv(&mut results).await.is_disconnect());
    assert!(!engine.is_stream_open(token));
    assert!(!engine.stop_web_socket(token));
    assert!(stays_quiet(&mut results, Duration::from_millis(300)).await);
    assert_eq!(engine.open_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_override_callback_receives_disconnect() {
    let (port, mut paths) = spawn_ws(Vec::new()).await;
    let engine = small_engine(loopback_config(0, port)).build().unwrap();

    let (callback, mut original) = collector();
    let token = engine.start_web_socket("ethusdt@bookTicker", callback);
    recv(&mut paths).await;

    let (override_cb, mut overridden) = collector();
    assert!(engine.stop_web_socket_with(token, override_cb));
    assert!(matches!(recv(&mut overridden).await, WsResult::Disconnect));
    assert!(stays_quiet(&mut original, Duration::from_millis(300)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_combined_stream_path() {
    let (port, mut paths) = spawn_ws(Vec::new()).await;
    let engine = small_engine(loopback_config(0, port)).build().unwrap();

    let token = engine.start_combined_stream(["btcusdt@markPrice", "ethusdt@markPrice"], |_| {});
    assert_eq!(
        recv(&mut paths).await,
        "/stream?streams=btcusdt@markPrice/ethusdt@markPrice"
    );
    assert!(engine.stop_web_socket(token));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_failure_is_reported_once() {
    let engine = small_engine(loopback_config(0, closed_port())).build().unwrap();
    let (callback, mut results) = collector();
    let token = engine.start_web_socket("btcusdt@markPrice", callback);

    match recv(&mut results).await {
        WsResult::Fail(err) => assert!(err.phase().is_some()),
        other => panic!("expected a failure, got {:?}", other),
    }
    assert!(stays_quiet(&mut results, Duration::from_millis(200)).await);

    // the failed stream still answers an explicit close
    assert!(engine.stop_web_socket(token));
    assert!(recv(&mut results).await.is_disconnect());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_with_open_streams() {
    let (port, mut paths) = spawn_ws(Vec::new()).await;
    let engine = small_engine(loopback_config(0, port)).build().unwrap();
    let (callback, mut results) = collector();
    let token = engine.start_web_socket("btcusdt@markPrice", callback);
    recv(&mut paths).await;

    engine.stop();
    assert_eq!(engine.open_streams(), 0);
    assert!(!engine.stop_web_socket(token));
    assert!(stays_quiet(&mut results, Duration::from_millis(200)).await);
    assert_eq!(
        engine.start_web_socket("btcusdt@markPrice", |_| {}),
        WsToken::INVALID
    );
}
