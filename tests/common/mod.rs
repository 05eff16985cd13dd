#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use lotusx_engine::{ConnectionConfig, Engine, EngineBuilder, WsResult};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Plain-TCP config pointing at loopback mocks.
pub fn loopback_config(rest_port: u16, ws_port: u16) -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", "127.0.0.1")
        .rest_port(rest_port)
        .ws_port(ws_port)
        .use_tls(false)
}

pub fn small_engine(config: ConnectionConfig) -> EngineBuilder {
    Engine::builder(config).rest_contexts(2).ws_contexts(2)
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Blocking HTTP mock on its own thread: one canned response per connection,
/// in order. Each request head is forwarded on the returned channel.
pub fn spawn_http(responses: Vec<String>) -> (u16, std::sync::mpsc::Receiver<String>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept() else {
                return;
            };
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
            let _ = socket.write_all(response.as_bytes());
        }
    });
    (port, rx)
}

/// WebSocket mock: accepts connections, reports each request path, sends
/// `frames`, then echoes nothing and waits for the client to close.
pub async fn spawn_ws(frames: Vec<String>) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (path_tx, path_rx) = mpsc::unbounded_channel();
    let frames = Arc::new(frames);

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let path_tx = path_tx.clone();
            let frames = Arc::clone(&frames);
            tokio::spawn(async move {
                let (uri_tx, uri_rx) = oneshot::channel();
                let callback = move |request: &Request, response: Response| {
                    let _ = uri_tx.send(request.uri().to_string());
                    Ok::<Response, ErrorResponse>(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                    return;
                };
                if let Ok(path) = uri_rx.await {
                    let _ = path_tx.send(path);
                }
                for frame in frames.iter() {
                    if ws.send(Message::Text(frame.clone())).await.is_err() {
                        return;
                    }
                }
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    (port, path_rx)
}

/// Callback that forwards every result to a channel.
pub fn collector() -> (
    impl Fn(WsResult) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<WsResult>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |result| {
            let _ = tx.send(result);
        },
        rx,
    )
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

/// True when nothing arrives within `wait`. A hung-up channel counts as quiet.
pub async fn stays_quiet<T>(rx: &mut mpsc::UnboundedReceiver<T>, wait: Duration) -> bool {
    !matches!(tokio::time::timeout(wait, rx.recv()).await, Ok(Some(_)))
}
