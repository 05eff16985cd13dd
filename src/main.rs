use lotusx_engine::{ConnectionConfig, Engine, Market, RestRequest, WsResult};
use std::sync::mpsc;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Public endpoints only; set BINANCE_API_KEY / BINANCE_SECRET_KEY for signed calls.
    let config = ConnectionConfig::from_env("BINANCE")
        .unwrap_or_else(|_| ConnectionConfig::live(Market::UsdM));
    let engine = Engine::builder(config)
        .rest_contexts(1)
        .ws_contexts(1)
        .build()?;

    let (tx, rx) = mpsc::channel();
    engine.send_rest_request(RestRequest::get("/fapi/v1/time"), move |result| {
        let _ = tx.send(result);
    });
    match rx.recv_timeout(Duration::from_secs(10))? {
        result if result.is_success() => println!("Server time: {:?}", result.json()),
        result => println!("Error fetching server time: {:?}", result),
    }

    let (tx, rx) = mpsc::sync_channel(16);
    let token = engine.start_web_socket("btcusdt@markPrice", move |result| {
        let _ = tx.try_send(result);
    });
    for _ in 0..5 {
        match rx.recv_timeout(Duration::from_secs(10))? {
            WsResult::Success(event) => println!("Mark price: {}", event["p"]),
            other => {
                println!("Stream ended: {:?}", other);
                break;
            }
        }
    }

    engine.stop_web_socket(token);
    engine.stop();
    Ok(())
}
