//! WebSocket hub protocol and stream routing, driven through the hub's
//! connection API with channel-backed fake connections.

use crate::common::{exchange, limit, settle_bus};
use axum::extract::ws::Message;
use rust_decimal_macros::dec;
use simex::api::WsHub;
use simex::exchange::Exchange;
use simex::orderbook::order::Side;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

fn connect(hub: &WsHub) -> (u64, UnboundedReceiver<Message>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (hub.register(tx), rx)
}

fn frames(rx: &mut UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Text(text) = message {
            out.push(serde_json::from_str(&text).unwrap());
        }
    }
    out
}

fn setup() -> (Arc<Exchange>, Arc<WsHub>) {
    let ex = exchange();
    let hub = WsHub::new(&ex);
    (ex, hub)
}

#[tokio::test]
async fn auth_resolves_api_keys() {
    let (ex, hub) = setup();
    let key = ex.create_user(&"alice".to_string());
    let (conn, _rx) = connect(&hub);

    let ok = hub.handle_frame(
        conn,
        &serde_json::json!({"method": "auth", "params": {"api_key": key}, "id": "1"}).to_string(),
    );
    let ok: serde_json::Value = serde_json::from_str(&ok).unwrap();
    assert_eq!(ok["result"], "success");
    assert_eq!(ok["user_id"], "alice");
    assert_eq!(ok["id"], "1");

    let bad = hub.handle_frame(
        conn,
        &serde_json::json!({"method": "auth", "params": {"api_key": "nope"}, "id": "2"}).to_string(),
    );
    let bad: serde_json::Value = serde_json::from_str(&bad).unwrap();
    assert_eq!(bad["error"], "invalid api key");
}

#[tokio::test]
async fn user_streams_require_matching_auth() {
    let (ex, hub) = setup();
    let key = ex.create_user(&"alice".to_string());
    let (conn, _rx) = connect(&hub);

    let denied = hub.handle_frame(
        conn,
        &serde_json::json!({
            "method": "subscribe",
            "params": {"streams": ["alice@account"]},
            "id": "1"
        })
        .to_string(),
    );
    let denied: serde_json::Value = serde_json::from_str(&denied).unwrap();
    assert!(denied["error"].is_string());

    hub.handle_frame(
        conn,
        &serde_json::json!({"method": "auth", "params": {"api_key": key}, "id": "2"}).to_string(),
    );
    let granted = hub.handle_frame(
        conn,
        &serde_json::json!({
            "method": "subscribe",
            "params": {"streams": ["alice@account", "alice@executionReport"]},
            "id": "3"
        })
        .to_string(),
    );
    let granted: serde_json::Value = serde_json::from_str(&granted).unwrap();
    assert_eq!(granted["result"], "success");

    // Another user's stream stays off limits.
    let foreign = hub.handle_frame(
        conn,
        &serde_json::json!({
            "method": "subscribe",
            "params": {"streams": ["bob@account"]},
            "id": "4"
        })
        .to_string(),
    );
    let foreign: serde_json::Value = serde_json::from_str(&foreign).unwrap();
    assert!(foreign["error"].is_string());
}

#[tokio::test]
async fn unknown_streams_and_methods_error() {
    let (_ex, hub) = setup();
    let (conn, _rx) = connect(&hub);

    let response = hub.handle_frame(
        conn,
        &serde_json::json!({
            "method": "subscribe",
            "params": {"streams": ["NOPE@trade"]},
            "id": "1"
        })
        .to_string(),
    );
    let response: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert!(response["error"].as_str().unwrap().contains("unknown symbol"));

    let response = hub.handle_frame(
        conn,
        &serde_json::json!({"method": "frobnicate", "id": "2"}).to_string(),
    );
    let response: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert!(response["error"].as_str().unwrap().contains("unknown method"));
}

#[tokio::test]
async fn trade_stream_receives_fills() {
    let (ex, hub) = setup();
    let (conn, mut rx) = connect(&hub);
    hub.handle_frame(
        conn,
        &serde_json::json!({
            "method": "subscribe",
            "params": {"streams": ["BTCUSDT@trade", "BTCUSDT@depth"]},
            "id": "1"
        })
        .to_string(),
    );

    ex.deposit(&"a".to_string(), "USDT", dec!(1000)).unwrap();
    ex.deposit(&"b".to_string(), "BTC", dec!(1)).unwrap();
    ex.place_order(limit("a", Side::Buy, dec!(1), dec!(100))).unwrap();
    ex.place_order(limit("b", Side::Sell, dec!(1), dec!(100))).unwrap();
    settle_bus(&ex);

    let received = frames(&mut rx);
    let trade_frames: Vec<_> = received
        .iter()
        .filter(|f| f["stream"] == "BTCUSDT@trade")
        .collect();
    assert_eq!(trade_frames.len(), 1);
    assert_eq!(trade_frames[0]["data"]["price"], "100");
    assert_eq!(trade_frames[0]["data"]["qty"], "1");

    // Depth pushes accompanied the book changes.
    assert!(received.iter().any(|f| f["stream"] == "BTCUSDT@depth"));
}

#[tokio::test]
async fn user_streams_receive_reports_and_balances() {
    let (ex, hub) = setup();
    let alice = "alice".to_string();
    let key = ex.create_user(&alice);
    ex.deposit(&alice, "USDT", dec!(1000)).unwrap();
    ex.deposit(&"bob".to_string(), "BTC", dec!(1)).unwrap();

    let (conn, mut rx) = connect(&hub);
    hub.handle_frame(
        conn,
        &serde_json::json!({"method": "auth", "params": {"api_key": key}, "id": "1"}).to_string(),
    );
    hub.handle_frame(
        conn,
        &serde_json::json!({
            "method": "subscribe",
            "params": {"streams": ["alice@executionReport", "alice@account"]},
            "id": "2"
        })
        .to_string(),
    );

    ex.place_order(limit("alice", Side::Buy, dec!(1), dec!(100))).unwrap();
    ex.place_order(limit("bob", Side::Sell, dec!(1), dec!(100))).unwrap();
    settle_bus(&ex);

    let received = frames(&mut rx);
    let reports: Vec<_> = received
        .iter()
        .filter(|f| f["stream"] == "alice@executionReport")
        .collect();
    assert!(!reports.is_empty());
    // Rested NEW first, FILLED eventually.
    assert_eq!(reports[0]["data"]["status"], "NEW");
    assert!(reports.iter().any(|f| f["data"]["status"] == "FILLED"));

    let accounts: Vec<_> = received
        .iter()
        .filter(|f| f["stream"] == "alice@account")
        .collect();
    assert!(!accounts.is_empty());
    assert_eq!(accounts.last().unwrap()["data"]["user_id"], "alice");
}

#[tokio::test]
async fn unsubscribe_and_disconnect_stop_pushes() {
    let (ex, hub) = setup();
    let (conn, mut rx) = connect(&hub);
    hub.handle_frame(
        conn,
        &serde_json::json!({
            "method": "subscribe",
            "params": {"streams": ["BTCUSDT@trade"]},
            "id": "1"
        })
        .to_string(),
    );
    hub.handle_frame(
        conn,
        &serde_json::json!({
            "method": "unsubscribe",
            "params": {"streams": ["BTCUSDT@trade"]},
            "id": "2"
        })
        .to_string(),
    );

    ex.process_market_tick("BTCUSDT", dec!(100), None).unwrap();
    settle_bus(&ex);
    assert!(frames(&mut rx).is_empty());

    hub.unregister(conn);
}
