//! REST surface: wire shapes, auth, recvWindow and the stable error codes,
//! exercised against the real router with in-memory requests.

use crate::common::{START_MS, exchange, limit};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use rust_decimal_macros::dec;
use simex::api::{WsHub, router};
use simex::exchange::Exchange;
use simex::orderbook::order::Side;
use std::sync::Arc;
use tower::ServiceExt;

struct Harness {
    app: Router,
    exchange: Arc<Exchange>,
    api_key: String,
}

fn harness() -> Harness {
    let ex = exchange();
    let user = "alice".to_string();
    ex.deposit(&user, "USDT", dec!(100000)).unwrap();
    ex.deposit(&user, "BTC", dec!(10)).unwrap();
    let api_key = ex.create_user(&user);
    let hub = WsHub::new(&ex);
    Harness {
        app: router(ex.clone(), hub),
        exchange: ex,
        api_key,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn order_body(extra: &str) -> String {
    format!(
        r#"{{"symbol":"BTCUSDT","side":"BUY","type":"LIMIT","quantity":"1","price":"50000","timeInForce":"GTC","timestamp":{START_MS}{extra}}}"#
    )
}

fn post_order(api_key: Option<&str>, body: String) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v3/order")
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("X-API-KEY", key);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn ping_returns_empty_object() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Request::builder().uri("/api/v3/ping").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({}));
}

#[tokio::test]
async fn time_reads_the_virtual_clock() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Request::builder().uri("/api/v3/time").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["serverTime"], serde_json::json!(START_MS));
}

#[tokio::test]
async fn exchange_info_lists_symbols() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Request::builder().uri("/api/v3/exchangeInfo").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["symbols"][0]["symbol"], "BTCUSDT");
    assert_eq!(body["symbols"][0]["baseAsset"], "BTC");
}

#[tokio::test]
async fn missing_api_key_is_unauthorized() {
    let h = harness();
    let (status, body) = send(&h.app, post_order(None, order_body(""))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], serde_json::json!(-2014));
}

#[tokio::test]
async fn unknown_api_key_is_rejected() {
    let h = harness();
    let (status, body) = send(&h.app, post_order(Some("bogus"), order_body(""))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], serde_json::json!(-2015));
}

#[tokio::test]
async fn missing_timestamp_is_1102() {
    let h = harness();
    let body =
        r#"{"symbol":"BTCUSDT","side":"BUY","type":"LIMIT","quantity":"1","price":"50000"}"#;
    let (status, response) = send(&h.app, post_order(Some(&h.api_key), body.to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["code"], serde_json::json!(-1102));
}

#[tokio::test]
async fn stale_timestamp_is_1021() {
    let h = harness();
    let body = format!(
        r#"{{"symbol":"BTCUSDT","side":"BUY","type":"LIMIT","quantity":"1","price":"50000","timestamp":{}}}"#,
        START_MS - 10_000
    );
    let (status, response) = send(&h.app, post_order(Some(&h.api_key), body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["code"], serde_json::json!(-1021));
}

#[tokio::test]
async fn place_order_returns_the_binance_shape() {
    let h = harness();
    let (status, body) = send(&h.app, post_order(Some(&h.api_key), order_body(""))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["symbol"], "BTCUSDT");
    assert_eq!(body["status"], "NEW");
    assert_eq!(body["side"], "BUY");
    assert_eq!(body["type"], "LIMIT");
    assert_eq!(body["timeInForce"], "GTC");
    assert_eq!(body["origQty"], "1");
    assert_eq!(body["executedQty"], "0");
    assert_eq!(body["transactTime"], serde_json::json!(START_MS));
    assert!(body["orderId"].as_u64().is_some());
    assert_eq!(body["fills"], serde_json::json!([]));
}

#[tokio::test]
async fn insufficient_balance_is_2010() {
    let h = harness();
    let body = format!(
        r#"{{"symbol":"BTCUSDT","side":"BUY","type":"LIMIT","quantity":"1000","price":"50000","timestamp":{START_MS}}}"#
    );
    let (status, response) = send(&h.app, post_order(Some(&h.api_key), body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["code"], serde_json::json!(-2010));
}

#[tokio::test]
async fn depth_reflects_resting_orders() {
    let h = harness();
    let (_, placed) = send(&h.app, post_order(Some(&h.api_key), order_body(""))).await;
    assert!(placed["orderId"].as_u64().is_some());

    let (status, body) = send(
        &h.app,
        Request::builder()
            .uri("/api/v3/depth?symbol=BTCUSDT&limit=5")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bids"][0][0], "50000");
    assert_eq!(body["bids"][0][1], "1");
    assert_eq!(body["asks"], serde_json::json!([]));
}

#[tokio::test]
async fn cancel_unknown_order_is_2013() {
    let h = harness();
    let uri = format!(
        "/api/v3/order?symbol=BTCUSDT&orderId=424242&timestamp={START_MS}"
    );
    let (status, body) = send(
        &h.app,
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("X-API-KEY", &h.api_key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], serde_json::json!(-2013));
}

#[tokio::test]
async fn full_order_round_trip_over_rest() {
    let h = harness();
    // Rest a bid, then cancel it and confirm the depth is empty again.
    let (_, placed) = send(&h.app, post_order(Some(&h.api_key), order_body(""))).await;
    let order_id = placed["orderId"].as_u64().unwrap();

    let uri = format!(
        "/api/v3/order?symbol=BTCUSDT&orderId={order_id}&timestamp={START_MS}"
    );
    let (status, canceled) = send(
        &h.app,
        Request::builder()
            .method("DELETE")
            .uri(&uri)
            .header("X-API-KEY", &h.api_key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["status"], "CANCELED");

    let (_, lookup) = send(
        &h.app,
        Request::builder()
            .uri(format!(
                "/api/v3/order?symbol=BTCUSDT&orderId={order_id}&timestamp={START_MS}"
            ))
            .header("X-API-KEY", &h.api_key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(lookup["status"], "CANCELED");
}

#[tokio::test]
async fn taker_order_reports_fills() {
    let h = harness();
    let bob = "bob".to_string();
    h.exchange.deposit(&bob, "BTC", dec!(5)).unwrap();
    h.exchange
        .place_order(limit("bob", Side::Sell, dec!(1), dec!(50000)))
        .unwrap();

    let (status, body) = send(&h.app, post_order(Some(&h.api_key), order_body(""))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "FILLED");
    assert_eq!(body["executedQty"], "1");
    assert_eq!(body["fills"][0]["price"], "50000");
    assert_eq!(body["fills"][0]["qty"], "1");
}

#[tokio::test]
async fn account_endpoint_returns_balances() {
    let h = harness();
    let uri = format!("/api/v3/account?timestamp={START_MS}");
    let (status, body) = send(
        &h.app,
        Request::builder()
            .uri(uri)
            .header("X-API-KEY", &h.api_key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let balances = body["balances"].as_array().unwrap();
    assert!(balances.iter().any(|b| b["asset"] == "BTC" && b["free"] == "10"));
    assert!(balances.iter().any(|b| b["asset"] == "USDT" && b["free"] == "100000"));
}

#[tokio::test]
async fn my_trades_requires_auth_and_reports_role() {
    let h = harness();
    let bob = "bob".to_string();
    h.exchange.deposit(&bob, "BTC", dec!(5)).unwrap();
    h.exchange
        .place_order(limit("bob", Side::Sell, dec!(1), dec!(50000)))
        .unwrap();
    send(&h.app, post_order(Some(&h.api_key), order_body(""))).await;

    let uri = format!("/api/v3/myTrades?symbol=BTCUSDT&timestamp={START_MS}");
    let (status, body) = send(
        &h.app,
        Request::builder()
            .uri(&uri)
            .header("X-API-KEY", &h.api_key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let trades = body.as_array().unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0]["isBuyer"], serde_json::json!(true));
    assert_eq!(trades[0]["isMaker"], serde_json::json!(false));
    assert_eq!(trades[0]["commissionAsset"], "BTC");

    let (status, _) = send(
        &h.app,
        Request::builder().uri(&uri).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn klines_round_trip_over_rest() {
    let h = harness();
    h.exchange.process_market_tick("BTCUSDT", dec!(100), Some(dec!(2))).unwrap();
    let (status, body) = send(
        &h.app,
        Request::builder()
            .uri("/api/v3/klines?symbol=BTCUSDT&interval=1m")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    // [openTime, open, high, low, close, volume, closeTime, quoteVolume, trades]
    assert_eq!(rows[0][1], "100");
    assert_eq!(rows[0][5], "2");

    let (status, body) = send(
        &h.app,
        Request::builder()
            .uri("/api/v3/klines?symbol=BTCUSDT&interval=9x")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], serde_json::json!(-1100));
}
