//! Binance-compatible REST surface under `/api/v3/`.
//!
//! Thin plumbing over the exchange facade: parameter structs, the API-key
//! extractor, recvWindow checks and wire-shaped responses. All errors leave
//! through the `{code, msg}` envelope in [`super::error`].

use super::error::ApiError;
use super::ws::{WsHub, ws_handler};
use crate::exchange::{Exchange, Interval};
use crate::orderbook::order::{
    CancelRestrictions, NewOrder, Order, OrderStatus, OrderType, Side, TimeInForce, UserId,
};
use crate::orderbook::trade::Trade;
use axum::Router;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::response::Json;
use axum::routing::{get, post};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Default allowed skew between client and server timestamps.
const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<Exchange>,
    pub hub: Arc<WsHub>,
}

/// Build the full router: REST endpoints plus the WebSocket endpoint.
pub fn router(exchange: Arc<Exchange>, hub: Arc<WsHub>) -> Router {
    Router::new()
        .route("/api/v3/ping", get(ping))
        .route("/api/v3/time", get(server_time))
        .route("/api/v3/exchangeInfo", get(exchange_info))
        .route("/api/v3/depth", get(depth))
        .route("/api/v3/klines", get(klines))
        .route(
            "/api/v3/order",
            post(place_order).get(get_order).delete(cancel_order),
        )
        .route("/api/v3/order/test", post(test_order))
        .route("/api/v3/openOrders", get(open_orders).delete(cancel_all))
        .route("/api/v3/account", get(account))
        .route("/api/v3/myTrades", get(my_trades))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { exchange, hub })
}

/// API-key authentication via the `X-API-KEY` header.
pub struct Authenticated(pub UserId);

#[async_trait::async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let key = parts
            .headers
            .get("X-API-KEY")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(ApiError::bad_api_key)?;
        state
            .exchange
            .authenticate(key)
            .map(Authenticated)
            .ok_or_else(ApiError::rejected_key)
    }
}

/// recvWindow validation for timestamped endpoints.
fn check_timestamp(
    exchange: &Exchange,
    timestamp: Option<u64>,
    recv_window: Option<u64>,
) -> Result<(), ApiError> {
    let Some(ts) = timestamp else {
        return Err(ApiError::mandatory("timestamp"));
    };
    let window = recv_window.unwrap_or(DEFAULT_RECV_WINDOW_MS);
    if exchange.server_time().abs_diff(ts) > window {
        return Err(ApiError::timestamp());
    }
    Ok(())
}

// ---- public endpoints ----------------------------------------------------

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

#[derive(Serialize)]
struct ServerTime {
    #[serde(rename = "serverTime")]
    server_time: u64,
}

async fn server_time(State(state): State<AppState>) -> Json<ServerTime> {
    Json(ServerTime {
        server_time: state.exchange.server_time(),
    })
}

async fn exchange_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let symbols: Vec<serde_json::Value> = state
        .exchange
        .exchange_info()
        .into_iter()
        .map(|cfg| {
            serde_json::json!({
                "symbol": cfg.symbol,
                "status": "TRADING",
                "baseAsset": cfg.base_asset,
                "baseAssetPrecision": cfg.base_precision,
                "quoteAsset": cfg.quote_asset,
                "quoteAssetPrecision": cfg.quote_precision,
                "filters": [
                    {
                        "filterType": "PRICE_FILTER",
                        "tickSize": cfg.tick_size.map(|t| t.to_string()),
                    },
                    {
                        "filterType": "LOT_SIZE",
                        "stepSize": cfg.lot_size.map(|l| l.to_string()),
                        "minQty": cfg.min_qty.map(|q| q.to_string()),
                    },
                ],
            })
        })
        .collect();
    Json(serde_json::json!({
        "timezone": "UTC",
        "serverTime": state.exchange.server_time(),
        "symbols": symbols,
    }))
}

#[derive(Deserialize)]
struct DepthQuery {
    symbol: String,
    limit: Option<usize>,
}

async fn depth(
    State(state): State<AppState>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state
        .exchange
        .depth(&query.symbol, query.limit.unwrap_or(100).min(5_000))?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

#[derive(Deserialize)]
struct KlinesQuery {
    symbol: String,
    interval: String,
    #[serde(rename = "startTime")]
    start_time: Option<u64>,
    #[serde(rename = "endTime")]
    end_time: Option<u64>,
    limit: Option<usize>,
}

async fn klines(
    State(state): State<AppState>,
    Query(query): Query<KlinesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let interval: Interval = query
        .interval
        .parse()
        .map_err(|()| ApiError::bad_parameter("Invalid interval."))?;
    let klines = state.exchange.klines(
        &query.symbol,
        interval,
        query.start_time,
        query.end_time,
        query.limit,
    )?;
    let wire: Vec<serde_json::Value> = klines.iter().map(|k| k.to_wire()).collect();
    Ok(Json(serde_json::Value::Array(wire)))
}

// ---- orders --------------------------------------------------------------

#[derive(Deserialize)]
struct PlaceOrderBody {
    #[serde(flatten)]
    order: NewOrder,
    timestamp: Option<u64>,
    #[serde(rename = "recvWindow")]
    recv_window: Option<u64>,
}

/// One fill line in the FULL order response.
#[derive(Serialize)]
struct FillLine {
    price: Decimal,
    qty: Decimal,
    commission: Decimal,
    #[serde(rename = "commissionAsset")]
    commission_asset: String,
    #[serde(rename = "tradeId")]
    trade_id: u64,
}

#[derive(Serialize)]
struct OrderResponse {
    symbol: String,
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "clientOrderId", skip_serializing_if = "Option::is_none")]
    client_order_id: Option<String>,
    #[serde(rename = "transactTime")]
    transact_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    #[serde(rename = "stopPrice", skip_serializing_if = "Option::is_none")]
    stop_price: Option<Decimal>,
    #[serde(rename = "origQty")]
    orig_qty: Decimal,
    #[serde(rename = "executedQty")]
    executed_qty: Decimal,
    #[serde(rename = "cummulativeQuoteQty")]
    cummulative_quote_qty: Decimal,
    status: OrderStatus,
    #[serde(rename = "timeInForce")]
    time_in_force: TimeInForce,
    #[serde(rename = "type")]
    order_type: OrderType,
    side: Side,
    fills: Vec<FillLine>,
}

fn order_response(state: &AppState, order: &Order, trades: &[Trade]) -> OrderResponse {
    let (base_asset, quote_asset) = state
        .exchange
        .engine()
        .symbol_config(&order.symbol)
        .map(|c| (c.base_asset, c.quote_asset))
        .unwrap_or_default();
    let fills = trades
        .iter()
        .map(|t| {
            let (commission, commission_asset) = match order.side {
                Side::Buy => (t.commission_buyer, base_asset.clone()),
                Side::Sell => (t.commission_seller, quote_asset.clone()),
            };
            FillLine {
                price: t.price,
                qty: t.quantity,
                commission,
                commission_asset,
                trade_id: t.trade_id,
            }
        })
        .collect();
    OrderResponse {
        symbol: order.symbol.clone(),
        order_id: order.order_id,
        client_order_id: order.client_order_id.clone(),
        transact_time: order.update_time,
        price: order.price,
        stop_price: order.stop_price,
        orig_qty: order.quantity,
        executed_qty: order.filled_quantity,
        cummulative_quote_qty: order.cumulative_quote_qty,
        status: order.status,
        time_in_force: order.time_in_force,
        order_type: order.order_type,
        side: order.side,
        fills,
    }
}

async fn place_order(
    State(state): State<AppState>,
    Authenticated(user): Authenticated,
    Json(body): Json<PlaceOrderBody>,
) -> Result<Json<OrderResponse>, ApiError> {
    check_timestamp(&state.exchange, body.timestamp, body.recv_window)?;
    let mut new = body.order;
    new.user_id = Some(user);
    let report = state.exchange.place_order(new)?;
    Ok(Json(order_response(&state, &report.order, &report.trades)))
}

async fn test_order(
    State(state): State<AppState>,
    Authenticated(user): Authenticated,
    Json(body): Json<PlaceOrderBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_timestamp(&state.exchange, body.timestamp, body.recv_window)?;
    let mut new = body.order;
    new.user_id = Some(user);
    state.exchange.test_order(&new)?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Deserialize)]
struct OrderQuery {
    symbol: String,
    #[serde(rename = "orderId")]
    order_id: Option<u64>,
    #[serde(rename = "origClientOrderId")]
    orig_client_order_id: Option<String>,
    #[serde(rename = "cancelRestrictions")]
    cancel_restrictions: Option<String>,
    timestamp: Option<u64>,
    #[serde(rename = "recvWindow")]
    recv_window: Option<u64>,
}

fn parse_restrictions(raw: Option<&str>) -> Result<CancelRestrictions, ApiError> {
    let Some(raw) = raw else {
        return Ok(CancelRestrictions::empty());
    };
    let mut restrictions = CancelRestrictions::empty();
    for part in raw.split(',') {
        match part.trim() {
            "ONLY_NEW" => restrictions |= CancelRestrictions::ONLY_NEW,
            "ONLY_PARTIALLY_FILLED" => restrictions |= CancelRestrictions::ONLY_PARTIALLY_FILLED,
            other => {
                return Err(ApiError::bad_parameter(format!(
                    "Invalid cancelRestrictions value: {other}"
                )));
            }
        }
    }
    Ok(restrictions)
}

async fn get_order(
    State(state): State<AppState>,
    Authenticated(user): Authenticated,
    Query(query): Query<OrderQuery>,
) -> Result<Json<OrderResponse>, ApiError> {
    check_timestamp(&state.exchange, query.timestamp, query.recv_window)?;
    let order = state.exchange.get_order(
        &query.symbol,
        query.order_id,
        query.orig_client_order_id,
        &user,
    )?;
    Ok(Json(order_response(&state, &order, &[])))
}

async fn cancel_order(
    State(state): State<AppState>,
    Authenticated(user): Authenticated,
    Query(query): Query<OrderQuery>,
) -> Result<Json<OrderResponse>, ApiError> {
    check_timestamp(&state.exchange, query.timestamp, query.recv_window)?;
    let restrictions = parse_restrictions(query.cancel_restrictions.as_deref())?;
    let order = state.exchange.cancel_order(
        &query.symbol,
        query.order_id,
        query.orig_client_order_id,
        &user,
        restrictions,
    )?;
    Ok(Json(order_response(&state, &order, &[])))
}

#[derive(Deserialize)]
struct OpenOrdersQuery {
    symbol: Option<String>,
    timestamp: Option<u64>,
    #[serde(rename = "recvWindow")]
    recv_window: Option<u64>,
}

async fn open_orders(
    State(state): State<AppState>,
    Authenticated(user): Authenticated,
    Query(query): Query<OpenOrdersQuery>,
) -> Result<Json<Vec<OrderResponse>>, ApiError> {
    check_timestamp(&state.exchange, query.timestamp, query.recv_window)?;
    let orders = state.exchange.open_orders(&user, query.symbol.as_deref());
    Ok(Json(
        orders
            .iter()
            .map(|o| order_response(&state, o, &[]))
            .collect(),
    ))
}

async fn cancel_all(
    State(state): State<AppState>,
    Authenticated(user): Authenticated,
    Query(query): Query<OpenOrdersQuery>,
) -> Result<Json<Vec<OrderResponse>>, ApiError> {
    check_timestamp(&state.exchange, query.timestamp, query.recv_window)?;
    let Some(symbol) = query.symbol else {
        return Err(ApiError::mandatory("symbol"));
    };
    let canceled = state.exchange.cancel_all_orders(&symbol, &user)?;
    Ok(Json(
        canceled
            .iter()
            .map(|o| order_response(&state, o, &[]))
            .collect(),
    ))
}

// ---- account -------------------------------------------------------------

#[derive(Deserialize)]
struct SignedQuery {
    timestamp: Option<u64>,
    #[serde(rename = "recvWindow")]
    recv_window: Option<u64>,
}

async fn account(
    State(state): State<AppState>,
    Authenticated(user): Authenticated,
    Query(query): Query<SignedQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_timestamp(&state.exchange, query.timestamp, query.recv_window)?;
    let balances = state.exchange.account_snapshot(&user);
    Ok(Json(serde_json::json!({
        "canTrade": true,
        "updateTime": state.exchange.server_time(),
        "balances": balances,
    })))
}

#[derive(Deserialize)]
struct MyTradesQuery {
    symbol: String,
    limit: Option<usize>,
    timestamp: Option<u64>,
    #[serde(rename = "recvWindow")]
    recv_window: Option<u64>,
}

#[derive(Serialize)]
struct MyTradeLine {
    symbol: String,
    id: u64,
    #[serde(rename = "orderId")]
    order_id: u64,
    price: Decimal,
    qty: Decimal,
    #[serde(rename = "quoteQty")]
    quote_qty: Decimal,
    commission: Decimal,
    #[serde(rename = "commissionAsset")]
    commission_asset: String,
    time: u64,
    #[serde(rename = "isBuyer")]
    is_buyer: bool,
    #[serde(rename = "isMaker")]
    is_maker: bool,
}

async fn my_trades(
    State(state): State<AppState>,
    Authenticated(user): Authenticated,
    Query(query): Query<MyTradesQuery>,
) -> Result<Json<Vec<MyTradeLine>>, ApiError> {
    check_timestamp(&state.exchange, query.timestamp, query.recv_window)?;
    let (base_asset, quote_asset) = state
        .exchange
        .engine()
        .symbol_config(&query.symbol)
        .map(|c| (c.base_asset, c.quote_asset))
        .unwrap_or_default();
    let trades = state
        .exchange
        .my_trades(&user, &query.symbol, query.limit.unwrap_or(500).min(1_000))?;
    let lines = trades
        .into_iter()
        .map(|t| {
            let is_buyer = t.buyer_user_id == user;
            let (order_id, commission, commission_asset, is_maker) = if is_buyer {
                (
                    t.buyer_order_id,
                    t.commission_buyer,
                    base_asset.clone(),
                    t.buyer_is_maker,
                )
            } else {
                (
                    t.seller_order_id,
                    t.commission_seller,
                    quote_asset.clone(),
                    !t.buyer_is_maker,
                )
            };
            MyTradeLine {
                symbol: t.symbol.clone(),
                id: t.trade_id,
                order_id,
                price: t.price,
                qty: t.quantity,
                quote_qty: t.quote_qty(),
                commission,
                commission_asset,
                time: t.timestamp,
                is_buyer,
                is_maker,
            }
        })
        .collect();
    Ok(Json(lines))
}

