//! WebSocket surface: a single endpoint speaking JSON-RPC-ish frames for
//! auth / subscribe / unsubscribe, plus `{stream, data}` pushes.
//!
//! The hub is one bus subscriber per event family; it routes bus events to
//! the connections subscribed to the matching stream names. Market streams
//! are `<SYMBOL>@trade`, `<SYMBOL>@depth` and `<SYMBOL>@kline_<interval>`;
//! user streams are `<user_id>@account` and `<user_id>@executionReport` and
//! require a prior successful auth for that user. The internal `"*"`
//! wildcard of the bus is never exposed here.

use super::rest::AppState;
use crate::events::{Event, EventBus, EventPayload, SubscribeOptions};
use crate::exchange::{Exchange, Interval};
use crate::orderbook::order::UserId;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{debug, trace, warn};

/// Depth levels pushed on `@depth` streams.
const DEPTH_PUSH_LEVELS: usize = 20;

struct ClientState {
    sender: UnboundedSender<Message>,
    user: Option<UserId>,
}

/// Stream fan-out hub shared by every WebSocket connection.
pub struct WsHub {
    exchange: Weak<Exchange>,
    clients: DashMap<u64, ClientState>,
    /// stream name → subscribed connection ids.
    streams: DashMap<String, HashSet<u64>>,
    next_conn_id: AtomicU64,
}

impl WsHub {
    /// Create the hub and register its bus subscriptions.
    pub fn new(exchange: &Arc<Exchange>) -> Arc<Self> {
        let hub = Arc::new(Self {
            exchange: Arc::downgrade(exchange),
            clients: DashMap::new(),
            streams: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        });
        hub.attach(exchange.bus());
        hub
    }

    fn attach(self: &Arc<Self>, bus: &EventBus) {
        for tag in ["MARKET", "ORDER", "FILL", "ACCOUNT"] {
            let weak = Arc::downgrade(self);
            bus.subscribe(
                tag,
                Arc::new(move |event: &Event| {
                    if let Some(hub) = weak.upgrade() {
                        hub.route_event(event);
                    }
                }),
                SubscribeOptions::default(),
            );
        }
    }

    /// Route one bus event to the streams it feeds.
    fn route_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::Fill(trade) => {
                let data = serde_json::to_value(trade.as_ref()).unwrap_or_default();
                self.push(&format!("{}@trade", trade.symbol), data);
                self.push_depth(&trade.symbol);
                self.push_klines(&trade.symbol);
            }
            EventPayload::Market(tick) => {
                let data = serde_json::to_value(tick).unwrap_or_default();
                self.push(&format!("{}@trade", tick.symbol), data);
                self.push_klines(&tick.symbol);
            }
            EventPayload::Order(order) => {
                let data = serde_json::to_value(order.as_ref()).unwrap_or_default();
                self.push(&format!("{}@executionReport", order.user_id), data);
                self.push_depth(&order.symbol);
            }
            EventPayload::Account(account) => {
                let data = serde_json::to_value(account).unwrap_or_default();
                self.push(&format!("{}@account", account.user_id), data);
            }
            _ => {}
        }
    }

    fn push(&self, stream: &str, data: serde_json::Value) {
        let Some(subscribers) = self.streams.get(stream) else {
            return;
        };
        if subscribers.is_empty() {
            return;
        }
        let frame = serde_json::json!({ "stream": stream, "data": data }).to_string();
        for conn_id in subscribers.iter() {
            if let Some(client) = self.clients.get(conn_id) {
                let _ = client.sender.send(Message::Text(frame.clone()));
            }
        }
        trace!(stream, "pushed to {} subscriber(s)", subscribers.len());
    }

    fn push_depth(&self, symbol: &str) {
        let stream = format!("{symbol}@depth");
        if !self.has_subscribers(&stream) {
            return;
        }
        let Some(exchange) = self.exchange.upgrade() else {
            return;
        };
        if let Ok(snapshot) = exchange.depth(symbol, DEPTH_PUSH_LEVELS) {
            self.push(&stream, serde_json::to_value(snapshot).unwrap_or_default());
        }
    }

    fn push_klines(&self, symbol: &str) {
        let Some(exchange) = self.exchange.upgrade() else {
            return;
        };
        for interval in Interval::ALL {
            let stream = format!("{symbol}@kline_{interval}");
            if !self.has_subscribers(&stream) {
                continue;
            }
            if let Some(kline) = exchange.kline_store().current(symbol, interval) {
                let data = serde_json::json!({
                    "symbol": symbol,
                    "interval": interval.as_str(),
                    "kline": kline,
                });
                self.push(&stream, data);
            }
        }
    }

    fn has_subscribers(&self, stream: &str) -> bool {
        self.streams.get(stream).is_some_and(|s| !s.is_empty())
    }

    /// Register a connection and get its id. Public so embedders (and
    /// tests) can drive the hub without a socket.
    pub fn register(&self, sender: UnboundedSender<Message>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(conn_id, ClientState { sender, user: None });
        debug!(conn_id, "ws connected");
        conn_id
    }

    /// Drop a connection and all of its stream subscriptions.
    pub fn unregister(&self, conn_id: u64) {
        self.clients.remove(&conn_id);
        for mut entry in self.streams.iter_mut() {
            entry.value_mut().remove(&conn_id);
        }
        debug!(conn_id, "ws disconnected");
    }

    /// Handle one client frame, returning the response frame.
    pub fn handle_frame(&self, conn_id: u64, text: &str) -> String {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                return serde_json::json!({ "id": null, "error": format!("invalid frame: {e}") })
                    .to_string();
            }
        };
        let id = frame.id.clone().unwrap_or(serde_json::Value::Null);

        match frame.method.as_str() {
            "auth" => self.handle_auth(conn_id, &frame, id),
            "subscribe" => self.handle_subscribe(conn_id, &frame, id, true),
            "unsubscribe" => self.handle_subscribe(conn_id, &frame, id, false),
            other => {
                serde_json::json!({ "id": id, "error": format!("unknown method: {other}") })
                    .to_string()
            }
        }
    }

    fn handle_auth(&self, conn_id: u64, frame: &ClientFrame, id: serde_json::Value) -> String {
        let Some(api_key) = frame.params.get("api_key").and_then(|v| v.as_str()) else {
            return serde_json::json!({ "id": id, "error": "missing api_key" }).to_string();
        };
        let Some(exchange) = self.exchange.upgrade() else {
            return serde_json::json!({ "id": id, "error": "exchange unavailable" }).to_string();
        };
        match exchange.authenticate(api_key) {
            Some(user) => {
                if let Some(mut client) = self.clients.get_mut(&conn_id) {
                    client.user = Some(user.clone());
                }
                serde_json::json!({ "id": id, "result": "success", "user_id": user }).to_string()
            }
            None => serde_json::json!({ "id": id, "error": "invalid api key" }).to_string(),
        }
    }

    fn handle_subscribe(
        &self,
        conn_id: u64,
        frame: &ClientFrame,
        id: serde_json::Value,
        subscribe: bool,
    ) -> String {
        let streams: Vec<String> = match frame.params.get("streams") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(streams) => streams,
                Err(_) => {
                    return serde_json::json!({ "id": id, "error": "streams must be a string array" })
                        .to_string();
                }
            },
            None => {
                return serde_json::json!({ "id": id, "error": "missing streams" }).to_string();
            }
        };

        for stream in &streams {
            if let Err(reason) = self.validate_stream(conn_id, stream) {
                warn!(conn_id, stream, "stream rejected: {reason}");
                return serde_json::json!({ "id": id, "error": reason }).to_string();
            }
        }
        for stream in streams {
            let mut entry = self.streams.entry(stream).or_default();
            if subscribe {
                entry.insert(conn_id);
            } else {
                entry.remove(&conn_id);
            }
        }
        serde_json::json!({ "id": id, "result": "success" }).to_string()
    }

    fn validate_stream(&self, conn_id: u64, stream: &str) -> Result<(), String> {
        let Some((prefix, kind)) = stream.split_once('@') else {
            return Err(format!("malformed stream name: {stream}"));
        };
        match kind {
            "trade" | "depth" => {
                let Some(exchange) = self.exchange.upgrade() else {
                    return Err("exchange unavailable".to_string());
                };
                if exchange.engine().symbol_config(prefix).is_none() {
                    return Err(format!("unknown symbol: {prefix}"));
                }
                Ok(())
            }
            kind if kind.starts_with("kline_") => {
                let Some(exchange) = self.exchange.upgrade() else {
                    return Err("exchange unavailable".to_string());
                };
                if exchange.engine().symbol_config(prefix).is_none() {
                    return Err(format!("unknown symbol: {prefix}"));
                }
                let interval = &kind["kline_".len()..];
                interval
                    .parse::<Interval>()
                    .map_err(|()| format!("unknown interval: {interval}"))?;
                Ok(())
            }
            "account" | "executionReport" => {
                let authed = self
                    .clients
                    .get(&conn_id)
                    .and_then(|c| c.user.clone())
                    .is_some_and(|user| user == prefix);
                if authed {
                    Ok(())
                } else {
                    Err("user stream requires auth".to_string())
                }
            }
            other => Err(format!("unknown stream kind: {other}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    id: Option<serde_json::Value>,
}

/// Upgrade handler mounted at `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<WsHub>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = unbounded_channel::<Message>();
    let conn_id = hub.register(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let response = hub.handle_frame(conn_id, &text);
                if tx.send(Message::Text(response)).is_err() {
                    break;
                }
            }
            Message::Ping(payload) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.unregister(conn_id);
    writer.abort();
}
