//! Event vocabulary shared by the bus and every subscriber: the closed type
//! set, the priority ladder and the structured payload variants.

use crate::account::BalanceSnapshot;
use crate::orderbook::order::{Order, UserId};
use crate::orderbook::trade::Trade;
use crate::time::TimeManager;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide event id sequence. Ids are 8-char lowercase hex of a
/// monotonic counter: unique within a run and time-ordered.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Allocate the next event id.
#[must_use]
pub fn next_event_id() -> String {
    format!("{:08x}", EVENT_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Delivery priority: smaller value wins. CRITICAL is reserved for
/// system-error and risk-limit traffic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPriority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Background = 5,
}

/// The closed set of event types. Every variant has a stable string tag;
/// subscriptions address tags (or the `"*"` wildcard).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Market,
    Signal,
    Order,
    Fill,
    Account,
    SystemStart,
    SystemStop,
    SystemError,
    StrategyStart,
    StrategyStop,
    StrategyError,
    DataStart,
    DataEnd,
    DataError,
    TimeTick,
    TimeBar,
    RiskWarning,
    RiskLimit,
    /// Application-defined tag outside the built-in set.
    Custom(String),
}

impl EventType {
    /// Stable wire tag used for subscription matching.
    #[must_use]
    pub fn as_tag(&self) -> &str {
        match self {
            EventType::Market => "MARKET",
            EventType::Signal => "SIGNAL",
            EventType::Order => "ORDER",
            EventType::Fill => "FILL",
            EventType::Account => "ACCOUNT",
            EventType::SystemStart => "SYSTEM_START",
            EventType::SystemStop => "SYSTEM_STOP",
            EventType::SystemError => "SYSTEM_ERROR",
            EventType::StrategyStart => "STRATEGY_START",
            EventType::StrategyStop => "STRATEGY_STOP",
            EventType::StrategyError => "STRATEGY_ERROR",
            EventType::DataStart => "DATA_START",
            EventType::DataEnd => "DATA_END",
            EventType::DataError => "DATA_ERROR",
            EventType::TimeTick => "TIME_TICK",
            EventType::TimeBar => "TIME_BAR",
            EventType::RiskWarning => "RISK_WARNING",
            EventType::RiskLimit => "RISK_LIMIT",
            EventType::Custom(tag) => tag,
        }
    }

    /// The priority an event of this type gets unless the publisher says
    /// otherwise.
    #[must_use]
    pub fn default_priority(&self) -> EventPriority {
        match self {
            EventType::SystemError | EventType::RiskLimit => EventPriority::Critical,
            _ => EventPriority::Normal,
        }
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "MARKET" => EventType::Market,
            "SIGNAL" => EventType::Signal,
            "ORDER" => EventType::Order,
            "FILL" => EventType::Fill,
            "ACCOUNT" => EventType::Account,
            "SYSTEM_START" => EventType::SystemStart,
            "SYSTEM_STOP" => EventType::SystemStop,
            "SYSTEM_ERROR" => EventType::SystemError,
            "STRATEGY_START" => EventType::StrategyStart,
            "STRATEGY_STOP" => EventType::StrategyStop,
            "STRATEGY_ERROR" => EventType::StrategyError,
            "DATA_START" => EventType::DataStart,
            "DATA_END" => EventType::DataEnd,
            "DATA_ERROR" => EventType::DataError,
            "TIME_TICK" => EventType::TimeTick,
            "TIME_BAR" => EventType::TimeBar,
            "RISK_WARNING" => EventType::RiskWarning,
            "RISK_LIMIT" => EventType::RiskLimit,
            _ => EventType::Custom(tag),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_tag().to_string()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Market-data tick payload.
#[derive(Debug, Clone, Serialize)]
pub struct MarketData {
    pub symbol: String,
    pub price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,
}

/// Strategy signal payload.
#[derive(Debug, Clone, Serialize)]
pub struct SignalData {
    pub symbol: String,
    /// Direction: positive long, negative short, zero flat.
    pub direction: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<Decimal>,
}

/// Account-change payload: the touched assets only.
#[derive(Debug, Clone, Serialize)]
pub struct AccountData {
    pub user_id: UserId,
    pub balances: Vec<BalanceSnapshot>,
}

/// Structured payloads. The bus treats all of them as one sum type; only
/// subscribers look inside.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Market(MarketData),
    Signal(SignalData),
    Order(Box<Order>),
    Fill(Box<Trade>),
    Account(AccountData),
    None,
}

/// One event as it travels through the bus.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub timestamp: u64,
    pub priority: EventPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub payload: EventPayload,
}

impl Event {
    /// Build an event stamped from the process clock, with the type's
    /// default priority.
    #[must_use]
    pub fn new(event_type: EventType, payload: EventPayload, time: &TimeManager) -> Self {
        let priority = event_type.default_priority();
        Self {
            id: next_event_id(),
            event_type,
            timestamp: time.now_ms(),
            priority,
            source: None,
            correlation_id: None,
            metadata: HashMap::new(),
            payload,
        }
    }

    /// MARKET tick event.
    #[must_use]
    pub fn market(
        symbol: &str,
        price: Decimal,
        quantity: Option<Decimal>,
        time: &TimeManager,
    ) -> Self {
        Self::new(
            EventType::Market,
            EventPayload::Market(MarketData {
                symbol: symbol.to_string(),
                price,
                quantity,
            }),
            time,
        )
    }

    /// ORDER lifecycle event carrying the full order snapshot.
    #[must_use]
    pub fn order(order: Order, time: &TimeManager) -> Self {
        Self::new(EventType::Order, EventPayload::Order(Box::new(order)), time)
    }

    /// FILL event carrying the immutable trade.
    #[must_use]
    pub fn fill(trade: Trade, time: &TimeManager) -> Self {
        Self::new(EventType::Fill, EventPayload::Fill(Box::new(trade)), time)
    }

    /// ACCOUNT event carrying the touched balances.
    #[must_use]
    pub fn account(user_id: UserId, balances: Vec<BalanceSnapshot>, time: &TimeManager) -> Self {
        Self::new(
            EventType::Account,
            EventPayload::Account(AccountData { user_id, balances }),
            time,
        )
    }

    /// Payload-less system/lifecycle event.
    #[must_use]
    pub fn system(event_type: EventType, time: &TimeManager) -> Self {
        Self::new(event_type, EventPayload::None, time)
    }

    /// Override the delivery priority.
    #[must_use]
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Tag the publishing component.
    #[must_use]
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Correlate with a triggering event.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    /// Attach one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}
