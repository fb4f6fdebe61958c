//! Prelude re-exporting the types most callers need.
//!
//! ```rust
//! use simex::prelude::*;
//! ```

pub use crate::account::{AccountError, AccountManager, AssetBalance, BalanceSnapshot};
pub use crate::config::{BusConfig, ExchangeConfig, FeeConfig, SeedUser, SymbolConfig};
pub use crate::events::{
    Event, EventBus, EventBusError, EventPayload, EventPriority, EventType, SubscribeOptions,
};
pub use crate::exchange::{Exchange, ExchangeError, FeeSchedule, Interval, Kline};
pub use crate::orderbook::order::{
    CancelRestrictions, NewOrder, Order, OrderId, OrderStatus, OrderType, SelfTradePrevention,
    Side, TimeInForce, UserId,
};
pub use crate::orderbook::trade::Trade;
pub use crate::orderbook::{
    CancelTarget, DepthSnapshot, MatchingEngine, OrderBook, OrderBookError, OrderReport,
    RejectReason,
};
pub use crate::time::{TimeManager, TimeMode};
