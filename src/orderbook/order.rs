//! Order vocabulary: sides, types, time-in-force, self-trade prevention,
//! status machine and the order record itself.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Server-assigned order identifier, unique per engine instance.
pub type OrderId = u64;

/// Opaque user identifier. Ordered lexicographically where the locking
/// discipline requires "ascending user id".
pub type UserId = String;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side of the book.
    #[must_use]
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Supported order types.
///
/// STOP, STOP_LIMIT and TRAILING_STOP park in the stop table until their
/// trigger crosses; the others enter the match loop directly. TWAP and VWAP
/// are accepted for API compatibility and execute as LIMIT (with a price) or
/// MARKET (without): slicing schedules live in the strategy layer, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    StopLimit,
    TrailingStop,
    Iceberg,
    Twap,
    Vwap,
}

impl OrderType {
    /// True for the stop family that parks in the stop table.
    #[must_use]
    #[inline]
    pub fn is_stop(self) -> bool {
        matches!(
            self,
            OrderType::Stop | OrderType::StopLimit | OrderType::TrailingStop
        )
    }

    /// True when the type requires a limit price at admission.
    #[must_use]
    #[inline]
    pub fn requires_price(self) -> bool {
        matches!(
            self,
            OrderType::Limit | OrderType::StopLimit | OrderType::Iceberg
        )
    }

    /// True when the type requires a stop (trigger) price at admission.
    #[must_use]
    #[inline]
    pub fn requires_stop_price(self) -> bool {
        self.is_stop()
    }
}

/// Time-in-force policy for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till cancel: unmatched remainder rests on the book.
    #[default]
    Gtc,
    /// Immediate or cancel: fills what it can, remainder expires.
    Ioc,
    /// Fill or kill: all or nothing, checked before any fill happens.
    Fok,
}

/// Self-trade prevention policy carried by the incoming (taker) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelfTradePrevention {
    /// No prevention: same-user orders match freely.
    #[default]
    None,
    /// Expire the incoming order and stop matching.
    ExpireTaker,
    /// Expire the resting order and keep matching.
    ExpireMaker,
    /// Expire both orders.
    ExpireBoth,
}

/// Order lifecycle states. FILLED, CANCELED, REJECTED and EXPIRED are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// True once the order can no longer change.
    #[must_use]
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    /// True while the order may still trade (live on the book or parked).
    #[must_use]
    #[inline]
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

bitflags::bitflags! {
    /// Restrictions a cancel request may carry: the cancel succeeds only if
    /// the order status is among the allowed set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CancelRestrictions: u8 {
        /// Cancel only if the order is still untouched.
        const ONLY_NEW = 0b01;
        /// Cancel only if the order is partially filled.
        const ONLY_PARTIALLY_FILLED = 0b10;
    }
}

impl CancelRestrictions {
    /// Whether the restriction set allows cancelling an order in `status`.
    /// An empty set allows any open status.
    #[must_use]
    pub fn allows(self, status: OrderStatus) -> bool {
        if self.is_empty() {
            return status.is_open();
        }
        (self.contains(CancelRestrictions::ONLY_NEW) && status == OrderStatus::New)
            || (self.contains(CancelRestrictions::ONLY_PARTIALLY_FILLED)
                && status == OrderStatus::PartiallyFilled)
    }
}

/// A live or archived order record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    /// Optional user-supplied id, unique per user.
    pub client_order_id: Option<String>,
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Limit price. `None` for pure market orders.
    pub price: Option<Decimal>,
    /// Trigger price for the stop family.
    pub stop_price: Option<Decimal>,
    /// Base-asset quantity. Zero for quote-quantified market buys until
    /// fills accumulate.
    pub quantity: Decimal,
    /// Quote budget for MARKET BUY quantified in quote asset.
    pub quote_order_qty: Option<Decimal>,
    /// Displayed slice size for iceberg orders.
    pub iceberg_qty: Option<Decimal>,
    pub filled_quantity: Decimal,
    /// Cumulative executed quote value (Σ qty × price across fills).
    pub cumulative_quote_qty: Decimal,
    pub time_in_force: TimeInForce,
    pub self_trade_prevention: SelfTradePrevention,
    pub create_time: u64,
    pub update_time: u64,
    pub status: OrderStatus,
}

impl Order {
    /// Unfilled base quantity.
    #[must_use]
    #[inline]
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Apply a fill of `qty` at `price`, keeping the
    /// `status = FILLED ⇔ filled_quantity = quantity` invariant.
    pub(crate) fn apply_fill(&mut self, qty: Decimal, price: Decimal, now_ms: u64) {
        self.filled_quantity += qty;
        self.cumulative_quote_qty += qty * price;
        self.update_time = now_ms;
        self.status = if self.filled_quantity >= self.quantity && !self.quantity.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    /// Move to a terminal or resting state without touching fill counters.
    pub(crate) fn set_status(&mut self, status: OrderStatus, now_ms: u64) {
        self.status = status;
        self.update_time = now_ms;
    }
}

/// Admission parameters for a new order, as they arrive from the REST edge
/// or a strategy. The engine validates, assigns ids and stamps times.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewOrder {
    #[serde(default)]
    pub symbol: String,
    pub side: Option<Side>,
    #[serde(rename = "type")]
    pub order_type: Option<OrderType>,
    pub quantity: Option<Decimal>,
    #[serde(rename = "quoteOrderQty")]
    pub quote_order_qty: Option<Decimal>,
    pub price: Option<Decimal>,
    #[serde(rename = "stopPrice")]
    pub stop_price: Option<Decimal>,
    #[serde(rename = "icebergQty")]
    pub iceberg_qty: Option<Decimal>,
    #[serde(rename = "timeInForce")]
    pub time_in_force: Option<TimeInForce>,
    #[serde(rename = "newClientOrderId")]
    pub client_order_id: Option<String>,
    #[serde(rename = "selfTradePreventionMode")]
    pub self_trade_prevention: Option<SelfTradePrevention>,
    pub user_id: Option<UserId>,
}
