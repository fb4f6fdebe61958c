//! Matching engine and order book error types.

use super::order::{OrderId, Side};
use rust_decimal::Decimal;
use thiserror::Error;

/// Reason an order was rejected by the matching engine before any fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// FOK feasibility pre-check failed: the eligible opposite depth cannot
    /// cover the full quantity.
    FokInsufficientLiquidity,
    /// Market order with no opposite liquidity at all.
    InsufficientLiquidity,
    /// The order type cannot be handled by the engine.
    UnsupportedType(String),
    /// A numeric field violates the symbol's tick/lot/precision rules.
    BadPrecision(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::FokInsufficientLiquidity => {
                write!(f, "FOK order cannot be filled completely")
            }
            RejectReason::InsufficientLiquidity => write!(f, "insufficient liquidity"),
            RejectReason::UnsupportedType(t) => write!(f, "unsupported order type: {t}"),
            RejectReason::BadPrecision(msg) => write!(f, "{msg}"),
        }
    }
}

/// Errors surfaced by the order book and matching engine.
///
/// `ValidationError`-class problems (unknown symbol, missing fields, bad
/// precision) never mutate state; `CrossedBook` signals a broken invariant
/// and is fatal to the process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrderBookError {
    /// No book registered for the symbol.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// A mandatory parameter was not provided.
    #[error("mandatory parameter missing: {0}")]
    MissingParameter(&'static str),

    /// A parameter was provided but does not validate.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Wire name of the offending parameter.
        name: &'static str,
        /// Human-readable validation failure.
        reason: String,
    },

    /// Order id (or client order id) does not resolve to a known order.
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// Cancel refused: terminal state, restriction mismatch or wrong owner.
    #[error("cancel rejected for order {order_id}: {reason}")]
    CancelRejected {
        /// The order the cancel addressed.
        order_id: OrderId,
        /// Why the cancel was refused.
        reason: String,
    },

    /// The engine rejected the order wholesale; no state was changed.
    #[error("order rejected: {0}")]
    OrderRejected(RejectReason),

    /// Post-operation invariant breach: the book is crossed. Not recoverable.
    #[error("crossed book on {symbol} {side}: bid {best_bid} >= ask {best_ask}")]
    CrossedBook {
        /// Symbol whose book crossed.
        symbol: String,
        /// Side of the operation that exposed the breach.
        side: Side,
        /// Best bid observed.
        best_bid: Decimal,
        /// Best ask observed.
        best_ask: Decimal,
    },
}

impl OrderBookError {
    /// True when the error reports an invariant breach that must abort.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrderBookError::CrossedBook { .. })
    }
}
