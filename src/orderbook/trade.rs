//! Trade records and the listener seams between the matching engine and the
//! exchange facade.
//!
//! The engine never touches balances or the event bus directly: it computes
//! fees through an injected [`FeeCalculator`], then hands each execution to
//! the [`TradeListener`] and every non-fill order transition to the
//! [`OrderUpdateListener`]. The facade installs both at wiring time, so the
//! dependency points one way (facade → engine) with no back-reference.

use super::order::{Order, OrderId, UserId};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

/// An immutable trade, emitted once per match and never modified after.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    #[serde(rename = "tradeId")]
    pub trade_id: u64,
    pub symbol: String,
    pub price: Decimal,
    #[serde(rename = "qty")]
    pub quantity: Decimal,
    #[serde(rename = "buyerOrderId")]
    pub buyer_order_id: OrderId,
    #[serde(rename = "sellerOrderId")]
    pub seller_order_id: OrderId,
    #[serde(rename = "buyerUserId")]
    pub buyer_user_id: UserId,
    #[serde(rename = "sellerUserId")]
    pub seller_user_id: UserId,
    #[serde(rename = "isBuyerMaker")]
    pub buyer_is_maker: bool,
    #[serde(rename = "time")]
    pub timestamp: u64,
    /// Buyer commission, denominated in the base asset (deducted from the
    /// base quantity the buyer receives).
    #[serde(rename = "commissionBuyer")]
    pub commission_buyer: Decimal,
    /// Seller commission, denominated in the quote asset (deducted from the
    /// quote proceeds the seller receives).
    #[serde(rename = "commissionSeller")]
    pub commission_seller: Decimal,
}

impl Trade {
    /// Quote value of this trade (price × quantity).
    #[must_use]
    #[inline]
    pub fn quote_qty(&self) -> Decimal {
        self.price * self.quantity
    }

    /// The maker's order id.
    #[must_use]
    pub fn maker_order_id(&self) -> OrderId {
        if self.buyer_is_maker {
            self.buyer_order_id
        } else {
            self.seller_order_id
        }
    }
}

/// A raw match, before commissions are attached. Input to the fee calculator.
#[derive(Debug, Clone)]
pub struct Fill {
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub buyer_user_id: UserId,
    pub seller_user_id: UserId,
    pub buyer_is_maker: bool,
}

/// Commissions for one fill: buyer side in base asset, seller side in quote.
#[derive(Debug, Clone, Copy, Default)]
pub struct FillCommissions {
    pub buyer: Decimal,
    pub seller: Decimal,
}

/// One execution as seen by the facade: the immutable trade plus post-fill
/// snapshots of both orders involved.
#[derive(Debug, Clone)]
pub struct TradeExecution {
    pub trade: Trade,
    /// The resting side, after this fill was applied.
    pub maker: Order,
    /// The incoming side, after this fill was applied.
    pub taker: Order,
}

/// Pure fee function installed by the facade: rates and rounding only, no
/// account mutation.
pub type FeeCalculator = Arc<dyn Fn(&Fill) -> FillCommissions + Send + Sync>;

/// Invoked synchronously for every execution, in match order, while the
/// symbol lock is held. Must not call back into the engine.
pub type TradeListener = Arc<dyn Fn(&TradeExecution) + Send + Sync>;

/// Invoked for every non-fill order transition: rested, parked stop, stop
/// activation, cancel, expiry.
pub type OrderUpdateListener = Arc<dyn Fn(&Order) + Send + Sync>;
