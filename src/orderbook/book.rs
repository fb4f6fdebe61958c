//! Core order book: price-sorted bid/ask sides with FIFO queues per level,
//! the stop table, and a bounded trade history.
//!
//! The book itself is not synchronized; the matching engine wraps each book
//! in one per-symbol lock (the coarse shard of the concurrency model) and is
//! the only writer. Readers get owned snapshots (`depth`, `recent_trades`).

use super::error::OrderBookError;
use super::level::{PriceLevel, RestingOrder};
use super::order::{Order, OrderId, Side, UserId};
use super::stops::StopTable;
use super::trade::Trade;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::trace;

/// Bounded ring of most recent trades kept per symbol.
const TRADE_HISTORY_CAP: usize = 10_000;

/// Aggregated top-of-book view: `[price, qty]` pairs, bids descending, asks
/// ascending. Iceberg orders contribute their displayed slice only.
#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

/// A single symbol's order book.
pub struct OrderBook {
    symbol: String,
    /// Bid side, keyed by price. Best bid is the highest key.
    bids: BTreeMap<Decimal, PriceLevel>,
    /// Ask side, keyed by price. Best ask is the lowest key.
    asks: BTreeMap<Decimal, PriceLevel>,
    /// order id → (price, side) for O(log n) cancellation.
    order_locations: HashMap<OrderId, (Decimal, Side)>,
    /// Parked stop orders, swept on every last-price change.
    stops: StopTable,
    trades: VecDeque<Trade>,
    last_trade_price: Option<Decimal>,
    /// Bumped on every mutation; stamped into depth snapshots.
    last_update_id: u64,
}

impl OrderBook {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            order_locations: HashMap::new(),
            stops: StopTable::new(),
            trades: VecDeque::new(),
            last_trade_price: None,
            last_update_id: 0,
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Highest bid price, if any.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    /// Lowest ask price, if any.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Best price on the given side.
    #[must_use]
    pub fn best_price(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Buy => self.best_bid(),
            Side::Sell => self.best_ask(),
        }
    }

    #[must_use]
    pub fn last_trade_price(&self) -> Option<Decimal> {
        self.last_trade_price
    }

    /// Update the reference price without a trade (external market tick).
    pub fn set_last_trade_price(&mut self, price: Decimal) {
        self.last_trade_price = Some(price);
        self.last_update_id += 1;
    }

    /// Rest an order on its side of the book at `price`.
    pub fn add_resting(&mut self, price: Decimal, resting: RestingOrder) {
        let side = resting.order.side;
        self.order_locations
            .insert(resting.order.order_id, (price, side));
        self.side_mut(side)
            .entry(price)
            .or_insert_with(PriceLevel::new)
            .push_back(resting);
        self.last_update_id += 1;
        trace!(symbol = %self.symbol, %price, %side, "order rested");
    }

    /// Remove an order from its level (cancel path). Cleans up the level if
    /// it becomes empty.
    pub fn remove_order(&mut self, order_id: OrderId) -> Option<RestingOrder> {
        let (price, side) = self.order_locations.remove(&order_id)?;
        let level = self.side_mut(side).get_mut(&price)?;
        let removed = level.remove(order_id);
        if level.is_empty() {
            self.side_mut(side).remove(&price);
        }
        if removed.is_some() {
            self.last_update_id += 1;
        }
        removed
    }

    /// Whether the order currently rests on the book.
    #[must_use]
    pub fn contains_order(&self, order_id: OrderId) -> bool {
        self.order_locations.contains_key(&order_id)
    }

    /// Head of the best level on `side`, mutable. The head is the next order
    /// to be matched under price-time priority.
    pub fn best_front_mut(&mut self, side: Side) -> Option<(Decimal, &mut RestingOrder)> {
        let price = self.best_price(side)?;
        let level = self.side_mut(side).get_mut(&price)?;
        level.front_mut().map(|r| (price, r))
    }

    /// Pop the exhausted head of the best level on `side`, cleaning up the
    /// level and location index.
    pub fn pop_best_front(&mut self, side: Side) -> Option<RestingOrder> {
        let price = self.best_price(side)?;
        let level = self.side_mut(side).get_mut(&price)?;
        let removed = level.pop_front();
        let level_empty = level.is_empty();
        if let Some(r) = &removed {
            self.order_locations.remove(&r.order.order_id);
        }
        if level_empty {
            self.side_mut(side).remove(&price);
        }
        self.last_update_id += 1;
        removed
    }

    /// Rotate the best level's head to the back of its queue (iceberg
    /// refill gives up time priority).
    pub fn rotate_best_front(&mut self, side: Side) {
        if let Some(price) = self.best_price(side)
            && let Some(level) = self.side_mut(side).get_mut(&price)
        {
            level.rotate_front_to_back();
            self.last_update_id += 1;
        }
    }

    /// Walk levels on `side` in match-priority order (bids descending, asks
    /// ascending).
    pub fn levels(&self, side: Side) -> Box<dyn Iterator<Item = (Decimal, &PriceLevel)> + '_> {
        match side {
            Side::Buy => Box::new(self.bids.iter().rev().map(|(p, l)| (*p, l))),
            Side::Sell => Box::new(self.asks.iter().map(|(p, l)| (*p, l))),
        }
    }

    /// Record an executed trade and advance the reference price.
    pub fn record_trade(&mut self, trade: Trade) {
        self.last_trade_price = Some(trade.price);
        if self.trades.len() >= TRADE_HISTORY_CAP {
            self.trades.pop_front();
        }
        self.trades.push_back(trade);
        self.last_update_id += 1;
    }

    /// Most recent trades, oldest first, bounded by `limit`.
    #[must_use]
    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        let skip = self.trades.len().saturating_sub(limit);
        self.trades.iter().skip(skip).cloned().collect()
    }

    /// Trades where `user` was on either side, oldest first.
    #[must_use]
    pub fn trades_for_user(&self, user: &UserId, limit: usize) -> Vec<Trade> {
        let mut out: Vec<Trade> = self
            .trades
            .iter()
            .filter(|t| &t.buyer_user_id == user || &t.seller_user_id == user)
            .cloned()
            .collect();
        let skip = out.len().saturating_sub(limit);
        out.drain(..skip);
        out
    }

    /// Aggregated depth for the top `limit` levels per side.
    #[must_use]
    pub fn depth(&self, limit: usize) -> DepthSnapshot {
        let collect = |iter: Box<dyn Iterator<Item = (Decimal, &PriceLevel)> + '_>| {
            iter.map(|(price, level)| (price, level.display_quantity()))
                .filter(|(_, qty)| !qty.is_zero())
                .take(limit)
                .collect::<Vec<_>>()
        };
        DepthSnapshot {
            last_update_id: self.last_update_id,
            bids: collect(self.levels(Side::Buy)),
            asks: collect(self.levels(Side::Sell)),
        }
    }

    /// Access to the stop table.
    pub fn stops(&self) -> &StopTable {
        &self.stops
    }

    pub fn stops_mut(&mut self) -> &mut StopTable {
        &mut self.stops
    }

    /// Live orders resting on the book, in no particular order.
    pub fn resting_orders(&self) -> impl Iterator<Item = &Order> {
        self.bids
            .values()
            .chain(self.asks.values())
            .flat_map(|level| level.iter().map(|r| &r.order))
    }

    /// Verify `best_bid < best_ask`. A violation means matching failed to
    /// consume a crossing order and the process state can no longer be
    /// trusted.
    pub fn check_uncrossed(&self, side: Side) -> Result<(), OrderBookError> {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask())
            && bid >= ask
        {
            return Err(OrderBookError::CrossedBook {
                symbol: self.symbol.clone(),
                side,
                best_bid: bid,
                best_ask: ask,
            });
        }
        Ok(())
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Decimal, PriceLevel> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }
}
