//! A single price level: a FIFO queue of resting orders.

use super::order::{Order, OrderId};
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// An order resting on the book, together with its displayed quantity.
///
/// For plain orders `display` tracks the remaining quantity. Iceberg orders
/// display at most `iceberg_qty`; when a slice is consumed the order refills
/// and rotates to the back of its level queue, giving up time priority for
/// the hidden part.
#[derive(Debug, Clone)]
pub struct RestingOrder {
    pub order: Order,
    pub display: Decimal,
}

impl RestingOrder {
    /// Wrap an order for resting, computing the initial display slice.
    #[must_use]
    pub fn new(order: Order) -> Self {
        let display = match order.iceberg_qty {
            Some(slice) if slice > Decimal::ZERO => slice.min(order.remaining_quantity()),
            _ => order.remaining_quantity(),
        };
        Self { order, display }
    }

    /// Reduce the displayed slice after a fill of `qty`. Returns `true` when
    /// the slice is exhausted but hidden quantity remains (iceberg refill
    /// condition).
    pub fn consume_display(&mut self, qty: Decimal) -> bool {
        self.display = (self.display - qty).max(Decimal::ZERO);
        self.display.is_zero() && self.order.remaining_quantity() > Decimal::ZERO
    }

    /// Refill the display slice from hidden quantity.
    pub fn refresh_display(&mut self) {
        let remaining = self.order.remaining_quantity();
        self.display = match self.order.iceberg_qty {
            Some(slice) if slice > Decimal::ZERO => slice.min(remaining),
            _ => remaining,
        };
    }
}

/// FIFO queue of live orders at one price. Dequeue order is arrival order
/// (price-time priority within the level).
#[derive(Debug, Default)]
pub struct PriceLevel {
    orders: VecDeque<RestingOrder>,
}

impl PriceLevel {
    pub fn new() -> Self {
        Self {
            orders: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, resting: RestingOrder) {
        self.orders.push_back(resting);
    }

    /// Rotate the head to the back of the queue (iceberg refill).
    pub fn rotate_front_to_back(&mut self) {
        if let Some(front) = self.orders.pop_front() {
            self.orders.push_back(front);
        }
    }

    pub fn front(&self) -> Option<&RestingOrder> {
        self.orders.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut RestingOrder> {
        self.orders.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<RestingOrder> {
        self.orders.pop_front()
    }

    /// Remove a specific order from the queue, preserving the order of the
    /// rest. O(queue length).
    pub fn remove(&mut self, order_id: OrderId) -> Option<RestingOrder> {
        let pos = self
            .orders
            .iter()
            .position(|r| r.order.order_id == order_id)?;
        self.orders.remove(pos)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Sum of remaining quantities (includes hidden iceberg reserve).
    #[must_use]
    pub fn total_quantity(&self) -> Decimal {
        self.orders
            .iter()
            .map(|r| r.order.remaining_quantity())
            .sum()
    }

    /// Sum of displayed quantities (what depth snapshots show).
    #[must_use]
    pub fn display_quantity(&self) -> Decimal {
        self.orders.iter().map(|r| r.display).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RestingOrder> {
        self.orders.iter()
    }
}
