//! Stop table: resting STOP / STOP_LIMIT / TRAILING_STOP orders not yet
//! active on the book, indexed by trigger price and swept on every change of
//! the last trade price.

use super::order::{Order, OrderId, Side};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

/// A parked stop order with its current trigger and optional trail distance.
#[derive(Debug, Clone)]
pub struct StopEntry {
    pub order: Order,
    /// Distance the trigger keeps from the reference price for trailing
    /// stops. `None` for static stops.
    pub trail_distance: Option<Decimal>,
}

/// Trigger-price index over parked stop orders.
///
/// Buy stops fire when the last trade price rises to or through the trigger;
/// sell stops when it falls to or through. Trailing triggers re-peg toward a
/// favorably moving reference, keeping their distance.
#[derive(Debug, Default)]
pub struct StopTable {
    buy_stops: BTreeMap<(Decimal, OrderId), StopEntry>,
    sell_stops: BTreeMap<(Decimal, OrderId), StopEntry>,
    /// order id → (side, current trigger) for O(log n) removal.
    index: HashMap<OrderId, (Side, Decimal)>,
}

impl StopTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a stop order under `trigger`.
    pub fn park(&mut self, trigger: Decimal, entry: StopEntry) {
        let id = entry.order.order_id;
        let side = entry.order.side;
        self.index.insert(id, (side, trigger));
        self.side_map_mut(side).insert((trigger, id), entry);
    }

    /// Remove a parked stop by order id (cancel path).
    pub fn remove(&mut self, order_id: OrderId) -> Option<StopEntry> {
        let (side, trigger) = self.index.remove(&order_id)?;
        self.side_map_mut(side).remove(&(trigger, order_id))
    }

    /// Whether the order is currently parked.
    #[must_use]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.index.contains_key(&order_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Pop every stop whose trigger has been crossed by `last_price`, in
    /// (trigger, order id) order. Buy stops fire on `last ≥ trigger`, sell
    /// stops on `last ≤ trigger`.
    pub fn take_triggered(&mut self, last_price: Decimal) -> Vec<StopEntry> {
        let mut fired = Vec::new();

        let buy_keys: Vec<(Decimal, OrderId)> = self
            .buy_stops
            .range(..=(last_price, OrderId::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in buy_keys {
            if let Some(entry) = self.buy_stops.remove(&key) {
                self.index.remove(&entry.order.order_id);
                fired.push(entry);
            }
        }

        let sell_keys: Vec<(Decimal, OrderId)> = self
            .sell_stops
            .range((last_price, 0)..)
            .map(|(k, _)| *k)
            .collect();
        for key in sell_keys {
            if let Some(entry) = self.sell_stops.remove(&key) {
                self.index.remove(&entry.order.order_id);
                fired.push(entry);
            }
        }

        fired
    }

    /// Re-peg trailing triggers against a new reference price. A buy trigger
    /// trails the market down; a sell trigger trails it up. Non-trailing
    /// entries are untouched.
    pub fn retrail(&mut self, last_price: Decimal) {
        let buy_moves: Vec<((Decimal, OrderId), Decimal)> = self
            .buy_stops
            .iter()
            .filter_map(|(key, entry)| {
                let trail = entry.trail_distance?;
                let candidate = last_price + trail;
                (candidate < key.0).then_some((*key, candidate))
            })
            .collect();
        for (key, new_trigger) in buy_moves {
            if let Some(mut entry) = self.buy_stops.remove(&key) {
                entry.order.stop_price = Some(new_trigger);
                self.index.insert(entry.order.order_id, (Side::Buy, new_trigger));
                self.buy_stops.insert((new_trigger, key.1), entry);
            }
        }

        let sell_moves: Vec<((Decimal, OrderId), Decimal)> = self
            .sell_stops
            .iter()
            .filter_map(|(key, entry)| {
                let trail = entry.trail_distance?;
                let candidate = (last_price - trail).max(Decimal::ZERO);
                (candidate > key.0).then_some((*key, candidate))
            })
            .collect();
        for (key, new_trigger) in sell_moves {
            if let Some(mut entry) = self.sell_stops.remove(&key) {
                entry.order.stop_price = Some(new_trigger);
                self.index
                    .insert(entry.order.order_id, (Side::Sell, new_trigger));
                self.sell_stops.insert((new_trigger, key.1), entry);
            }
        }
    }

    /// Walk every parked entry, buy stops first.
    pub fn entries(&self) -> impl Iterator<Item = &StopEntry> {
        self.buy_stops.values().chain(self.sell_stops.values())
    }

    fn side_map_mut(&mut self, side: Side) -> &mut BTreeMap<(Decimal, OrderId), StopEntry> {
        match side {
            Side::Buy => &mut self.buy_stops,
            Side::Sell => &mut self.sell_stops,
        }
    }
}
