//! The matching engine: order admission, price-time priority matching, stop
//! activation and cancellation across all registered symbols.
//!
//! One engine instance owns every order book. Each book sits behind its own
//! lock, so matching is serialized per symbol and parallel across symbols.
//! All money movement happens outside the engine through the listener seams
//! in [`crate::orderbook::trade`]; the engine only moves orders and emits.

use super::book::{DepthSnapshot, OrderBook};
use super::error::{OrderBookError, RejectReason};
use super::level::RestingOrder;
use super::order::{
    CancelRestrictions, NewOrder, Order, OrderId, OrderStatus, OrderType, SelfTradePrevention,
    Side, TimeInForce, UserId,
};
use super::stops::StopEntry;
use super::stp::{StpAction, check_self_trade};
use super::trade::{
    FeeCalculator, Fill, FillCommissions, OrderUpdateListener, Trade, TradeExecution,
    TradeListener,
};
use crate::config::SymbolConfig;
use crate::time::TimeManager;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};

/// Funds check invoked when a parked stop activates: the facade locks the
/// required amount and answers whether the activation may proceed. Stops
/// lock nothing while parked; the budget is taken at trigger time against
/// the then-current book.
pub type ActivationHook = Arc<dyn Fn(&Order, Decimal) -> bool + Send + Sync>;

/// Result of a successful order admission: the final order state plus the
/// trades this order generated as taker.
#[derive(Debug, Clone)]
pub struct OrderReport {
    pub order: Order,
    pub trades: Vec<Trade>,
}

/// How a cancel request addresses the order.
#[derive(Debug, Clone)]
pub enum CancelTarget {
    ById(OrderId),
    ByClientId(String),
}

/// Price-time priority matching engine over per-symbol locked books.
pub struct MatchingEngine {
    books: DashMap<String, Arc<Mutex<OrderBook>>>,
    symbols: DashMap<String, SymbolConfig>,
    /// Every order seen this run, live and terminal, by server id.
    orders: DashMap<OrderId, Order>,
    /// (user, client order id) → server id.
    client_index: DashMap<(UserId, String), OrderId>,
    time: Arc<TimeManager>,
    next_order_id: AtomicU64,
    next_trade_id: AtomicU64,
    fee_calculator: RwLock<Option<FeeCalculator>>,
    trade_listener: RwLock<Option<TradeListener>>,
    order_listener: RwLock<Option<OrderUpdateListener>>,
    activation_hook: RwLock<Option<ActivationHook>>,
}

impl MatchingEngine {
    pub fn new(time: Arc<TimeManager>) -> Self {
        Self {
            books: DashMap::new(),
            symbols: DashMap::new(),
            orders: DashMap::new(),
            client_index: DashMap::new(),
            time,
            next_order_id: AtomicU64::new(1),
            next_trade_id: AtomicU64::new(1),
            fee_calculator: RwLock::new(None),
            trade_listener: RwLock::new(None),
            order_listener: RwLock::new(None),
            activation_hook: RwLock::new(None),
        }
    }

    /// Register a symbol and create its (empty) book.
    pub fn register_symbol(&self, cfg: SymbolConfig) {
        let symbol = cfg.symbol.clone();
        self.books
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(&symbol))));
        self.symbols.insert(symbol, cfg);
    }

    #[must_use]
    pub fn symbol_config(&self, symbol: &str) -> Option<SymbolConfig> {
        self.symbols.get(symbol).map(|c| c.clone())
    }

    #[must_use]
    pub fn symbols(&self) -> Vec<SymbolConfig> {
        self.symbols.iter().map(|e| e.value().clone()).collect()
    }

    pub fn set_fee_calculator(&self, calc: FeeCalculator) {
        *self.fee_calculator.write() = Some(calc);
    }

    pub fn set_trade_listener(&self, listener: TradeListener) {
        *self.trade_listener.write() = Some(listener);
    }

    pub fn set_order_listener(&self, listener: OrderUpdateListener) {
        *self.order_listener.write() = Some(listener);
    }

    pub fn set_activation_hook(&self, hook: ActivationHook) {
        *self.activation_hook.write() = Some(hook);
    }

    /// Allocate the server id for an order about to be placed. The facade
    /// takes it before admission so fund locks can be keyed by order id.
    pub fn allocate_order_id(&self) -> OrderId {
        self.next_order_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Validate admission parameters and return the order as it would be
    /// admitted, without touching the book or any balance (dry run).
    pub fn test_order(&self, new: &NewOrder) -> Result<Order, OrderBookError> {
        self.build_order(new, 0)
    }

    /// Admit an order under `order_id`: validate, park stops, match the
    /// rest, apply time-in-force to the remainder, then sweep the stop
    /// table. Returns the taker's final state and its trades.
    pub fn place_order(
        &self,
        new: &NewOrder,
        order_id: OrderId,
    ) -> Result<OrderReport, OrderBookError> {
        let order = self.build_order(new, order_id)?;
        let cfg = self
            .symbol_config(&order.symbol)
            .ok_or_else(|| OrderBookError::UnknownSymbol(order.symbol.clone()))?;
        let book_handle = self.book_handle(&order.symbol)?;
        let mut book = book_handle.lock();

        if let Some(cid) = &order.client_order_id {
            self.client_index
                .insert((order.user_id.clone(), cid.clone()), order.order_id);
        }

        let user_id = order.user_id.clone();
        let client_id = order.client_order_id.clone();
        let result = if order.order_type.is_stop() {
            self.park_stop(&mut book, order)
        } else {
            self.match_order(&mut book, order, &cfg)
        };
        if result.is_ok() {
            self.sweep_stops(&mut book, &cfg);
        }
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                if let Some(cid) = client_id {
                    self.client_index.remove(&(user_id, cid));
                }
                return Err(e);
            }
        };

        if let Err(e) = book.check_uncrossed(report.order.side) {
            error!(symbol = %report.order.symbol, "fatal: {e}");
            panic!("{e}");
        }
        Ok(report)
    }

    /// Cancel an order: authenticate the owner, honor restrictions, remove
    /// it from the book or stop table and report the canceled state.
    pub fn cancel_order(
        &self,
        symbol: &str,
        target: CancelTarget,
        user: &UserId,
        restrictions: CancelRestrictions,
    ) -> Result<Order, OrderBookError> {
        let order_id = self.resolve_target(user, &target)?;
        let book_handle = self.book_handle(symbol)?;
        let mut book = book_handle.lock();

        let mut order = self
            .orders
            .get(&order_id)
            .map(|o| o.clone())
            .ok_or_else(|| OrderBookError::OrderNotFound(order_id.to_string()))?;
        if &order.user_id != user || order.symbol != symbol {
            return Err(OrderBookError::OrderNotFound(order_id.to_string()));
        }
        if !order.status.is_open() {
            return Err(OrderBookError::CancelRejected {
                order_id,
                reason: format!("order is {:?}", order.status),
            });
        }
        if !restrictions.allows(order.status) {
            return Err(OrderBookError::CancelRejected {
                order_id,
                reason: "cancelRestrictions not satisfied".to_string(),
            });
        }

        let removed_resting = book.remove_order(order_id);
        let removed_stop = if removed_resting.is_none() {
            book.stops_mut().remove(order_id)
        } else {
            None
        };
        if removed_resting.is_none() && removed_stop.is_none() {
            return Err(OrderBookError::OrderNotFound(order_id.to_string()));
        }

        order.set_status(OrderStatus::Canceled, self.time.now_ms());
        self.orders.insert(order_id, order.clone());
        self.notify_order(&order);
        debug!(symbol, order_id, "order canceled");
        Ok(order)
    }

    /// Cancel every open order `user` has on `symbol` (resting and parked).
    pub fn cancel_all(&self, symbol: &str, user: &UserId) -> Result<Vec<Order>, OrderBookError> {
        let book_handle = self.book_handle(symbol)?;
        let ids: Vec<OrderId> = {
            let book = book_handle.lock();
            book.resting_orders()
                .filter(|o| &o.user_id == user)
                .map(|o| o.order_id)
                .chain(
                    book.stops()
                        .entries()
                        .filter(|e| &e.order.user_id == user)
                        .map(|e| e.order.order_id),
                )
                .collect()
        };
        let mut canceled = Vec::with_capacity(ids.len());
        for id in ids {
            match self.cancel_order(symbol, CancelTarget::ById(id), user, CancelRestrictions::empty())
            {
                Ok(order) => canceled.push(order),
                // Raced with a concurrent fill between the scan and the
                // cancel; skip it.
                Err(OrderBookError::CancelRejected { .. }) | Err(OrderBookError::OrderNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(canceled)
    }

    /// Ingest an external market-data tick: update the reference price and
    /// sweep the stop table. The book itself is untouched.
    pub fn process_market_tick(&self, symbol: &str, price: Decimal) -> Result<(), OrderBookError> {
        if price <= Decimal::ZERO {
            return Err(OrderBookError::InvalidParameter {
                name: "price",
                reason: "must be positive".to_string(),
            });
        }
        let cfg = self
            .symbol_config(symbol)
            .ok_or_else(|| OrderBookError::UnknownSymbol(symbol.to_string()))?;
        let book_handle = self.book_handle(symbol)?;
        let mut book = book_handle.lock();
        book.set_last_trade_price(price);
        self.sweep_stops(&mut book, &cfg);
        Ok(())
    }

    /// Aggregated depth snapshot.
    pub fn depth(&self, symbol: &str, limit: usize) -> Result<DepthSnapshot, OrderBookError> {
        Ok(self.book_handle(symbol)?.lock().depth(limit))
    }

    /// Most recent trades on `symbol`.
    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, OrderBookError> {
        Ok(self.book_handle(symbol)?.lock().recent_trades(limit))
    }

    /// Trades on `symbol` where `user` was on either side.
    pub fn trades_for_user(
        &self,
        symbol: &str,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<Trade>, OrderBookError> {
        Ok(self.book_handle(symbol)?.lock().trades_for_user(user, limit))
    }

    /// Last trade (or tick) price.
    pub fn last_price(&self, symbol: &str) -> Result<Option<Decimal>, OrderBookError> {
        Ok(self.book_handle(symbol)?.lock().last_trade_price())
    }

    /// Best bid and ask.
    pub fn best_bid_ask(
        &self,
        symbol: &str,
    ) -> Result<(Option<Decimal>, Option<Decimal>), OrderBookError> {
        let handle = self.book_handle(symbol)?;
        let book = handle.lock();
        Ok((book.best_bid(), book.best_ask()))
    }

    /// Quote cost of taking up to `qty` from the opposite side at market:
    /// `(fillable_qty, quote_cost)` walking the book in priority order.
    pub fn market_cost(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<(Decimal, Decimal), OrderBookError> {
        let handle = self.book_handle(symbol)?;
        let book = handle.lock();
        Ok(walk_cost(&book, side, qty))
    }

    /// Order body by server id.
    #[must_use]
    pub fn get_order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.get(&order_id).map(|o| o.clone())
    }

    /// Order body by (user, client order id).
    #[must_use]
    pub fn get_order_by_client_id(&self, user: &UserId, client_id: &str) -> Option<Order> {
        let id = self
            .client_index
            .get(&(user.clone(), client_id.to_string()))
            .map(|e| *e.value())?;
        self.get_order(id)
    }

    // ---- internals ------------------------------------------------------

    fn book_handle(&self, symbol: &str) -> Result<Arc<Mutex<OrderBook>>, OrderBookError> {
        self.books
            .get(symbol)
            .map(|b| b.clone())
            .ok_or_else(|| OrderBookError::UnknownSymbol(symbol.to_string()))
    }

    fn resolve_target(
        &self,
        user: &UserId,
        target: &CancelTarget,
    ) -> Result<OrderId, OrderBookError> {
        match target {
            CancelTarget::ById(id) => Ok(*id),
            CancelTarget::ByClientId(cid) => self
                .client_index
                .get(&(user.clone(), cid.clone()))
                .map(|e| *e.value())
                .ok_or_else(|| OrderBookError::OrderNotFound(cid.clone())),
        }
    }

    /// Normalize and validate admission parameters into an order record.
    /// Pure: no engine state is touched beyond duplicate-id detection.
    fn build_order(&self, new: &NewOrder, order_id: OrderId) -> Result<Order, OrderBookError> {
        if new.symbol.is_empty() {
            return Err(OrderBookError::MissingParameter("symbol"));
        }
        let cfg = self
            .symbol_config(&new.symbol)
            .ok_or_else(|| OrderBookError::UnknownSymbol(new.symbol.clone()))?;
        let side = new.side.ok_or(OrderBookError::MissingParameter("side"))?;
        let order_type = new.order_type.ok_or(OrderBookError::MissingParameter("type"))?;
        let user_id = new
            .user_id
            .clone()
            .ok_or(OrderBookError::MissingParameter("userId"))?;

        if let Some(cid) = &new.client_order_id
            && let Some(existing) = self.client_index.get(&(user_id.clone(), cid.clone()))
            && self
                .orders
                .get(existing.value())
                .is_some_and(|o| o.status.is_open())
        {
            return Err(OrderBookError::InvalidParameter {
                name: "newClientOrderId",
                reason: "duplicate client order id".to_string(),
            });
        }

        let quote_mode =
            order_type == OrderType::Market && side == Side::Buy && new.quantity.is_none();

        let quantity = match new.quantity {
            Some(qty) => {
                validate_quantity(qty, &cfg)?;
                qty
            }
            None if quote_mode => Decimal::ZERO,
            None => return Err(OrderBookError::MissingParameter("quantity")),
        };

        let quote_order_qty = match new.quote_order_qty {
            Some(_) if order_type != OrderType::Market => {
                return Err(OrderBookError::InvalidParameter {
                    name: "quoteOrderQty",
                    reason: "only valid for MARKET orders".to_string(),
                });
            }
            Some(q) => {
                if q <= Decimal::ZERO {
                    return Err(OrderBookError::InvalidParameter {
                        name: "quoteOrderQty",
                        reason: "must be positive".to_string(),
                    });
                }
                if !quote_mode {
                    return Err(OrderBookError::InvalidParameter {
                        name: "quoteOrderQty",
                        reason: "cannot be combined with quantity".to_string(),
                    });
                }
                Some(q)
            }
            None if quote_mode => return Err(OrderBookError::MissingParameter("quantity")),
            None => None,
        };

        let price = match new.price {
            Some(p) => {
                validate_price(p, &cfg)?;
                Some(p)
            }
            None if order_type.requires_price() => {
                return Err(OrderBookError::MissingParameter("price"));
            }
            None => None,
        };

        let stop_price = match new.stop_price {
            Some(p) => {
                validate_price(p, &cfg)?;
                Some(p)
            }
            None if order_type.requires_stop_price() => {
                return Err(OrderBookError::MissingParameter("stopPrice"));
            }
            None => None,
        };

        let iceberg_qty = match new.iceberg_qty {
            Some(q) => {
                if q <= Decimal::ZERO || q > quantity {
                    return Err(OrderBookError::InvalidParameter {
                        name: "icebergQty",
                        reason: "must be positive and at most the order quantity".to_string(),
                    });
                }
                Some(q)
            }
            None if order_type == OrderType::Iceberg => {
                return Err(OrderBookError::MissingParameter("icebergQty"));
            }
            None => None,
        };

        let now = self.time.now_ms();
        Ok(Order {
            order_id,
            client_order_id: new.client_order_id.clone(),
            user_id,
            symbol: cfg.symbol.clone(),
            side,
            order_type,
            price,
            stop_price,
            quantity,
            quote_order_qty,
            iceberg_qty,
            filled_quantity: Decimal::ZERO,
            cumulative_quote_qty: Decimal::ZERO,
            time_in_force: new.time_in_force.unwrap_or_default(),
            self_trade_prevention: new.self_trade_prevention.unwrap_or_default(),
            create_time: now,
            update_time: now,
            status: OrderStatus::New,
        })
    }

    /// Park a stop-family order, or activate it immediately when its trigger
    /// is already crossed by the current reference price.
    fn park_stop(
        &self,
        book: &mut OrderBook,
        order: Order,
    ) -> Result<OrderReport, OrderBookError> {
        let trigger = order
            .stop_price
            .ok_or(OrderBookError::MissingParameter("stopPrice"))?;
        let last = book.last_trade_price();

        let already_triggered = match (last, order.side) {
            (Some(last), Side::Buy) => last >= trigger,
            (Some(last), Side::Sell) => last <= trigger,
            (None, _) => false,
        };
        if already_triggered {
            let cfg = self
                .symbol_config(&order.symbol)
                .ok_or_else(|| OrderBookError::UnknownSymbol(order.symbol.clone()))?;
            trace!(order_id = order.order_id, %trigger, "stop trigger already crossed, activating");
            return self.activate_stop(book, order, &cfg);
        }

        let trail_distance = if order.order_type == OrderType::TrailingStop {
            last.map(|l| (trigger - l).abs())
        } else {
            None
        };
        self.orders.insert(order.order_id, order.clone());
        self.notify_order(&order);
        book.stops_mut().park(
            trigger,
            StopEntry {
                order: order.clone(),
                trail_distance,
            },
        );
        debug!(order_id = order.order_id, %trigger, "stop order parked");
        Ok(OrderReport {
            order,
            trades: Vec::new(),
        })
    }

    /// Activate a triggered stop: check funds through the activation hook,
    /// upgrade the type and run it through the match loop.
    fn activate_stop(
        &self,
        book: &mut OrderBook,
        mut order: Order,
        cfg: &SymbolConfig,
    ) -> Result<OrderReport, OrderBookError> {
        order.order_type = match order.order_type {
            OrderType::StopLimit => OrderType::Limit,
            // STOP and TRAILING_STOP upgrade to MARKET on trigger.
            _ => OrderType::Market,
        };

        let required = match (order.side, order.order_type) {
            (Side::Sell, _) => order.remaining_quantity(),
            (Side::Buy, OrderType::Limit) => {
                order.remaining_quantity() * order.price.unwrap_or_default()
            }
            (Side::Buy, _) => {
                let (_, cost) = walk_cost(book, Side::Buy, order.remaining_quantity());
                cost
            }
        };
        let hook = self.activation_hook.read().clone();
        let funded = hook.map(|h| h(&order, required)).unwrap_or(true);
        if !funded {
            order.set_status(OrderStatus::Expired, self.time.now_ms());
            self.orders.insert(order.order_id, order.clone());
            self.notify_order(&order);
            debug!(order_id = order.order_id, "stop activation unfunded, expired");
            return Ok(OrderReport {
                order,
                trades: Vec::new(),
            });
        }

        self.notify_order(&order);
        match self.match_order(book, order.clone(), cfg) {
            Ok(report) => Ok(report),
            // An activated order that cannot match (e.g. a FOK stop-limit
            // against thin depth) expires instead of propagating a reject.
            Err(OrderBookError::OrderRejected(reason)) => {
                debug!(order_id = order.order_id, %reason, "activated stop expired");
                order.set_status(OrderStatus::Expired, self.time.now_ms());
                self.orders.insert(order.order_id, order.clone());
                self.notify_order(&order);
                Ok(OrderReport {
                    order,
                    trades: Vec::new(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// The match loop (spec-ordered): walk the opposite side while the
    /// incoming order is eligible against the top level, applying STP,
    /// emitting one trade per match, then settle the remainder by
    /// time-in-force.
    fn match_order(
        &self,
        book: &mut OrderBook,
        mut taker: Order,
        cfg: &SymbolConfig,
    ) -> Result<OrderReport, OrderBookError> {
        let opposite = taker.side.opposite();
        let limit = effective_limit(&taker);
        let quote_mode = taker.order_type == OrderType::Market
            && taker.side == Side::Buy
            && taker.quantity.is_zero();
        let mut quote_budget = taker.quote_order_qty.filter(|_| quote_mode);

        if taker.time_in_force == TimeInForce::Fok
            && taker.order_type != OrderType::Market
            && let Some(limit_price) = limit
            && !fok_feasible(book, &taker, limit_price)
        {
            return Err(OrderBookError::OrderRejected(
                RejectReason::FokInsufficientLiquidity,
            ));
        }

        self.orders.insert(taker.order_id, taker.clone());
        let mut trades = Vec::new();
        let mut taker_expired_by_stp = false;

        loop {
            let done = if quote_mode {
                quote_budget.is_none_or(|b| b <= Decimal::ZERO)
            } else {
                taker.remaining_quantity() <= Decimal::ZERO
            };
            if done {
                break;
            }

            // Top of the opposite side, if still eligible for the taker.
            let Some((top_price, maker_user, maker_remaining)) = ({
                let head = book.best_front_mut(opposite);
                head.map(|(p, r)| (p, r.order.user_id.clone(), r.order.remaining_quantity()))
            }) else {
                break;
            };
            let eligible = match limit {
                Some(l) => match taker.side {
                    Side::Buy => top_price <= l,
                    Side::Sell => top_price >= l,
                },
                None => true,
            };
            if !eligible {
                break;
            }

            match check_self_trade(&taker.user_id, &maker_user, taker.self_trade_prevention) {
                StpAction::Match => {}
                StpAction::ExpireTaker => {
                    taker_expired_by_stp = true;
                    break;
                }
                StpAction::ExpireMaker => {
                    self.expire_best_maker(book, opposite);
                    continue;
                }
                StpAction::ExpireBoth => {
                    self.expire_best_maker(book, opposite);
                    taker_expired_by_stp = true;
                    break;
                }
            }

            let quantity = match quote_budget {
                Some(budget) => {
                    let affordable = (budget / top_price)
                        .round_dp_with_strategy(cfg.base_precision, RoundingStrategy::ToZero);
                    affordable.min(maker_remaining)
                }
                None => taker.remaining_quantity().min(maker_remaining),
            };
            if quantity <= Decimal::ZERO {
                break;
            }

            let now = self.time.now_ms();
            // Apply the fill to the resting head.
            let (maker_snapshot, refill) = {
                let Some((_, head)) = book.best_front_mut(opposite) else {
                    break;
                };
                head.order.apply_fill(quantity, top_price, now);
                let refill = head.consume_display(quantity);
                (head.order.clone(), refill)
            };
            // Apply it to the taker. Quote-budget buys have no target base
            // quantity, so the counters move directly.
            if quote_mode {
                taker.filled_quantity += quantity;
                taker.cumulative_quote_qty += quantity * top_price;
                taker.status = OrderStatus::PartiallyFilled;
                taker.update_time = now;
            } else {
                taker.apply_fill(quantity, top_price, now);
            }

            let (buyer, seller) = match taker.side {
                Side::Buy => (&taker, &maker_snapshot),
                Side::Sell => (&maker_snapshot, &taker),
            };
            let fill = Fill {
                symbol: taker.symbol.clone(),
                price: top_price,
                quantity,
                buyer_user_id: buyer.user_id.clone(),
                seller_user_id: seller.user_id.clone(),
                buyer_is_maker: taker.side == Side::Sell,
            };
            let commissions = self
                .fee_calculator
                .read()
                .clone()
                .map(|calc| calc(&fill))
                .unwrap_or_else(FillCommissions::default);
            let trade = Trade {
                trade_id: self.next_trade_id.fetch_add(1, Ordering::Relaxed),
                symbol: taker.symbol.clone(),
                price: top_price,
                quantity,
                buyer_order_id: buyer.order_id,
                seller_order_id: seller.order_id,
                buyer_user_id: buyer.user_id.clone(),
                seller_user_id: seller.user_id.clone(),
                buyer_is_maker: taker.side == Side::Sell,
                timestamp: now,
                commission_buyer: commissions.buyer,
                commission_seller: commissions.seller,
            };
            trace!(
                symbol = %trade.symbol,
                trade_id = trade.trade_id,
                price = %trade.price,
                qty = %trade.quantity,
                "trade"
            );

            book.record_trade(trade.clone());
            self.orders.insert(maker_snapshot.order_id, maker_snapshot.clone());
            self.orders.insert(taker.order_id, taker.clone());

            if maker_snapshot.status == OrderStatus::Filled {
                book.pop_best_front(opposite);
            } else if refill {
                if let Some((_, head)) = book.best_front_mut(opposite) {
                    head.refresh_display();
                }
                book.rotate_best_front(opposite);
            }

            if let Some(budget) = &mut quote_budget {
                *budget -= quantity * top_price;
            }

            let execution = TradeExecution {
                trade: trade.clone(),
                maker: maker_snapshot,
                taker: taker.clone(),
            };
            self.notify_trade(&execution);
            trades.push(trade);
        }

        self.finish_taker(book, &mut taker, quote_mode, taker_expired_by_stp);
        Ok(OrderReport {
            order: taker,
            trades,
        })
    }

    /// Post-loop remainder handling: rest, expire or finish the taker.
    fn finish_taker(
        &self,
        book: &mut OrderBook,
        taker: &mut Order,
        quote_mode: bool,
        expired_by_stp: bool,
    ) {
        let now = self.time.now_ms();

        if expired_by_stp {
            taker.set_status(OrderStatus::Expired, now);
        } else if quote_mode {
            // A quote-budget buy is complete once the budget is spent; it
            // never rests.
            let status = if taker.filled_quantity > Decimal::ZERO {
                OrderStatus::Filled
            } else {
                OrderStatus::Expired
            };
            taker.set_status(status, now);
        } else if taker.status != OrderStatus::Filled {
            if executes_as_market(taker) {
                taker.set_status(OrderStatus::Expired, now);
            } else {
                match taker.time_in_force {
                    TimeInForce::Gtc => {
                        if let Some(price) = taker.price {
                            book.add_resting(price, RestingOrder::new(taker.clone()));
                        }
                    }
                    TimeInForce::Ioc => taker.set_status(OrderStatus::Expired, now),
                    // The feasibility pre-check guarantees FOK orders fill
                    // completely once matching starts.
                    TimeInForce::Fok => {
                        debug_assert!(false, "FOK remainder after feasibility check");
                        taker.set_status(OrderStatus::Expired, now);
                    }
                }
            }
        }

        self.orders.insert(taker.order_id, taker.clone());
        // Filled takers were already reported through the trade stream,
        // except quote-budget buys: they reach FILLED only here, after the
        // last fill, so their final state (and any unspent budget) must
        // still be announced.
        if taker.status != OrderStatus::Filled || quote_mode {
            self.notify_order(taker);
        }
    }

    /// Expire the resting head on `side` (STP maker expiry).
    fn expire_best_maker(&self, book: &mut OrderBook, side: Side) {
        if let Some(mut removed) = book.pop_best_front(side) {
            removed
                .order
                .set_status(OrderStatus::Expired, self.time.now_ms());
            self.orders.insert(removed.order.order_id, removed.order.clone());
            self.notify_order(&removed.order);
            debug!(order_id = removed.order.order_id, "maker expired by STP");
        }
    }

    /// Activate every stop whose trigger has been crossed, looping until the
    /// table is quiescent (activations can move the last price and trigger
    /// further stops).
    fn sweep_stops(&self, book: &mut OrderBook, cfg: &SymbolConfig) {
        loop {
            let Some(last) = book.last_trade_price() else {
                return;
            };
            book.stops_mut().retrail(last);
            let fired = book.stops_mut().take_triggered(last);
            if fired.is_empty() {
                return;
            }
            for entry in fired {
                match self.activate_stop(book, entry.order, cfg) {
                    Ok(report) => {
                        trace!(
                            order_id = report.order.order_id,
                            fills = report.trades.len(),
                            "stop activated"
                        );
                    }
                    Err(e) => {
                        // Activation failures expire the stop rather than
                        // poisoning the sweep.
                        error!("stop activation failed: {e}");
                    }
                }
            }
        }
    }

    fn notify_order(&self, order: &Order) {
        let listener = self.order_listener.read().clone();
        if let Some(l) = listener {
            l(order);
        }
    }

    fn notify_trade(&self, execution: &TradeExecution) {
        let listener = self.trade_listener.read().clone();
        if let Some(l) = listener {
            l(execution);
        }
    }
}

/// Validate a quantity against the symbol's precision, lot and minimum
/// filters.
fn validate_quantity(qty: Decimal, cfg: &SymbolConfig) -> Result<(), OrderBookError> {
    if qty <= Decimal::ZERO {
        return Err(OrderBookError::InvalidParameter {
            name: "quantity",
            reason: "must be positive".to_string(),
        });
    }
    if qty.normalize().scale() > cfg.base_precision {
        return Err(OrderBookError::OrderRejected(RejectReason::BadPrecision(
            format!("quantity precision exceeds {}", cfg.base_precision),
        )));
    }
    if let Some(lot) = cfg.lot_size
        && !(qty % lot).is_zero()
    {
        return Err(OrderBookError::OrderRejected(RejectReason::BadPrecision(
            format!("quantity is not a multiple of lot size {lot}"),
        )));
    }
    if let Some(min) = cfg.min_qty
        && qty < min
    {
        return Err(OrderBookError::InvalidParameter {
            name: "quantity",
            reason: format!("below minimum {min}"),
        });
    }
    Ok(())
}

/// Validate a price against the symbol's precision and tick filters.
fn validate_price(price: Decimal, cfg: &SymbolConfig) -> Result<(), OrderBookError> {
    if price <= Decimal::ZERO {
        return Err(OrderBookError::InvalidParameter {
            name: "price",
            reason: "must be positive".to_string(),
        });
    }
    if price.normalize().scale() > cfg.quote_precision {
        return Err(OrderBookError::OrderRejected(RejectReason::BadPrecision(
            format!("price precision exceeds {}", cfg.quote_precision),
        )));
    }
    if let Some(tick) = cfg.tick_size
        && !(price % tick).is_zero()
    {
        return Err(OrderBookError::OrderRejected(RejectReason::BadPrecision(
            format!("price is not a multiple of tick size {tick}"),
        )));
    }
    Ok(())
}

/// The price bound the taker matches against, if any.
fn effective_limit(order: &Order) -> Option<Decimal> {
    match order.order_type {
        OrderType::Market => None,
        _ => order.price,
    }
}

/// Whether the remainder behaves like a market order (expires instead of
/// resting). Covers MARKET proper plus unpriced TWAP/VWAP, which execute as
/// market sweeps here since slicing schedules live above the core.
fn executes_as_market(order: &Order) -> bool {
    match order.order_type {
        OrderType::Market => true,
        OrderType::Twap | OrderType::Vwap => order.price.is_none(),
        _ => false,
    }
}

/// Walk the side opposite to `side` and price the cost of taking `qty`:
/// returns `(fillable_qty, quote_cost)`.
fn walk_cost(book: &OrderBook, side: Side, qty: Decimal) -> (Decimal, Decimal) {
    let mut remaining = qty;
    let mut cost = Decimal::ZERO;
    for (price, level) in book.levels(side.opposite()) {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = level.total_quantity().min(remaining);
        cost += take * price;
        remaining -= take;
    }
    (qty - remaining, cost)
}

/// FOK feasibility: can `taker.quantity` fill completely against eligible
/// opposite depth, given the taker's STP policy?
///
/// - `NONE`: every resting order counts.
/// - `EXPIRE_MAKER`: same-user orders are expired on contact, so only
///   other users' quantity counts.
/// - `EXPIRE_TAKER` / `EXPIRE_BOTH`: matching stops at the first same-user
///   order, so only the quantity ahead of it counts.
fn fok_feasible(book: &OrderBook, taker: &Order, limit: Decimal) -> bool {
    let mut available = Decimal::ZERO;
    for (price, level) in book.levels(taker.side.opposite()) {
        let eligible = match taker.side {
            Side::Buy => price <= limit,
            Side::Sell => price >= limit,
        };
        if !eligible {
            break;
        }
        for resting in level.iter() {
            let same_user = resting.order.user_id == taker.user_id;
            match taker.self_trade_prevention {
                SelfTradePrevention::None => available += resting.order.remaining_quantity(),
                SelfTradePrevention::ExpireMaker => {
                    if !same_user {
                        available += resting.order.remaining_quantity();
                    }
                }
                SelfTradePrevention::ExpireTaker | SelfTradePrevention::ExpireBoth => {
                    if same_user {
                        return available >= taker.quantity;
                    }
                    available += resting.order.remaining_quantity();
                }
            }
            if available >= taker.quantity {
                return true;
            }
        }
    }
    available >= taker.quantity
}
