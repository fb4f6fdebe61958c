//! The exchange facade: binds the matching engine, the account ledger, the
//! kline store and the event bus, and exposes the operation set the REST
//! and WebSocket edges consume.
//!
//! The facade owns all money choreography. At admission it computes and
//! takes the fund lock (so an underfunded order never reaches the engine);
//! on every fill it runs the paired settlement and publishes ORDER, FILL
//! and ACCOUNT events in that order; at terminal states it releases the
//! unused portion of the original lock verbatim. The engine reaches back
//! only through the listener seams installed here, so there is no reference
//! cycle.

use crate::account::{AccountError, AccountManager, BalanceSnapshot, TradeSettlement};
use crate::config::{ExchangeConfig, SymbolConfig};
use crate::events::{Event, EventBus, EventType};
use crate::exchange::fees::{FeePolicy, FeeSchedule, LiquidityRole, round_commission};
use crate::exchange::klines::{Interval, Kline, KlineManager};
use crate::orderbook::order::{CancelRestrictions, NewOrder, Order, OrderId, Side, UserId};
use crate::orderbook::trade::{Fill, FillCommissions, Trade, TradeExecution};
use crate::orderbook::{CancelTarget, DepthSnapshot, MatchingEngine, OrderBookError, OrderReport};
use crate::time::TimeManager;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Facade-level failures, the union the API edge maps to wire codes.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Book(#[from] OrderBookError),
    #[error(transparent)]
    Account(#[from] AccountError),
}

/// Funds reserved for one live order. `remaining` shrinks as fills settle;
/// whatever is left when the order reaches a terminal state is released.
#[derive(Debug, Clone)]
struct OrderLock {
    user: UserId,
    asset: String,
    remaining: Decimal,
}

/// The simulated exchange.
pub struct Exchange {
    time: Arc<TimeManager>,
    bus: Arc<EventBus>,
    accounts: Arc<AccountManager>,
    engine: Arc<MatchingEngine>,
    klines: Arc<KlineManager>,
    fees: Arc<dyn FeePolicy>,
    symbol_cfgs: Arc<DashMap<String, SymbolConfig>>,
    locks: Arc<DashMap<OrderId, OrderLock>>,
    open_orders: Arc<DashMap<UserId, BTreeSet<OrderId>>>,
    /// Serializes order admission (and cancels / ticks) per symbol so the
    /// quote-then-lock-then-match sequence observes a stable book.
    admission: DashMap<String, Arc<Mutex<()>>>,
}

impl Exchange {
    /// Build and wire the whole core from a configuration. The bus is
    /// created but not started; call [`Exchange::start`].
    pub fn new(config: &ExchangeConfig, time: Arc<TimeManager>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(config.bus, Arc::clone(&time)));
        let accounts = Arc::new(AccountManager::new(Arc::clone(&time)));
        let engine = Arc::new(MatchingEngine::new(Arc::clone(&time)));
        let klines = Arc::new(KlineManager::new());
        let fees: Arc<dyn FeePolicy> = Arc::new(FeeSchedule::from(config.fees));
        let symbol_cfgs = Arc::new(DashMap::new());
        let locks: Arc<DashMap<OrderId, OrderLock>> = Arc::new(DashMap::new());
        let open_orders: Arc<DashMap<UserId, BTreeSet<OrderId>>> = Arc::new(DashMap::new());

        for cfg in &config.symbols {
            symbol_cfgs.insert(cfg.symbol.clone(), cfg.clone());
            engine.register_symbol(cfg.clone());
        }
        for seed in &config.users {
            for (asset, amount) in &seed.balances {
                if let Err(e) = accounts.deposit(&seed.user_id, asset, *amount) {
                    warn!(user = %seed.user_id, asset, "seed deposit skipped: {e}");
                }
            }
            if let Some(key) = &seed.api_key {
                accounts.register_api_key(key, &seed.user_id);
            }
        }

        wire_fee_calculator(&engine, &fees, &symbol_cfgs);
        wire_trade_listener(
            &engine,
            &accounts,
            &bus,
            &time,
            &klines,
            &symbol_cfgs,
            &locks,
            &open_orders,
        );
        wire_order_listener(&engine, &accounts, &bus, &time, &locks, &open_orders);
        wire_activation_hook(&engine, &accounts, &fees, &symbol_cfgs, &locks);

        Arc::new(Self {
            time,
            bus,
            accounts,
            engine,
            klines,
            fees,
            symbol_cfgs,
            locks,
            open_orders,
            admission: DashMap::new(),
        })
    }

    /// Start the event bus and announce the system.
    pub fn start(&self) {
        self.bus.start();
        let _ = self.bus.publish(Event::system(EventType::SystemStart, &self.time));
        info!("exchange started");
    }

    /// Announce shutdown and stop the bus (drains briefly first so the stop
    /// event reaches subscribers).
    pub fn shutdown(&self) {
        let _ = self.bus.publish(Event::system(EventType::SystemStop, &self.time));
        self.bus.drain(std::time::Duration::from_millis(500));
        self.bus.stop();
        info!("exchange stopped");
    }

    // ---- order operations ------------------------------------------------

    /// Validate, fund and admit an order.
    pub fn place_order(&self, new: NewOrder) -> Result<OrderReport, ExchangeError> {
        let _guard = self.admission_guard(&new.symbol);
        let draft = self.engine.test_order(&new)?;
        let order_id = self.engine.allocate_order_id();

        if !draft.order_type.is_stop() {
            self.lock_for_admission(&draft, order_id)?;
        }

        match self.engine.place_order(&new, order_id) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.release_admission_lock(order_id);
                Err(e.into())
            }
        }
    }

    /// Dry run: validation only, no lock, no book mutation.
    pub fn test_order(&self, new: &NewOrder) -> Result<Order, ExchangeError> {
        Ok(self.engine.test_order(new)?)
    }

    /// Cancel one order by server id or client id.
    pub fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<OrderId>,
        client_order_id: Option<String>,
        user: &UserId,
        restrictions: CancelRestrictions,
    ) -> Result<Order, ExchangeError> {
        let _guard = self.admission_guard(symbol);
        let target = match (order_id, client_order_id) {
            (Some(id), _) => CancelTarget::ById(id),
            (None, Some(cid)) => CancelTarget::ByClientId(cid),
            (None, None) => return Err(OrderBookError::MissingParameter("orderId").into()),
        };
        Ok(self.engine.cancel_order(symbol, target, user, restrictions)?)
    }

    /// Cancel every open order of `user` on `symbol`.
    pub fn cancel_all_orders(
        &self,
        symbol: &str,
        user: &UserId,
    ) -> Result<Vec<Order>, ExchangeError> {
        let _guard = self.admission_guard(symbol);
        Ok(self.engine.cancel_all(symbol, user)?)
    }

    /// Look up an order, scoped to its owner.
    pub fn get_order(
        &self,
        symbol: &str,
        order_id: Option<OrderId>,
        client_order_id: Option<String>,
        user: &UserId,
    ) -> Result<Order, ExchangeError> {
        let order = match (order_id, client_order_id) {
            (Some(id), _) => self.engine.get_order(id),
            (None, Some(cid)) => self.engine.get_order_by_client_id(user, &cid),
            (None, None) => return Err(OrderBookError::MissingParameter("orderId").into()),
        };
        match order {
            Some(o) if &o.user_id == user && o.symbol == symbol => Ok(o),
            Some(o) => Err(OrderBookError::OrderNotFound(o.order_id.to_string()).into()),
            None => Err(OrderBookError::OrderNotFound("unknown".to_string()).into()),
        }
    }

    /// All open orders of `user`, optionally filtered by symbol, in id
    /// order.
    #[must_use]
    pub fn open_orders(&self, user: &UserId, symbol: Option<&str>) -> Vec<Order> {
        let Some(ids) = self.open_orders.get(user).map(|s| s.clone()) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.engine.get_order(*id))
            .filter(|o| o.status.is_open())
            .filter(|o| symbol.is_none_or(|s| o.symbol == s))
            .collect()
    }

    /// Trades of `user` on `symbol`, oldest first.
    pub fn my_trades(
        &self,
        user: &UserId,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Trade>, ExchangeError> {
        Ok(self.engine.trades_for_user(symbol, user, limit)?)
    }

    // ---- market data -----------------------------------------------------

    /// Aggregated depth.
    pub fn depth(&self, symbol: &str, limit: usize) -> Result<DepthSnapshot, ExchangeError> {
        Ok(self.engine.depth(symbol, limit)?)
    }

    /// Recent public trades.
    pub fn recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, ExchangeError> {
        Ok(self.engine.recent_trades(symbol, limit)?)
    }

    /// Candles.
    pub fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        start: Option<u64>,
        end: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Kline>, ExchangeError> {
        if !self.symbol_cfgs.contains_key(symbol) {
            return Err(OrderBookError::UnknownSymbol(symbol.to_string()).into());
        }
        Ok(self.klines.query(symbol, interval, start, end, limit))
    }

    /// Ingest an external market tick: reference price update, stop sweep,
    /// kline fold, MARKET event.
    pub fn process_market_tick(
        &self,
        symbol: &str,
        price: Decimal,
        quantity: Option<Decimal>,
    ) -> Result<(), ExchangeError> {
        let _guard = self.admission_guard(symbol);
        self.engine.process_market_tick(symbol, price)?;
        self.klines
            .record(symbol, price, quantity.unwrap_or(Decimal::ZERO), self.time.now_ms());
        let event = Event::market(symbol, price, quantity, &self.time);
        if let Err(e) = self.bus.publish(event) {
            warn!(symbol, "market event dropped: {e}");
        }
        Ok(())
    }

    /// Registered symbols and their filters.
    #[must_use]
    pub fn exchange_info(&self) -> Vec<SymbolConfig> {
        let mut out: Vec<SymbolConfig> = self.symbol_cfgs.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Server time from the process clock.
    #[must_use]
    pub fn server_time(&self) -> u64 {
        self.time.now_ms()
    }

    // ---- accounts --------------------------------------------------------

    /// Create a user (idempotent) and issue an API key.
    pub fn create_user(&self, user: &UserId) -> String {
        self.accounts.create_api_key(user)
    }

    /// Resolve an API key.
    #[must_use]
    pub fn authenticate(&self, api_key: &str) -> Option<UserId> {
        self.accounts.authenticate(api_key)
    }

    /// External deposit, with an ACCOUNT event.
    pub fn deposit(
        &self,
        user: &UserId,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        self.accounts.deposit(user, asset, amount)?;
        self.publish_account_event(user, &[asset]);
        Ok(())
    }

    /// External withdrawal, with an ACCOUNT event.
    pub fn withdraw(
        &self,
        user: &UserId,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        self.accounts.withdraw(user, asset, amount)?;
        self.publish_account_event(user, &[asset]);
        Ok(())
    }

    /// Current balances.
    #[must_use]
    pub fn account_snapshot(&self, user: &UserId) -> Vec<BalanceSnapshot> {
        self.accounts.balances(user)
    }

    // ---- handles ---------------------------------------------------------

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    #[must_use]
    pub fn kline_store(&self) -> &Arc<KlineManager> {
        &self.klines
    }

    #[must_use]
    pub fn time(&self) -> &Arc<TimeManager> {
        &self.time
    }

    // ---- internals -------------------------------------------------------

    fn admission_guard(&self, symbol: &str) -> parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()> {
        let lock = self
            .admission
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_arc()
    }

    /// Compute and take the admission fund lock for a non-stop order.
    fn lock_for_admission(&self, draft: &Order, order_id: OrderId) -> Result<(), ExchangeError> {
        let cfg = self
            .engine
            .symbol_config(&draft.symbol)
            .ok_or_else(|| OrderBookError::UnknownSymbol(draft.symbol.clone()))?;
        let taker_rate = self.fees.rate(draft.side, LiquidityRole::Taker);

        let locked = match (draft.side, draft.price, draft.quote_order_qty) {
            // Sells lock the base quantity regardless of type.
            (Side::Sell, _, _) => self.accounts.lock_for_order(
                &draft.user_id,
                &cfg,
                Side::Sell,
                draft.price.unwrap_or_default(),
                draft.quantity,
                None,
                taker_rate,
            )?,
            // Quote-quantified market buy locks the budget verbatim.
            (Side::Buy, _, Some(quote)) => self.accounts.lock_for_order(
                &draft.user_id,
                &cfg,
                Side::Buy,
                Decimal::ZERO,
                draft.quantity,
                Some(quote),
                taker_rate,
            )?,
            // Priced buy locks qty × price × (1 + fee).
            (Side::Buy, Some(price), None) => self.accounts.lock_for_order(
                &draft.user_id,
                &cfg,
                Side::Buy,
                price,
                draft.quantity,
                None,
                taker_rate,
            )?,
            // Market buy by base quantity: price the walk over the current
            // book (stable under the admission guard) and lock its cost.
            (Side::Buy, None, None) => {
                let (_, cost) = self.engine.market_cost(&draft.symbol, Side::Buy, draft.quantity)?;
                if cost.is_zero() {
                    // Empty book: nothing can fill, nothing to lock; the
                    // engine will expire the order.
                    return Ok(());
                }
                let amount = cost * (Decimal::ONE + taker_rate);
                self.accounts.lock(&draft.user_id, &cfg.quote_asset, amount)?;
                crate::account::LockedFunds {
                    asset: cfg.quote_asset.clone(),
                    amount,
                }
            }
        };

        self.locks.insert(
            order_id,
            OrderLock {
                user: draft.user_id.clone(),
                asset: locked.asset,
                remaining: locked.amount,
            },
        );
        Ok(())
    }

    /// Undo an admission lock after the engine rejected the order.
    fn release_admission_lock(&self, order_id: OrderId) {
        if let Some((_, lock)) = self.locks.remove(&order_id)
            && lock.remaining > Decimal::ZERO
            && let Err(e) = self.accounts.unlock(&lock.user, &lock.asset, lock.remaining)
        {
            error!(order_id, "failed to release admission lock: {e}");
        }
    }

    fn publish_account_event(&self, user: &UserId, assets: &[&str]) {
        let balances = self.accounts.balances_for(user, assets);
        let event = Event::account(user.clone(), balances, &self.time);
        if let Err(e) = self.bus.publish(event) {
            warn!(%user, "account event dropped: {e}");
        }
    }
}

// ---- listener wiring ----------------------------------------------------
//
// Free functions so the closures capture exactly the handles they need and
// the engine never holds a reference back to the facade.

fn wire_fee_calculator(
    engine: &Arc<MatchingEngine>,
    fees: &Arc<dyn FeePolicy>,
    symbol_cfgs: &Arc<DashMap<String, SymbolConfig>>,
) {
    let fees = Arc::clone(fees);
    let cfgs = Arc::clone(symbol_cfgs);
    engine.set_fee_calculator(Arc::new(move |fill: &Fill| {
        let Some(cfg) = cfgs.get(&fill.symbol) else {
            return FillCommissions::default();
        };
        let (buyer_role, seller_role) = if fill.buyer_is_maker {
            (LiquidityRole::Maker, LiquidityRole::Taker)
        } else {
            (LiquidityRole::Taker, LiquidityRole::Maker)
        };
        let buyer = round_commission(
            fill.quantity * fees.rate(Side::Buy, buyer_role),
            cfg.base_precision,
        );
        let seller = round_commission(
            fill.quantity * fill.price * fees.rate(Side::Sell, seller_role),
            cfg.quote_precision,
        );
        FillCommissions { buyer, seller }
    }));
}

#[allow(clippy::too_many_arguments)]
fn wire_trade_listener(
    engine: &Arc<MatchingEngine>,
    accounts: &Arc<AccountManager>,
    bus: &Arc<EventBus>,
    time: &Arc<TimeManager>,
    klines: &Arc<KlineManager>,
    symbol_cfgs: &Arc<DashMap<String, SymbolConfig>>,
    locks: &Arc<DashMap<OrderId, OrderLock>>,
    open_orders: &Arc<DashMap<UserId, BTreeSet<OrderId>>>,
) {
    let accounts = Arc::clone(accounts);
    let bus = Arc::clone(bus);
    let time = Arc::clone(time);
    let klines = Arc::clone(klines);
    let cfgs = Arc::clone(symbol_cfgs);
    let locks = Arc::clone(locks);
    let open_orders = Arc::clone(open_orders);

    engine.set_trade_listener(Arc::new(move |exec: &TradeExecution| {
        let trade = &exec.trade;
        let Some(cfg) = cfgs.get(&trade.symbol).map(|c| c.clone()) else {
            return;
        };

        klines.record(&trade.symbol, trade.price, trade.quantity, trade.timestamp);

        // ORDER events for both sides, then the FILL, then the ACCOUNT
        // deltas: the order the edge relies on.
        publish(&bus, Event::order(exec.maker.clone(), &time));
        publish(&bus, Event::order(exec.taker.clone(), &time));
        publish(&bus, Event::fill(trade.clone(), &time).with_correlation_id(&exec.taker.order_id.to_string()));

        let quote_qty = trade.quote_qty();
        let settlement = TradeSettlement {
            buyer: trade.buyer_user_id.clone(),
            seller: trade.seller_user_id.clone(),
            base_asset: cfg.base_asset.clone(),
            quote_asset: cfg.quote_asset.clone(),
            base_qty: trade.quantity,
            quote_qty,
            commission_buyer: trade.commission_buyer,
            commission_seller: trade.commission_seller,
        };
        if let Err(e) = accounts.settle_trade(&settlement) {
            // A fill without covering locks violates the ledger invariants:
            // announce and abort.
            let _ = bus.publish(
                Event::system(EventType::SystemError, &time)
                    .with_metadata("error", serde_json::Value::String(e.to_string())),
            );
            error!(trade_id = trade.trade_id, "fatal: settlement failed: {e}");
            panic!("settlement failed for trade {}: {e}", trade.trade_id);
        }

        decrement_lock(&locks, trade.buyer_order_id, quote_qty);
        decrement_lock(&locks, trade.seller_order_id, trade.quantity);

        for order in [&exec.maker, &exec.taker] {
            if order.status.is_terminal() {
                finish_order(&accounts, &locks, &open_orders, &bus, &time, order);
            }
        }

        for user in [&trade.buyer_user_id, &trade.seller_user_id] {
            let balances =
                accounts.balances_for(user, &[cfg.base_asset.as_str(), cfg.quote_asset.as_str()]);
            publish(&bus, Event::account(user.clone(), balances, &time));
            if trade.buyer_user_id == trade.seller_user_id {
                break;
            }
        }
    }));
}

fn wire_order_listener(
    engine: &Arc<MatchingEngine>,
    accounts: &Arc<AccountManager>,
    bus: &Arc<EventBus>,
    time: &Arc<TimeManager>,
    locks: &Arc<DashMap<OrderId, OrderLock>>,
    open_orders: &Arc<DashMap<UserId, BTreeSet<OrderId>>>,
) {
    let accounts = Arc::clone(accounts);
    let bus = Arc::clone(bus);
    let time = Arc::clone(time);
    let locks = Arc::clone(locks);
    let open_orders = Arc::clone(open_orders);

    engine.set_order_listener(Arc::new(move |order: &Order| {
        publish(&bus, Event::order(order.clone(), &time));
        if order.status.is_open() {
            open_orders
                .entry(order.user_id.clone())
                .or_default()
                .insert(order.order_id);
        } else {
            finish_order(&accounts, &locks, &open_orders, &bus, &time, order);
        }
    }));
}

fn wire_activation_hook(
    engine: &Arc<MatchingEngine>,
    accounts: &Arc<AccountManager>,
    fees: &Arc<dyn FeePolicy>,
    symbol_cfgs: &Arc<DashMap<String, SymbolConfig>>,
    locks: &Arc<DashMap<OrderId, OrderLock>>,
) {
    let accounts = Arc::clone(accounts);
    let fees = Arc::clone(fees);
    let cfgs = Arc::clone(symbol_cfgs);
    let locks = Arc::clone(locks);

    engine.set_activation_hook(Arc::new(move |order: &Order, required: Decimal| {
        let Some(cfg) = cfgs.get(&order.symbol) else {
            return false;
        };
        let (asset, amount) = match order.side {
            Side::Sell => (cfg.base_asset.clone(), required),
            Side::Buy => {
                let rate = fees.rate(Side::Buy, LiquidityRole::Taker);
                (cfg.quote_asset.clone(), required * (Decimal::ONE + rate))
            }
        };
        if amount <= Decimal::ZERO {
            // Nothing to reserve (e.g. a market stop against an empty
            // book); let the engine expire it.
            return true;
        }
        match accounts.lock(&order.user_id, &asset, amount) {
            Ok(()) => {
                locks.insert(
                    order.order_id,
                    OrderLock {
                        user: order.user_id.clone(),
                        asset,
                        remaining: amount,
                    },
                );
                true
            }
            Err(e) => {
                warn!(order_id = order.order_id, "stop activation unfunded: {e}");
                false
            }
        }
    }));
}

fn publish(bus: &EventBus, event: Event) {
    if let Err(e) = bus.publish(event) {
        warn!("event dropped: {e}");
    }
}

fn decrement_lock(locks: &DashMap<OrderId, OrderLock>, order_id: OrderId, amount: Decimal) {
    if let Some(mut lock) = locks.get_mut(&order_id) {
        lock.remaining = (lock.remaining - amount).max(Decimal::ZERO);
    }
}

/// Terminal-state bookkeeping: drop from the open index, release the unused
/// lock and publish the resulting ACCOUNT delta.
fn finish_order(
    accounts: &AccountManager,
    locks: &DashMap<OrderId, OrderLock>,
    open_orders: &DashMap<UserId, BTreeSet<OrderId>>,
    bus: &EventBus,
    time: &TimeManager,
    order: &Order,
) {
    if let Some(mut set) = open_orders.get_mut(&order.user_id) {
        set.remove(&order.order_id);
    }
    if let Some((_, lock)) = locks.remove(&order.order_id) {
        if lock.remaining > Decimal::ZERO {
            if let Err(e) = accounts.unlock(&lock.user, &lock.asset, lock.remaining) {
                error!(order_id = order.order_id, "lock release failed: {e}");
            }
            let balances = accounts.balances_for(&lock.user, &[lock.asset.as_str()]);
            publish(bus, Event::account(lock.user.clone(), balances, time));
        }
    }
}
