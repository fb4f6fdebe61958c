//! # Simulated Exchange Core for Quantitative Backtesting
//!
//! A simulated cryptocurrency exchange that serves as the execution substrate
//! for a backtesting engine. It accepts orders over a Binance-compatible REST
//! API, streams market-data and user-account updates over a WebSocket API,
//! runs a price-time priority matching engine, and drives all subscribers
//! through a central priority event bus that works identically under
//! wall-clock ("live") and virtual-clock ("backtest") time.
//!
//! ## Architecture
//!
//! Four subsystems make up the core:
//!
//! - **Matching engine** ([`orderbook`]) — price-time priority limit order
//!   books with one coarse lock per symbol, the order lifecycle state
//!   machine, stop-order activation, self-trade prevention and trade
//!   emission. Matching is serialized per symbol and parallel across
//!   symbols.
//! - **Account manager** ([`account`]) — per-user asset ledger with
//!   free/locked partitioning. A user's balances always move atomically
//!   under one lock; cross-user settlement takes both locks in ascending
//!   user-id order.
//! - **Event bus** ([`events`]) — priority-ordered pub/sub with one
//!   dispatcher thread and a worker pool for async handlers. Strict
//!   priority between classes, FIFO within a class, handler panics
//!   isolated and counted.
//! - **Time manager** ([`time`]) — the single source of "now". In backtest
//!   mode the clock is virtual and advances only on request, so replaying
//!   the same data yields byte-identical event streams.
//!
//! The [`exchange::Exchange`] facade wires them together: it locks funds at
//! admission, settles the two-sided transaction on every fill, and publishes
//! ORDER / FILL / ACCOUNT events in that order. The REST and WebSocket edges
//! in [`api`] are plumbing over the facade's operation set.
//!
//! ## Data flow
//!
//! ```text
//! REST edge → Exchange facade → Account (lock funds)
//!          → Matching engine (match → trades, order updates)
//!          → Event bus → WebSocket fan-out
//! ```
//!
//! Market-data ticks enter through
//! [`exchange::Exchange::process_market_tick`]: they move the reference
//! price, may trigger parked stop orders, feed the kline store and leave as
//! MARKET events.
//!
//! ## Numerics
//!
//! Every price, quantity, balance and fee is a [`rust_decimal::Decimal`].
//! Price-level keys, crossing checks and FOK feasibility rely on exact
//! decimal equality; binary floats never enter the core. Commissions round
//! away from zero at the receiving asset's precision.
//!
//! ## Example
//!
//! ```
//! use simex::config::{ExchangeConfig, SymbolConfig};
//! use simex::exchange::Exchange;
//! use simex::orderbook::order::{NewOrder, OrderType, Side, TimeInForce};
//! use simex::time::TimeManager;
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! let mut config = ExchangeConfig::default();
//! config.symbols.push(SymbolConfig::new("BTCUSDT", "BTC", "USDT"));
//!
//! let time = Arc::new(TimeManager::backtest(1_700_000_000_000));
//! let exchange = Exchange::new(&config, time);
//! exchange.start();
//!
//! let alice = "alice".to_string();
//! exchange.deposit(&alice, "USDT", Decimal::from(100_000)).unwrap();
//!
//! let report = exchange
//!     .place_order(NewOrder {
//!         symbol: "BTCUSDT".into(),
//!         side: Some(Side::Buy),
//!         order_type: Some(OrderType::Limit),
//!         quantity: Some(Decimal::from(1)),
//!         price: Some(Decimal::from(50_000)),
//!         time_in_force: Some(TimeInForce::Gtc),
//!         user_id: Some(alice.clone()),
//!         ..NewOrder::default()
//!     })
//!     .unwrap();
//! assert!(report.trades.is_empty()); // rests on the empty book
//! exchange.shutdown();
//! ```

pub mod account;
pub mod api;
pub mod config;
pub mod events;
pub mod exchange;
pub mod orderbook;
pub mod prelude;
pub mod time;

pub use account::{AccountError, AccountManager};
pub use config::{ExchangeConfig, SymbolConfig};
pub use events::{Event, EventBus, EventPriority, EventType};
pub use exchange::{Exchange, ExchangeError};
pub use orderbook::{MatchingEngine, OrderBook, OrderBookError};
pub use time::{TimeManager, TimeMode};
