//! Shared fixtures: a wired exchange over a virtual clock.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use simex::config::{ExchangeConfig, FeeConfig, SymbolConfig};
use simex::exchange::Exchange;
use simex::orderbook::order::{NewOrder, OrderType, SelfTradePrevention, Side, TimeInForce};
use simex::time::TimeManager;
use std::sync::Arc;
use std::time::Duration;

pub const START_MS: u64 = 1_700_000_000_000;

/// A started exchange with a BTCUSDT market, zero fees and a virtual clock.
pub fn exchange() -> Arc<Exchange> {
    exchange_with_fees(FeeConfig {
        maker_rate: Decimal::ZERO,
        taker_rate: Decimal::ZERO,
    })
}

/// Same fixture with explicit fee rates.
pub fn exchange_with_fees(fees: FeeConfig) -> Arc<Exchange> {
    let config = ExchangeConfig {
        fees,
        symbols: vec![SymbolConfig::new("BTCUSDT", "BTC", "USDT")],
        ..ExchangeConfig::default()
    };
    let time = Arc::new(TimeManager::backtest(START_MS));
    let ex = Exchange::new(&config, time);
    ex.start();
    ex
}

/// The standard 0.1 % maker/taker schedule.
pub fn standard_fees() -> FeeConfig {
    FeeConfig {
        maker_rate: dec!(0.001),
        taker_rate: dec!(0.001),
    }
}

pub fn limit(user: &str, side: Side, qty: Decimal, price: Decimal) -> NewOrder {
    NewOrder {
        symbol: "BTCUSDT".into(),
        side: Some(side),
        order_type: Some(OrderType::Limit),
        quantity: Some(qty),
        price: Some(price),
        time_in_force: Some(TimeInForce::Gtc),
        user_id: Some(user.to_string()),
        ..NewOrder::default()
    }
}

pub fn limit_tif(
    user: &str,
    side: Side,
    qty: Decimal,
    price: Decimal,
    tif: TimeInForce,
) -> NewOrder {
    NewOrder {
        time_in_force: Some(tif),
        ..limit(user, side, qty, price)
    }
}

pub fn limit_stp(
    user: &str,
    side: Side,
    qty: Decimal,
    price: Decimal,
    stp: SelfTradePrevention,
) -> NewOrder {
    NewOrder {
        self_trade_prevention: Some(stp),
        ..limit(user, side, qty, price)
    }
}

pub fn market(user: &str, side: Side, qty: Decimal) -> NewOrder {
    NewOrder {
        symbol: "BTCUSDT".into(),
        side: Some(side),
        order_type: Some(OrderType::Market),
        quantity: Some(qty),
        user_id: Some(user.to_string()),
        ..NewOrder::default()
    }
}

pub fn stop_market(user: &str, side: Side, qty: Decimal, stop_price: Decimal) -> NewOrder {
    NewOrder {
        symbol: "BTCUSDT".into(),
        side: Some(side),
        order_type: Some(OrderType::Stop),
        quantity: Some(qty),
        stop_price: Some(stop_price),
        user_id: Some(user.to_string()),
        ..NewOrder::default()
    }
}

/// Wait for the bus to finish delivering everything published so far.
pub fn settle_bus(ex: &Exchange) {
    assert!(ex.bus().drain(Duration::from_secs(2)), "bus did not drain");
}
