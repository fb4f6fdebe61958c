//! End-to-end scenarios through the exchange facade: funds choreography,
//! event ordering and the canonical S1–S6 seed scenarios.

use crate::common::{
    exchange, exchange_with_fees, limit, limit_stp, limit_tif, market, settle_bus, standard_fees,
    stop_market,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use simex::events::{Event, SubscribeOptions};
use simex::exchange::{ExchangeError, Interval};
use simex::orderbook::order::{
    CancelRestrictions, NewOrder, OrderStatus, OrderType, SelfTradePrevention, Side, TimeInForce,
};
use simex::orderbook::OrderBookError;
use std::sync::Arc;

#[test]
fn s1_single_level_cross_with_fees() {
    let ex = exchange_with_fees(standard_fees());
    let alice = "alice".to_string();
    let bob = "bob".to_string();
    ex.deposit(&alice, "USDT", dec!(100000)).unwrap();
    ex.deposit(&bob, "BTC", dec!(10)).unwrap();

    // Alice rests a bid: 1 BTC at 50 000, locking 50 050 (fee headroom).
    let resting = ex.place_order(limit("alice", Side::Buy, dec!(1), dec!(50000))).unwrap();
    assert!(resting.trades.is_empty());
    let usdt = ex.accounts().balance(&alice, "USDT");
    assert_eq!((usdt.free, usdt.locked), (dec!(49950), dec!(50050)));

    // Bob sells into the bid below it; the trade prints at the bid price.
    let taker = ex.place_order(limit("bob", Side::Sell, dec!(1), dec!(49000))).unwrap();
    assert_eq!(taker.trades.len(), 1);
    let trade = &taker.trades[0];
    assert_eq!(trade.price, dec!(50000));
    assert_eq!(trade.quantity, dec!(1));
    assert_eq!(taker.order.status, OrderStatus::Filled);
    assert_eq!(
        ex.engine().get_order(resting.order.order_id).unwrap().status,
        OrderStatus::Filled
    );

    // Alice: fee comes out of the received BTC; the quote surplus from the
    // fee headroom is released.
    let alice_btc = ex.accounts().balance(&alice, "BTC");
    let alice_usdt = ex.accounts().balance(&alice, "USDT");
    assert_eq!(alice_btc.free, dec!(0.999));
    assert_eq!(alice_usdt.free, dec!(50000));
    assert_eq!(alice_usdt.locked, Decimal::ZERO);

    // Bob: fee comes out of the received USDT.
    let bob_btc = ex.accounts().balance(&bob, "BTC");
    let bob_usdt = ex.accounts().balance(&bob, "USDT");
    assert_eq!(bob_btc.free, dec!(9));
    assert_eq!(bob_btc.locked, Decimal::ZERO);
    assert_eq!(bob_usdt.free, dec!(49950));

    // Commissions on the trade record match what moved.
    assert_eq!(trade.commission_buyer, dec!(0.001));
    assert_eq!(trade.commission_seller, dec!(50));
}

#[test]
fn s2_fok_infeasible_rejects_without_balance_change() {
    let ex = exchange();
    let user = "seller".to_string();
    ex.deposit(&user, "BTC", dec!(10)).unwrap();

    let err = ex
        .place_order(limit_tif("seller", Side::Sell, dec!(5), dec!(10), TimeInForce::Fok))
        .unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::Book(OrderBookError::OrderRejected(_))
    ));

    let btc = ex.accounts().balance(&user, "BTC");
    assert_eq!((btc.free, btc.locked), (dec!(10), Decimal::ZERO));
    assert!(ex.recent_trades("BTCUSDT", 10).unwrap().is_empty());
}

#[test]
fn s3_ioc_partial_settles_fill_and_releases_remainder() {
    let ex = exchange();
    let buyer = "buyer".to_string();
    let seller = "seller".to_string();
    ex.deposit(&buyer, "USDT", dec!(1000)).unwrap();
    ex.deposit(&seller, "BTC", dec!(10)).unwrap();

    ex.place_order(limit("seller", Side::Sell, dec!(2), dec!(100))).unwrap();
    let report = ex
        .place_order(limit_tif("buyer", Side::Buy, dec!(5), dec!(100), TimeInForce::Ioc))
        .unwrap();

    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].quantity, dec!(2));
    assert_eq!(report.order.status, OrderStatus::Expired);

    // Exactly the filled portion settled; the rest of the lock came back.
    let usdt = ex.accounts().balance(&buyer, "USDT");
    assert_eq!((usdt.free, usdt.locked), (dec!(800), Decimal::ZERO));
    assert_eq!(ex.accounts().balance(&buyer, "BTC").free, dec!(2));
    let seller_btc = ex.accounts().balance(&seller, "BTC");
    assert_eq!((seller_btc.free, seller_btc.locked), (dec!(8), Decimal::ZERO));
    assert_eq!(ex.accounts().balance(&seller, "USDT").free, dec!(200));
}

#[test]
fn s4_expire_maker_swaps_the_locks() {
    let ex = exchange();
    let user = "solo".to_string();
    ex.deposit(&user, "USDT", dec!(1000)).unwrap();
    ex.deposit(&user, "BTC", dec!(5)).unwrap();

    let bid = ex.place_order(limit("solo", Side::Buy, dec!(1), dec!(100))).unwrap();
    let ask = ex
        .place_order(limit_stp(
            "solo",
            Side::Sell,
            dec!(1),
            dec!(100),
            SelfTradePrevention::ExpireMaker,
        ))
        .unwrap();

    assert!(ask.trades.is_empty());
    assert_eq!(ask.order.status, OrderStatus::New);
    assert_eq!(
        ex.engine().get_order(bid.order.order_id).unwrap().status,
        OrderStatus::Expired
    );

    // The bid's quote lock was released; the ask's base lock is live.
    let usdt = ex.accounts().balance(&user, "USDT");
    let btc = ex.accounts().balance(&user, "BTC");
    assert_eq!((usdt.free, usdt.locked), (dec!(1000), Decimal::ZERO));
    assert_eq!((btc.free, btc.locked), (dec!(4), dec!(1)));
}

#[test]
fn s6_stop_activates_from_unrelated_match() {
    let ex = exchange();
    let a = "a".to_string();
    let b = "b".to_string();
    let c = "c".to_string();
    ex.deposit(&a, "USDT", dec!(200000)).unwrap();
    ex.deposit(&b, "BTC", dec!(10)).unwrap();
    ex.deposit(&c, "USDT", dec!(200000)).unwrap();

    ex.place_order(limit("b", Side::Sell, dec!(1), dec!(50100))).unwrap();
    ex.place_order(limit("b", Side::Sell, dec!(1), dec!(50200))).unwrap();

    // C parks a stop; nothing is locked while it waits.
    let stop = ex.place_order(stop_market("c", Side::Buy, dec!(1), dec!(50100))).unwrap();
    assert_eq!(ex.accounts().balance(&c, "USDT").locked, Decimal::ZERO);

    // An unrelated match drives the last price to the trigger.
    ex.place_order(limit("a", Side::Buy, dec!(1), dec!(50100))).unwrap();

    let activated = ex.engine().get_order(stop.order.order_id).unwrap();
    assert_eq!(activated.status, OrderStatus::Filled);
    let trades = ex.recent_trades("BTCUSDT", 10).unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].price, dec!(50200));
    assert_eq!(trades[1].buyer_user_id, c);

    let c_usdt = ex.accounts().balance(&c, "USDT");
    assert_eq!(ex.accounts().balance(&c, "BTC").free, dec!(1));
    assert_eq!((c_usdt.free, c_usdt.locked), (dec!(149800), Decimal::ZERO));
}

#[test]
fn fill_events_arrive_as_order_fill_account() {
    let ex = exchange();
    let buyer = "buyer".to_string();
    let seller = "seller".to_string();
    ex.deposit(&buyer, "USDT", dec!(1000)).unwrap();
    ex.deposit(&seller, "BTC", dec!(1)).unwrap();
    ex.place_order(limit("buyer", Side::Buy, dec!(1), dec!(100))).unwrap();
    settle_bus(&ex);

    let tags = Arc::new(Mutex::new(Vec::new()));
    let sink = tags.clone();
    ex.bus().subscribe(
        "*",
        Arc::new(move |event: &Event| {
            sink.lock().push(event.event_type.as_tag().to_string());
        }),
        SubscribeOptions::default(),
    );

    ex.place_order(limit("seller", Side::Sell, dec!(1), dec!(100))).unwrap();
    settle_bus(&ex);

    let seen = tags.lock().clone();
    let relevant: Vec<&str> = seen
        .iter()
        .map(String::as_str)
        .filter(|t| matches!(*t, "ORDER" | "FILL" | "ACCOUNT"))
        .collect();
    assert_eq!(relevant, vec!["ORDER", "ORDER", "FILL", "ACCOUNT", "ACCOUNT"]);
}

#[test]
fn place_then_cancel_is_an_identity_on_balances() {
    let ex = exchange();
    let user = "u".to_string();
    ex.deposit(&user, "USDT", dec!(500)).unwrap();

    let report = ex.place_order(limit("u", Side::Buy, dec!(2), dec!(100))).unwrap();
    assert_eq!(ex.accounts().balance(&user, "USDT").locked, dec!(200));

    let canceled = ex
        .cancel_order("BTCUSDT", Some(report.order.order_id), None, &user, CancelRestrictions::empty())
        .unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
    let usdt = ex.accounts().balance(&user, "USDT");
    assert_eq!((usdt.free, usdt.locked), (dec!(500), Decimal::ZERO));
}

#[test]
fn insufficient_balance_is_rejected_before_the_book() {
    let ex = exchange();
    let user = "poor".to_string();
    ex.deposit(&user, "USDT", dec!(50)).unwrap();
    let err = ex.place_order(limit("poor", Side::Buy, dec!(1), dec!(100))).unwrap_err();
    assert!(matches!(err, ExchangeError::Account(_)));
    assert!(ex.open_orders(&user, None).is_empty());
    let usdt = ex.accounts().balance(&user, "USDT");
    assert_eq!((usdt.free, usdt.locked), (dec!(50), Decimal::ZERO));
}

#[test]
fn open_orders_track_lifecycle() {
    let ex = exchange();
    let user = "u".to_string();
    let other = "v".to_string();
    ex.deposit(&user, "USDT", dec!(1000)).unwrap();
    ex.deposit(&other, "BTC", dec!(1)).unwrap();

    let report = ex.place_order(limit("u", Side::Buy, dec!(1), dec!(100))).unwrap();
    let open = ex.open_orders(&user, Some("BTCUSDT"));
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].order_id, report.order.order_id);

    ex.place_order(limit("v", Side::Sell, dec!(1), dec!(100))).unwrap();
    assert!(ex.open_orders(&user, None).is_empty());
}

#[test]
fn cancel_all_clears_resting_and_parked_orders() {
    let ex = exchange();
    let user = "u".to_string();
    ex.deposit(&user, "USDT", dec!(10000)).unwrap();
    ex.deposit(&user, "BTC", dec!(5)).unwrap();

    ex.place_order(limit("u", Side::Buy, dec!(1), dec!(90))).unwrap();
    ex.place_order(limit("u", Side::Sell, dec!(1), dec!(110))).unwrap();
    ex.place_order(stop_market("u", Side::Sell, dec!(1), dec!(80))).unwrap();

    let canceled = ex.cancel_all_orders("BTCUSDT", &user).unwrap();
    assert_eq!(canceled.len(), 3);
    assert!(ex.open_orders(&user, None).is_empty());

    let usdt = ex.accounts().balance(&user, "USDT");
    let btc = ex.accounts().balance(&user, "BTC");
    assert_eq!((usdt.free, usdt.locked), (dec!(10000), Decimal::ZERO));
    assert_eq!((btc.free, btc.locked), (dec!(5), Decimal::ZERO));
}

#[test]
fn market_buy_by_quantity_locks_the_walked_cost() {
    let ex = exchange();
    let buyer = "buyer".to_string();
    let seller = "seller".to_string();
    ex.deposit(&buyer, "USDT", dec!(1000)).unwrap();
    ex.deposit(&seller, "BTC", dec!(10)).unwrap();
    ex.place_order(limit("seller", Side::Sell, dec!(1), dec!(100))).unwrap();
    ex.place_order(limit("seller", Side::Sell, dec!(1), dec!(120))).unwrap();

    let report = ex.place_order(market("buyer", Side::Buy, dec!(2))).unwrap();
    assert_eq!(report.trades.len(), 2);
    assert_eq!(report.order.status, OrderStatus::Filled);

    let usdt = ex.accounts().balance(&buyer, "USDT");
    assert_eq!((usdt.free, usdt.locked), (dec!(780), Decimal::ZERO));
    assert_eq!(ex.accounts().balance(&buyer, "BTC").free, dec!(2));
}

#[test]
fn quote_order_qty_market_buy_spends_exactly_the_budget() {
    let ex = exchange();
    let buyer = "buyer".to_string();
    let seller = "seller".to_string();
    ex.deposit(&buyer, "USDT", dec!(500)).unwrap();
    ex.deposit(&seller, "BTC", dec!(10)).unwrap();
    ex.place_order(limit("seller", Side::Sell, dec!(5), dec!(100))).unwrap();

    let report = ex
        .place_order(NewOrder {
            symbol: "BTCUSDT".into(),
            side: Some(Side::Buy),
            order_type: Some(OrderType::Market),
            quote_order_qty: Some(dec!(250)),
            user_id: Some("buyer".into()),
            ..NewOrder::default()
        })
        .unwrap();
    assert_eq!(report.order.status, OrderStatus::Filled);
    assert_eq!(report.order.filled_quantity, dec!(2.5));

    let usdt = ex.accounts().balance(&buyer, "USDT");
    assert_eq!((usdt.free, usdt.locked), (dec!(250), Decimal::ZERO));
    assert_eq!(ex.accounts().balance(&buyer, "BTC").free, dec!(2.5));
}

#[test]
fn assets_are_conserved_across_matching() {
    let ex = exchange();
    let users = ["u1", "u2", "u3"];
    for user in users {
        ex.deposit(&user.to_string(), "USDT", dec!(10000)).unwrap();
        ex.deposit(&user.to_string(), "BTC", dec!(10)).unwrap();
    }

    ex.place_order(limit("u1", Side::Sell, dec!(2), dec!(100))).unwrap();
    ex.place_order(limit("u2", Side::Buy, dec!(1), dec!(100))).unwrap();
    ex.place_order(limit("u3", Side::Buy, dec!(3), dec!(101))).unwrap();
    ex.place_order(market("u2", Side::Sell, dec!(1))).unwrap();
    ex.place_order(limit_tif("u3", Side::Sell, dec!(2), dec!(99), TimeInForce::Ioc)).unwrap();

    let mut total_btc = Decimal::ZERO;
    let mut total_usdt = Decimal::ZERO;
    for user in users {
        let btc = ex.accounts().balance(&user.to_string(), "BTC");
        let usdt = ex.accounts().balance(&user.to_string(), "USDT");
        assert!(btc.free >= Decimal::ZERO && btc.locked >= Decimal::ZERO);
        assert!(usdt.free >= Decimal::ZERO && usdt.locked >= Decimal::ZERO);
        total_btc += btc.total();
        total_usdt += usdt.total();
    }
    // Zero fees: trading only moves assets between users.
    assert_eq!(total_btc, dec!(30));
    assert_eq!(total_usdt, dec!(30000));
}

#[test]
fn my_trades_shows_both_sides() {
    let ex = exchange();
    let a = "a".to_string();
    let b = "b".to_string();
    ex.deposit(&a, "USDT", dec!(1000)).unwrap();
    ex.deposit(&b, "BTC", dec!(1)).unwrap();
    ex.place_order(limit("a", Side::Buy, dec!(1), dec!(100))).unwrap();
    ex.place_order(limit("b", Side::Sell, dec!(1), dec!(100))).unwrap();

    let a_trades = ex.my_trades(&a, "BTCUSDT", 10).unwrap();
    let b_trades = ex.my_trades(&b, "BTCUSDT", 10).unwrap();
    assert_eq!(a_trades.len(), 1);
    assert_eq!(b_trades.len(), 1);
    assert_eq!(a_trades[0].trade_id, b_trades[0].trade_id);
}

#[test]
fn market_ticks_feed_klines() {
    let ex = exchange();
    ex.process_market_tick("BTCUSDT", dec!(100), Some(dec!(1))).unwrap();
    ex.time().advance(60.0);
    ex.process_market_tick("BTCUSDT", dec!(110), Some(dec!(2))).unwrap();

    let klines = ex.klines("BTCUSDT", Interval::M1, None, None, None).unwrap();
    assert_eq!(klines.len(), 2);
    assert_eq!(klines[0].close, dec!(100));
    assert_eq!(klines[1].open, dec!(110));

    let hourly = ex.klines("BTCUSDT", Interval::H1, None, None, None).unwrap();
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].high, dec!(110));
    assert_eq!(hourly[0].volume, dec!(3));
}

#[test]
fn event_timestamps_follow_the_virtual_clock() {
    let ex = exchange();
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let sink = stamps.clone();
    ex.bus().subscribe(
        "MARKET",
        Arc::new(move |event: &Event| {
            sink.lock().push(event.timestamp);
        }),
        SubscribeOptions::default(),
    );

    ex.process_market_tick("BTCUSDT", dec!(100), None).unwrap();
    ex.time().advance(1.0);
    ex.process_market_tick("BTCUSDT", dec!(101), None).unwrap();
    settle_bus(&ex);

    let stamps = stamps.lock().clone();
    assert_eq!(stamps.len(), 2);
    assert_eq!(stamps[1], stamps[0] + 1_000);
}
