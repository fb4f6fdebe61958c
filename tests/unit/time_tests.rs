//! Clock laws: virtual time round-trips, advancement, mode discipline.

use simex::time::{TimeManager, TimeMode};
use std::sync::Arc;

#[test]
fn set_then_read_round_trip() {
    let tm = TimeManager::backtest(0);
    tm.set_virtual_time(1_650_000_000_000);
    assert_eq!(tm.now_ms(), 1_650_000_000_000);
}

#[test]
fn advance_rounds_to_millis() {
    let tm = TimeManager::backtest(1_000_000);
    tm.advance(2.5);
    assert_eq!(tm.now_ms(), 1_002_500);
    tm.advance(0.0011);
    assert_eq!(tm.now_ms(), 1_002_501);
}

#[test]
fn live_mode_ignores_virtual_mutators() {
    let tm = TimeManager::new(TimeMode::Live);
    let before = tm.now_ms();
    tm.set_virtual_time(1);
    tm.advance(1000.0);
    assert!(tm.now_ms() >= before);
    assert_eq!(tm.mode(), TimeMode::Live);
}

#[test]
fn ns_is_derived_from_ms_in_backtest() {
    let tm = TimeManager::backtest(77);
    assert_eq!(tm.now_ns(), 77 * 1_000_000);
}

#[test]
fn readers_see_monotonic_time_under_advances() {
    let tm = Arc::new(TimeManager::backtest(0));
    let writer = {
        let tm = tm.clone();
        std::thread::spawn(move || {
            for _ in 0..5_000 {
                tm.advance(0.001);
            }
        })
    };
    let reader = {
        let tm = tm.clone();
        std::thread::spawn(move || {
            let mut last = 0;
            for _ in 0..5_000 {
                let now = tm.now_ms();
                assert!(now >= last, "clock went backward: {last} -> {now}");
                last = now;
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(tm.now_ms(), 5_000);
}
