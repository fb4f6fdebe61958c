//! Event bus contract: priority scheduling, subscriber ordering, isolation,
//! back-pressure, lifecycle and record retention.

use parking_lot::Mutex;
use simex::config::BusConfig;
use simex::events::{Event, EventBus, EventBusError, EventPriority, EventType, SubscribeOptions};
use simex::time::TimeManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn bus_with(config: BusConfig) -> (EventBus, Arc<TimeManager>) {
    let time = Arc::new(TimeManager::backtest(1_000));
    (EventBus::new(config, time.clone()), time)
}

fn bus() -> (EventBus, Arc<TimeManager>) {
    bus_with(BusConfig::default())
}

fn sink_handler(sink: &Arc<Mutex<Vec<String>>>, label: &str) -> simex::events::EventHandler {
    let sink = sink.clone();
    let label = label.to_string();
    Arc::new(move |event: &Event| {
        sink.lock().push(format!("{label}:{}", event.event_type.as_tag()));
    })
}

#[test]
fn publish_before_start_is_rejected() {
    let (bus, time) = bus();
    let err = bus.publish(Event::system(EventType::SystemStart, &time)).unwrap_err();
    assert_eq!(err, EventBusError::Stopped);
}

#[test]
fn every_matching_handler_runs_exactly_once() {
    let (bus, time) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("MARKET", sink_handler(&sink, "exact"), SubscribeOptions::default());
    bus.subscribe("*", sink_handler(&sink, "wild"), SubscribeOptions::default());
    bus.subscribe("ORDER", sink_handler(&sink, "other"), SubscribeOptions::default());
    bus.start();

    bus.publish(Event::market("BTCUSDT", 1.into(), None, &time)).unwrap();
    assert!(bus.drain(Duration::from_secs(2)));

    let seen = sink.lock().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&"exact:MARKET".to_string()));
    assert!(seen.contains(&"wild:MARKET".to_string()));
    bus.stop();
}

#[test]
fn higher_priority_subscriber_runs_first() {
    let (bus, time) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        "MARKET",
        sink_handler(&sink, "normal"),
        SubscribeOptions {
            priority: EventPriority::Normal,
            async_handler: false,
        },
    );
    bus.subscribe(
        "MARKET",
        sink_handler(&sink, "high"),
        SubscribeOptions {
            priority: EventPriority::High,
            async_handler: false,
        },
    );
    bus.start();
    bus.publish(Event::market("BTCUSDT", 1.into(), None, &time)).unwrap();
    assert!(bus.drain(Duration::from_secs(2)));

    assert_eq!(sink.lock().clone(), vec!["high:MARKET", "normal:MARKET"]);
    bus.stop();
}

#[test]
fn queued_events_respect_priority_then_fifo() {
    let (bus, time) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("*", sink_handler(&sink, "s"), SubscribeOptions::default());
    bus.start();
    bus.pause();

    bus.publish(Event::system(EventType::DataStart, &time).with_priority(EventPriority::Low))
        .unwrap();
    bus.publish(Event::system(EventType::DataEnd, &time).with_priority(EventPriority::Low))
        .unwrap();
    bus.publish(Event::system(EventType::SystemError, &time)) // CRITICAL by default
        .unwrap();
    bus.resume();
    assert!(bus.drain(Duration::from_secs(2)));

    assert_eq!(
        sink.lock().clone(),
        vec!["s:SYSTEM_ERROR", "s:DATA_START", "s:DATA_END"]
    );
    bus.stop();
}

#[test]
fn same_priority_is_fifo_in_publish_order() {
    let (bus, time) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("*", sink_handler(&sink, "s"), SubscribeOptions::default());
    bus.start();
    bus.pause();
    bus.publish(Event::market("BTCUSDT", 1.into(), None, &time)).unwrap();
    bus.publish(Event::system(EventType::Order, &time)).unwrap();
    bus.resume();
    assert!(bus.drain(Duration::from_secs(2)));
    assert_eq!(sink.lock().clone(), vec!["s:MARKET", "s:ORDER"]);
    bus.stop();
}

#[test]
fn failing_handler_does_not_poison_others() {
    let (bus, time) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        "MARKET",
        Arc::new(|_event: &Event| panic!("boom")),
        SubscribeOptions {
            priority: EventPriority::High,
            async_handler: false,
        },
    );
    bus.subscribe("MARKET", sink_handler(&sink, "ok"), SubscribeOptions::default());
    bus.start();
    let id = bus
        .publish(Event::market("BTCUSDT", 1.into(), None, &time))
        .unwrap();
    assert!(bus.drain(Duration::from_secs(2)));

    assert_eq!(sink.lock().clone(), vec!["ok:MARKET"]);
    let stats = bus.stats();
    assert_eq!(stats.events_failed, 1);
    assert_eq!(stats.events_processed, 1);
    let record = bus.record(&id).unwrap();
    assert_eq!(record.error_count, 1);
    assert!(record.last_error.is_some());
    bus.stop();
}

#[test]
fn saturated_queue_rejects_with_backpressure() {
    let (bus, time) = bus_with(BusConfig {
        max_queue_size: 2,
        async_workers: 1,
    });
    bus.start();
    bus.pause();
    bus.publish(Event::system(EventType::TimeTick, &time)).unwrap();
    bus.publish(Event::system(EventType::TimeTick, &time)).unwrap();
    let err = bus.publish(Event::system(EventType::TimeTick, &time)).unwrap_err();
    assert_eq!(err, EventBusError::Saturated);
    bus.resume();
    bus.stop();
}

#[test]
fn unsubscribe_stops_delivery() {
    let (bus, time) = bus();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let id = bus.subscribe("MARKET", sink_handler(&sink, "s"), SubscribeOptions::default());
    bus.start();
    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));
    bus.publish(Event::market("BTCUSDT", 1.into(), None, &time)).unwrap();
    assert!(bus.drain(Duration::from_secs(2)));
    assert!(sink.lock().is_empty());
    bus.stop();
}

#[test]
fn async_handlers_run_on_the_pool() {
    let (bus, time) = bus();
    let counter = Arc::new(AtomicU64::new(0));
    let handle = counter.clone();
    bus.subscribe(
        "MARKET",
        Arc::new(move |_event: &Event| {
            handle.fetch_add(1, Ordering::SeqCst);
        }),
        SubscribeOptions {
            priority: EventPriority::Normal,
            async_handler: true,
        },
    );
    bus.start();
    for _ in 0..10 {
        bus.publish(Event::market("BTCUSDT", 1.into(), None, &time)).unwrap();
    }
    assert!(bus.drain(Duration::from_secs(2)));
    // Jobs are handed to the pool; give them a moment to finish.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while counter.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    bus.stop();
}

#[test]
fn stop_rejects_further_publishes() {
    let (bus, time) = bus();
    bus.start();
    bus.publish(Event::system(EventType::SystemStart, &time)).unwrap();
    bus.stop();
    let err = bus.publish(Event::system(EventType::SystemStop, &time)).unwrap_err();
    assert_eq!(err, EventBusError::Stopped);
}

#[test]
fn stats_track_published_and_subscribers() {
    let (bus, time) = bus();
    bus.subscribe("*", Arc::new(|_e: &Event| {}), SubscribeOptions::default());
    bus.start();
    for _ in 0..5 {
        bus.publish(Event::system(EventType::TimeTick, &time)).unwrap();
    }
    assert!(bus.drain(Duration::from_secs(2)));
    let stats = bus.stats();
    assert_eq!(stats.events_published, 5);
    assert_eq!(stats.events_processed, 5);
    assert_eq!(stats.subscriber_count, 1);
    assert_eq!(stats.queue_size, 0);
    bus.stop();
}

#[test]
fn record_map_is_bounded_with_hysteresis() {
    let (bus, time) = bus_with(BusConfig {
        max_queue_size: 50_000,
        async_workers: 1,
    });
    bus.start();
    let first = bus.publish(Event::system(EventType::TimeTick, &time)).unwrap();
    let mut last = String::new();
    for _ in 0..12_000 {
        last = bus.publish(Event::system(EventType::TimeTick, &time)).unwrap();
    }
    assert!(bus.drain(Duration::from_secs(5)));

    assert!(bus.record_count() <= 10_000);
    assert!(bus.record_count() >= 8_000);
    assert!(bus.record(&first).is_none(), "oldest record should be evicted");
    assert!(bus.record(&last).is_some(), "newest record should be retained");
    bus.stop();
}
