//! Priority-ordered, cancellable pub/sub event bus.
//!
//! One dispatcher thread pops events from a bounded priority queue (strict
//! priority, FIFO within a class) and invokes every matching subscription:
//! sync handlers inline, async-flagged handlers on a crossbeam-channel
//! worker pool. Handler panics are caught, counted and isolated; a failing
//! handler never prevents the others from running.
//!
//! The bus also keeps a bounded map of recent events for introspection and
//! per-handler error/runtime accounting.

use super::types::{Event, EventPriority};
use crate::config::BusConfig;
use crate::time::TimeManager;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Cap on the introspection record map.
const MAX_EVENT_RECORDS: usize = 10_000;
/// When over cap, trim down to this share of the cap (hysteresis).
const RECORD_TRIM_RATIO: f64 = 0.8;
/// How long `stop()` waits for workers before abandoning them.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscriber callback. Sync handlers run on the dispatcher thread and must
/// not block; async handlers run on the worker pool.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

/// Publish-side failures. The bus never retries; policy lives with the
/// caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    /// Queue is at `max_queue_size`; the caller decides whether to retry,
    /// drop or log.
    #[error("event bus queue is saturated")]
    Saturated,
    /// The bus is not running (not started yet, or stopped).
    #[error("event bus is stopped")]
    Stopped,
}

/// Options for a subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Ordering among subscribers of the same event: smaller runs earlier.
    pub priority: EventPriority,
    /// Run on the worker pool instead of the dispatcher thread.
    pub async_handler: bool,
}

/// Bus counters exposed by [`EventBus::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub subscriber_count: usize,
    pub queue_size: usize,
    pub uptime_ms: u64,
    pub avg_processing_time_us: f64,
}

/// Per-handler accounting: error counts and cumulative runtime per
/// subscription.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerStats {
    pub invocations: u64,
    pub failures: u64,
    pub total_runtime_us: u64,
}

/// Introspection record for one published event.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub created_at: u64,
    pub processed_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_processed: Option<u64>,
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
    priority: EventPriority,
    async_handler: bool,
    /// Registration order; ties within a priority break oldest-first.
    seq: u64,
}

/// Heap entry: strict priority, then publish order. `BinaryHeap` pops the
/// maximum, so the ordering is reversed to pop the smallest key.
struct QueuedEvent {
    priority: EventPriority,
    seq: u64,
    event: Event,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedEvent {}
impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

type Job = (EventHandler, Arc<Event>, SubscriptionId);

struct BusShared {
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    condvar: Condvar,
    /// tag (or `"*"`) → subscriptions.
    subscriptions: DashMap<String, Vec<Subscription>>,
    /// subscription id → tag, for unsubscribe.
    subscription_tags: DashMap<SubscriptionId, String>,
    handler_stats: DashMap<SubscriptionId, HandlerStats>,
    records: DashMap<String, EventRecord>,
    /// Insertion order of record ids; eviction is oldest-first.
    record_log: Mutex<VecDeque<String>>,
    running: AtomicBool,
    paused: AtomicBool,
    stopping: AtomicBool,
    max_queue_size: usize,
    publish_seq: AtomicU64,
    next_subscription_id: AtomicU64,
    events_published: AtomicU64,
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    processing_ns_total: AtomicU64,
    started_at_ms: AtomicU64,
    worker_tx: Mutex<Option<crossbeam::channel::Sender<Job>>>,
    time: Arc<TimeManager>,
}

/// The event bus. Cheap to clone handles via `Arc<EventBus>`.
pub struct EventBus {
    shared: Arc<BusShared>,
    async_workers: usize,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: BusConfig, time: Arc<TimeManager>) -> Self {
        Self {
            shared: Arc::new(BusShared {
                queue: Mutex::new(BinaryHeap::new()),
                condvar: Condvar::new(),
                subscriptions: DashMap::new(),
                subscription_tags: DashMap::new(),
                handler_stats: DashMap::new(),
                records: DashMap::new(),
                record_log: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                max_queue_size: config.max_queue_size,
                publish_seq: AtomicU64::new(0),
                next_subscription_id: AtomicU64::new(1),
                events_published: AtomicU64::new(0),
                events_processed: AtomicU64::new(0),
                events_failed: AtomicU64::new(0),
                processing_ns_total: AtomicU64::new(0),
                started_at_ms: AtomicU64::new(0),
                worker_tx: Mutex::new(None),
                time,
            }),
            async_workers: config.async_workers.max(1),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler for an event tag, or `"*"` for every event.
    pub fn subscribe(
        &self,
        event_type: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = self.shared.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription {
            id,
            handler,
            priority: options.priority,
            async_handler: options.async_handler,
            seq: id,
        };
        self.shared
            .subscriptions
            .entry(event_type.to_string())
            .or_default()
            .push(subscription);
        self.shared
            .subscription_tags
            .insert(id, event_type.to_string());
        debug!(tag = event_type, subscription_id = id, "subscribed");
        id
    }

    /// Remove a subscription. Returns `false` when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((_, tag)) = self.shared.subscription_tags.remove(&id) else {
            return false;
        };
        if let Some(mut subs) = self.shared.subscriptions.get_mut(&tag) {
            subs.retain(|s| s.id != id);
        }
        self.shared.handler_stats.remove(&id);
        debug!(subscription_id = id, "unsubscribed");
        true
    }

    /// Enqueue an event. Non-blocking: a saturated queue or a stopped bus is
    /// reported to the publisher, never retried internally.
    pub fn publish(&self, event: Event) -> Result<String, EventBusError> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) || shared.stopping.load(Ordering::Acquire) {
            return Err(EventBusError::Stopped);
        }

        let event_id = event.id.clone();
        {
            let mut queue = shared.queue.lock();
            if queue.len() >= shared.max_queue_size {
                warn!(event_id, "publish rejected: queue saturated");
                return Err(EventBusError::Saturated);
            }
            let seq = shared.publish_seq.fetch_add(1, Ordering::Relaxed);
            shared.record_event(&event);
            queue.push(QueuedEvent {
                priority: event.priority,
                seq,
                event,
            });
        }
        shared.condvar.notify_all();
        shared.events_published.fetch_add(1, Ordering::Relaxed);
        Ok(event_id)
    }

    /// Spawn the dispatcher and worker pool. Returns `false` if already
    /// running.
    pub fn start(&self) -> bool {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::AcqRel) {
            warn!("event bus already running");
            return false;
        }
        shared.stopping.store(false, Ordering::Release);
        shared
            .started_at_ms
            .store(shared.time.now_ms(), Ordering::Relaxed);

        let (tx, rx) = crossbeam::channel::unbounded::<Job>();
        *shared.worker_tx.lock() = Some(tx);

        let mut threads = self.threads.lock();
        for worker in 0..self.async_workers {
            let rx = rx.clone();
            let shared = Arc::clone(shared);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("bus-worker-{worker}"))
                    .spawn(move || {
                        while let Ok((handler, event, sub_id)) = rx.recv() {
                            shared.run_handler(&handler, &event, sub_id);
                        }
                    })
                    .expect("spawn bus worker"),
            );
        }
        {
            let shared = Arc::clone(shared);
            threads.push(
                std::thread::Builder::new()
                    .name("bus-dispatch".to_string())
                    .spawn(move || shared.dispatch_loop())
                    .expect("spawn bus dispatcher"),
            );
        }
        info!(workers = self.async_workers, "event bus started");
        true
    }

    /// Stop the bus: reject further publishes, wake the dispatcher, finish
    /// the in-flight delivery and join with a bounded timeout. Outstanding
    /// async jobs past the timeout are abandoned.
    pub fn stop(&self) {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        shared.stopping.store(true, Ordering::Release);
        shared.paused.store(false, Ordering::Release);
        shared.condvar.notify_all();
        // Closing the channel lets workers drain and exit.
        *shared.worker_tx.lock() = None;

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let (done_tx, done_rx) = crossbeam::channel::bounded::<()>(1);
        std::thread::spawn(move || {
            for handle in threads {
                let _ = handle.join();
            }
            let _ = done_tx.send(());
        });
        if done_rx.recv_timeout(STOP_JOIN_TIMEOUT).is_err() {
            warn!("event bus stop timed out; abandoning outstanding handlers");
        }
        info!("event bus stopped");
    }

    /// Suspend delivery; queued and newly published events wait.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        debug!("event bus paused");
    }

    /// Resume delivery.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.condvar.notify_all();
        debug!("event bus resumed");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let shared = &self.shared;
        let processed = shared.events_processed.load(Ordering::Relaxed);
        let total_ns = shared.processing_ns_total.load(Ordering::Relaxed);
        let started = shared.started_at_ms.load(Ordering::Relaxed);
        BusStats {
            events_published: shared.events_published.load(Ordering::Relaxed),
            events_processed: processed,
            events_failed: shared.events_failed.load(Ordering::Relaxed),
            subscriber_count: shared.subscription_tags.len(),
            queue_size: shared.queue.lock().len(),
            uptime_ms: if started == 0 {
                0
            } else {
                shared.time.now_ms().saturating_sub(started)
            },
            avg_processing_time_us: if processed == 0 {
                0.0
            } else {
                (total_ns as f64 / processed as f64) / 1_000.0
            },
        }
    }

    /// Per-subscription error and runtime accounting.
    #[must_use]
    pub fn handler_stats(&self, id: SubscriptionId) -> Option<HandlerStats> {
        self.shared.handler_stats.get(&id).map(|s| s.clone())
    }

    /// Introspection record for a published event, if still retained.
    #[must_use]
    pub fn record(&self, event_id: &str) -> Option<EventRecord> {
        self.shared.records.get(event_id).map(|r| r.clone())
    }

    /// Number of retained event records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.shared.records.len()
    }

    /// Block until the queue is empty and the dispatcher is idle, bounded by
    /// `timeout`. Test and shutdown helper.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let queued = self.shared.queue.lock().len();
            let processed = self.shared.events_processed.load(Ordering::Relaxed);
            let published = self.shared.events_published.load(Ordering::Relaxed);
            if queued == 0 && processed >= published {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl BusShared {
    fn dispatch_loop(self: Arc<Self>) {
        debug!("dispatcher running");
        loop {
            let item = {
                let mut queue = self.queue.lock();
                loop {
                    if self.stopping.load(Ordering::Acquire) {
                        return;
                    }
                    if !self.paused.load(Ordering::Acquire)
                        && let Some(item) = queue.pop()
                    {
                        break item;
                    }
                    self.condvar.wait(&mut queue);
                }
            };
            self.deliver(item.event);
        }
    }

    /// Invoke every matching subscription for one event, ordered by
    /// subscriber priority then registration age.
    fn deliver(&self, event: Event) {
        let tag = event.event_type.as_tag().to_string();
        let mut subs: Vec<Subscription> = Vec::new();
        if let Some(exact) = self.subscriptions.get(&tag) {
            subs.extend(exact.iter().cloned());
        }
        if let Some(wildcard) = self.subscriptions.get("*") {
            subs.extend(wildcard.iter().cloned());
        }
        subs.sort_by_key(|s| (s.priority, s.seq));

        let started = Instant::now();
        let shared_event = Arc::new(event);
        for sub in subs {
            if sub.async_handler {
                let tx = self.worker_tx.lock().clone();
                if let Some(tx) = tx {
                    let _ = tx.send((sub.handler.clone(), Arc::clone(&shared_event), sub.id));
                }
            } else {
                self.run_handler(&sub.handler, &shared_event, sub.id);
            }
        }

        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.processing_ns_total
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        if let Some(mut record) = self.records.get_mut(&shared_event.id) {
            record.processed_count += 1;
            record.last_processed = Some(self.time.now_ms());
        }
    }

    /// Run one handler, isolating panics.
    fn run_handler(&self, handler: &EventHandler, event: &Event, sub_id: SubscriptionId) {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
        let elapsed_us = started.elapsed().as_micros() as u64;

        let mut stats = self.handler_stats.entry(sub_id).or_default();
        stats.invocations += 1;
        stats.total_runtime_us += elapsed_us;

        if let Err(panic) = outcome {
            stats.failures += 1;
            drop(stats);
            self.events_failed.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(&panic);
            error!(
                event_id = event.id,
                subscription_id = sub_id,
                "handler panicked: {message}"
            );
            if let Some(mut record) = self.records.get_mut(&event.id) {
                record.error_count += 1;
                record.last_error = Some(message);
            }
        }
    }

    /// Insert an introspection record, evicting oldest-first past the cap
    /// with hysteresis (trim to 80 % of the cap).
    fn record_event(&self, event: &Event) {
        self.records.insert(
            event.id.clone(),
            EventRecord {
                event_id: event.id.clone(),
                event_type: event.event_type.as_tag().to_string(),
                created_at: event.timestamp,
                processed_count: 0,
                error_count: 0,
                last_error: None,
                last_processed: None,
            },
        );
        let mut log = self.record_log.lock();
        log.push_back(event.id.clone());
        if log.len() > MAX_EVENT_RECORDS {
            let target = (MAX_EVENT_RECORDS as f64 * RECORD_TRIM_RATIO) as usize;
            while log.len() > target {
                if let Some(old) = log.pop_front() {
                    self.records.remove(&old);
                }
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
