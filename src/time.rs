//! Process clock abstraction for live trading and backtests.
//!
//! Every timestamp inside the exchange (event stamps, order create/update
//! times, recvWindow checks, kline buckets) is read from a [`TimeManager`]
//! handle, never from the host clock directly. In [`TimeMode::Live`] the
//! manager forwards to the host clock; in [`TimeMode::Backtest`] it serves a
//! virtual timestamp that only moves through [`TimeManager::advance`] /
//! [`TimeManager::set_virtual_time`], optionally interpolated against real
//! elapsed time by a speed factor.
//!
//! Reads are O(1) and never tear across the ms/ns boundary: backtest state is
//! published through a seqlock (sequence word plus plain atomic payload
//! words), so a reader either sees a consistent anchor or retries.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Clock mode: host time or controlled virtual time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TimeMode {
    /// Host wall clock. Backtest-only mutators are warned no-ops.
    Live,
    /// Virtual clock advanced explicitly by the backtest driver.
    Backtest,
}

impl std::fmt::Display for TimeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeMode::Live => write!(f, "LIVE"),
            TimeMode::Backtest => write!(f, "BACKTEST"),
        }
    }
}

const MODE_LIVE: u8 = 0;
const MODE_BACKTEST: u8 = 1;

/// Single source of "now" for the whole process.
///
/// One instance is created at startup and shared as `Arc<TimeManager>`; the
/// clock semantics are global but the handle is injected explicitly.
///
/// Thread-safety: reads are lock-free in both modes; all mutators serialize
/// on an internal writer lock and publish through the seqlock sequence.
pub struct TimeManager {
    mode: AtomicU8,
    /// Seqlock sequence. Odd while a writer is mid-update.
    seq: AtomicU64,
    /// Virtual anchor timestamp in ms (backtest mode).
    virtual_ms: AtomicU64,
    /// Real elapsed ns since `origin` at the moment the anchor was written.
    anchor_real_ns: AtomicU64,
    /// Speed factor bits (f64). 1.0 disables interpolation.
    speed_bits: AtomicU64,
    /// Serializes writers; readers never take it.
    write_lock: Mutex<()>,
    /// Monotonic reference captured at construction.
    origin: Instant,
}

impl TimeManager {
    /// Create a manager in the given mode with virtual time at 0 ms.
    pub fn new(mode: TimeMode) -> Self {
        Self {
            mode: AtomicU8::new(match mode {
                TimeMode::Live => MODE_LIVE,
                TimeMode::Backtest => MODE_BACKTEST,
            }),
            seq: AtomicU64::new(0),
            virtual_ms: AtomicU64::new(0),
            anchor_real_ns: AtomicU64::new(0),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            write_lock: Mutex::new(()),
            origin: Instant::now(),
        }
    }

    /// Create a live-mode manager.
    pub fn live() -> Self {
        Self::new(TimeMode::Live)
    }

    /// Create a backtest-mode manager starting at `start_ms`.
    pub fn backtest(start_ms: u64) -> Self {
        let tm = Self::new(TimeMode::Backtest);
        tm.set_virtual_time(start_ms);
        tm
    }

    /// Current clock mode.
    #[must_use]
    pub fn mode(&self) -> TimeMode {
        match self.mode.load(Ordering::Acquire) {
            MODE_BACKTEST => TimeMode::Backtest,
            _ => TimeMode::Live,
        }
    }

    /// Switch mode. Entering backtest re-anchors the virtual clock so a
    /// non-unit speed factor does not credit wall time spent in live mode.
    pub fn set_mode(&self, mode: TimeMode) {
        let _guard = self.write_lock.lock();
        if mode == TimeMode::Backtest {
            let v = self.virtual_ms.load(Ordering::Relaxed);
            self.write_anchor(v, self.real_elapsed_ns());
        }
        self.mode.store(
            match mode {
                TimeMode::Live => MODE_LIVE,
                TimeMode::Backtest => MODE_BACKTEST,
            },
            Ordering::Release,
        );
    }

    /// Current time in milliseconds since the Unix epoch (live) or since the
    /// virtual origin (backtest).
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        match self.mode() {
            TimeMode::Live => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            TimeMode::Backtest => self.virtual_now_ms(),
        }
    }

    /// Current time in nanoseconds. In backtest mode this is derived from the
    /// same ms read as [`Self::now_ms`], so the two never disagree.
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        match self.mode() {
            TimeMode::Live => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            TimeMode::Backtest => self.virtual_now_ms().saturating_mul(1_000_000),
        }
    }

    /// Current time as an [`Instant`]. In backtest mode the instant is
    /// synthetic: the construction-time origin offset by the virtual clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        match self.mode() {
            TimeMode::Live => Instant::now(),
            TimeMode::Backtest => self.origin + Duration::from_millis(self.virtual_now_ms()),
        }
    }

    /// Replace the virtual timestamp. Backtest only; warned no-op in live.
    pub fn set_virtual_time(&self, timestamp_ms: u64) {
        if self.mode() != TimeMode::Backtest {
            warn!("set_virtual_time ignored: clock is in LIVE mode");
            return;
        }
        let _guard = self.write_lock.lock();
        self.write_anchor(timestamp_ms, self.real_elapsed_ns());
    }

    /// Advance the virtual clock by `delta_seconds`. Backtest only; warned
    /// no-op in live. Negative deltas are ignored: virtual time never moves
    /// backward within a mode.
    pub fn advance(&self, delta_seconds: f64) {
        if self.mode() != TimeMode::Backtest {
            warn!("advance ignored: clock is in LIVE mode");
            return;
        }
        if delta_seconds < 0.0 || !delta_seconds.is_finite() {
            warn!(delta_seconds, "advance ignored: delta must be non-negative");
            return;
        }
        let delta_ms = (delta_seconds * 1000.0).round() as u64;
        let _guard = self.write_lock.lock();
        // Fold any speed-interpolated progress into the anchor first so the
        // jump is relative to what readers currently observe.
        let current = self.virtual_now_ms();
        self.write_anchor(current.saturating_add(delta_ms), self.real_elapsed_ns());
    }

    /// Set the speed factor used to interpolate virtual time against real
    /// elapsed time between explicit advances. Backtest only. Non-positive or
    /// non-finite factors are ignored.
    pub fn set_speed(&self, factor: f64) {
        if self.mode() != TimeMode::Backtest {
            warn!("set_speed ignored: clock is in LIVE mode");
            return;
        }
        if factor <= 0.0 || !factor.is_finite() {
            warn!(factor, "set_speed ignored: factor must be positive");
            return;
        }
        let _guard = self.write_lock.lock();
        // Re-anchor at the currently observed time so switching factors is
        // continuous.
        let current = self.virtual_now_ms();
        let elapsed = self.real_elapsed_ns();
        let odd = self.seq.fetch_add(1, Ordering::AcqRel);
        debug_assert!(odd % 2 == 0);
        self.virtual_ms.store(current, Ordering::Relaxed);
        self.anchor_real_ns.store(elapsed, Ordering::Relaxed);
        self.speed_bits.store(factor.to_bits(), Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Current speed factor (1.0 unless changed in backtest mode).
    #[must_use]
    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    fn real_elapsed_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    /// Publish a new anchor. Caller must hold `write_lock`.
    fn write_anchor(&self, virtual_ms: u64, anchor_real_ns: u64) {
        let odd = self.seq.fetch_add(1, Ordering::AcqRel);
        debug_assert!(odd % 2 == 0);
        self.virtual_ms.store(virtual_ms, Ordering::Relaxed);
        self.anchor_real_ns.store(anchor_real_ns, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Consistent virtual read through the seqlock.
    fn virtual_now_ms(&self) -> u64 {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let base = self.virtual_ms.load(Ordering::Relaxed);
            let anchor = self.anchor_real_ns.load(Ordering::Relaxed);
            let speed = f64::from_bits(self.speed_bits.load(Ordering::Relaxed));
            let s2 = self.seq.load(Ordering::Acquire);
            if s1 != s2 {
                continue;
            }
            if speed == 1.0 {
                return base;
            }
            let elapsed_ns = self.real_elapsed_ns().saturating_sub(anchor);
            let extra_ms = (elapsed_ns as f64 / 1_000_000.0) * speed;
            return base.saturating_add(extra_ms as u64);
        }
    }
}

impl std::fmt::Debug for TimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeManager")
            .field("mode", &self.mode())
            .field("now_ms", &self.now_ms())
            .field("speed", &self.speed())
            .finish()
    }
}
