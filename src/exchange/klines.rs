//! OHLCV candle aggregation per (symbol, interval).
//!
//! Fed synchronously by the facade on every trade and market tick so that
//! backtests produce deterministic candles. Bounded retention per series.

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::str::FromStr;

/// Retained buckets per (symbol, interval) series.
const SERIES_CAP: usize = 5_000;
/// Default number of buckets a query returns.
pub const DEFAULT_KLINE_LIMIT: usize = 500;
/// Hard bound on buckets a query returns.
pub const MAX_KLINE_LIMIT: usize = 1_000;

/// Supported candle intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Interval {
    pub const ALL: [Interval; 7] = [
        Interval::M1,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H4,
        Interval::D1,
    ];

    /// Bucket width in milliseconds.
    #[must_use]
    pub fn millis(self) -> u64 {
        match self {
            Interval::M1 => 60_000,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::M30 => 1_800_000,
            Interval::H1 => 3_600_000,
            Interval::H4 => 14_400_000,
            Interval::D1 => 86_400_000,
        }
    }

    /// Wire name (`1m`, `1h`, ...), as used in REST params and stream names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1d",
        }
    }
}

impl FromStr for Interval {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::M1),
            "5m" => Ok(Interval::M5),
            "15m" => Ok(Interval::M15),
            "30m" => Ok(Interval::M30),
            "1h" => Ok(Interval::H1),
            "4h" => Ok(Interval::H4),
            "1d" => Ok(Interval::D1),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One OHLCV bucket.
#[derive(Debug, Clone, Serialize)]
pub struct Kline {
    #[serde(rename = "openTime")]
    pub open_time: u64,
    #[serde(rename = "closeTime")]
    pub close_time: u64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Base-asset volume.
    pub volume: Decimal,
    /// Quote-asset volume (Σ price × qty).
    #[serde(rename = "quoteVolume")]
    pub quote_volume: Decimal,
    #[serde(rename = "trades")]
    pub trade_count: u64,
}

impl Kline {
    fn new(open_time: u64, close_time: u64, price: Decimal, qty: Decimal) -> Self {
        Self {
            open_time,
            close_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: qty,
            quote_volume: price * qty,
            trade_count: 1,
        }
    }

    fn absorb(&mut self, price: Decimal, qty: Decimal) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += qty;
        self.quote_volume += price * qty;
        self.trade_count += 1;
    }

    /// Binance-wire representation: a positional array with decimal strings.
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!([
            self.open_time,
            self.open.to_string(),
            self.high.to_string(),
            self.low.to_string(),
            self.close.to_string(),
            self.volume.to_string(),
            self.close_time,
            self.quote_volume.to_string(),
            self.trade_count,
        ])
    }
}

#[derive(Default)]
struct KlineSeries {
    buckets: VecDeque<Kline>,
}

impl KlineSeries {
    fn record(&mut self, interval: Interval, timestamp: u64, price: Decimal, qty: Decimal) {
        let width = interval.millis();
        let open_time = timestamp - timestamp % width;
        match self.buckets.back_mut() {
            Some(last) if last.open_time == open_time => last.absorb(price, qty),
            // Late data for an already-closed bucket folds into it rather
            // than opening a new one out of order.
            Some(last) if last.open_time > open_time => {
                if let Some(bucket) = self
                    .buckets
                    .iter_mut()
                    .rev()
                    .find(|b| b.open_time == open_time)
                {
                    bucket.absorb(price, qty);
                }
            }
            _ => {
                self.buckets
                    .push_back(Kline::new(open_time, open_time + width - 1, price, qty));
                if self.buckets.len() > SERIES_CAP {
                    self.buckets.pop_front();
                }
            }
        }
    }

    fn query(&self, start: Option<u64>, end: Option<u64>, limit: usize) -> Vec<Kline> {
        let mut out: Vec<Kline> = self
            .buckets
            .iter()
            .filter(|k| start.is_none_or(|s| k.open_time >= s))
            .filter(|k| end.is_none_or(|e| k.open_time <= e))
            .cloned()
            .collect();
        let skip = out.len().saturating_sub(limit);
        out.drain(..skip);
        out
    }
}

/// Candle store for every symbol and interval.
#[derive(Default)]
pub struct KlineManager {
    series: DashMap<(String, Interval), Mutex<KlineSeries>>,
}

impl KlineManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one trade (or tick) into every interval series of the symbol.
    pub fn record(&self, symbol: &str, price: Decimal, qty: Decimal, timestamp: u64) {
        for interval in Interval::ALL {
            let key = (symbol.to_string(), interval);
            let series = self.series.entry(key).or_default();
            series.lock().record(interval, timestamp, price, qty);
        }
    }

    /// Buckets for a (symbol, interval), oldest first, bounded by `limit`
    /// (clamped to [`MAX_KLINE_LIMIT`]).
    #[must_use]
    pub fn query(
        &self,
        symbol: &str,
        interval: Interval,
        start: Option<u64>,
        end: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<Kline> {
        let limit = limit.unwrap_or(DEFAULT_KLINE_LIMIT).min(MAX_KLINE_LIMIT);
        self.series
            .get(&(symbol.to_string(), interval))
            .map(|s| s.lock().query(start, end, limit))
            .unwrap_or_default()
    }

    /// The in-progress bucket for a (symbol, interval), if any.
    #[must_use]
    pub fn current(&self, symbol: &str, interval: Interval) -> Option<Kline> {
        self.series
            .get(&(symbol.to_string(), interval))
            .and_then(|s| s.lock().buckets.back().cloned())
    }
}
