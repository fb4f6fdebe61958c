//! Exchange facade, fee policy and kline aggregation.

mod facade;
mod fees;
mod klines;

pub use facade::{Exchange, ExchangeError};
pub use fees::{FeePolicy, FeeSchedule, LiquidityRole, round_commission};
pub use klines::{DEFAULT_KLINE_LIMIT, Interval, Kline, KlineManager, MAX_KLINE_LIMIT};
