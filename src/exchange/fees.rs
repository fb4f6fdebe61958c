//! Trading fee policy.
//!
//! Fees are a facade concern: the matching engine only asks a pure function
//! for the commissions of a fill. Commissions are always deducted from the
//! asset the party receives, rounded away from zero at that asset's
//! precision, and never added to locked funds.

use crate::config::FeeConfig;
use crate::orderbook::order::Side;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Which side of the match a party was on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidityRole {
    /// Was resting on the book when the match occurred.
    Maker,
    /// Crossed the book.
    Taker,
}

/// Pluggable fee policy: `(side, role) → rate`.
pub trait FeePolicy: Send + Sync {
    fn rate(&self, side: Side, role: LiquidityRole) -> Decimal;
}

/// Flat maker/taker schedule, the default policy. Rates are fractions
/// (0.001 = 10 bps) and apply to the received asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

impl FeeSchedule {
    #[must_use]
    pub fn new(maker_rate: Decimal, taker_rate: Decimal) -> Self {
        Self {
            maker_rate,
            taker_rate,
        }
    }

    /// A schedule that charges nothing.
    #[must_use]
    pub fn zero() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.maker_rate.is_zero() && self.taker_rate.is_zero()
    }
}

impl From<FeeConfig> for FeeSchedule {
    fn from(cfg: FeeConfig) -> Self {
        Self::new(cfg.maker_rate, cfg.taker_rate)
    }
}

impl FeePolicy for FeeSchedule {
    fn rate(&self, _side: Side, role: LiquidityRole) -> Decimal {
        match role {
            LiquidityRole::Maker => self.maker_rate,
            LiquidityRole::Taker => self.taker_rate,
        }
    }
}

/// Round a commission to the receiving asset's precision, away from zero.
#[must_use]
pub fn round_commission(amount: Decimal, precision: u32) -> Decimal {
    amount.round_dp_with_strategy(precision, RoundingStrategy::AwayFromZero)
}
