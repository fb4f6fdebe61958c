//! Per-asset balance with free / locked partitioning.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One asset's balance: `free` is spendable, `locked` is reserved against
/// live orders. Both are non-negative at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
}

impl AssetBalance {
    /// Total holding (free + locked).
    #[must_use]
    #[inline]
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }

    #[must_use]
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.free.is_zero() && self.locked.is_zero()
    }
}

/// Owned snapshot of one (asset, balance) pair, the stable shape used by
/// account queries, ACCOUNT events and the REST surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}
