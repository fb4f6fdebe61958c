//! Self-Trade Prevention (STP) decision logic.
//!
//! STP stops orders from the same user from matching against each other.
//! The policy travels on the incoming (taker) order; resting orders are
//! checked head-by-head as the match loop walks the opposite side.
//!
//! With `SelfTradePrevention::None` (the default) same-user orders match
//! freely and the check is a single comparison.

use super::order::{SelfTradePrevention, UserId};

/// What the match loop must do with the current resting head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StpAction {
    /// No conflict (different users, or STP disabled): match normally.
    Match,
    /// Expire the incoming remainder and stop matching. The resting order
    /// stays.
    ExpireTaker,
    /// Expire the resting head and continue matching against the next order.
    ExpireMaker,
    /// Expire both: the resting head leaves the book and the incoming
    /// remainder expires.
    ExpireBoth,
}

/// Decide the STP action for the resting queue head.
///
/// # Arguments
/// * `taker_user` — Owner of the incoming order.
/// * `maker_user` — Owner of the resting head.
/// * `policy` — The incoming order's STP policy.
#[must_use]
#[inline]
pub fn check_self_trade(
    taker_user: &UserId,
    maker_user: &UserId,
    policy: SelfTradePrevention,
) -> StpAction {
    if policy == SelfTradePrevention::None || taker_user != maker_user {
        return StpAction::Match;
    }
    match policy {
        SelfTradePrevention::None => StpAction::Match,
        SelfTradePrevention::ExpireTaker => StpAction::ExpireTaker,
        SelfTradePrevention::ExpireMaker => StpAction::ExpireMaker,
        SelfTradePrevention::ExpireBoth => StpAction::ExpireBoth,
    }
}
