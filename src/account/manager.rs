//! The asset ledger: per-user balances with free / locked partitioning,
//! atomic settlement of fills, and the API key table.
//!
//! Each user's balances live behind one lock, so a user's ledger moves
//! atomically: an operation either commits in full or leaves no trace.
//! Cross-user settlement locks both parties in ascending user-id order.

use super::balance::{AssetBalance, BalanceSnapshot};
use crate::config::SymbolConfig;
use crate::orderbook::order::{Side, UserId};
use crate::time::TimeManager;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// Ledger operation failures. No variant leaves partial state behind.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    /// Free balance cannot cover the requested amount.
    #[error("insufficient funds: user {user} needs {required} {asset}, free {available}")]
    InsufficientFunds {
        user: UserId,
        asset: String,
        required: Decimal,
        available: Decimal,
    },

    /// Locked balance cannot cover the requested amount. On the settlement
    /// path this means a fund lock went missing, which is an invariant
    /// breach upstream.
    #[error("insufficient locked funds: user {user} needs {required} {asset}, locked {available}")]
    InsufficientLocked {
        user: UserId,
        asset: String,
        required: Decimal,
        available: Decimal,
    },

    /// Amounts must be strictly positive.
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),
}

/// The exact funds reserved for an order, returned so the caller can release
/// the unused portion verbatim later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedFunds {
    pub asset: String,
    pub amount: Decimal,
}

/// Two-sided settlement instruction for one fill.
#[derive(Debug, Clone)]
pub struct TradeSettlement {
    pub buyer: UserId,
    pub seller: UserId,
    pub base_asset: String,
    pub quote_asset: String,
    /// Base quantity exchanged.
    pub base_qty: Decimal,
    /// Quote value exchanged (price × quantity).
    pub quote_qty: Decimal,
    /// Buyer commission, deducted from the base the buyer receives.
    pub commission_buyer: Decimal,
    /// Seller commission, deducted from the quote the seller receives.
    pub commission_seller: Decimal,
}

#[derive(Debug, Default)]
struct AccountState {
    balances: HashMap<String, AssetBalance>,
}

impl AccountState {
    fn entry(&mut self, asset: &str) -> &mut AssetBalance {
        self.balances.entry(asset.to_string()).or_default()
    }

    fn get(&self, asset: &str) -> AssetBalance {
        self.balances.get(asset).copied().unwrap_or_default()
    }
}

/// Per-user ledger plus the API key table. All primitives are atomic at the
/// per-user granularity.
pub struct AccountManager {
    accounts: DashMap<UserId, Arc<Mutex<AccountState>>>,
    api_keys: DashMap<String, UserId>,
    time: Arc<TimeManager>,
    key_seq: AtomicU64,
}

impl AccountManager {
    pub fn new(time: Arc<TimeManager>) -> Self {
        Self {
            accounts: DashMap::new(),
            api_keys: DashMap::new(),
            time,
            key_seq: AtomicU64::new(1),
        }
    }

    /// Credit free balance (external deposit).
    pub fn deposit(
        &self,
        user: &UserId,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), AccountError> {
        positive(amount)?;
        let handle = self.handle(user);
        let mut state = handle.lock();
        state.entry(asset).free += amount;
        debug!(%user, asset, %amount, "deposit");
        Ok(())
    }

    /// Debit free balance (external withdrawal).
    pub fn withdraw(
        &self,
        user: &UserId,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), AccountError> {
        positive(amount)?;
        let handle = self.handle(user);
        let mut state = handle.lock();
        let balance = state.entry(asset);
        if balance.free < amount {
            return Err(AccountError::InsufficientFunds {
                user: user.clone(),
                asset: asset.to_string(),
                required: amount,
                available: balance.free,
            });
        }
        balance.free -= amount;
        debug!(%user, asset, %amount, "withdraw");
        Ok(())
    }

    /// Move free → locked (reserve against a live order).
    pub fn lock(&self, user: &UserId, asset: &str, amount: Decimal) -> Result<(), AccountError> {
        positive(amount)?;
        let handle = self.handle(user);
        let mut state = handle.lock();
        let balance = state.entry(asset);
        if balance.free < amount {
            return Err(AccountError::InsufficientFunds {
                user: user.clone(),
                asset: asset.to_string(),
                required: amount,
                available: balance.free,
            });
        }
        balance.free -= amount;
        balance.locked += amount;
        trace!(%user, asset, %amount, "lock");
        Ok(())
    }

    /// Move locked → free (release an unused reservation).
    pub fn unlock(&self, user: &UserId, asset: &str, amount: Decimal) -> Result<(), AccountError> {
        positive(amount)?;
        let handle = self.handle(user);
        let mut state = handle.lock();
        let balance = state.entry(asset);
        if balance.locked < amount {
            return Err(AccountError::InsufficientLocked {
                user: user.clone(),
                asset: asset.to_string(),
                required: amount,
                available: balance.locked,
            });
        }
        balance.locked -= amount;
        balance.free += amount;
        trace!(%user, asset, %amount, "unlock");
        Ok(())
    }

    /// Remove locked funds from the account (the paying side of a fill).
    pub fn settle(&self, user: &UserId, asset: &str, amount: Decimal) -> Result<(), AccountError> {
        positive(amount)?;
        let handle = self.handle(user);
        let mut state = handle.lock();
        settle_inner(&mut state, user, asset, amount)
    }

    /// Add free funds (the receiving side of a fill).
    pub fn credit(&self, user: &UserId, asset: &str, amount: Decimal) -> Result<(), AccountError> {
        positive(amount)?;
        let handle = self.handle(user);
        let mut state = handle.lock();
        state.entry(asset).free += amount;
        trace!(%user, asset, %amount, "credit");
        Ok(())
    }

    /// Reserve the funds an order needs at admission and report exactly what
    /// was locked so it can be released verbatim later.
    ///
    /// BUY locks quote `qty × price × (1 + fee_rate)`; SELL locks base
    /// `qty`; a quote-quantified MARKET BUY locks the quote amount directly.
    /// For market buys by base quantity the caller passes its own reference
    /// price (typically the walked book cost over the quantity).
    pub fn lock_for_order(
        &self,
        user: &UserId,
        cfg: &SymbolConfig,
        side: Side,
        reference_price: Decimal,
        qty: Decimal,
        quote_qty: Option<Decimal>,
        fee_rate: Decimal,
    ) -> Result<LockedFunds, AccountError> {
        let (asset, amount) = match side {
            Side::Sell => (cfg.base_asset.clone(), qty),
            Side::Buy => match quote_qty {
                Some(quote) => (cfg.quote_asset.clone(), quote),
                None => (
                    cfg.quote_asset.clone(),
                    qty * reference_price * (Decimal::ONE + fee_rate),
                ),
            },
        };
        self.lock(user, &asset, amount)?;
        Ok(LockedFunds { asset, amount })
    }

    /// Apply the two-sided transaction for one fill: the seller's base
    /// leaves its lock and the quote proceeds (minus commission) are
    /// credited; the buyer's quote leaves its lock and the base (minus
    /// commission) is credited. Both users are locked in ascending user-id
    /// order; a self-trade locks once.
    pub fn settle_trade(&self, s: &TradeSettlement) -> Result<(), AccountError> {
        let seller_handle = self.handle(&s.seller);
        if s.buyer == s.seller {
            let mut state = seller_handle.lock();
            apply_seller(&mut state, s)?;
            apply_buyer(&mut state, s)?;
            return Ok(());
        }

        let buyer_handle = self.handle(&s.buyer);
        let (first, second, buyer_first) = if s.buyer < s.seller {
            (&buyer_handle, &seller_handle, true)
        } else {
            (&seller_handle, &buyer_handle, false)
        };
        let mut first_state = first.lock();
        let mut second_state = second.lock();
        let (buyer_state, seller_state) = if buyer_first {
            (&mut *first_state, &mut *second_state)
        } else {
            (&mut *second_state, &mut *first_state)
        };
        apply_seller(seller_state, s)?;
        apply_buyer(buyer_state, s)?;
        Ok(())
    }

    /// All non-zero balances of `user`, sorted by asset.
    #[must_use]
    pub fn balances(&self, user: &UserId) -> Vec<BalanceSnapshot> {
        let Some(handle) = self.accounts.get(user).map(|h| h.clone()) else {
            return Vec::new();
        };
        let state = handle.lock();
        let mut out: Vec<BalanceSnapshot> = state
            .balances
            .iter()
            .filter(|(_, b)| !b.is_zero())
            .map(|(asset, b)| BalanceSnapshot {
                asset: asset.clone(),
                free: b.free,
                locked: b.locked,
            })
            .collect();
        out.sort_by(|a, b| a.asset.cmp(&b.asset));
        out
    }

    /// One asset's balance for `user` (zero if the account or asset is
    /// unknown).
    #[must_use]
    pub fn balance(&self, user: &UserId, asset: &str) -> AssetBalance {
        self.accounts
            .get(user)
            .map(|h| h.clone())
            .map(|h| h.lock().get(asset))
            .unwrap_or_default()
    }

    /// Snapshots for a chosen set of assets (used for ACCOUNT events, which
    /// carry only the touched assets).
    #[must_use]
    pub fn balances_for(&self, user: &UserId, assets: &[&str]) -> Vec<BalanceSnapshot> {
        assets
            .iter()
            .map(|asset| {
                let b = self.balance(user, asset);
                BalanceSnapshot {
                    asset: (*asset).to_string(),
                    free: b.free,
                    locked: b.locked,
                }
            })
            .collect()
    }

    /// Issue a fresh API key for `user`. The key is the hex SHA-256 of a
    /// random UUID, the user id, a sequence number and a clock sample:
    /// 256 bits, opaque.
    pub fn create_api_key(&self, user: &UserId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().as_bytes());
        hasher.update(user.as_bytes());
        hasher.update(self.key_seq.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        hasher.update(self.time.now_ns().to_le_bytes());
        let key: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        self.api_keys.insert(key.clone(), user.clone());
        debug!(%user, "api key created");
        key
    }

    /// Register a caller-chosen API key (configuration-seeded users).
    pub fn register_api_key(&self, api_key: &str, user: &UserId) {
        self.api_keys.insert(api_key.to_string(), user.clone());
    }

    /// Resolve an API key to its user.
    #[must_use]
    pub fn authenticate(&self, api_key: &str) -> Option<UserId> {
        self.api_keys.get(api_key).map(|u| u.clone())
    }

    fn handle(&self, user: &UserId) -> Arc<Mutex<AccountState>> {
        self.accounts
            .entry(user.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AccountState::default())))
            .clone()
    }
}

fn positive(amount: Decimal) -> Result<(), AccountError> {
    if amount <= Decimal::ZERO {
        return Err(AccountError::NonPositiveAmount(amount));
    }
    Ok(())
}

fn settle_inner(
    state: &mut AccountState,
    user: &UserId,
    asset: &str,
    amount: Decimal,
) -> Result<(), AccountError> {
    let balance = state.entry(asset);
    if balance.locked < amount {
        return Err(AccountError::InsufficientLocked {
            user: user.clone(),
            asset: asset.to_string(),
            required: amount,
            available: balance.locked,
        });
    }
    balance.locked -= amount;
    trace!(%user, asset, %amount, "settle");
    Ok(())
}

fn apply_seller(state: &mut AccountState, s: &TradeSettlement) -> Result<(), AccountError> {
    settle_inner(state, &s.seller, &s.base_asset, s.base_qty)?;
    let proceeds = s.quote_qty - s.commission_seller;
    if proceeds > Decimal::ZERO {
        state.entry(&s.quote_asset).free += proceeds;
    }
    Ok(())
}

fn apply_buyer(state: &mut AccountState, s: &TradeSettlement) -> Result<(), AccountError> {
    settle_inner(state, &s.buyer, &s.quote_asset, s.quote_qty)?;
    let received = s.base_qty - s.commission_buyer;
    if received > Decimal::ZERO {
        state.entry(&s.base_asset).free += received;
    }
    Ok(())
}
