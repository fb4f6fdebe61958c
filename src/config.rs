//! Exchange configuration: symbols and their filters, fee rates, event bus
//! sizing and server binding. Loaded from a TOML file by the server binary;
//! library users construct the structs directly.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Per-symbol trading rules. Precision bounds the accepted decimal places;
/// tick/lot sizes additionally force exact multiples when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Max decimal places accepted for quantities, and the precision base
    /// commissions round to.
    #[serde(default = "default_precision")]
    pub base_precision: u32,
    /// Max decimal places accepted for prices, and the precision quote
    /// commissions round to.
    #[serde(default = "default_precision")]
    pub quote_precision: u32,
    /// Minimum price increment; prices must be exact multiples when set.
    #[serde(default)]
    pub tick_size: Option<Decimal>,
    /// Minimum quantity increment; quantities must be exact multiples when
    /// set.
    #[serde(default)]
    pub lot_size: Option<Decimal>,
    /// Orders below this quantity are rejected.
    #[serde(default)]
    pub min_qty: Option<Decimal>,
}

fn default_precision() -> u32 {
    8
}

impl SymbolConfig {
    /// Minimal config with default precisions and no size filters.
    pub fn new(symbol: &str, base_asset: &str, quote_asset: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            base_precision: default_precision(),
            quote_precision: default_precision(),
            tick_size: None,
            lot_size: None,
            min_qty: None,
        }
    }

    /// Builder: set the minimum price increment.
    #[must_use]
    pub fn with_tick_size(mut self, tick_size: Decimal) -> Self {
        self.tick_size = Some(tick_size);
        self
    }

    /// Builder: set the minimum quantity increment.
    #[must_use]
    pub fn with_lot_size(mut self, lot_size: Decimal) -> Self {
        self.lot_size = Some(lot_size);
        self
    }

    /// Builder: set the minimum order quantity.
    #[must_use]
    pub fn with_min_qty(mut self, min_qty: Decimal) -> Self {
        self.min_qty = Some(min_qty);
        self
    }
}

/// Flat maker/taker fee rates (fractions, e.g. 0.001 = 10 bps).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeConfig {
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            maker_rate: Decimal::new(1, 3), // 0.001
            taker_rate: Decimal::new(1, 3),
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BusConfig {
    /// Publishes beyond this queue depth are rejected with back-pressure.
    pub max_queue_size: usize,
    /// Worker threads serving async-flagged handlers.
    pub async_workers: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            async_workers: 4,
        }
    }
}

/// Server binary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port` the REST/WS listener binds to.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// A user seeded at startup with initial deposits (handy for backtests and
/// demos; live deployments create users through the facade).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub user_id: String,
    /// asset → initial free balance.
    #[serde(default)]
    pub balances: HashMap<String, Decimal>,
    /// Pre-assigned API key, so backtest drivers can authenticate without a
    /// key-exchange step.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
    #[serde(default)]
    pub users: Vec<SeedUser>,
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ExchangeConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// A ready-to-run config with one BTC and one ETH market, used when no
    /// config file is given.
    #[must_use]
    pub fn dev_default() -> Self {
        Self {
            server: ServerConfig::default(),
            fees: FeeConfig::default(),
            bus: BusConfig::default(),
            symbols: vec![
                SymbolConfig::new("BTCUSDT", "BTC", "USDT"),
                SymbolConfig::new("ETHUSDT", "ETH", "USDT"),
            ],
            users: Vec::new(),
        }
    }
}
