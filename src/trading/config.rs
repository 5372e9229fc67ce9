//! Trading and exchange configuration, loaded once from the environment.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::split_instrument;

/// Configuration for signal evaluation, sizing, and risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Instrument traded by the periodic trigger
    pub default_symbol: String,

    /// Quote asset of the default instrument (min-balance check, valuation)
    pub quote_asset: String,

    /// Quote-currency notional committed per entry
    pub trade_amount: Decimal,

    /// Stop-loss distance from entry, in percent
    pub stop_loss_percent: Decimal,

    /// Take-profit distance from entry, in percent
    pub take_profit_percent: Decimal,

    /// Maximum number of concurrently open positions
    pub max_positions: usize,

    /// Realized loss per UTC day that halts new entries
    pub max_daily_loss: Decimal,

    /// Minimum free quote balance required to enter
    pub min_balance: Decimal,

    /// Minimum signal confidence (0-1) to act on
    pub min_confidence: f64,

    /// Short SMA window, in candles
    pub short_window: usize,

    /// Long SMA window, in candles
    pub long_window: usize,

    /// Candle interval for price history (e.g., "1h")
    pub timeframe: String,

    /// Periodic trigger interval in seconds
    pub poll_interval_secs: u64,

    /// Bounded wait for gateway reads, in seconds
    pub gateway_timeout_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_symbol: "BTC/USDT".to_string(),
            quote_asset: "USDT".to_string(),
            trade_amount: dec!(10.0),
            stop_loss_percent: dec!(2.0),
            take_profit_percent: dec!(5.0),
            max_positions: 3,
            max_daily_loss: dec!(100.0),
            min_balance: dec!(50.0),
            min_confidence: 0.3,
            short_window: 20,
            long_window: 50,
            timeframe: "1h".to_string(),
            poll_interval_secs: 300, // 5 minutes
            gateway_timeout_secs: 30,
        }
    }
}

impl TradingConfig {
    /// Load from process environment variables and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let default_symbol = lookup("DEFAULT_SYMBOL")
            .map(|s| s.trim().to_uppercase())
            .unwrap_or(defaults.default_symbol);
        let quote_asset = match split_instrument(&default_symbol) {
            Some((_, quote)) => quote.to_string(),
            None => {
                return Err(ConfigError::invalid(
                    "DEFAULT_SYMBOL",
                    &default_symbol,
                    "expected BASE/QUOTE pair notation",
                ))
            }
        };

        let config = Self {
            default_symbol,
            quote_asset,
            trade_amount: parse_or(&lookup, "TRADE_AMOUNT", defaults.trade_amount)?,
            stop_loss_percent: parse_or(&lookup, "STOP_LOSS_PERCENT", defaults.stop_loss_percent)?,
            take_profit_percent: parse_or(
                &lookup,
                "TAKE_PROFIT_PERCENT",
                defaults.take_profit_percent,
            )?,
            max_positions: parse_or(&lookup, "MAX_POSITIONS", defaults.max_positions)?,
            max_daily_loss: parse_or(&lookup, "MAX_DAILY_LOSS", defaults.max_daily_loss)?,
            min_balance: parse_or(&lookup, "MIN_BALANCE", defaults.min_balance)?,
            min_confidence: parse_or(&lookup, "MIN_CONFIDENCE", defaults.min_confidence)?,
            short_window: parse_or(&lookup, "SHORT_WINDOW", defaults.short_window)?,
            long_window: parse_or(&lookup, "LONG_WINDOW", defaults.long_window)?,
            timeframe: lookup("TIMEFRAME").unwrap_or(defaults.timeframe),
            poll_interval_secs: parse_or(&lookup, "POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
            gateway_timeout_secs: parse_or(
                &lookup,
                "GATEWAY_TIMEOUT_SECS",
                defaults.gateway_timeout_secs,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check every setting is within range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if split_instrument(&self.default_symbol).is_none() {
            return Err(ConfigError::invalid(
                "DEFAULT_SYMBOL",
                &self.default_symbol,
                "expected BASE/QUOTE pair notation",
            ));
        }
        if self.trade_amount <= Decimal::ZERO {
            return Err(ConfigError::invalid("TRADE_AMOUNT", self.trade_amount, "must be positive"));
        }
        if self.stop_loss_percent <= Decimal::ZERO || self.stop_loss_percent >= dec!(100) {
            return Err(ConfigError::invalid(
                "STOP_LOSS_PERCENT",
                self.stop_loss_percent,
                "must be between 0 and 100 (exclusive)",
            ));
        }
        if self.take_profit_percent <= Decimal::ZERO {
            return Err(ConfigError::invalid(
                "TAKE_PROFIT_PERCENT",
                self.take_profit_percent,
                "must be positive",
            ));
        }
        if self.max_positions == 0 {
            return Err(ConfigError::invalid("MAX_POSITIONS", self.max_positions, "must be at least 1"));
        }
        if self.max_daily_loss <= Decimal::ZERO {
            return Err(ConfigError::invalid("MAX_DAILY_LOSS", self.max_daily_loss, "must be positive"));
        }
        if self.min_balance < Decimal::ZERO {
            return Err(ConfigError::invalid("MIN_BALANCE", self.min_balance, "must not be negative"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::invalid(
                "MIN_CONFIDENCE",
                self.min_confidence,
                "must be between 0 and 1",
            ));
        }
        if self.short_window == 0 || self.short_window >= self.long_window {
            return Err(ConfigError::invalid(
                "SHORT_WINDOW",
                self.short_window,
                format!("must be positive and below LONG_WINDOW ({})", self.long_window),
            ));
        }
        if self.timeframe.trim().is_empty() {
            return Err(ConfigError::invalid("TIMEFRAME", &self.timeframe, "must not be empty"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("POLL_INTERVAL_SECS", 0, "must be positive"));
        }
        if self.gateway_timeout_secs == 0 {
            return Err(ConfigError::invalid("GATEWAY_TIMEOUT_SECS", 0, "must be positive"));
        }
        Ok(())
    }

    /// Bounded wait applied to gateway reads.
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}

/// Which gateway implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Live Binance spot REST API
    Binance,
    /// Binance market data with locally simulated fills
    Paper,
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "paper" => Ok(Self::Paper),
            other => Err(ConfigError::UnsupportedExchange(other.to_string())),
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeKind::Binance => f.write_str("binance"),
            ExchangeKind::Paper => f.write_str("paper"),
        }
    }
}

/// Exchange connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub kind: ExchangeKind,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,

    /// Route requests to the exchange testnet
    pub sandbox: bool,

    /// Starting quote balance for paper trading
    pub paper_balance: Decimal,

    /// Simulated fee rate for paper fills (0.001 = 0.1%)
    pub paper_fee_rate: Decimal,
}

// Keeps credentials out of logs.
impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("kind", &self.kind)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "***"))
            .field("sandbox", &self.sandbox)
            .field("paper_balance", &self.paper_balance)
            .field("paper_fee_rate", &self.paper_fee_rate)
            .finish()
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Binance,
            api_key: None,
            api_secret: None,
            sandbox: true,
            paper_balance: dec!(1000),
            paper_fee_rate: dec!(0.001),
        }
    }
}

impl ExchangeConfig {
    /// Load through `lookup`, which main backs with the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let kind = match lookup("EXCHANGE_NAME") {
            Some(name) => name.parse()?,
            None => defaults.kind,
        };

        let sandbox = match lookup("EXCHANGE_SANDBOX") {
            Some(v) => parse_bool("EXCHANGE_SANDBOX", &v)?,
            None => defaults.sandbox,
        };

        let config = Self {
            kind,
            api_key: lookup("EXCHANGE_API_KEY").filter(|v| !v.trim().is_empty()),
            api_secret: lookup("EXCHANGE_SECRET").filter(|v| !v.trim().is_empty()),
            sandbox,
            paper_balance: parse_or(&lookup, "PAPER_BALANCE", defaults.paper_balance)?,
            paper_fee_rate: parse_or(&lookup, "PAPER_FEE_RATE", defaults.paper_fee_rate)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == ExchangeKind::Binance {
            if self.api_key.is_none() {
                return Err(ConfigError::Missing("EXCHANGE_API_KEY"));
            }
            if self.api_secret.is_none() {
                return Err(ConfigError::Missing("EXCHANGE_SECRET"));
            }
        }
        if self.paper_balance < Decimal::ZERO {
            return Err(ConfigError::invalid("PAPER_BALANCE", self.paper_balance, "must not be negative"));
        }
        if self.paper_fee_rate < Decimal::ZERO || self.paper_fee_rate >= Decimal::ONE {
            return Err(ConfigError::invalid(
                "PAPER_FEE_RATE",
                self.paper_fee_rate,
                "must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected true or false")),
    }
}
