//! Market data and account balance models.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current ticker for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: String,

    /// Last traded price
    pub last: Decimal,

    /// 24h high
    pub high: Decimal,

    /// 24h low
    pub low: Decimal,

    /// 24h base-asset volume
    pub volume: Decimal,

    /// 24h absolute price change
    #[serde(default)]
    pub change: Decimal,

    /// 24h price change in percent
    #[serde(default)]
    pub change_pct: Decimal,
}

impl Quote {
    /// Quote with only a last price.
    #[cfg(test)]
    pub fn at(instrument: &str, last: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            last,
            high: last,
            low: last,
            volume: Decimal::ZERO,
            change: Decimal::ZERO,
            change_pct: Decimal::ZERO,
        }
    }
}

/// Holdings of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Split a pair like "BTC/USDT" into its base and quote assets.
pub fn split_instrument(instrument: &str) -> Option<(&str, &str)> {
    let (base, quote) = instrument.split_once('/')?;
    if base.is_empty() || quote.is_empty() || quote.contains('/') {
        return None;
    }
    Some((base, quote))
}
