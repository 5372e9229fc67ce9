//! Response types for the Binance spot REST API.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::models::{Balance, OrderState, OrderStatus, Quote};

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub code: i64,
    pub msg: String,
}

/// 24h rolling ticker from /api/v3/ticker/24hr.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24hResponse {
    pub last_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub price_change: Decimal,
    #[serde(default)]
    pub price_change_percent: Decimal,
}

impl Ticker24hResponse {
    pub fn into_quote(self, instrument: &str) -> Quote {
        Quote {
            instrument: instrument.to_string(),
            last: self.last_price,
            high: self.high_price,
            low: self.low_price,
            volume: self.volume,
            change: self.price_change,
            change_pct: self.price_change_percent,
        }
    }
}

/// Account snapshot from /api/v3/account.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub balances: Vec<BalanceResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl From<BalanceResponse> for Balance {
    fn from(b: BalanceResponse) -> Self {
        Balance {
            asset: b.asset,
            free: b.free,
            locked: b.locked,
        }
    }
}

/// Order as returned by POST, GET and DELETE on /api/v3/order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub status: String,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub cummulative_quote_qty: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub stop_price: Decimal,
}

impl OrderResponse {
    pub fn state(&self) -> OrderState {
        order_state(&self.status)
    }

    /// Volume-weighted fill price. Stop orders report no quote quantity
    /// until filled, so fall back to the trigger price.
    pub fn average_price(&self) -> Option<Decimal> {
        if self.executed_qty > Decimal::ZERO && self.cummulative_quote_qty > Decimal::ZERO {
            return Some(self.cummulative_quote_qty / self.executed_qty);
        }
        if self.executed_qty > Decimal::ZERO {
            if self.price > Decimal::ZERO {
                return Some(self.price);
            }
            if self.stop_price > Decimal::ZERO {
                return Some(self.stop_price);
            }
        }
        None
    }

    pub fn into_status(self) -> OrderStatus {
        OrderStatus {
            order_id: self.order_id.to_string(),
            state: self.state(),
            filled_quantity: self.executed_qty,
            average_price: self.average_price(),
        }
    }
}

/// Map a Binance order status string onto [`OrderState`].
pub fn order_state(status: &str) -> OrderState {
    match status {
        "FILLED" => OrderState::Filled,
        "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
        "CANCELED" => OrderState::Canceled,
        "REJECTED" => OrderState::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderState::Expired,
        // NEW, PENDING_NEW, PENDING_CANCEL
        _ => OrderState::Open,
    }
}

/// Extract close prices from a /api/v3/klines payload.
///
/// Each kline is a heterogeneous array; the close is the string at index 4.
pub fn parse_kline_closes(rows: &[Vec<serde_json::Value>]) -> Result<Vec<Decimal>, GatewayError> {
    rows.iter()
        .map(|row| {
            let raw = row
                .get(4)
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::Decode("kline row missing close price".to_string()))?;
            raw.parse::<Decimal>()
                .map_err(|e| GatewayError::Decode(format!("bad close price '{}': {}", raw, e)))
        })
        .collect()
}
