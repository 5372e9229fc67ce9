//! Order models shared by the engine and the exchange gateways.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Fill immediately at the best available price
    Market,
    /// Rest at a limit price (take-profit exits)
    Limit,
    /// Market order armed at a trigger price (stop-loss exits)
    StopMarket,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
            OrderKind::StopMarket => "stop_market",
        };
        f.write_str(s)
    }
}

/// Request to place an order through a gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub kind: OrderKind,
    /// Limit price for `Limit`, trigger price for `StopMarket`, unused for `Market`
    pub price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(instrument: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            side,
            quantity,
            kind: OrderKind::Market,
            price: None,
        }
    }

    pub fn limit(instrument: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            side,
            quantity,
            kind: OrderKind::Limit,
            price: Some(price),
        }
    }

    pub fn stop_market(
        instrument: &str,
        side: OrderSide,
        quantity: Decimal,
        trigger: Decimal,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            side,
            quantity,
            kind: OrderKind::StopMarket,
            price: Some(trigger),
        }
    }
}

/// Lifecycle state of an order on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderState {
    /// Whether the order can no longer fill.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected | OrderState::Expired
        )
    }
}

/// Acknowledgement returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub state: OrderState,
}

/// Current status of a previously submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: OrderState,
    pub filled_quantity: Decimal,
    /// Volume-weighted fill price, when anything has filled
    pub average_price: Option<Decimal>,
}

/// A confirmed order as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub instrument: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    /// Reference price used for sizing
    pub price: Decimal,
    pub submitted_at: DateTime<Utc>,
}
