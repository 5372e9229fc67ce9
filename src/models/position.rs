//! Position model: one open spot exposure per instrument.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Exposure direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Bought first, profits when price rises
    Long,
    /// Sold first, profits when price falls
    Short,
}

impl Direction {
    /// Side of the order that opens this direction.
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side of the orders that close this direction.
    pub fn exit_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open position tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument in pair notation (e.g., "BTC/USDT")
    pub instrument: String,

    /// Long or short exposure
    pub direction: Direction,

    /// Base-asset quantity, always positive
    pub quantity: Decimal,

    /// Reference price at entry, always positive
    pub entry_price: Decimal,

    /// When the entry was confirmed
    pub opened_at: DateTime<Utc>,

    /// Exchange id of the entry order
    pub order_id: String,

    /// Protective stop trigger price
    pub stop_price: Option<Decimal>,

    /// Protective take-profit limit price
    pub take_profit_price: Option<Decimal>,

    /// Exchange id of the stop order, once confirmed
    pub stop_order_id: Option<String>,

    /// Exchange id of the take-profit order, once confirmed
    pub take_profit_order_id: Option<String>,
}

impl Position {
    /// Profit or loss if the position were closed at `exit_price`.
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        let diff = exit_price - self.entry_price;
        match self.direction {
            Direction::Long => diff * self.quantity,
            Direction::Short => -diff * self.quantity,
        }
    }

    /// Whether any protective order is linked to this position.
    pub fn has_exits(&self) -> bool {
        self.stop_order_id.is_some() || self.take_profit_order_id.is_some()
    }
}
