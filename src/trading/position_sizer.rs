//! Position sizing and protective exit levels.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::Direction;

use super::TradingConfig;

/// Planned entry: quantity plus stop-loss and take-profit trigger prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedEntry {
    pub quantity: Decimal,
    pub stop_price: Decimal,
    pub take_profit_price: Decimal,
}

/// Converts the configured notional into order quantities.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    trade_amount: Decimal,
    stop_loss_percent: Decimal,
    take_profit_percent: Decimal,
}

impl PositionSizer {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            trade_amount: config.trade_amount,
            stop_loss_percent: config.stop_loss_percent,
            take_profit_percent: config.take_profit_percent,
        }
    }

    /// Quantity bought or sold for the configured notional at `price`.
    ///
    /// Returns `None` for a non-positive price, or one so far out of range
    /// that the quantity overflows or rounds to zero.
    pub fn quantity(&self, price: Decimal) -> Option<Decimal> {
        if price <= Decimal::ZERO {
            return None;
        }
        self.trade_amount
            .checked_div(price)
            .filter(|q| *q > Decimal::ZERO)
            .map(|q| q.normalize())
    }

    /// Stop-loss and take-profit prices for an entry at `entry_price`.
    ///
    /// For a long the stop sits below and the target above; a short mirrors
    /// both.
    pub fn exit_levels(&self, direction: Direction, entry_price: Decimal) -> (Decimal, Decimal) {
        let stop_offset = self.stop_loss_percent / dec!(100);
        let target_offset = self.take_profit_percent / dec!(100);

        let (stop, target) = match direction {
            Direction::Long => (
                entry_price * (Decimal::ONE - stop_offset),
                entry_price * (Decimal::ONE + target_offset),
            ),
            Direction::Short => (
                entry_price * (Decimal::ONE + stop_offset),
                entry_price * (Decimal::ONE - target_offset),
            ),
        };
        (stop.normalize(), target.normalize())
    }

    /// Full sizing for an entry, or `None` when the price is unusable.
    pub fn size(&self, direction: Direction, price: Decimal) -> Option<SizedEntry> {
        let quantity = self.quantity(price)?;
        let (stop_price, take_profit_price) = self.exit_levels(direction, price);
        Some(SizedEntry {
            quantity,
            stop_price,
            take_profit_price,
        })
    }
}
