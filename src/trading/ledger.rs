//! Position ledger: the authoritative record of open positions.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::error::LedgerError;
use crate::models::{Direction, Position};

use super::RiskState;

/// Open positions keyed by instrument, at most one per instrument.
#[derive(Debug, Clone, Default)]
pub struct PositionLedger {
    positions: BTreeMap<String, Position>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly filled entry.
    pub fn open(
        &mut self,
        instrument: &str,
        direction: Direction,
        quantity: Decimal,
        entry_price: Decimal,
        order_id: &str,
    ) -> Result<Position, LedgerError> {
        if self.positions.contains_key(instrument) {
            return Err(LedgerError::DuplicatePosition(instrument.to_string()));
        }
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::InvalidPosition {
                instrument: instrument.to_string(),
                reason: format!("quantity must be positive, got {}", quantity),
            });
        }
        if entry_price <= Decimal::ZERO {
            return Err(LedgerError::InvalidPosition {
                instrument: instrument.to_string(),
                reason: format!("entry price must be positive, got {}", entry_price),
            });
        }

        let position = Position {
            instrument: instrument.to_string(),
            direction,
            quantity,
            entry_price,
            opened_at: Utc::now(),
            order_id: order_id.to_string(),
            stop_price: None,
            take_profit_price: None,
            stop_order_id: None,
            take_profit_order_id: None,
        };
        self.positions.insert(instrument.to_string(), position.clone());

        info!(
            instrument = %instrument,
            direction = %direction,
            quantity = %quantity,
            entry_price = %entry_price,
            "Position opened"
        );
        Ok(position)
    }

    /// Remove a position and book its realized PnL into `risk` for `today`.
    ///
    /// Both updates happen under the same borrow, so no reader can observe
    /// one without the other.
    pub fn close(
        &mut self,
        instrument: &str,
        exit_price: Decimal,
        risk: &mut RiskState,
        today: NaiveDate,
    ) -> Result<Decimal, LedgerError> {
        let position = self
            .positions
            .remove(instrument)
            .ok_or_else(|| LedgerError::NoSuchPosition(instrument.to_string()))?;

        let realized = position.pnl_at(exit_price);
        risk.record_realized(realized, today);

        info!(
            instrument = %instrument,
            direction = %position.direction,
            entry_price = %position.entry_price,
            exit_price = %exit_price,
            realized_pnl = %realized,
            daily_pnl = %risk.daily_pnl(),
            "Position closed"
        );
        Ok(realized)
    }

    /// Store the planned protective exit levels.
    pub fn set_exit_levels(
        &mut self,
        instrument: &str,
        stop_price: Decimal,
        take_profit_price: Decimal,
    ) -> Result<(), LedgerError> {
        let position = self.get_mut(instrument)?;
        position.stop_price = Some(stop_price);
        position.take_profit_price = Some(take_profit_price);
        Ok(())
    }

    /// Link confirmed protective order ids to the open position.
    pub fn attach_exits(
        &mut self,
        instrument: &str,
        stop_order_id: Option<String>,
        take_profit_order_id: Option<String>,
    ) -> Result<(), LedgerError> {
        let position = self.get_mut(instrument)?;
        if stop_order_id.is_some() {
            position.stop_order_id = stop_order_id;
        }
        if take_profit_order_id.is_some() {
            position.take_profit_order_id = take_profit_order_id;
        }
        Ok(())
    }

    pub fn get(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.positions.contains_key(instrument)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// All open positions ordered by instrument.
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    fn get_mut(&mut self, instrument: &str) -> Result<&mut Position, LedgerError> {
        self.positions
            .get_mut(instrument)
            .ok_or_else(|| LedgerError::NoSuchPosition(instrument.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn risk() -> RiskState {
        RiskState::new(day(1))
    }

    #[test]
    fn test_open_twice_is_duplicate() {
        let mut ledger = PositionLedger::new();
        ledger
            .open("BTC/USDT", Direction::Long, dec!(0.1), dec!(100), "a")
            .unwrap();

        let err = ledger
            .open("BTC/USDT", Direction::Short, dec!(1), dec!(100), "b")
            .unwrap_err();
        assert_eq!(err, LedgerError::DuplicatePosition("BTC/USDT".to_string()));
        assert_eq!(ledger.get("BTC/USDT").unwrap().order_id, "a");
    }

    #[test]
    fn test_reopen_after_close() {
        let mut ledger = PositionLedger::new();
        let mut risk = risk();
        ledger.open("BTC/USDT", Direction::Long, dec!(1), dec!(100), "a").unwrap();
        ledger.close("BTC/USDT", dec!(100), &mut risk, day(1)).unwrap();
        assert!(ledger
            .open("BTC/USDT", Direction::Long, dec!(1), dec!(100), "b")
            .is_ok());
    }

    #[test]
    fn test_close_long_books_daily_pnl() {
        let mut ledger = PositionLedger::new();
        let mut risk = risk();
        ledger.open("ETH/USDT", Direction::Long, dec!(2), dec!(100), "a").unwrap();

        let realized = ledger.close("ETH/USDT", dec!(110), &mut risk, day(1)).unwrap();
        assert_eq!(realized, dec!(20));
        assert_eq!(risk.daily_pnl(), dec!(20));
        assert!(ledger.get("ETH/USDT").is_none());
    }

    #[test]
    fn test_close_short_inverts_sign() {
        let mut ledger = PositionLedger::new();
        let mut risk = risk();
        ledger.open("ETH/USDT", Direction::Short, dec!(2), dec!(100), "a").unwrap();

        let realized = ledger.close("ETH/USDT", dec!(110), &mut risk, day(1)).unwrap();
        assert_eq!(realized, dec!(-20));
        assert_eq!(risk.daily_pnl(), dec!(-20));
    }

    #[test]
    fn test_close_missing_position() {
        let mut ledger = PositionLedger::new();
        let mut risk = risk();
        let err = ledger.close("SOL/USDT", dec!(10), &mut risk, day(1)).unwrap_err();
        assert_eq!(err, LedgerError::NoSuchPosition("SOL/USDT".to_string()));
        assert_eq!(risk.daily_pnl(), Decimal::ZERO);
    }

    #[test]
    fn test_rejects_non_positive_values() {
        let mut ledger = PositionLedger::new();
        assert!(matches!(
            ledger.open("BTC/USDT", Direction::Long, Decimal::ZERO, dec!(100), "a"),
            Err(LedgerError::InvalidPosition { .. })
        ));
        assert!(matches!(
            ledger.open("BTC/USDT", Direction::Long, dec!(1), dec!(-1), "a"),
            Err(LedgerError::InvalidPosition { .. })
        ));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_attach_exits_and_snapshot_order() {
        let mut ledger = PositionLedger::new();
        ledger.open("XRP/USDT", Direction::Long, dec!(5), dec!(1), "x").unwrap();
        ledger.open("ADA/USDT", Direction::Long, dec!(5), dec!(1), "y").unwrap();

        ledger.set_exit_levels("ADA/USDT", dec!(0.98), dec!(1.05)).unwrap();
        ledger
            .attach_exits("ADA/USDT", Some("s1".to_string()), None)
            .unwrap();

        let snapshot = ledger.snapshot();
        let instruments: Vec<_> = snapshot.iter().map(|p| p.instrument.as_str()).collect();
        assert_eq!(instruments, vec!["ADA/USDT", "XRP/USDT"]);
        assert_eq!(snapshot[0].stop_order_id.as_deref(), Some("s1"));
        assert_eq!(snapshot[0].take_profit_order_id, None);
        assert_eq!(snapshot[0].stop_price, Some(dec!(0.98)));

        assert!(ledger.attach_exits("DOGE/USDT", None, None).is_err());
    }

    #[test]
    fn test_close_after_midnight_books_into_new_day() {
        let mut ledger = PositionLedger::new();
        let mut risk = risk();
        risk.record_realized(dec!(10), day(1));
        ledger.open("BTC/USDT", Direction::Long, dec!(1), dec!(200), "a").unwrap();

        ledger.close("BTC/USDT", dec!(90), &mut risk, day(2)).unwrap();
        assert_eq!(risk.daily_pnl(), dec!(-110));
        assert_eq!(risk.effective_daily_pnl(day(2)), dec!(-110));
    }
}
