//! Risk gate: daily loss, minimum balance, and position-count limits.
//!
//! Every trade attempt passes through [`RiskGate::evaluate`] before any
//! signal is computed. Checks run in a fixed order and the first failure is
//! reported as the denial reason.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::TradingConfig;

/// Process-wide daily risk budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    daily_pnl: Decimal,
    last_reset: NaiveDate,
}

impl RiskState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            daily_pnl: Decimal::ZERO,
            last_reset: today,
        }
    }

    /// Realized PnL booked since the last UTC day rollover.
    pub fn daily_pnl(&self) -> Decimal {
        self.daily_pnl
    }

    #[cfg(test)]
    pub fn last_reset(&self) -> NaiveDate {
        self.last_reset
    }

    /// Reset the daily budget when `today` is past the last reset date.
    ///
    /// Returns whether a reset happened. A clock that moves backwards never
    /// resets.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today <= self.last_reset {
            return false;
        }
        info!(
            previous_day = %self.last_reset,
            previous_pnl = %self.daily_pnl,
            "New UTC day, resetting daily PnL"
        );
        self.daily_pnl = Decimal::ZERO;
        self.last_reset = today;
        true
    }

    /// Book realized PnL from a closed position into `today`'s budget.
    ///
    /// Rolls over first, so a loss realized after UTC midnight is never
    /// wiped by the next gate evaluation.
    pub fn record_realized(&mut self, pnl: Decimal, today: NaiveDate) {
        self.roll_over(today);
        self.daily_pnl += pnl;
    }

    /// Daily PnL as it would read after a rollover to `today`, without
    /// mutating the state.
    pub fn effective_daily_pnl(&self, today: NaiveDate) -> Decimal {
        if today > self.last_reset {
            Decimal::ZERO
        } else {
            self.daily_pnl
        }
    }
}

/// Why the gate refused a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskDenial {
    DailyLossLimit { daily_pnl: Decimal, limit: Decimal },
    InsufficientBalance { free: Decimal, minimum: Decimal },
    MaxPositions { open: usize, max: usize },
}

impl std::fmt::Display for RiskDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskDenial::DailyLossLimit { daily_pnl, limit } => {
                write!(f, "Daily loss limit reached: ${:.2} <= -${:.2}", daily_pnl, limit)
            }
            RiskDenial::InsufficientBalance { free, minimum } => {
                write!(f, "Balance too low: ${:.2} < ${:.2}", free, minimum)
            }
            RiskDenial::MaxPositions { open, max } => {
                write!(f, "Maximum positions reached: {} >= {}", open, max)
            }
        }
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Allow,
    Deny(RiskDenial),
}

impl RiskDecision {
    #[cfg(test)]
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskDecision::Allow)
    }
}

/// Stateless checker of the configured limits against a [`RiskState`].
#[derive(Debug, Clone)]
pub struct RiskGate {
    max_daily_loss: Decimal,
    min_balance: Decimal,
    max_positions: usize,
}

impl RiskGate {
    pub fn new(max_daily_loss: Decimal, min_balance: Decimal, max_positions: usize) -> Self {
        Self {
            max_daily_loss,
            min_balance,
            max_positions,
        }
    }

    pub fn from_config(config: &TradingConfig) -> Self {
        Self::new(config.max_daily_loss, config.min_balance, config.max_positions)
    }

    /// Rollover and the daily-loss check alone. Needs no gateway data, so
    /// callers run it before fetching a balance.
    pub fn check_daily_loss(
        &self,
        state: &mut RiskState,
        today: NaiveDate,
    ) -> Result<(), RiskDenial> {
        state.roll_over(today);

        if state.daily_pnl <= -self.max_daily_loss {
            let denial = RiskDenial::DailyLossLimit {
                daily_pnl: state.daily_pnl,
                limit: self.max_daily_loss,
            };
            warn!(reason = %denial, "Risk gate denied trade");
            return Err(denial);
        }
        Ok(())
    }

    /// Run the checks in order: rollover, daily loss, balance, position count.
    ///
    /// `open_positions` counts recorded positions plus entries in flight.
    /// `free_balance` is `None` when the balance could not be fetched, in
    /// which case the balance check is skipped.
    pub fn evaluate(
        &self,
        state: &mut RiskState,
        open_positions: usize,
        free_balance: Option<Decimal>,
        today: NaiveDate,
    ) -> RiskDecision {
        if let Err(denial) = self.check_daily_loss(state, today) {
            return RiskDecision::Deny(denial);
        }

        match free_balance {
            Some(free) if free < self.min_balance => {
                let denial = RiskDenial::InsufficientBalance {
                    free,
                    minimum: self.min_balance,
                };
                warn!(reason = %denial, "Risk gate denied trade");
                return RiskDecision::Deny(denial);
            }
            Some(_) => {}
            None => warn!("Free balance unavailable, skipping minimum-balance check"),
        }

        if open_positions >= self.max_positions {
            let denial = RiskDenial::MaxPositions {
                open: open_positions,
                max: self.max_positions,
            };
            info!(reason = %denial, "Risk gate denied trade");
            return RiskDecision::Deny(denial);
        }

        debug!(
            daily_pnl = %state.daily_pnl,
            open_positions,
            "Risk gate passed"
        );
        RiskDecision::Allow
    }

    /// Boolean form of [`RiskGate::evaluate`].
    #[cfg(test)]
    pub fn can_trade(
        &self,
        state: &mut RiskState,
        open_positions: usize,
        free_balance: Option<Decimal>,
        today: NaiveDate,
    ) -> bool {
        self.evaluate(state, open_positions, free_balance, today).is_allowed()
    }
}
