//! Trading signals: SMA crossover over closing prices.
//!
//! The evaluator is a replaceable policy. The engine only depends on the
//! [`SignalEvaluator`] trait, so any deterministic function of a close
//! history can be plugged in.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Recommended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalAction::Buy => f.write_str("buy"),
            SignalAction::Sell => f.write_str("sell"),
            SignalAction::Hold => f.write_str("hold"),
        }
    }
}

/// Directional recommendation with a confidence in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub confidence: f64,
}

impl Signal {
    pub fn hold() -> Self {
        Self {
            action: SignalAction::Hold,
            confidence: 0.0,
        }
    }

    pub fn buy(confidence: f64) -> Self {
        Self {
            action: SignalAction::Buy,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn sell(confidence: f64) -> Self {
        Self {
            action: SignalAction::Sell,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A pure policy turning a close history into a signal.
pub trait SignalEvaluator: Send + Sync {
    /// Number of trailing closes the evaluator wants.
    fn history_len(&self) -> usize;

    /// Evaluate closes ordered oldest to newest.
    fn evaluate(&self, closes: &[Decimal]) -> Signal;
}

/// Simple moving average crossover confirmed by the latest close.
#[derive(Debug, Clone, Copy)]
pub struct SmaCrossover {
    pub short_window: usize,
    pub long_window: usize,
}

impl SmaCrossover {
    pub fn new(short_window: usize, long_window: usize) -> Self {
        Self {
            short_window,
            long_window,
        }
    }
}

impl SignalEvaluator for SmaCrossover {
    fn history_len(&self) -> usize {
        self.long_window
    }

    fn evaluate(&self, closes: &[Decimal]) -> Signal {
        evaluate(closes, self.short_window, self.long_window)
    }
}

/// Simple moving average of the trailing `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values[values.len() - period..].iter().sum();
    Some(sum / Decimal::from(period))
}

/// SMA crossover decision rule.
///
/// Buy when the short SMA is above the long SMA and the latest close is
/// above the short SMA; sell on the mirrored condition; hold otherwise.
/// Confidence is the relative SMA spread, clamped to [0, 1].
pub fn evaluate(closes: &[Decimal], short_window: usize, long_window: usize) -> Signal {
    if short_window == 0 || closes.len() < long_window {
        return Signal::hold();
    }

    let (Some(short), Some(long), Some(&latest)) = (
        sma(closes, short_window),
        sma(closes, long_window),
        closes.last(),
    ) else {
        return Signal::hold();
    };

    // Degenerate feeds would divide by zero below
    if short <= Decimal::ZERO || long <= Decimal::ZERO {
        return Signal::hold();
    }

    if short > long && latest > short {
        Signal::buy(ratio((short - long) / long))
    } else if short < long && latest < short {
        Signal::sell(ratio((long - short) / short))
    } else {
        Signal::hold()
    }
}

fn ratio(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0).clamp(0.0, 1.0)
}
