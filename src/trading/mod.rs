//! Trading logic: signals, risk limits, position ledger, sizing, and the
//! execution engine.

mod config;
mod engine;
mod ledger;
mod position_sizer;
mod risk;
mod signal;

pub use config::{ExchangeConfig, ExchangeKind, TradingConfig};
pub use engine::{CloseOutcome, TradingEngine};
pub use ledger::PositionLedger;
pub use position_sizer::PositionSizer;
pub use risk::{RiskDecision, RiskDenial, RiskGate, RiskState};
pub use signal::{Signal, SignalAction, SignalEvaluator, SmaCrossover};
