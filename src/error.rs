//! Error taxonomy for configuration, exchange calls, and ledger invariants.

use std::time::Duration;

/// Invalid or missing configuration. Fatal at startup.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Required setting '{0}' is not set")]
    Missing(&'static str),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Unsupported exchange '{0}' (expected 'binance' or 'paper')")]
    UnsupportedExchange(String),
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// A failed or timed-out call to the exchange gateway.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Exchange rejected request ({status}): {message}")]
    Api { status: u16, code: i64, message: String },

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Failed to decode exchange response: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API credentials are not configured")]
    MissingCredentials,
}

impl GatewayError {
    /// Whether retrying the same read could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Timeout { .. } | GatewayError::Transport(_) => true,
            GatewayError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Violations of the one-position-per-instrument ledger invariants.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Position already open for {0}")]
    DuplicatePosition(String),

    #[error("No open position for {0}")]
    NoSuchPosition(String),

    #[error("Invalid position for {instrument}: {reason}")]
    InvalidPosition { instrument: String, reason: String },
}

/// Hard failures surfaced by the trading engine.
///
/// Gateway failures and risk denials never appear here: they degrade into
/// a "no trade" outcome instead.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Ledger invariant violated: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Trade task aborted: {0}")]
    TaskAborted(String),
}
