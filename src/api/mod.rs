//! Exchange gateways for market data, balances, and order execution.

mod binance_client;
#[cfg(test)]
mod mock;
mod paper;
mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::models::{Balance, OrderAck, OrderRequest, OrderStatus, Quote};

pub use binance_client::BinanceClient;
#[cfg(test)]
pub use mock::MockGateway;
pub use paper::PaperExchange;

/// Everything the trading core needs from an exchange.
///
/// Implementations own no trading state. Callers bound every read with a
/// timeout, so an implementation may block as long as its transport allows.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Exchange name for status and logs.
    fn name(&self) -> &str;

    /// Last `window` closing prices for `instrument`, oldest first.
    async fn fetch_price_history(
        &self,
        instrument: &str,
        timeframe: &str,
        window: usize,
    ) -> Result<Vec<Decimal>, GatewayError>;

    /// Current ticker.
    async fn fetch_quote(&self, instrument: &str) -> Result<Quote, GatewayError>;

    /// Free (unlocked) balance of one asset. Unknown assets read as zero.
    async fn fetch_free_balance(&self, asset: &str) -> Result<Decimal, GatewayError>;

    /// All non-empty balances.
    async fn fetch_balances(&self) -> Result<Vec<Balance>, GatewayError>;

    /// Place an order. Never retried.
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn fetch_order(&self, instrument: &str, order_id: &str)
        -> Result<OrderStatus, GatewayError>;

    async fn cancel_order(&self, instrument: &str, order_id: &str) -> Result<(), GatewayError>;
}
