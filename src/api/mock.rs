//! Scriptable in-memory gateway for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Notify;

use crate::error::GatewayError;
use crate::models::{Balance, OrderAck, OrderKind, OrderRequest, OrderState, OrderStatus, Quote};

use super::Gateway;

#[derive(Default)]
struct MockState {
    prices: HashMap<String, Decimal>,
    histories: HashMap<String, Vec<Decimal>>,
    balances: HashMap<String, Decimal>,
    statuses: HashMap<String, OrderStatus>,
    submitted: Vec<(String, OrderRequest)>,
    canceled: Vec<String>,
    fail_quotes: bool,
    fail_history: bool,
    fail_balance: bool,
    failing_kinds: Vec<OrderKind>,
    submit_gates: HashMap<String, Arc<Notify>>,
    next_id: u64,
}

/// Gateway double with failure and latency injection.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
    read_delay: Option<Duration>,
    submits_entered: AtomicUsize,
    balance_reads: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, instrument: &str, price: Decimal) -> Self {
        self.lock().prices.insert(instrument.to_string(), price);
        self
    }

    pub fn with_history(self, instrument: &str, closes: Vec<Decimal>) -> Self {
        self.lock().histories.insert(instrument.to_string(), closes);
        self
    }

    pub fn with_balance(self, asset: &str, free: Decimal) -> Self {
        self.lock().balances.insert(asset.to_string(), free);
        self
    }

    /// Delay every read by `delay`.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Block the next order submission for `instrument` until `gate` is
    /// notified. Later submissions pass straight through.
    pub fn with_submit_gate(self, instrument: &str, gate: Arc<Notify>) -> Self {
        self.lock().submit_gates.insert(instrument.to_string(), gate);
        self
    }

    pub fn set_price(&self, instrument: &str, price: Decimal) {
        self.lock().prices.insert(instrument.to_string(), price);
    }

    pub fn fail_quotes(&self, fail: bool) {
        self.lock().fail_quotes = fail;
    }

    pub fn fail_history(&self, fail: bool) {
        self.lock().fail_history = fail;
    }

    pub fn fail_balance(&self, fail: bool) {
        self.lock().fail_balance = fail;
    }

    /// Reject every submission of `kind`.
    pub fn fail_orders_of(&self, kind: OrderKind) {
        self.lock().failing_kinds.push(kind);
    }

    /// Mark an order filled at `price`.
    pub fn fill_order(&self, order_id: &str, price: Decimal) {
        let mut state = self.lock();
        if let Some(status) = state.statuses.get_mut(order_id) {
            status.state = OrderState::Filled;
            status.average_price = Some(price);
        }
    }

    /// Orders accepted so far, paired with their ids.
    pub fn submitted(&self) -> Vec<(String, OrderRequest)> {
        self.lock().submitted.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.lock().canceled.clone()
    }

    /// Number of submissions that reached the gateway, accepted or not.
    pub fn submits_entered(&self) -> usize {
        self.submits_entered.load(Ordering::SeqCst)
    }

    /// Number of free-balance lookups made so far.
    pub fn balance_reads(&self) -> usize {
        self.balance_reads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Gateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_price_history(
        &self,
        instrument: &str,
        _timeframe: &str,
        window: usize,
    ) -> Result<Vec<Decimal>, GatewayError> {
        self.pause().await;
        let state = self.lock();
        if state.fail_history {
            return Err(GatewayError::Api {
                status: 503,
                code: -1,
                message: "history unavailable".to_string(),
            });
        }
        let closes = state
            .histories
            .get(instrument)
            .ok_or_else(|| GatewayError::NotFound(instrument.to_string()))?;
        let start = closes.len().saturating_sub(window);
        Ok(closes[start..].to_vec())
    }

    async fn fetch_quote(&self, instrument: &str) -> Result<Quote, GatewayError> {
        self.pause().await;
        let state = self.lock();
        if state.fail_quotes {
            return Err(GatewayError::Api {
                status: 503,
                code: -1,
                message: "quote unavailable".to_string(),
            });
        }
        state
            .prices
            .get(instrument)
            .map(|&price| Quote::at(instrument, price))
            .ok_or_else(|| GatewayError::NotFound(instrument.to_string()))
    }

    async fn fetch_free_balance(&self, asset: &str) -> Result<Decimal, GatewayError> {
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let state = self.lock();
        if state.fail_balance {
            return Err(GatewayError::Api {
                status: 503,
                code: -1,
                message: "balance unavailable".to_string(),
            });
        }
        Ok(state.balances.get(asset).copied().unwrap_or(Decimal::ZERO))
    }

    async fn fetch_balances(&self) -> Result<Vec<Balance>, GatewayError> {
        self.pause().await;
        let state = self.lock();
        if state.fail_balance {
            return Err(GatewayError::Rejected("balance unavailable".to_string()));
        }
        let mut balances: Vec<Balance> = state
            .balances
            .iter()
            .map(|(asset, free)| Balance {
                asset: asset.clone(),
                free: *free,
                locked: Decimal::ZERO,
            })
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.submits_entered.fetch_add(1, Ordering::SeqCst);
        let gate = self.lock().submit_gates.remove(&request.instrument);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.lock();
        if state.failing_kinds.contains(&request.kind) {
            return Err(GatewayError::Rejected(format!("{} order refused", request.kind)));
        }

        state.next_id += 1;
        let order_id = format!("mock-{}", state.next_id);
        let order_state = if request.kind == OrderKind::Market {
            OrderState::Filled
        } else {
            OrderState::Open
        };
        state.statuses.insert(
            order_id.clone(),
            OrderStatus {
                order_id: order_id.clone(),
                state: order_state,
                filled_quantity: Decimal::ZERO,
                average_price: None,
            },
        );
        state.submitted.push((order_id.clone(), request.clone()));

        Ok(OrderAck {
            order_id,
            state: order_state,
        })
    }

    async fn fetch_order(
        &self,
        _instrument: &str,
        order_id: &str,
    ) -> Result<OrderStatus, GatewayError> {
        self.pause().await;
        self.lock()
            .statuses
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
    }

    async fn cancel_order(&self, _instrument: &str, order_id: &str) -> Result<(), GatewayError> {
        let mut state = self.lock();
        let status = state
            .statuses
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))?;
        status.state = OrderState::Canceled;
        state.canceled.push(order_id.to_string());
        Ok(())
    }
}
