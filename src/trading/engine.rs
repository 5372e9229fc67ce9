//! Trading engine: risk gate, signal, sizing, entry, protective exits, and
//! position bookkeeping.
//!
//! Every trigger (console command, CLI, or scheduler tick) goes through
//! [`TradingEngine::execute_trade`]. Work for one instrument is serialized by
//! a per-instrument lock held for the whole sequence. The ledger and risk
//! state share one short-lived lock that is never held across a gateway call,
//! so a slow exchange on one instrument never stalls another.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::api::Gateway;
use crate::error::{EngineError, GatewayError, LedgerError};
use crate::models::{
    split_instrument, Balance, Direction, Order, OrderKind, OrderRequest, OrderState, Position,
    Quote,
};

use super::position_sizer::SizedEntry;
use super::{
    PositionLedger, PositionSizer, RiskDecision, RiskDenial, RiskGate, RiskState, Signal,
    SignalAction, SignalEvaluator, SmaCrossover, TradingConfig,
};

/// Why an attempt ended without opening a position.
#[derive(Debug, Clone, PartialEq)]
pub enum NoTradeReason {
    RiskDenied(RiskDenial),
    PositionAlreadyOpen,
    SignalHold,
    LowConfidence { confidence: f64, threshold: f64 },
    HistoryUnavailable(String),
    PriceUnavailable(String),
    InvalidPrice(Decimal),
    EntryRejected(String),
}

impl std::fmt::Display for NoTradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoTradeReason::RiskDenied(denial) => write!(f, "Risk check failed: {}", denial),
            NoTradeReason::PositionAlreadyOpen => f.write_str("Position already open"),
            NoTradeReason::SignalHold => f.write_str("Signal is HOLD"),
            NoTradeReason::LowConfidence {
                confidence,
                threshold,
            } => write!(f, "Confidence {:.2} below {:.2}", confidence, threshold),
            NoTradeReason::HistoryUnavailable(e) => write!(f, "Price history unavailable: {}", e),
            NoTradeReason::PriceUnavailable(e) => write!(f, "Price unavailable: {}", e),
            NoTradeReason::InvalidPrice(p) => write!(f, "Invalid price: {}", p),
            NoTradeReason::EntryRejected(e) => write!(f, "Entry order failed: {}", e),
        }
    }
}

/// A filled entry and the position it opened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedTrade {
    pub order: Order,
    pub position: Position,
    pub signal: Signal,
}

/// Result of [`TradingEngine::execute_trade`].
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    Executed(Box<ExecutedTrade>),
    NoTrade(NoTradeReason),
}

impl TradeOutcome {
    /// The entry order, when one was placed.
    pub fn order(&self) -> Option<&Order> {
        match self {
            TradeOutcome::Executed(trade) => Some(&trade.order),
            TradeOutcome::NoTrade(_) => None,
        }
    }

    #[cfg(test)]
    pub fn is_executed(&self) -> bool {
        matches!(self, TradeOutcome::Executed(_))
    }
}

impl std::fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeOutcome::Executed(trade) => {
                let p = &trade.position;
                write!(
                    f,
                    "{} {} {} @ {} (stop {}, target {}, confidence {:.2})",
                    trade.order.side,
                    p.quantity,
                    p.instrument,
                    p.entry_price,
                    fmt_opt(&p.stop_price),
                    fmt_opt(&p.take_profit_price),
                    trade.signal.confidence
                )
            }
            TradeOutcome::NoTrade(reason) => write!(f, "No trade: {}", reason),
        }
    }
}

fn fmt_opt(value: &Option<Decimal>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// What closed a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::StopLoss => f.write_str("stop loss"),
            CloseReason::TakeProfit => f.write_str("take profit"),
            CloseReason::Manual => f.write_str("manual"),
        }
    }
}

/// A position removed from the ledger with its realized result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
    pub reason: CloseReason,
}

/// Result of [`TradingEngine::close_position`].
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed(Box<ClosedPosition>),
    NotOpen,
    Failed(String),
}

/// Control-surface snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub exchange: String,
    pub is_trading: bool,
    pub open_positions: usize,
    pub max_positions: usize,
    pub daily_pnl: Decimal,
    pub max_daily_loss: Decimal,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Engine Status ===")?;
        writeln!(f, "Exchange:        {}", self.exchange)?;
        writeln!(
            f,
            "Trading:         {}",
            if self.is_trading { "ACTIVE" } else { "STOPPED" }
        )?;
        writeln!(f, "Open positions:  {}/{}", self.open_positions, self.max_positions)?;
        writeln!(
            f,
            "Daily P&L:       ${:.2} (limit -${:.2})",
            self.daily_pnl, self.max_daily_loss
        )?;
        Ok(())
    }
}

/// Account valuation in the quote currency.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub quote_asset: String,
    pub total_value: Decimal,
    pub balances: Vec<Balance>,
    pub positions: Vec<Position>,
    /// Assets skipped because no price was available
    pub unpriced: Vec<String>,
}

struct Book {
    ledger: PositionLedger,
    risk: RiskState,
}

/// Counts an entry between a passed risk check and its ledger record.
///
/// Released when the position is recorded, or on drop if the entry never
/// made it that far.
struct EntryReservation {
    pending: Arc<AtomicUsize>,
    released: bool,
}

impl EntryReservation {
    fn acquire(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::SeqCst);
        Self {
            pending: pending.clone(),
            released: false,
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.released = true;
        }
    }
}

impl Drop for EntryReservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Everything decided before the first order goes out.
struct EntryPlan {
    instrument: String,
    direction: Direction,
    signal: Signal,
    price: Decimal,
    sized: SizedEntry,
}

/// Decision and position engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TradingEngine {
    config: Arc<TradingConfig>,
    gateway: Arc<dyn Gateway>,
    evaluator: Arc<dyn SignalEvaluator>,
    gate: RiskGate,
    sizer: PositionSizer,
    book: Arc<RwLock<Book>>,
    instrument_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    pending_entries: Arc<AtomicUsize>,
    is_trading: Arc<AtomicBool>,
}

impl TradingEngine {
    /// Engine with the SMA crossover evaluator from `config`.
    pub fn new(config: TradingConfig, gateway: Arc<dyn Gateway>) -> Self {
        let evaluator = Arc::new(SmaCrossover::new(config.short_window, config.long_window));
        Self::with_evaluator(config, gateway, evaluator)
    }

    pub fn with_evaluator(
        config: TradingConfig,
        gateway: Arc<dyn Gateway>,
        evaluator: Arc<dyn SignalEvaluator>,
    ) -> Self {
        let gate = RiskGate::from_config(&config);
        let sizer = PositionSizer::new(&config);
        Self {
            config: Arc::new(config),
            gateway,
            evaluator,
            gate,
            sizer,
            book: Arc::new(RwLock::new(Book {
                ledger: PositionLedger::new(),
                risk: RiskState::new(today()),
            })),
            instrument_locks: Arc::new(Mutex::new(HashMap::new())),
            pending_entries: Arc::new(AtomicUsize::new(0)),
            is_trading: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn exchange_name(&self) -> &str {
        self.gateway.name()
    }

    // ==================== Trading ====================

    /// Run one full trade attempt for `instrument`.
    ///
    /// Returns `NoTrade` for every expected refusal (risk, signal, price,
    /// gateway failure). `Err` is reserved for ledger invariant violations.
    /// Once the entry order is about to be sent, the remaining steps run to
    /// completion even if the caller stops waiting.
    pub async fn execute_trade(&self, instrument: &str) -> Result<TradeOutcome, EngineError> {
        let guard = self.lock_instrument(instrument).await;
        info!(instrument = %instrument, "Executing trade");

        let reservation = match self.check_risk(instrument).await {
            Ok(reservation) => reservation,
            Err(reason) => return Ok(self.no_trade(instrument, reason)),
        };

        let plan = match self.plan_entry(instrument).await {
            Ok(plan) => plan,
            Err(reason) => return Ok(self.no_trade(instrument, reason)),
        };

        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            engine.commit_entry(plan, reservation).await
        })
        .await
        .map_err(|e| EngineError::TaskAborted(e.to_string()))?
    }

    fn no_trade(&self, instrument: &str, reason: NoTradeReason) -> TradeOutcome {
        info!(instrument = %instrument, reason = %reason, "No trade");
        TradeOutcome::NoTrade(reason)
    }

    /// Gate check plus the one-position-per-instrument check. On success the
    /// entry is reserved so concurrent attempts count it against the limit.
    ///
    /// The daily-loss check runs before the balance read, so an exhausted
    /// budget denies without a gateway round trip.
    async fn check_risk(&self, instrument: &str) -> Result<EntryReservation, NoTradeReason> {
        {
            let mut book = self.book.write().await;
            self.gate
                .check_daily_loss(&mut book.risk, today())
                .map_err(NoTradeReason::RiskDenied)?;
        }

        let asset = quote_asset_of(instrument, &self.config.quote_asset);
        let free_balance = match self
            .read("fetch_free_balance", self.gateway.fetch_free_balance(&asset))
            .await
        {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!(asset = %asset, error = %e, "Balance check failed");
                None
            }
        };

        let mut book = self.book.write().await;
        let open = book.ledger.len() + self.pending_entries.load(Ordering::SeqCst);

        if let RiskDecision::Deny(denial) =
            self.gate.evaluate(&mut book.risk, open, free_balance, today())
        {
            return Err(NoTradeReason::RiskDenied(denial));
        }
        if book.ledger.contains(instrument) {
            return Err(NoTradeReason::PositionAlreadyOpen);
        }

        Ok(EntryReservation::acquire(&self.pending_entries))
    }

    /// Signal, price, and sizing. No orders are sent here.
    async fn plan_entry(&self, instrument: &str) -> Result<EntryPlan, NoTradeReason> {
        let signal = self
            .evaluate_signal(instrument)
            .await
            .map_err(|e| NoTradeReason::HistoryUnavailable(e.to_string()))?;

        let direction = match signal.action {
            SignalAction::Buy => Direction::Long,
            SignalAction::Sell => Direction::Short,
            SignalAction::Hold => return Err(NoTradeReason::SignalHold),
        };
        if signal.confidence < self.config.min_confidence {
            return Err(NoTradeReason::LowConfidence {
                confidence: signal.confidence,
                threshold: self.config.min_confidence,
            });
        }

        let quote = self
            .quote(instrument)
            .await
            .map_err(|e| NoTradeReason::PriceUnavailable(e.to_string()))?;
        let sized = self
            .sizer
            .size(direction, quote.last)
            .ok_or(NoTradeReason::InvalidPrice(quote.last))?;

        debug!(
            instrument = %instrument,
            action = %signal.action,
            confidence = signal.confidence,
            price = %quote.last,
            quantity = %sized.quantity,
            "Entry planned"
        );
        Ok(EntryPlan {
            instrument: instrument.to_string(),
            direction,
            signal,
            price: quote.last,
            sized,
        })
    }

    /// Submit the entry, record the position, then place protective exits.
    async fn commit_entry(
        &self,
        plan: EntryPlan,
        mut reservation: EntryReservation,
    ) -> Result<TradeOutcome, EngineError> {
        let EntryPlan {
            instrument,
            direction,
            signal,
            price,
            sized,
        } = plan;

        let request = OrderRequest::market(&instrument, direction.entry_side(), sized.quantity);
        let ack = match self.gateway.submit_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(instrument = %instrument, error = %e, "Entry order failed");
                return Ok(TradeOutcome::NoTrade(NoTradeReason::EntryRejected(e.to_string())));
            }
        };

        let order = Order {
            id: ack.order_id.clone(),
            instrument: instrument.clone(),
            side: request.side,
            kind: OrderKind::Market,
            quantity: sized.quantity,
            price,
            submitted_at: Utc::now(),
        };

        {
            let mut book = self.book.write().await;
            invariant(book.ledger.open(
                &instrument,
                direction,
                sized.quantity,
                price,
                &ack.order_id,
            ))?;
            invariant(book.ledger.set_exit_levels(
                &instrument,
                sized.stop_price,
                sized.take_profit_price,
            ))?;
            reservation.release();
        }

        let exit_side = direction.exit_side();
        let stop = OrderRequest::stop_market(&instrument, exit_side, sized.quantity, sized.stop_price);
        let target = OrderRequest::limit(&instrument, exit_side, sized.quantity, sized.take_profit_price);
        let (stop_id, target_id) =
            tokio::join!(self.submit_exit(&stop), self.submit_exit(&target));

        let position = {
            let mut book = self.book.write().await;
            if stop_id.is_some() || target_id.is_some() {
                invariant(book.ledger.attach_exits(&instrument, stop_id, target_id))?;
            }
            book.ledger
                .get(&instrument)
                .cloned()
                .ok_or_else(|| LedgerError::NoSuchPosition(instrument.clone()))
        };
        let position = invariant(position)?;

        info!(
            instrument = %instrument,
            direction = %direction,
            quantity = %position.quantity,
            entry_price = %position.entry_price,
            stop_price = %sized.stop_price,
            take_profit_price = %sized.take_profit_price,
            order_id = %order.id,
            "Trade executed"
        );
        Ok(TradeOutcome::Executed(Box::new(ExecutedTrade {
            order,
            position,
            signal,
        })))
    }

    /// Best-effort protective order.
    async fn submit_exit(&self, request: &OrderRequest) -> Option<String> {
        match self.gateway.submit_order(request).await {
            Ok(ack) => {
                debug!(
                    instrument = %request.instrument,
                    kind = %request.kind,
                    order_id = %ack.order_id,
                    "Protective order placed"
                );
                Some(ack.order_id)
            }
            Err(e) => {
                warn!(
                    instrument = %request.instrument,
                    kind = %request.kind,
                    error = %e,
                    "Protective order failed, position left without it"
                );
                None
            }
        }
    }

    // ==================== Position maintenance ====================

    /// Close positions whose stop or target has filled.
    pub async fn sync_positions(&self) -> Result<Vec<ClosedPosition>, EngineError> {
        let tracked: Vec<String> = {
            let book = self.book.read().await;
            if book.ledger.is_empty() {
                return Ok(Vec::new());
            }
            book.ledger
                .snapshot()
                .into_iter()
                .filter(|p| p.has_exits())
                .map(|p| p.instrument)
                .collect()
        };

        let mut closed = Vec::new();
        for instrument in tracked {
            if let Some(c) = self.sync_instrument(&instrument).await? {
                closed.push(c);
            }
        }
        Ok(closed)
    }

    async fn sync_instrument(&self, instrument: &str) -> Result<Option<ClosedPosition>, EngineError> {
        let _guard = self.lock_instrument(instrument).await;
        let Some(position) = self.book.read().await.ledger.get(instrument).cloned() else {
            return Ok(None);
        };

        let legs = [
            (
                CloseReason::StopLoss,
                position.stop_order_id.clone(),
                position.take_profit_order_id.clone(),
                position.stop_price,
            ),
            (
                CloseReason::TakeProfit,
                position.take_profit_order_id.clone(),
                position.stop_order_id.clone(),
                position.take_profit_price,
            ),
        ];

        for (reason, order_id, sibling_id, level) in legs {
            let Some(order_id) = order_id else { continue };
            let status = match self
                .read("fetch_order", self.gateway.fetch_order(instrument, &order_id))
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    warn!(instrument = %instrument, order_id = %order_id, error = %e, "Order status check failed");
                    continue;
                }
            };

            match status.state {
                OrderState::Filled => {
                    let exit_price = status
                        .average_price
                        .or(level)
                        .unwrap_or(position.entry_price);
                    if let Some(sibling_id) = sibling_id {
                        self.cancel_best_effort(instrument, &sibling_id).await;
                    }
                    let realized = {
                        let mut book = self.book.write().await;
                        let Book { ledger, risk } = &mut *book;
                        invariant(ledger.close(instrument, exit_price, risk, today()))?
                    };
                    info!(
                        instrument = %instrument,
                        reason = %reason,
                        exit_price = %exit_price,
                        realized_pnl = %realized,
                        "Protective order filled"
                    );
                    return Ok(Some(ClosedPosition {
                        position,
                        exit_price,
                        realized_pnl: realized,
                        reason,
                    }));
                }
                OrderState::Canceled | OrderState::Rejected | OrderState::Expired => {
                    warn!(
                        instrument = %instrument,
                        order_id = %order_id,
                        state = ?status.state,
                        "Protective order is no longer active"
                    );
                }
                OrderState::Open | OrderState::PartiallyFilled => {}
            }
        }
        Ok(None)
    }

    /// Manually close the position on `instrument` at market.
    pub async fn close_position(&self, instrument: &str) -> Result<CloseOutcome, EngineError> {
        let guard = self.lock_instrument(instrument).await;
        let Some(position) = self.book.read().await.ledger.get(instrument).cloned() else {
            return Ok(CloseOutcome::NotOpen);
        };

        let exit_price = match self.quote(instrument).await {
            Ok(quote) if quote.last > Decimal::ZERO => quote.last,
            Ok(quote) => return Ok(CloseOutcome::Failed(format!("invalid price {}", quote.last))),
            Err(e) => return Ok(CloseOutcome::Failed(e.to_string())),
        };

        let engine = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            engine.commit_close(position, exit_price).await
        })
        .await
        .map_err(|e| EngineError::TaskAborted(e.to_string()))?
    }

    async fn commit_close(
        &self,
        position: Position,
        exit_price: Decimal,
    ) -> Result<CloseOutcome, EngineError> {
        let instrument = position.instrument.clone();

        // Spot exchanges lock the base asset behind resting sell orders
        for order_id in [&position.stop_order_id, &position.take_profit_order_id]
            .into_iter()
            .flatten()
        {
            self.cancel_best_effort(&instrument, order_id).await;
        }

        let request = OrderRequest::market(
            &instrument,
            position.direction.exit_side(),
            position.quantity,
        );
        if let Err(e) = self.gateway.submit_order(&request).await {
            warn!(
                instrument = %instrument,
                error = %e,
                "Close order failed, position remains open without protective orders"
            );
            return Ok(CloseOutcome::Failed(e.to_string()));
        }

        let realized = {
            let mut book = self.book.write().await;
            let Book { ledger, risk } = &mut *book;
            invariant(ledger.close(&instrument, exit_price, risk, today()))?
        };
        Ok(CloseOutcome::Closed(Box::new(ClosedPosition {
            position,
            exit_price,
            realized_pnl: realized,
            reason: CloseReason::Manual,
        })))
    }

    async fn cancel_best_effort(&self, instrument: &str, order_id: &str) {
        if let Err(e) = self.gateway.cancel_order(instrument, order_id).await {
            warn!(instrument = %instrument, order_id = %order_id, error = %e, "Cancel failed");
        }
    }

    // ==================== Control surface ====================

    /// Enable the periodic trigger. Returns false if it was already on.
    pub fn start_trading(&self) -> bool {
        let changed = !self.is_trading.swap(true, Ordering::SeqCst);
        if changed {
            info!("Automated trading started");
        }
        changed
    }

    /// Disable the periodic trigger. Returns false if it was already off.
    pub fn stop_trading(&self) -> bool {
        let changed = self.is_trading.swap(false, Ordering::SeqCst);
        if changed {
            info!("Automated trading stopped");
        }
        changed
    }

    pub fn is_trading(&self) -> bool {
        self.is_trading.load(Ordering::SeqCst)
    }

    pub async fn get_status(&self) -> EngineStatus {
        let book = self.book.read().await;
        EngineStatus {
            exchange: self.gateway.name().to_string(),
            is_trading: self.is_trading(),
            open_positions: book.ledger.len(),
            max_positions: self.config.max_positions,
            daily_pnl: book.risk.effective_daily_pnl(today()),
            max_daily_loss: self.config.max_daily_loss,
        }
    }

    /// Open positions ordered by instrument, taken at one point in time.
    pub async fn positions(&self) -> Vec<Position> {
        self.book.read().await.ledger.snapshot()
    }

    /// Value every balance in the configured quote asset.
    pub async fn get_portfolio_summary(&self) -> Result<PortfolioSummary, GatewayError> {
        let quote_asset = self.config.quote_asset.clone();
        let balances = self
            .read("fetch_balances", self.gateway.fetch_balances())
            .await?;

        let valuations = join_all(balances.iter().map(|balance| {
            let quote_asset = quote_asset.clone();
            async move {
                if balance.asset.eq_ignore_ascii_case(&quote_asset) {
                    return Ok(balance.total());
                }
                let pair = format!("{}/{}", balance.asset, quote_asset);
                self.quote(&pair)
                    .await
                    .map(|q| balance.total() * q.last)
                    .map_err(|e| (balance.asset.clone(), e))
            }
        }))
        .await;

        let mut total_value = Decimal::ZERO;
        let mut unpriced = Vec::new();
        for valuation in valuations {
            match valuation {
                Ok(value) => total_value += value,
                Err((asset, e)) => {
                    warn!(asset = %asset, error = %e, "Skipping unpriced asset");
                    unpriced.push(asset);
                }
            }
        }

        Ok(PortfolioSummary {
            quote_asset,
            total_value,
            balances,
            positions: self.positions().await,
            unpriced,
        })
    }

    pub async fn balances(&self) -> Result<Vec<Balance>, GatewayError> {
        self.read("fetch_balances", self.gateway.fetch_balances()).await
    }

    pub async fn quote(&self, instrument: &str) -> Result<Quote, GatewayError> {
        self.read("fetch_quote", self.gateway.fetch_quote(instrument))
            .await
    }

    /// Current signal for `instrument` without trading on it.
    pub async fn evaluate_signal(&self, instrument: &str) -> Result<Signal, GatewayError> {
        let closes = self
            .read(
                "fetch_price_history",
                self.gateway.fetch_price_history(
                    instrument,
                    &self.config.timeframe,
                    self.evaluator.history_len(),
                ),
            )
            .await?;
        Ok(self.evaluator.evaluate(&closes))
    }

    // ==================== Internals ====================

    async fn lock_instrument(&self, instrument: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.instrument_locks.lock().await;
            locks.entry(instrument.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Bound a gateway read by the configured timeout.
    async fn read<T, F>(&self, operation: &'static str, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let after = self.config.gateway_timeout();
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout { operation, after }),
        }
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn quote_asset_of(instrument: &str, fallback: &str) -> String {
    split_instrument(instrument)
        .map(|(_, quote)| quote.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// Surface a ledger invariant violation loudly.
fn invariant<T>(result: Result<T, LedgerError>) -> Result<T, EngineError> {
    result.map_err(|e| {
        error!(error = %e, "Ledger invariant violated");
        debug_assert!(false, "ledger invariant violated: {}", e);
        EngineError::Ledger(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rust_decimal_macros::dec;
    use tokio::sync::Notify;
    use tokio_test::assert_ok;

    use crate::api::MockGateway;
    use crate::models::OrderSide;

    struct FixedSignal(Signal);

    impl SignalEvaluator for FixedSignal {
        fn history_len(&self) -> usize {
            1
        }

        fn evaluate(&self, _closes: &[Decimal]) -> Signal {
            self.0
        }
    }

    fn make_mock() -> MockGateway {
        MockGateway::new()
            .with_balance("USDT", dec!(1000))
            .with_price("BTC/USDT", dec!(100))
            .with_price("ETH/USDT", dec!(50))
            .with_history("BTC/USDT", vec![dec!(100)])
            .with_history("ETH/USDT", vec![dec!(50)])
    }

    fn make_config() -> TradingConfig {
        TradingConfig {
            max_positions: 3,
            ..Default::default()
        }
    }

    fn make_engine(mock: Arc<MockGateway>, config: TradingConfig, signal: Signal) -> TradingEngine {
        TradingEngine::with_evaluator(config, mock, Arc::new(FixedSignal(signal)))
    }

    fn expect_executed(outcome: TradeOutcome) -> ExecutedTrade {
        match outcome {
            TradeOutcome::Executed(trade) => *trade,
            other => panic!("expected a trade, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_long_entry() {
        let mock = Arc::new(make_mock());
        let config = TradingConfig {
            max_positions: 1,
            max_daily_loss: dec!(100),
            stop_loss_percent: dec!(2),
            take_profit_percent: dec!(5),
            trade_amount: dec!(10),
            ..Default::default()
        };
        let engine = make_engine(mock.clone(), config, Signal::buy(0.5));

        let trade = expect_executed(assert_ok!(engine.execute_trade("BTC/USDT").await));
        assert_eq!(trade.order.side, OrderSide::Buy);
        assert_eq!(trade.order.quantity, dec!(0.1));
        assert_eq!(trade.position.entry_price, dec!(100));
        assert_eq!(trade.position.stop_price, Some(dec!(98)));
        assert_eq!(trade.position.take_profit_price, Some(dec!(105)));
        assert!(trade.position.stop_order_id.is_some());
        assert!(trade.position.take_profit_order_id.is_some());

        let submitted = mock.submitted();
        assert_eq!(submitted.len(), 3);
        let stop = &submitted[1..]
            .iter()
            .find(|(_, r)| r.kind == OrderKind::StopMarket)
            .unwrap()
            .1;
        assert_eq!(stop.side, OrderSide::Sell);
        assert_eq!(stop.price, Some(dec!(98)));

        let second = assert_ok!(engine.execute_trade("ETH/USDT").await);
        assert_eq!(
            second,
            TradeOutcome::NoTrade(NoTradeReason::RiskDenied(RiskDenial::MaxPositions {
                open: 1,
                max: 1
            }))
        );
        assert_eq!(mock.submitted().len(), 3);
    }

    #[tokio::test]
    async fn test_zero_price_no_trade() {
        let mock = Arc::new(make_mock());
        mock.set_price("BTC/USDT", Decimal::ZERO);
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let outcome = assert_ok!(engine.execute_trade("BTC/USDT").await);
        assert_eq!(outcome, TradeOutcome::NoTrade(NoTradeReason::InvalidPrice(Decimal::ZERO)));
        assert!(engine.positions().await.is_empty());
        assert_eq!(mock.submits_entered(), 0);
        assert_eq!(engine.pending_entries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_price_no_trade() {
        let tiny = Decimal::new(1, 28);
        let mock = Arc::new(make_mock());
        mock.set_price("BTC/USDT", tiny);
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let outcome = assert_ok!(engine.execute_trade("BTC/USDT").await);
        assert_eq!(outcome, TradeOutcome::NoTrade(NoTradeReason::InvalidPrice(tiny)));
        assert_eq!(mock.submits_entered(), 0);
        assert_eq!(engine.pending_entries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quote_failure_no_trade() {
        let mock = Arc::new(make_mock());
        mock.fail_quotes(true);
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let outcome = assert_ok!(engine.execute_trade("BTC/USDT").await);
        assert!(matches!(
            outcome,
            TradeOutcome::NoTrade(NoTradeReason::PriceUnavailable(_))
        ));
        assert!(engine.positions().await.is_empty());
        assert_eq!(mock.submits_entered(), 0);
    }

    #[tokio::test]
    async fn test_history_failure_no_trade() {
        let mock = Arc::new(make_mock());
        mock.fail_history(true);
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let outcome = assert_ok!(engine.execute_trade("BTC/USDT").await);
        assert!(matches!(
            outcome,
            TradeOutcome::NoTrade(NoTradeReason::HistoryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out() {
        let mock = Arc::new(make_mock().with_read_delay(Duration::from_millis(1500)));
        let config = TradingConfig {
            gateway_timeout_secs: 1,
            ..make_config()
        };
        let engine = make_engine(mock.clone(), config, Signal::buy(0.9));

        // Balance times out and is skipped, then history times out
        let outcome = assert_ok!(engine.execute_trade("BTC/USDT").await);
        match outcome {
            TradeOutcome::NoTrade(NoTradeReason::HistoryUnavailable(msg)) => {
                assert!(msg.contains("timed out"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hold_and_low_confidence() {
        let mock = Arc::new(make_mock());
        let engine = make_engine(mock.clone(), make_config(), Signal::hold());
        assert_eq!(
            assert_ok!(engine.execute_trade("BTC/USDT").await),
            TradeOutcome::NoTrade(NoTradeReason::SignalHold)
        );

        let engine = make_engine(mock.clone(), make_config(), Signal::sell(0.29));
        let outcome = assert_ok!(engine.execute_trade("BTC/USDT").await);
        assert!(matches!(
            outcome,
            TradeOutcome::NoTrade(NoTradeReason::LowConfidence { .. })
        ));
        assert_eq!(mock.submits_entered(), 0);
    }

    #[tokio::test]
    async fn test_entry_failure_submits_nothing_else() {
        let mock = Arc::new(make_mock());
        mock.fail_orders_of(OrderKind::Market);
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let outcome = assert_ok!(engine.execute_trade("BTC/USDT").await);
        assert!(matches!(
            outcome,
            TradeOutcome::NoTrade(NoTradeReason::EntryRejected(_))
        ));
        assert_eq!(mock.submits_entered(), 1);
        assert!(engine.positions().await.is_empty());
        assert_eq!(engine.pending_entries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exit_failure_still_records_position() {
        let mock = Arc::new(make_mock());
        mock.fail_orders_of(OrderKind::StopMarket);
        mock.fail_orders_of(OrderKind::Limit);
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let trade = expect_executed(assert_ok!(engine.execute_trade("BTC/USDT").await));
        assert_eq!(trade.position.stop_order_id, None);
        assert_eq!(trade.position.take_profit_order_id, None);

        let positions = engine.positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].instrument, "BTC/USDT");
    }

    #[tokio::test]
    async fn test_short_entry_mirrors_exits() {
        let mock = Arc::new(make_mock());
        let engine = make_engine(mock.clone(), make_config(), Signal::sell(0.6));

        let trade = expect_executed(assert_ok!(engine.execute_trade("BTC/USDT").await));
        assert_eq!(trade.order.side, OrderSide::Sell);
        assert_eq!(trade.position.direction, Direction::Short);
        assert_eq!(trade.position.stop_price, Some(dec!(102)));
        assert_eq!(trade.position.take_profit_price, Some(dec!(95)));
    }

    #[tokio::test]
    async fn test_second_trade_same_instrument_is_noop() {
        let mock = Arc::new(make_mock());
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        assert!(assert_ok!(engine.execute_trade("BTC/USDT").await).is_executed());
        assert_eq!(
            assert_ok!(engine.execute_trade("BTC/USDT").await),
            TradeOutcome::NoTrade(NoTradeReason::PositionAlreadyOpen)
        );
        assert_eq!(mock.submitted().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_same_instrument_opens_once() {
        let mock = Arc::new(make_mock());
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let (a, b) = tokio::join!(
            engine.execute_trade("BTC/USDT"),
            engine.execute_trade("BTC/USDT")
        );
        let executed = [assert_ok!(a), assert_ok!(b)]
            .iter()
            .filter(|o| o.is_executed())
            .count();
        assert_eq!(executed, 1);

        let entries = mock
            .submitted()
            .iter()
            .filter(|(_, r)| r.kind == OrderKind::Market)
            .count();
        assert_eq!(entries, 1);
        assert_eq!(engine.positions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_instruments_do_not_block_each_other() {
        let gate = Arc::new(Notify::new());
        let mock = Arc::new(make_mock().with_submit_gate("BTC/USDT", gate.clone()));
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let slow = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute_trade("BTC/USDT").await })
        };
        while mock.submits_entered() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // BTC entry is stuck at the gateway; ETH must still go through
        let eth = tokio::time::timeout(Duration::from_secs(2), engine.execute_trade("ETH/USDT"))
            .await
            .expect("ETH trade blocked behind BTC");
        assert!(assert_ok!(eth).is_executed());

        // Status reads are not blocked either
        let status = tokio::time::timeout(Duration::from_secs(1), engine.get_status())
            .await
            .unwrap();
        assert_eq!(status.open_positions, 1);

        gate.notify_one();
        let btc = slow.await.unwrap();
        assert!(assert_ok!(btc).is_executed());
        assert_eq!(engine.positions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_entry_counts_against_limit() {
        let gate = Arc::new(Notify::new());
        let mock = Arc::new(make_mock().with_submit_gate("BTC/USDT", gate.clone()));
        let config = TradingConfig {
            max_positions: 1,
            ..Default::default()
        };
        let engine = make_engine(mock.clone(), config, Signal::buy(0.9));

        let slow = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute_trade("BTC/USDT").await })
        };
        while mock.submits_entered() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let eth = assert_ok!(engine.execute_trade("ETH/USDT").await);
        assert!(matches!(
            eth,
            TradeOutcome::NoTrade(NoTradeReason::RiskDenied(RiskDenial::MaxPositions { .. }))
        ));

        gate.notify_one();
        assert!(assert_ok!(slow.await.unwrap()).is_executed());
    }

    #[tokio::test]
    async fn test_commit_survives_caller_cancellation() {
        let gate = Arc::new(Notify::new());
        let mock = Arc::new(make_mock().with_submit_gate("BTC/USDT", gate.clone()));
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let caller = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute_trade("BTC/USDT").await })
        };
        while mock.submits_entered() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        caller.abort();
        gate.notify_one();

        for _ in 0..200 {
            if engine.positions().await.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let positions = engine.positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(0.1));
    }

    #[tokio::test]
    async fn test_stop_fill_books_loss_and_trips_daily_limit() {
        let mock = Arc::new(make_mock());
        let config = TradingConfig {
            max_daily_loss: dec!(0.1),
            ..make_config()
        };
        let engine = make_engine(mock.clone(), config, Signal::buy(0.9));

        let trade = expect_executed(assert_ok!(engine.execute_trade("BTC/USDT").await));
        let stop_id = trade.position.stop_order_id.clone().unwrap();
        let target_id = trade.position.take_profit_order_id.clone().unwrap();

        assert!(assert_ok!(engine.sync_positions().await).is_empty());

        mock.fill_order(&stop_id, dec!(98));
        let closed = assert_ok!(engine.sync_positions().await);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, CloseReason::StopLoss);
        assert_eq!(closed[0].realized_pnl, dec!(-0.2));
        assert_eq!(mock.canceled(), vec![target_id]);
        assert!(engine.positions().await.is_empty());
        assert_eq!(engine.get_status().await.daily_pnl, dec!(-0.2));

        // Exhausted budget denies without touching the balance endpoint
        let reads = mock.balance_reads();
        let outcome = assert_ok!(engine.execute_trade("ETH/USDT").await);
        assert!(matches!(
            outcome,
            TradeOutcome::NoTrade(NoTradeReason::RiskDenied(RiskDenial::DailyLossLimit { .. }))
        ));
        assert_eq!(mock.balance_reads(), reads);
    }

    #[tokio::test]
    async fn test_take_profit_fill() {
        let mock = Arc::new(make_mock());
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        let trade = expect_executed(assert_ok!(engine.execute_trade("BTC/USDT").await));
        let target_id = trade.position.take_profit_order_id.clone().unwrap();
        mock.fill_order(&target_id, dec!(105));

        let closed = assert_ok!(engine.sync_positions().await);
        assert_eq!(closed[0].reason, CloseReason::TakeProfit);
        assert_eq!(closed[0].realized_pnl, dec!(0.5));
    }

    #[tokio::test]
    async fn test_manual_close() {
        let mock = Arc::new(make_mock());
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));
        assert_ok!(engine.execute_trade("BTC/USDT").await);

        mock.set_price("BTC/USDT", dec!(110));
        let closed = match assert_ok!(engine.close_position("BTC/USDT").await) {
            CloseOutcome::Closed(closed) => closed,
            other => panic!("expected close, got {:?}", other),
        };
        assert_eq!(closed.exit_price, dec!(110));
        assert_eq!(closed.realized_pnl, dec!(1.0));
        assert_eq!(mock.canceled().len(), 2);

        let (_, last) = mock.submitted().last().cloned().unwrap();
        assert_eq!(last.kind, OrderKind::Market);
        assert_eq!(last.side, OrderSide::Sell);

        assert_eq!(
            assert_ok!(engine.close_position("BTC/USDT").await),
            CloseOutcome::NotOpen
        );
        assert_eq!(engine.get_status().await.daily_pnl, dec!(1.0));
    }

    #[tokio::test]
    async fn test_failed_close_keeps_position() {
        let mock = Arc::new(make_mock());
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));
        assert_ok!(engine.execute_trade("BTC/USDT").await);

        mock.fail_orders_of(OrderKind::Market);
        let outcome = assert_ok!(engine.close_position("BTC/USDT").await);
        assert!(matches!(outcome, CloseOutcome::Failed(_)));
        assert_eq!(engine.positions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_status_and_trading_toggle() {
        let mock = Arc::new(make_mock());
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));

        assert!(!engine.is_trading());
        assert!(engine.start_trading());
        assert!(!engine.start_trading());
        assert!(engine.is_trading());

        assert_ok!(engine.execute_trade("BTC/USDT").await);
        let status = engine.get_status().await;
        assert_eq!(status.exchange, "mock");
        assert!(status.is_trading);
        assert_eq!(status.open_positions, 1);
        assert_eq!(status.daily_pnl, Decimal::ZERO);
        assert!(status.to_string().contains("ACTIVE"));

        assert!(engine.stop_trading());
        assert!(!engine.get_status().await.is_trading);
    }

    #[tokio::test]
    async fn test_unknown_balance_does_not_block() {
        let mock = Arc::new(make_mock());
        mock.fail_balance(true);
        let engine = make_engine(mock.clone(), make_config(), Signal::buy(0.9));
        assert!(assert_ok!(engine.execute_trade("BTC/USDT").await).is_executed());
    }

    #[tokio::test]
    async fn test_portfolio_summary() {
        let mock = Arc::new(
            MockGateway::new()
                .with_balance("USDT", dec!(500))
                .with_balance("BTC", dec!(0.5))
                .with_balance("XYZ", dec!(7))
                .with_price("BTC/USDT", dec!(100)),
        );
        let engine = make_engine(mock, make_config(), Signal::hold());

        let summary = assert_ok!(engine.get_portfolio_summary().await);
        assert_eq!(summary.quote_asset, "USDT");
        assert_eq!(summary.total_value, dec!(550));
        assert_eq!(summary.unpriced, vec!["XYZ".to_string()]);
        assert_eq!(summary.balances.len(), 3);
        assert!(summary.positions.is_empty());
    }
}
