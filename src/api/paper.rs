//! Paper trading: live market data with locally simulated fills.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::models::{
    split_instrument, Balance, OrderAck, OrderKind, OrderRequest, OrderSide, OrderState,
    OrderStatus, Quote,
};

use super::Gateway;

struct PaperOrder {
    request: OrderRequest,
    status: OrderStatus,
}

#[derive(Default)]
struct PaperBook {
    balances: HashMap<String, Decimal>,
    orders: HashMap<String, PaperOrder>,
    next_id: u64,
}

impl PaperBook {
    fn free(&self, asset: &str) -> Decimal {
        self.balances.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    fn credit(&mut self, asset: &str, amount: Decimal) {
        *self.balances.entry(asset.to_string()).or_insert(Decimal::ZERO) += amount;
    }

    /// Settle a fill against the balance book, charging `fee_rate` in the
    /// quote asset.
    fn settle(
        &mut self,
        instrument: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        fee_rate: Decimal,
    ) -> Result<(), GatewayError> {
        let (base, quote) = split_instrument(instrument)
            .ok_or_else(|| GatewayError::Rejected(format!("invalid instrument {}", instrument)))?;
        let notional = quantity * price;
        let fee = notional * fee_rate;

        match side {
            OrderSide::Buy => {
                let cost = notional + fee;
                if self.free(quote) < cost {
                    return Err(GatewayError::Rejected(format!(
                        "insufficient {} balance: {} < {}",
                        quote,
                        self.free(quote),
                        cost
                    )));
                }
                self.credit(quote, -cost);
                self.credit(base, quantity);
            }
            OrderSide::Sell => {
                if self.free(base) < quantity {
                    return Err(GatewayError::Rejected(format!(
                        "insufficient {} balance: {} < {}",
                        base,
                        self.free(base),
                        quantity
                    )));
                }
                self.credit(base, -quantity);
                self.credit(quote, notional - fee);
            }
        }
        debug!(instrument, side = %side, fee = %fee, "Paper fill settled");
        Ok(())
    }
}

/// Simulated exchange that prices orders off a live market-data gateway.
///
/// Market orders fill at the last price. Stop and limit orders rest until a
/// later quote crosses their price; funds are checked at fill time, not
/// reserved while resting.
pub struct PaperExchange {
    market: Arc<dyn Gateway>,
    fee_rate: Decimal,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(
        market: Arc<dyn Gateway>,
        quote_asset: &str,
        starting_balance: Decimal,
        fee_rate: Decimal,
    ) -> Self {
        let mut book = PaperBook::default();
        book.credit(quote_asset, starting_balance);
        info!(
            quote_asset,
            starting_balance = %starting_balance,
            fee_rate = %fee_rate,
            "Paper exchange initialized"
        );
        Self {
            market,
            fee_rate,
            book: Mutex::new(book),
        }
    }

    /// Fill any resting orders on `instrument` that `last` has crossed.
    async fn trigger_resting(&self, instrument: &str, last: Decimal) {
        let mut book = self.book.lock().await;

        let crossed: Vec<String> = book
            .orders
            .iter()
            .filter(|(_, o)| o.request.instrument == instrument && !o.status.state.is_terminal())
            .filter(|(_, o)| is_crossed(&o.request, last))
            .map(|(id, _)| id.clone())
            .collect();

        for order_id in crossed {
            let Some((request, fill_price)) = book.orders.get(&order_id).map(|o| {
                let price = match o.request.kind {
                    OrderKind::Limit => o.request.price.unwrap_or(last),
                    _ => last,
                };
                (o.request.clone(), price)
            }) else {
                continue;
            };

            let result = book.settle(
                instrument,
                request.side,
                request.quantity,
                fill_price,
                self.fee_rate,
            );
            let Some(order) = book.orders.get_mut(&order_id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    order.status.state = OrderState::Filled;
                    order.status.filled_quantity = request.quantity;
                    order.status.average_price = Some(fill_price);
                    info!(
                        order_id = %order_id,
                        instrument = %instrument,
                        kind = %request.kind,
                        side = %request.side,
                        price = %fill_price,
                        "Paper order triggered"
                    );
                }
                Err(e) => {
                    order.status.state = OrderState::Rejected;
                    warn!(order_id = %order_id, error = %e, "Paper order could not fill");
                }
            }
        }
    }
}

/// Whether `last` has reached the order's trigger or limit price.
fn is_crossed(request: &OrderRequest, last: Decimal) -> bool {
    let Some(price) = request.price else {
        return false;
    };
    match (request.kind, request.side) {
        (OrderKind::StopMarket, OrderSide::Sell) => last <= price,
        (OrderKind::StopMarket, OrderSide::Buy) => last >= price,
        (OrderKind::Limit, OrderSide::Sell) => last >= price,
        (OrderKind::Limit, OrderSide::Buy) => last <= price,
        (OrderKind::Market, _) => false,
    }
}

#[async_trait]
impl Gateway for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_price_history(
        &self,
        instrument: &str,
        timeframe: &str,
        window: usize,
    ) -> Result<Vec<Decimal>, GatewayError> {
        self.market
            .fetch_price_history(instrument, timeframe, window)
            .await
    }

    async fn fetch_quote(&self, instrument: &str) -> Result<Quote, GatewayError> {
        let quote = self.market.fetch_quote(instrument).await?;
        self.trigger_resting(instrument, quote.last).await;
        Ok(quote)
    }

    async fn fetch_free_balance(&self, asset: &str) -> Result<Decimal, GatewayError> {
        Ok(self.book.lock().await.free(asset))
    }

    async fn fetch_balances(&self) -> Result<Vec<Balance>, GatewayError> {
        let book = self.book.lock().await;
        let mut balances: Vec<Balance> = book
            .balances
            .iter()
            .filter(|(_, free)| **free > Decimal::ZERO)
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
        if request.quantity <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }
        if request.kind != OrderKind::Market && request.price.is_none() {
            return Err(GatewayError::Rejected(format!("{} order requires a price", request.kind)));
        }

        // Market fills need a fresh price before taking the book lock
        let fill_price = match request.kind {
            OrderKind::Market => Some(self.fetch_quote(&request.instrument).await?.last),
            _ => None,
        };

        let mut book = self.book.lock().await;
        if let Some(price) = fill_price {
            book.settle(
                &request.instrument,
                request.side,
                request.quantity,
                price,
                self.fee_rate,
            )?;
        }

        book.next_id += 1;
        let order_id = format!("paper-{}", book.next_id);
        let state = if fill_price.is_some() {
            OrderState::Filled
        } else {
            OrderState::Open
        };
        book.orders.insert(
            order_id.clone(),
            PaperOrder {
                request: request.clone(),
                status: OrderStatus {
                    order_id: order_id.clone(),
                    state,
                    filled_quantity: if fill_price.is_some() {
                        request.quantity
                    } else {
                        Decimal::ZERO
                    },
                    average_price: fill_price,
                },
            },
        );

        debug!(
            order_id = %order_id,
            instrument = %request.instrument,
            side = %request.side,
            kind = %request.kind,
            quantity = %request.quantity,
            "Paper order accepted"
        );
        Ok(OrderAck { order_id, state })
    }

    async fn fetch_order(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> Result<OrderStatus, GatewayError> {
        let resting = {
            let book = self.book.lock().await;
            let order = book
                .orders
                .get(order_id)
                .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))?;
            !order.status.state.is_terminal()
        };

        // Polling a resting order re-prices it
        if resting {
            self.fetch_quote(instrument).await?;
        }

        let book = self.book.lock().await;
        book.orders
            .get(order_id)
            .map(|o| o.status.clone())
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
    }

    async fn cancel_order(&self, _instrument: &str, order_id: &str) -> Result<(), GatewayError> {
        let mut book = self.book.lock().await;
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))?;
        if order.status.state.is_terminal() {
            return Err(GatewayError::Rejected(format!(
                "order {} is already {:?}",
                order_id, order.status.state
            )));
        }
        order.status.state = OrderState::Canceled;
        Ok(())
    }
}
