//! Binance spot REST client: klines, tickers, account balances, and orders.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{Balance, OrderAck, OrderKind, OrderRequest, OrderState, OrderStatus, Quote};
use crate::trading::ExchangeConfig;

use super::types::*;
use super::Gateway;

const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_WINDOW_MS: u64 = 5000;
const MAX_KLINES: usize = 1000;

/// Total time spent retrying a failing read before giving up.
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(15);

type HmacSha256 = Hmac<Sha256>;

struct Credentials {
    api_key: String,
    api_secret: String,
}

/// Client for the Binance spot API.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl BinanceClient {
    /// Create an authenticated client from exchange settings.
    pub fn new(config: &ExchangeConfig) -> Result<Self, GatewayError> {
        let credentials = match (&config.api_key, &config.api_secret) {
            (Some(api_key), Some(api_secret)) => Some(Credentials {
                api_key: api_key.clone(),
                api_secret: api_secret.clone(),
            }),
            _ => None,
        };
        let base_url = if config.sandbox { TESTNET_URL } else { MAINNET_URL };
        Self::build(base_url.to_string(), credentials)
    }

    /// Market-data-only client. Signed endpoints fail with `MissingCredentials`.
    pub fn public(sandbox: bool) -> Result<Self, GatewayError> {
        let base_url = if sandbox { TESTNET_URL } else { MAINNET_URL };
        Self::build(base_url.to_string(), None)
    }

    #[cfg(test)]
    pub fn with_base_url(base_url: String) -> Result<Self, GatewayError> {
        Self::build(base_url, None)
    }

    fn build(base_url: String, credentials: Option<Credentials>) -> Result<Self, GatewayError> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        info!(base_url = %base_url, authenticated = credentials.is_some(), "Binance client ready");
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    /// Retry a read with exponential backoff while its failure is transient.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(MAX_RETRY_ELAPSED))
            .build();

        backoff::future::retry(policy, || async {
            f().await.map_err(|e| {
                if e.is_transient() {
                    warn!(operation, error = %e, "Transient gateway error, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    async fn get_public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).query(query).send().await?;
        decode(resp).await
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(GatewayError::MissingCredentials)?;
        let query = signed_query(&creds.api_secret, params, Utc::now().timestamp_millis())?;
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await?;
        decode(resp).await
    }

    async fn account(&self) -> Result<AccountResponse, GatewayError> {
        self.with_retry("fetch_account", || {
            self.send_signed(Method::GET, "/api/v3/account", &[])
        })
        .await
    }
}

#[async_trait]
impl Gateway for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn fetch_price_history(
        &self,
        instrument: &str,
        timeframe: &str,
        window: usize,
    ) -> Result<Vec<Decimal>, GatewayError> {
        let query = [
            ("symbol", exchange_symbol(instrument)),
            ("interval", timeframe.to_string()),
            ("limit", window.min(MAX_KLINES).to_string()),
        ];
        debug!(instrument = %instrument, timeframe, window, "Fetching klines");

        let rows: Vec<Vec<serde_json::Value>> = self
            .with_retry("fetch_price_history", || {
                self.get_public("/api/v3/klines", &query)
            })
            .await?;
        parse_kline_closes(&rows)
    }

    async fn fetch_quote(&self, instrument: &str) -> Result<Quote, GatewayError> {
        let query = [("symbol", exchange_symbol(instrument))];
        debug!(instrument = %instrument, "Fetching ticker");

        let ticker: Ticker24hResponse = self
            .with_retry("fetch_quote", || self.get_public("/api/v3/ticker/24hr", &query))
            .await?;
        Ok(ticker.into_quote(instrument))
    }

    async fn fetch_free_balance(&self, asset: &str) -> Result<Decimal, GatewayError> {
        let account = self.account().await?;
        Ok(account
            .balances
            .into_iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }

    async fn fetch_balances(&self) -> Result<Vec<Balance>, GatewayError> {
        let account = self.account().await?;
        Ok(account
            .balances
            .into_iter()
            .map(Balance::from)
            .filter(|b| b.total() > Decimal::ZERO)
            .collect())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let params = order_params(request)?;
        info!(
            instrument = %request.instrument,
            side = %request.side,
            kind = %request.kind,
            quantity = %request.quantity,
            price = ?request.price,
            "Submitting order"
        );

        let resp: OrderResponse = self
            .send_signed(Method::POST, "/api/v3/order", &params)
            .await?;

        let state = resp.state();
        if matches!(state, OrderState::Rejected | OrderState::Expired) {
            return Err(GatewayError::Rejected(format!(
                "order {} for {} ended as {}",
                resp.order_id, request.instrument, resp.status
            )));
        }
        Ok(OrderAck {
            order_id: resp.order_id.to_string(),
            state,
        })
    }

    async fn fetch_order(
        &self,
        instrument: &str,
        order_id: &str,
    ) -> Result<OrderStatus, GatewayError> {
        let params = [
            ("symbol", exchange_symbol(instrument)),
            ("orderId", order_id.to_string()),
        ];
        let resp: OrderResponse = self
            .with_retry("fetch_order", || {
                self.send_signed(Method::GET, "/api/v3/order", &params)
            })
            .await?;
        Ok(resp.into_status())
    }

    async fn cancel_order(&self, instrument: &str, order_id: &str) -> Result<(), GatewayError> {
        let params = [
            ("symbol", exchange_symbol(instrument)),
            ("orderId", order_id.to_string()),
        ];
        let resp: OrderResponse = self
            .send_signed(Method::DELETE, "/api/v3/order", &params)
            .await?;
        debug!(instrument = %instrument, order_id, status = %resp.status, "Order canceled");
        Ok(())
    }
}

/// "BTC/USDT" -> "BTCUSDT".
fn exchange_symbol(instrument: &str) -> String {
    instrument.replace('/', "").to_uppercase()
}

fn order_params(request: &OrderRequest) -> Result<Vec<(&'static str, String)>, GatewayError> {
    let mut params = vec![
        ("symbol", exchange_symbol(&request.instrument)),
        ("side", request.side.as_str().to_string()),
    ];

    match request.kind {
        OrderKind::Market => {
            params.push(("type", "MARKET".to_string()));
        }
        OrderKind::Limit => {
            let price = request
                .price
                .ok_or_else(|| GatewayError::Rejected("limit order requires a price".to_string()))?;
            params.push(("type", "LIMIT".to_string()));
            params.push(("timeInForce", "GTC".to_string()));
            params.push(("price", price.normalize().to_string()));
        }
        OrderKind::StopMarket => {
            let trigger = request
                .price
                .ok_or_else(|| GatewayError::Rejected("stop order requires a trigger price".to_string()))?;
            params.push(("type", "STOP_LOSS".to_string()));
            params.push(("stopPrice", trigger.normalize().to_string()));
        }
    }

    params.push(("quantity", request.quantity.normalize().to_string()));
    params.push(("newClientOrderId", Uuid::new_v4().simple().to_string()));
    Ok(params)
}

/// Append `recvWindow`, `timestamp`, and the HMAC signature to `params`.
fn signed_query(
    secret: &str,
    params: &[(&str, String)],
    timestamp_ms: i64,
) -> Result<String, GatewayError> {
    let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    query.push(format!("recvWindow={}", RECV_WINDOW_MS));
    query.push(format!("timestamp={}", timestamp_ms));
    let query = query.join("&");

    let signature = sign(secret, &query)?;
    Ok(format!("{}&signature={}", query, signature))
}

/// Hex-encoded HMAC-SHA256 of `payload`.
fn sign(secret: &str, payload: &str) -> Result<String, GatewayError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| GatewayError::MissingCredentials)?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, GatewayError> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        let (code, message) = match serde_json::from_str::<ApiErrorResponse>(&body) {
            Ok(err) => (err.code, err.msg),
            Err(_) => (0, body),
        };
        return Err(GatewayError::Api {
            status: status.as_u16(),
            code,
            message,
        });
    }

    serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
}
