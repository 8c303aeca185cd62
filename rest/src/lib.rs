pub mod auth;
mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use common::config::Config;
use common::util::format_api_timestamp;
use entity::market::Quote;
use entity::trading::*;
use log::{debug, info, warn};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use stock_symbol::Symbol;
use time::{Duration, OffsetDateTime};

pub use auth::{authorization_code, authorize_url, AuthError, Session};
use rate_limit::RateLimiter;

fn token_url(config: &Config) -> String {
    format!("{}/oauth/token", config.urls.oauth_api_root)
}

/// Exchanges the code from a browser login for a new session and saves its tokens to
/// the configured auth file.
pub async fn authorize_session(code: &str) -> anyhow::Result<Session> {
    let config = Config::get();
    Session::from_authorization_code(
        &config.auth_file,
        &Client::new(),
        &token_url(config),
        &config.keys.app_key,
        &config.keys.app_secret,
        &config.keys.callback_url,
        code,
    )
    .await
}

/// Where the price of a manual order comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Market,
    Fixed(Decimal),
    Bid,
    Ask,
}

#[derive(Clone)]
pub struct SchwabRestApi {
    config: &'static Config,
    client: Client,
    session: Arc<Session>,
    limiter: Arc<RateLimiter>,
}

impl SchwabRestApi {
    pub async fn new(session: Session) -> anyhow::Result<Self> {
        let config = Config::get();
        let client = Client::new();

        let me = Self {
            config,
            client,
            session: Arc::new(session),
            limiter: Arc::new(RateLimiter::new(config.orders.requests_per_minute)),
        };

        let hash = me
            .account_hash()
            .await
            .context("Failed to resolve the account number")?;
        debug!("Using account hash {hash}");

        if let Some(expiration) = me.session.refresh_token_expiration() {
            info!("Refresh token expires around {expiration}");
        }

        Ok(me)
    }

    fn trader_endpoint(&self, method: Method, endpoint: &str) -> RequestBuilder {
        self.client.request(
            method,
            format!("{}{endpoint}", self.config.urls.trader_api_root),
        )
    }

    fn market_data_endpoint(&self, endpoint: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{endpoint}", self.config.urls.market_data_api_root))
    }

    async fn authorize(&self, request: RequestBuilder) -> anyhow::Result<RequestBuilder> {
        self.limiter.throttle_request().await;

        let authorization = self
            .session
            .authorization(
                &self.client,
                &token_url(self.config),
                &self.config.keys.app_key,
                &self.config.keys.app_secret,
            )
            .await?;

        Ok(request.header(AUTHORIZATION, authorization))
    }

    async fn dispatch(&self, request: RequestBuilder) -> anyhow::Result<Response> {
        let response = self.authorize(request).await?.send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthError::Unauthorized {
                status: response.status().as_u16(),
            }
            .into());
        }

        Ok(response)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> anyhow::Result<T> {
        let response = self.dispatch(request).await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(anyhow!("Request failed with HTTP {status}: {text}"));
        }

        let res = serde_json::from_str(&text).context("Failed to parse response");
        if res.is_err() {
            debug!("{text}");
        }
        res
    }

    /// Like `send`, but an unsuccessful status means "no data" rather than an error.
    async fn send_optional<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> anyhow::Result<Option<T>> {
        let response = self.dispatch(request).await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            debug!("HTTP {status}: {text}");
            return Ok(None);
        }

        serde_json::from_str(&text)
            .map(Some)
            .context("Failed to parse response")
    }

    pub async fn account_hash(&self) -> anyhow::Result<&str> {
        self.session
            .account_hash
            .get_or_try_init(|| async {
                let numbers: Vec<AccountNumber> = self
                    .send(self.trader_endpoint(Method::GET, "/accounts/accountNumbers"))
                    .await?;
                numbers
                    .into_iter()
                    .next()
                    .map(|number| number.hash_value)
                    .ok_or_else(|| anyhow!("No accounts are linked to these credentials"))
            })
            .await
            .map(String::as_str)
    }

    pub async fn account(&self) -> anyhow::Result<SecuritiesAccount> {
        let accounts: Vec<Account> = self
            .send(
                self.trader_endpoint(Method::GET, "/accounts")
                    .query(&[("fields", "positions")]),
            )
            .await?;

        accounts
            .into_iter()
            .next()
            .map(|account| account.securities_account)
            .ok_or_else(|| anyhow!("Account list is empty"))
    }

    /// Fetches quotes for the given symbols. `None` means the broker answered but returned
    /// no usable data; symbols the broker does not know are simply absent from the map.
    pub async fn quotes(
        &self,
        symbols: &[Symbol],
    ) -> anyhow::Result<Option<HashMap<Symbol, Quote>>> {
        let joined = symbols
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let response: Option<QuoteResponse> = self
            .send_optional(
                self.market_data_endpoint("/quotes")
                    .query(&[("symbols", joined.as_str()), ("fields", "quote,reference")]),
            )
            .await?;

        Ok(response.map(|entries| {
            entries
                .into_iter()
                .filter_map(|(key, entry)| {
                    let symbol = Symbol::from_str(&key).ok()?;
                    entry.quote.map(|raw| (symbol, Quote::from_raw(symbol, raw)))
                })
                .collect()
        }))
    }

    pub async fn quote(&self, symbol: Symbol) -> anyhow::Result<Option<Quote>> {
        Ok(self
            .quotes(&[symbol])
            .await?
            .and_then(|mut quotes| quotes.remove(&symbol)))
    }

    pub async fn orders(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> anyhow::Result<Vec<BrokerOrder>> {
        let hash = self.account_hash().await?;
        self.send(
            self.trader_endpoint(Method::GET, &format!("/accounts/{hash}/orders"))
                .query(&[
                    ("fromEnteredTime", format_api_timestamp(from)?),
                    ("toEnteredTime", format_api_timestamp(to)?),
                ]),
        )
        .await
    }

    pub async fn working_orders(&self) -> anyhow::Result<Vec<BrokerOrder>> {
        let now = OffsetDateTime::now_utc();
        let lookback = Duration::days(self.config.orders.working_order_lookback_days.into());

        Ok(self
            .orders(now - lookback, now)
            .await?
            .into_iter()
            .filter(BrokerOrder::is_working)
            .collect())
    }

    pub async fn delete_order(&self, order_id: &BrokerId) -> anyhow::Result<OrderResponse> {
        let hash = self.account_hash().await?;
        let response = self
            .dispatch(self.trader_endpoint(
                Method::DELETE,
                &format!("/accounts/{hash}/orders/{order_id}"),
            ))
            .await?;

        Ok(OrderResponse {
            ok: response.status().is_success(),
            text: response.text().await?,
        })
    }

    /// Cancels every working order for `symbol` placed within the lookback window.
    pub async fn cancel_working_orders(&self, symbol: Symbol) -> anyhow::Result<()> {
        let orders = self
            .working_orders()
            .await
            .context("Failed to list working orders")?;

        for order in orders
            .iter()
            .filter(|order| order.symbol().and_then(WideSymbol::to_compact) == Some(symbol))
        {
            let response = self.delete_order(&order.order_id).await?;
            if response.ok {
                info!("Deleted working order {} for {symbol}", order.order_id);
            } else {
                warn!(
                    "Failed to delete working order {} for {symbol}: {response}",
                    order.order_id
                );
            }
        }

        Ok(())
    }

    pub async fn place_order(
        &self,
        instruction: Instruction,
        symbol: Symbol,
        shares: u32,
        price: PriceSource,
    ) -> anyhow::Result<OrderResponse> {
        self.cancel_working_orders(symbol).await?;

        let price = match price {
            PriceSource::Market => None,
            PriceSource::Fixed(price) => Some(price),
            PriceSource::Bid | PriceSource::Ask => {
                let quote = self
                    .quote(symbol)
                    .await?
                    .ok_or_else(|| anyhow!("No quote available for {symbol}"))?;
                Some(if price == PriceSource::Bid {
                    quote.bid
                } else {
                    quote.ask
                })
            }
        };

        if instruction.requires_price() && price.is_none() {
            return Err(anyhow!("{instruction} orders need a price"));
        }

        let order = OrderRequest::for_instruction(instruction, symbol, shares, price);
        debug!("Submitting {}", serde_json::to_string(&order)?);

        let hash = self.account_hash().await?;
        let response = self
            .dispatch(
                self.trader_endpoint(Method::POST, &format!("/accounts/{hash}/orders"))
                    .header(CONTENT_TYPE, "application/json")
                    .body(serde_json::to_string(&order)?.into_bytes()),
            )
            .await?;

        Ok(OrderResponse {
            ok: response.status().is_success(),
            text: response.text().await?,
        })
    }

    /// Trade transactions for `symbol` between `start` and `end`. `None` when the broker
    /// refuses the request.
    pub async fn transactions(
        &self,
        symbol: Symbol,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> anyhow::Result<Option<Vec<Transaction>>> {
        let hash = self.account_hash().await?;
        self.send_optional(
            self.trader_endpoint(Method::GET, &format!("/accounts/{hash}/transactions"))
                .query(&[
                    ("startDate", format_api_timestamp(start)?),
                    ("endDate", format_api_timestamp(end)?),
                    ("symbol", symbol.to_string()),
                    ("types", "TRADE".to_owned()),
                ]),
        )
        .await
    }
}
