use async_trait::async_trait;
use entity::market::{Fill, Quote};
use entity::trading::{Instruction, OrderResponse};
use rest::{PriceSource, SchwabRestApi};
use rust_decimal::Decimal;
use stock_symbol::Symbol;
use time::OffsetDateTime;

/// Latest prices for a symbol. `Ok(None)` is a soft failure the caller may retry.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(&self, symbol: Symbol) -> anyhow::Result<Option<Quote>>;
}

/// Submits orders. Every submission first cancels the symbol's working orders.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(
        &self,
        instruction: Instruction,
        symbol: Symbol,
        shares: u32,
        price: Option<Decimal>,
    ) -> anyhow::Result<OrderResponse>;
}

#[async_trait]
pub trait FillSource: Send + Sync {
    async fn fills(
        &self,
        symbol: Symbol,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> anyhow::Result<Option<Vec<Fill>>>;
}

#[async_trait]
impl QuoteSource for SchwabRestApi {
    async fn quote(&self, symbol: Symbol) -> anyhow::Result<Option<Quote>> {
        SchwabRestApi::quote(self, symbol).await
    }
}

#[async_trait]
impl OrderGateway for SchwabRestApi {
    async fn place_order(
        &self,
        instruction: Instruction,
        symbol: Symbol,
        shares: u32,
        price: Option<Decimal>,
    ) -> anyhow::Result<OrderResponse> {
        let price = price.map_or(PriceSource::Market, PriceSource::Fixed);
        SchwabRestApi::place_order(self, instruction, symbol, shares, price).await
    }
}

#[async_trait]
impl FillSource for SchwabRestApi {
    async fn fills(
        &self,
        symbol: Symbol,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> anyhow::Result<Option<Vec<Fill>>> {
        Ok(self.transactions(symbol, start, end).await?.map(|transactions| {
            transactions
                .iter()
                .flat_map(Fill::from_transaction)
                .collect()
        }))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use anyhow::anyhow;

    pub enum ScriptedTick {
        Quote { last: Decimal, bid: Decimal, ask: Decimal },
        Empty,
        Fails,
    }

    /// Replays a fixed sequence of ticks. Once the script runs out every further
    /// request comes back empty.
    pub struct ScriptedQuotes {
        ticks: Mutex<VecDeque<ScriptedTick>>,
        served: Mutex<usize>,
    }

    impl ScriptedQuotes {
        pub fn new(ticks: impl IntoIterator<Item = ScriptedTick>) -> Self {
            Self {
                ticks: Mutex::new(ticks.into_iter().collect()),
                served: Mutex::new(0),
            }
        }

        /// One tick per `(ask, bid)` pair with last equal to the ask.
        pub fn from_ask_bid(pairs: &[(Decimal, Decimal)]) -> Self {
            Self::new(pairs.iter().map(|&(ask, bid)| ScriptedTick::Quote {
                last: ask,
                bid,
                ask,
            }))
        }

        pub fn from_last(prices: &[Decimal]) -> Self {
            Self::new(prices.iter().map(|&price| ScriptedTick::Quote {
                last: price,
                bid: price,
                ask: price,
            }))
        }

        pub fn served(&self) -> usize {
            *self.served.lock().unwrap()
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedQuotes {
        async fn quote(&self, symbol: Symbol) -> anyhow::Result<Option<Quote>> {
            *self.served.lock().unwrap() += 1;

            match self.ticks.lock().unwrap().pop_front() {
                Some(ScriptedTick::Quote { last, bid, ask }) => Ok(Some(Quote {
                    symbol,
                    last,
                    bid,
                    ask,
                })),
                Some(ScriptedTick::Fails) => Err(anyhow!("connection reset")),
                Some(ScriptedTick::Empty) | None => Ok(None),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PlacedOrder {
        pub instruction: Instruction,
        pub symbol: Symbol,
        pub shares: u32,
        pub price: Option<Decimal>,
    }

    /// Accepts (or rejects) every order and remembers what was submitted.
    pub struct RecordingGateway {
        placed: Mutex<Vec<PlacedOrder>>,
        response: OrderResponse,
    }

    impl RecordingGateway {
        pub fn accepting() -> Self {
            Self::with_response(OrderResponse {
                ok: true,
                text: String::new(),
            })
        }

        pub fn rejecting(text: &str) -> Self {
            Self::with_response(OrderResponse {
                ok: false,
                text: text.to_owned(),
            })
        }

        fn with_response(response: OrderResponse) -> Self {
            Self {
                placed: Mutex::new(Vec::new()),
                response,
            }
        }

        pub fn placed(&self) -> Vec<PlacedOrder> {
            self.placed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderGateway for RecordingGateway {
        async fn place_order(
            &self,
            instruction: Instruction,
            symbol: Symbol,
            shares: u32,
            price: Option<Decimal>,
        ) -> anyhow::Result<OrderResponse> {
            self.placed.lock().unwrap().push(PlacedOrder {
                instruction,
                symbol,
                shares,
                price,
            });
            Ok(self.response.clone())
        }
    }
}
