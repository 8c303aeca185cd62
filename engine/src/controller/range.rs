use std::fmt::{self, Display, Formatter};

use entity::trading::Instruction;
use log::{debug, error, info};
use rest::AuthError;
use rust_decimal::Decimal;
use stock_symbol::Symbol;

use super::{fetch_quote, CancelSignal, Fetched, RunOutcome, Timing};
use crate::broker::{OrderGateway, QuoteSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Follow the move out of the band.
    Breakout,
    /// Bet on a return into the band.
    Oscillate,
}

impl RangeMode {
    /// The entry order for `last`, or `None` while it stays inside `[low, high]`.
    pub fn instruction(self, last: Decimal, low: Decimal, high: Decimal) -> Option<Instruction> {
        let above = last > high;
        if !above && last >= low {
            return None;
        }

        Some(match (self, above) {
            (Self::Breakout, true) | (Self::Oscillate, false) => Instruction::Buy,
            (Self::Breakout, false) | (Self::Oscillate, true) => Instruction::Sell,
        })
    }
}

impl Display for RangeMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Breakout => f.write_str("breakout"),
            Self::Oscillate => f.write_str("oscillate"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeRun {
    pub mode: RangeMode,
    pub symbol: Symbol,
    pub shares: u32,
    pub low: Decimal,
    pub high: Decimal,
}

impl Display for RangeRun {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}, {}]",
            self.mode, self.symbol, self.shares, self.low, self.high
        )
    }
}

impl RangeRun {
    pub async fn run(
        &self,
        quotes: &dyn QuoteSource,
        orders: &dyn OrderGateway,
        timing: Timing,
        mut cancel: CancelSignal,
    ) -> anyhow::Result<RunOutcome> {
        let symbol = self.symbol;
        let mut tick = 1usize;

        info!("Waiting to enter position: {self}");

        loop {
            if let Fetched::Quote(quote) = fetch_quote(quotes, symbol).await? {
                debug!(
                    "{tick}: {} <= {symbol} {} <= {}",
                    self.low, quote.last, self.high
                );
                tick += 1;

                if let Some(instruction) = self.mode.instruction(quote.last, self.low, self.high) {
                    info!("{} target met; placing {instruction} order", self.mode);
                    return self.submit(orders, instruction).await;
                }
            }

            if cancel.pause(timing.range_poll_interval).await {
                return Ok(RunOutcome::Cancelled);
            }
        }
    }

    async fn submit(
        &self,
        orders: &dyn OrderGateway,
        instruction: Instruction,
    ) -> anyhow::Result<RunOutcome> {
        match orders
            .place_order(instruction, self.symbol, self.shares, None)
            .await
        {
            Ok(response) if response.accepted() => {
                info!("{response}");
                Ok(RunOutcome::Entered {
                    instruction,
                    stop: None,
                })
            }
            Ok(response) => {
                error!(
                    "{instruction} order for {} was not accepted: {response}",
                    self.symbol
                );
                Ok(RunOutcome::OrderFailed)
            }
            Err(error) if error.is::<AuthError>() => Err(error),
            Err(error) => {
                error!(
                    "Failed to place {instruction} order for {}: {error:?}",
                    self.symbol
                );
                Ok(RunOutcome::OrderFailed)
            }
        }
    }
}
