use std::fmt::{self, Display, Formatter};

use common::config::Config;
use common::util::{self, format_currency, DAY_LABEL_FORMAT, TIME_FORMAT};
use entity::trading::Instruction;
use log::{error, info, warn};
use rest::{AuthError, PriceSource, SchwabRestApi};
use rust_decimal::Decimal;
use stock_symbol::Symbol;
use time::OffsetDateTime;

use super::report;
use super::runs::RunRegistry;
use crate::broker::FillSource;
use crate::controller::{CancelSignal, ExtremeRun, RangeRun, RunOutcome, Timing};
use crate::event::{Command, EngineEvent, EventEmitter, EventReceiver, RunEvent};
use crate::grouping::group_round_trips;

pub struct Engine {
    rest: SchwabRestApi,
    runs: RunRegistry,
    run_events: EventEmitter<RunEvent>,
    timing: Timing,
}

pub async fn run(mut events: EventReceiver, rest: SchwabRestApi) -> anyhow::Result<()> {
    let mut engine = Engine {
        rest,
        runs: RunRegistry::new(),
        run_events: events.new_emitter::<RunEvent>(),
        timing: Timing::from(&Config::get().controller),
    };

    let result = engine.run(&mut events).await;

    if !engine.runs.is_empty() {
        info!("Waiting for active runs to stop");
    }
    for event in engine.runs.shutdown(&mut events).await {
        // Authentication failures are already logged, and we are stopping anyway
        let _ = engine.handle_run_event(event);
    }

    result
}

enum RunKind {
    Extreme(ExtremeRun),
    Range(RangeRun),
}

impl RunKind {
    fn symbol(&self) -> Symbol {
        match self {
            Self::Extreme(run) => run.symbol,
            Self::Range(run) => run.symbol,
        }
    }

    async fn run(
        &self,
        broker: &SchwabRestApi,
        timing: Timing,
        cancel: CancelSignal,
    ) -> anyhow::Result<RunOutcome> {
        match self {
            Self::Extreme(run) => run.run(broker, broker, timing, cancel).await,
            Self::Range(run) => run.run(broker, broker, timing, cancel).await,
        }
    }
}

impl Display for RunKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extreme(run) => Display::fmt(run, f),
            Self::Range(run) => Display::fmt(run, f),
        }
    }
}

impl Engine {
    async fn run(&mut self, events: &mut EventReceiver) -> anyhow::Result<()> {
        loop {
            let event = tokio::select! {
                event = events.next() => event,
                Some(()) = self.runs.reap() => continue,
            };
            let Some(event) = event else {
                return Ok(());
            };

            match event {
                EngineEvent::Command(Command::Stop) => return Ok(()),
                EngineEvent::Command(command) => self.handle_command(command).await?,
                EngineEvent::Run(run_event) => self.handle_run_event(run_event)?,
            }
        }
    }

    /// Failures of a single command are logged and forgotten, except authentication
    /// failures which end the session.
    async fn handle_command(&mut self, command: Command) -> anyhow::Result<()> {
        let result = match command {
            Command::Quote { symbols } => self.show_quotes(&symbols).await,
            Command::Order {
                instruction,
                symbol,
                shares,
                price,
            } => self.place_order(instruction, symbol, shares, price).await,
            Command::Balance => self.show_balance().await,
            Command::Positions { symbols } => self.show_positions(&symbols).await,
            Command::Extreme(run) => {
                self.start_run(RunKind::Extreme(run));
                Ok(())
            }
            Command::Range(run) => {
                self.start_run(RunKind::Range(run));
                Ok(())
            }
            Command::Transactions { symbols, days_ago } => {
                self.show_transactions(&symbols, days_ago).await
            }
            Command::Flatten => self.flatten().await,
            Command::Runs => {
                self.show_runs();
                Ok(())
            }
            Command::Cancel { symbol } => {
                self.cancel(symbol);
                Ok(())
            }
            Command::Stop => {
                warn!(
                    "Stop command passed to command handler - this should have been handled externally"
                );
                Ok(())
            }
        };

        match result {
            Err(error) if error.is::<AuthError>() => Err(error),
            Err(error) => {
                error!("Command failed: {error:?}");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn handle_run_event(&mut self, event: RunEvent) -> anyhow::Result<()> {
        match event {
            RunEvent::Finished { symbol, id, result } => {
                let description = self
                    .runs
                    .finish(symbol, id)
                    .map(|run| run.description)
                    .unwrap_or_else(|| symbol.to_string());

                match result {
                    Ok(outcome) => info!("{description}: {outcome}"),
                    Err(error) if error.is::<AuthError>() => {
                        error!("{description} stopped by an authentication failure");
                        return Err(error);
                    }
                    Err(error) => error!("{description} failed: {error:?}"),
                }
            }
        }

        Ok(())
    }

    fn start_run(&mut self, kind: RunKind) {
        let symbol = kind.symbol();
        let rest = self.rest.clone();
        let timing = self.timing;

        let started = self.runs.spawn(
            symbol,
            kind.to_string(),
            OffsetDateTime::now_utc(),
            self.run_events.clone(),
            move |signal| async move { kind.run(&rest, timing, signal).await },
        );

        if !started {
            warn!("{symbol} already has an active run; cancel it first");
        }
    }

    fn show_runs(&self) {
        if self.runs.is_empty() {
            info!("No active runs");
            return;
        }

        let mut listing = String::from("Active runs:");
        for (_, run) in self.runs.iter() {
            let since = util::format_or_placeholder(Config::localize(run.started), &TIME_FORMAT);
            listing.push_str(&format!("\n  {} (since {since})", run.description));
        }
        info!("{listing}");
    }

    fn cancel(&self, symbol: Option<Symbol>) {
        match symbol {
            Some(symbol) if self.runs.cancel(symbol) => {
                info!("Cancelling the {symbol} run at its next tick")
            }
            Some(symbol) => info!("No active run for {symbol}"),
            None => {
                let count = self.runs.cancel_all();
                info!("Cancelling {count} run(s)");
            }
        }
    }

    async fn show_quotes(&self, symbols: &[Symbol]) -> anyhow::Result<()> {
        match self.rest.quotes(symbols).await? {
            Some(quotes) => info!("{}", report::quotes(symbols, &quotes)),
            None => warn!("Error getting quotes"),
        }
        Ok(())
    }

    async fn place_order(
        &self,
        instruction: Instruction,
        symbol: Symbol,
        shares: u32,
        price: PriceSource,
    ) -> anyhow::Result<()> {
        let response = self
            .rest
            .place_order(instruction, symbol, shares, price)
            .await?;

        if response.accepted() {
            info!("{instruction} {symbol} {shares}: {response}");
        } else {
            warn!("{instruction} {symbol} {shares} was not accepted: {response}");
        }
        Ok(())
    }

    async fn show_balance(&self) -> anyhow::Result<()> {
        let account = self.rest.account().await?;
        info!(
            "Account balance: {}",
            format_currency(account.current_balances.equity)
        );
        Ok(())
    }

    async fn show_positions(&self, symbols: &[Symbol]) -> anyhow::Result<()> {
        let account = self.rest.account().await?;

        let quotes = if symbols.is_empty() {
            Default::default()
        } else {
            match self.rest.quotes(symbols).await? {
                Some(quotes) => quotes,
                None => {
                    warn!("Error getting quotes");
                    return Ok(());
                }
            }
        };

        info!(
            "{}",
            report::positions(&account.positions, symbols, &quotes)
        );
        Ok(())
    }

    async fn show_transactions(&self, symbols: &[Symbol], days_ago: u32) -> anyhow::Result<()> {
        let (start, end) = report::day_window(Config::localize(OffsetDateTime::now_utc()), days_ago);

        let names = symbols
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join("/");
        let mut out = format!(
            "{names}: {} - {}\n",
            util::format_or_placeholder(start, &DAY_LABEL_FORMAT),
            util::format_or_placeholder(end, &DAY_LABEL_FORMAT)
        );

        let mut total = Decimal::ZERO;
        for &symbol in symbols {
            let fills = match self.rest.fills(symbol, start, end).await? {
                Some(fills) => fills,
                None => {
                    warn!("Error getting transactions for {symbol}");
                    Vec::new()
                }
            };

            let trips = group_round_trips(fills);
            total += trips.total_profit();
            report::write_round_trips(&mut out, symbol, &trips)?;
        }

        out.push_str(&format!("Total profit: {}", format_currency(total)));
        info!("{out}");
        Ok(())
    }

    async fn flatten(&self) -> anyhow::Result<()> {
        let account = self.rest.account().await?;
        let orders = report::flatten_orders(&account.positions);

        if orders.is_empty() {
            info!("No open positions");
            return Ok(());
        }

        for (instruction, symbol, shares) in orders {
            let response = self
                .rest
                .place_order(instruction, symbol, shares, PriceSource::Market)
                .await?;

            if response.accepted() {
                info!("{instruction} {symbol} {shares}: {response}");
            } else {
                error!(
                    "Error disposing of {symbol}: {shares} shares: instruction is {instruction}: {response}"
                );
            }
        }

        Ok(())
    }
}
