use std::array;
use std::time::Duration;

use anyhow::{anyhow, Context};
use common::config::Config;
use common::util::parse_decimal;
use entity::trading::Instruction;
use log::{error, warn};
use rest::PriceSource;
use rust_decimal::Decimal;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::Editor;
use stock_symbol::Symbol;
use time::UtcOffset;
use tokio::task;

use crate::controller::params::{parse_known_extreme, LimitPolicy, TargetChange};
use crate::controller::{ExtremeRun, Polarity, RangeMode, RangeRun};
use crate::event::{Command, EventEmitter};

const HISTORY_FILE: &str = "./.history";

pub async fn run_task(emitter: EventEmitter<Command>, mut editor: Editor<(), FileHistory>) {
    // No history yet on first launch
    let _ = editor.load_history(HISTORY_FILE);

    let mut editor = Some(Box::new(editor));
    let mut error_count = 0;

    loop {
        let Some(mut current) = editor.take() else {
            return;
        };

        let join_result = task::spawn_blocking(move || {
            let result = current.readline("> ");
            (current, result)
        })
        .await;

        let (mut returned_editor, input) = match join_result {
            Ok(ret) => ret,
            Err(unhandled_error) => {
                error!("Terminal reader task panicked: {unhandled_error:?}. Aborting CLI.");
                emitter.emit(Command::Stop).await;
                return;
            }
        };

        match input {
            Ok(input) => {
                if !input.trim().is_empty() {
                    if let Err(error) = returned_editor.add_history_entry(input.trim()) {
                        warn!("Failed to record command history: {error}");
                    }
                }

                if let Some(command) = parse_command(&input) {
                    let should_stop = matches!(command, Command::Stop);
                    emitter.emit(command).await;
                    if should_stop {
                        save_history(&mut returned_editor);
                        return;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                save_history(&mut returned_editor);
                emitter.emit(Command::Stop).await;
                return;
            }
            // Do nothing
            Err(ReadlineError::WindowResized | ReadlineError::Eof) => (),
            Err(error) => {
                error!("Unexpected error when reading CLI input: {error:?}");
                error_count += 1;

                if error_count > 3 {
                    error!("Maximum retries exceeded, aborting CLI");
                    emitter.emit(Command::Stop).await;
                    return;
                }

                editor = Some(returned_editor);
                tokio::time::sleep(Duration::from_secs(3u64.pow(error_count))).await;
                continue;
            }
        }

        editor = Some(returned_editor);

        // We successfully processed some line input, so we reset the error count
        error_count = 0;
    }
}

fn save_history(editor: &mut Editor<(), FileHistory>) {
    if let Err(error) = editor.save_history(HISTORY_FILE) {
        warn!("Failed to save command history: {error}");
    }
}

fn parse_command(input: &str) -> Option<Command> {
    let mut components = input.split_whitespace();
    let name = components.next()?.to_ascii_lowercase();
    let args = components.collect::<Vec<_>>();

    let Some(spec) = find_command(&name) else {
        println!("Unknown command \"{name}\". Type \"help\" for a list of commands.");
        return None;
    };

    match spec.parse(&name, &args) {
        Ok(command) => command,
        Err(error) => {
            println!("{error:#}. Usage: {}", spec.usage());
            None
        }
    }
}

fn find_command(name: &str) -> Option<&'static dyn CommandSpec> {
    COMMANDS
        .iter()
        .copied()
        .find(|spec| spec.names().iter().any(|&candidate| candidate == name))
}

/// One entry of the command table.
trait CommandSpec: Sync {
    fn names(&self) -> &'static [&'static str];

    fn usage(&self) -> &'static str;

    fn help(&self) -> &'static str;

    /// `Ok(None)` means the command was handled here and nothing goes to the engine.
    fn parse(&self, name: &str, args: &[&str]) -> anyhow::Result<Option<Command>>;
}

static COMMANDS: &[&dyn CommandSpec] = &[
    &QuoteCommand,
    &OrderCommand,
    &BalanceCommand,
    &PositionsCommand,
    &ExtremeCommand,
    &RangeCommand,
    &TransactionsCommand,
    &FlattenCommand,
    &RunsCommand,
    &CancelCommand,
    &SetUtcOffsetCommand,
    &HelpCommand,
    &StopCommand,
];

struct QuoteCommand;

impl CommandSpec for QuoteCommand {
    fn names(&self) -> &'static [&'static str] {
        &["quote"]
    }

    fn usage(&self) -> &'static str {
        "quote <symbol1,symbol2,...>"
    }

    fn help(&self) -> &'static str {
        "Get quotes (last, bid, ask) for symbols"
    }

    fn parse(&self, _name: &str, args: &[&str]) -> anyhow::Result<Option<Command>> {
        let symbols = parse_symbols(required(args, 0, "symbols")?)?;
        Ok(Some(Command::Quote { symbols }))
    }
}

struct OrderCommand;

impl CommandSpec for OrderCommand {
    fn names(&self) -> &'static [&'static str] {
        &["order"]
    }

    fn usage(&self) -> &'static str {
        "order <b|s|bs|ss|bts|sts> <symbol> <shares> [price | offset | bid | ask]"
    }

    fn help(&self) -> &'static str {
        "Place a buy, sell, stop or trailing stop order; without a price buys and sells go out at market"
    }

    fn parse(&self, _name: &str, args: &[&str]) -> anyhow::Result<Option<Command>> {
        let instruction = required(args, 0, "instruction")?.parse::<Instruction>()?;
        let symbol = parse_symbol(required(args, 1, "symbol")?)?;
        let shares = parse_shares(required(args, 2, "shares")?)?;

        let price = match args.get(3).map(|arg| arg.to_ascii_lowercase()) {
            None => PriceSource::Market,
            Some(arg) if arg == "bid" => PriceSource::Bid,
            Some(arg) if arg == "ask" => PriceSource::Ask,
            Some(arg) => PriceSource::Fixed(parse_price(&arg, "price")?),
        };

        if instruction.requires_price() && price == PriceSource::Market {
            return Err(anyhow!("{instruction} orders need a price or offset"));
        }

        Ok(Some(Command::Order {
            instruction,
            symbol,
            shares,
            price,
        }))
    }
}

struct BalanceCommand;

impl CommandSpec for BalanceCommand {
    fn names(&self) -> &'static [&'static str] {
        &["bal", "balance"]
    }

    fn usage(&self) -> &'static str {
        "bal"
    }

    fn help(&self) -> &'static str {
        "Show the account balance"
    }

    fn parse(&self, _name: &str, _args: &[&str]) -> anyhow::Result<Option<Command>> {
        Ok(Some(Command::Balance))
    }
}

struct PositionsCommand;

impl CommandSpec for PositionsCommand {
    fn names(&self) -> &'static [&'static str] {
        &["pos", "positions"]
    }

    fn usage(&self) -> &'static str {
        "pos [symbol1,symbol2,...]"
    }

    fn help(&self) -> &'static str {
        "Show positions; with symbols, also show gain/loss against the last price"
    }

    fn parse(&self, _name: &str, args: &[&str]) -> anyhow::Result<Option<Command>> {
        let symbols = match args.first() {
            Some(arg) => parse_symbols(arg)?,
            None => Vec::new(),
        };
        Ok(Some(Command::Positions { symbols }))
    }
}

struct ExtremeCommand;

impl CommandSpec for ExtremeCommand {
    fn names(&self) -> &'static [&'static str] {
        &["buylow", "sellhigh"]
    }

    fn usage(&self) -> &'static str {
        "buylow|sellhigh <symbol> <shares> <change[%]> [extreme | -1] [limit | 0 | -1]"
    }

    fn help(&self) -> &'static str {
        "Enter a position once price bounces a target change off its low (buylow) or high (sellhigh)"
    }

    fn parse(&self, name: &str, args: &[&str]) -> anyhow::Result<Option<Command>> {
        let polarity = if name == "sellhigh" {
            Polarity::SellHigh
        } else {
            Polarity::BuyLow
        };

        let symbol = parse_symbol(required(args, 0, "symbol")?)?;
        let shares = parse_shares(required(args, 1, "shares")?)?;
        let change = TargetChange::parse(required(args, 2, "change")?)?;
        let known_extreme = match args.get(3) {
            Some(arg) => parse_known_extreme(arg)?,
            None => None,
        };
        let limit = match args.get(4) {
            Some(arg) => LimitPolicy::parse(arg)?,
            None => LimitPolicy::None,
        };

        Ok(Some(Command::Extreme(ExtremeRun {
            polarity,
            symbol,
            shares,
            change,
            known_extreme,
            limit,
        })))
    }
}

struct RangeCommand;

impl CommandSpec for RangeCommand {
    fn names(&self) -> &'static [&'static str] {
        &["breakout", "oscillate"]
    }

    fn usage(&self) -> &'static str {
        "breakout|oscillate <symbol> <shares> <low> <high>"
    }

    fn help(&self) -> &'static str {
        "Enter a position when price breaks out of (breakout) or leaves and should return to (oscillate) a range"
    }

    fn parse(&self, name: &str, args: &[&str]) -> anyhow::Result<Option<Command>> {
        let mode = if name == "oscillate" {
            RangeMode::Oscillate
        } else {
            RangeMode::Breakout
        };

        let symbol = parse_symbol(required(args, 0, "symbol")?)?;
        let shares = parse_shares(required(args, 1, "shares")?)?;
        let low = parse_price(required(args, 2, "low")?, "low")?;
        let high = parse_price(required(args, 3, "high")?, "high")?;

        if low > high {
            return Err(anyhow!("Low bound {low} is above high bound {high}"));
        }

        Ok(Some(Command::Range(RangeRun {
            mode,
            symbol,
            shares,
            low,
            high,
        })))
    }
}

struct TransactionsCommand;

impl CommandSpec for TransactionsCommand {
    fn names(&self) -> &'static [&'static str] {
        &["trans"]
    }

    fn usage(&self) -> &'static str {
        "trans <symbol1,symbol2,...> [days ago]"
    }

    fn help(&self) -> &'static str {
        "Show a day's fills grouped into round trips, with realized profit"
    }

    fn parse(&self, _name: &str, args: &[&str]) -> anyhow::Result<Option<Command>> {
        let symbols = parse_symbols(required(args, 0, "symbols")?)?;
        let days_ago = match args.get(1) {
            Some(arg) => arg
                .parse::<u32>()
                .with_context(|| format!("Invalid day offset \"{arg}\""))?,
            None => 0,
        };

        Ok(Some(Command::Transactions { symbols, days_ago }))
    }
}

struct FlattenCommand;

impl CommandSpec for FlattenCommand {
    fn names(&self) -> &'static [&'static str] {
        &["flatten"]
    }

    fn usage(&self) -> &'static str {
        "flatten"
    }

    fn help(&self) -> &'static str {
        "Close every open position at market"
    }

    fn parse(&self, _name: &str, _args: &[&str]) -> anyhow::Result<Option<Command>> {
        Ok(Some(Command::Flatten))
    }
}

struct RunsCommand;

impl CommandSpec for RunsCommand {
    fn names(&self) -> &'static [&'static str] {
        &["runs"]
    }

    fn usage(&self) -> &'static str {
        "runs"
    }

    fn help(&self) -> &'static str {
        "List active buylow, sellhigh, breakout and oscillate runs"
    }

    fn parse(&self, _name: &str, _args: &[&str]) -> anyhow::Result<Option<Command>> {
        Ok(Some(Command::Runs))
    }
}

struct CancelCommand;

impl CommandSpec for CancelCommand {
    fn names(&self) -> &'static [&'static str] {
        &["cancel"]
    }

    fn usage(&self) -> &'static str {
        "cancel [symbol]"
    }

    fn help(&self) -> &'static str {
        "Cancel the run for a symbol, or every run"
    }

    fn parse(&self, _name: &str, args: &[&str]) -> anyhow::Result<Option<Command>> {
        let symbol = args.first().map(|arg| parse_symbol(arg)).transpose()?;
        Ok(Some(Command::Cancel { symbol }))
    }
}

struct SetUtcOffsetCommand;

impl CommandSpec for SetUtcOffsetCommand {
    fn names(&self) -> &'static [&'static str] {
        &["set-utc-offset", "suo"]
    }

    fn usage(&self) -> &'static str {
        "set-utc-offset <H:M:S>"
    }

    fn help(&self) -> &'static str {
        "Override the local UTC offset used for display and day boundaries"
    }

    fn parse(&self, _name: &str, args: &[&str]) -> anyhow::Result<Option<Command>> {
        let offset = parse_utc_offset(required(args, 0, "offset")?)?;
        Config::get().utc_offset.set(offset);
        println!("Updated UTC offset");
        Ok(None)
    }
}

struct HelpCommand;

impl CommandSpec for HelpCommand {
    fn names(&self) -> &'static [&'static str] {
        &["help", "h", "?"]
    }

    fn usage(&self) -> &'static str {
        "help"
    }

    fn help(&self) -> &'static str {
        "Show this list"
    }

    fn parse(&self, _name: &str, _args: &[&str]) -> anyhow::Result<Option<Command>> {
        for spec in COMMANDS {
            println!("{}: {}", spec.usage(), spec.help());
        }
        Ok(None)
    }
}

struct StopCommand;

impl CommandSpec for StopCommand {
    fn names(&self) -> &'static [&'static str] {
        &["q", "quit", "stop"]
    }

    fn usage(&self) -> &'static str {
        "q"
    }

    fn help(&self) -> &'static str {
        "Cancel all runs and quit"
    }

    fn parse(&self, _name: &str, _args: &[&str]) -> anyhow::Result<Option<Command>> {
        Ok(Some(Command::Stop))
    }
}

fn required<'a>(args: &[&'a str], index: usize, name: &str) -> anyhow::Result<&'a str> {
    args.get(index)
        .copied()
        .ok_or_else(|| anyhow!("Missing argument <{name}>"))
}

fn parse_symbol(arg: &str) -> anyhow::Result<Symbol> {
    Symbol::from_str(&arg.to_ascii_uppercase())
        .map_err(|error| anyhow!("Invalid symbol \"{arg}\": {error}"))
}

fn parse_symbols(arg: &str) -> anyhow::Result<Vec<Symbol>> {
    arg.split(',')
        .filter(|symbol| !symbol.is_empty())
        .map(parse_symbol)
        .collect()
}

fn parse_shares(arg: &str) -> anyhow::Result<u32> {
    match arg.parse::<u32>() {
        Ok(0) => Err(anyhow!("Share count must be positive")),
        Ok(shares) => Ok(shares),
        Err(error) => Err(anyhow!("Invalid share count \"{arg}\": {error}")),
    }
}

fn parse_price(arg: &str, name: &str) -> anyhow::Result<Decimal> {
    let price = parse_decimal(arg)?;
    if price <= Decimal::ZERO {
        return Err(anyhow!("<{name}> must be positive, got {arg}"));
    }
    Ok(price)
}

fn parse_utc_offset(arg: &str) -> anyhow::Result<UtcOffset> {
    let mut time_components = arg.split(':');
    let [h, m, s] = array::from_fn(|_| {
        time_components
            .next()
            .and_then(|component| component.parse::<i8>().ok())
    });

    match (h, m, s) {
        (Some(h), Some(m), Some(s)) => {
            UtcOffset::from_hms(h, m, s).map_err(|error| anyhow!("Component out of range: {error}"))
        }
        _ => Err(anyhow!(
            "Required offset in the form H:M:S where H, M, and S are signed integers"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn every_name_is_unique() {
        let mut names = COMMANDS
            .iter()
            .flat_map(|spec| spec.names().iter().copied())
            .collect::<Vec<_>>();
        let count = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), count);
    }

    #[test]
    fn buylow_with_all_arguments() {
        let command = parse_command("buylow xle 10 0.0025% -1 0").unwrap();
        let Command::Extreme(run) = command else {
            panic!("expected an extreme run, got {command:?}");
        };

        assert_eq!(run.polarity, Polarity::BuyLow);
        assert_eq!(run.symbol, Symbol::from_str("XLE").unwrap());
        assert_eq!(run.shares, 10);
        assert_eq!(run.change, TargetChange::Percent(dec!(0.0025)));
        assert_eq!(run.known_extreme, None);
        assert_eq!(run.limit, LimitPolicy::DefaultStop);
    }

    #[test]
    fn sellhigh_defaults_optional_arguments() {
        let Some(Command::Extreme(run)) = parse_command("SELLHIGH XLE 5 0.25") else {
            panic!("expected an extreme run");
        };

        assert_eq!(run.polarity, Polarity::SellHigh);
        assert_eq!(run.change, TargetChange::Absolute(dec!(0.25)));
        assert_eq!(run.limit, LimitPolicy::None);
    }

    #[test]
    fn malformed_arguments_abort_only_that_command() {
        assert!(parse_command("buylow XLE ten 0.25").is_none());
        assert!(parse_command("buylow XLE 0 0.25").is_none());
        assert!(parse_command("buylow XLE 10 0.25 78 -5").is_none());
        assert!(parse_command("breakout XLE 10 80 79").is_none());
        assert!(parse_command("order ss XLE 10").is_none());
        assert!(parse_command("frobnicate").is_none());
        assert!(parse_command("   ").is_none());
    }

    #[test]
    fn order_price_sources() {
        let Some(Command::Order { price, instruction, .. }) = parse_command("order b XLE 10 bid")
        else {
            panic!("expected an order");
        };
        assert_eq!(instruction, Instruction::Buy);
        assert_eq!(price, PriceSource::Bid);

        let Some(Command::Order { price, .. }) = parse_command("order sts XLE 10 0.5") else {
            panic!("expected an order");
        };
        assert_eq!(price, PriceSource::Fixed(dec!(0.5)));
    }

    #[test]
    fn range_and_transactions() {
        let Some(Command::Range(run)) = parse_command("oscillate SPY 3 570 575.5") else {
            panic!("expected a range run");
        };
        assert_eq!(run.mode, RangeMode::Oscillate);
        assert_eq!(run.high, dec!(575.5));

        let Some(Command::Transactions { symbols, days_ago }) = parse_command("trans xle,spy 2")
        else {
            panic!("expected a transactions report");
        };
        assert_eq!(symbols.len(), 2);
        assert_eq!(days_ago, 2);
    }

    #[test]
    fn stop_aliases() {
        for input in ["q", "quit", "stop"] {
            assert!(matches!(parse_command(input), Some(Command::Stop)));
        }
    }

    #[test]
    fn utc_offsets() {
        assert_eq!(
            parse_utc_offset("-4:0:0").unwrap(),
            UtcOffset::from_hms(-4, 0, 0).unwrap()
        );
        assert!(parse_utc_offset("-4:00").is_err());
        assert!(parse_utc_offset("30:0:0").is_err());
    }
}
