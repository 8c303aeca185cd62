use std::collections::HashMap;
use std::fmt::{self, Write};

use common::util::format_currency;
use entity::market::Quote;
use entity::trading::{Instruction, Position};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use stock_symbol::Symbol;
use time::macros::time;
use time::{Duration, OffsetDateTime, Time};

use crate::grouping::RoundTrips;

pub fn quotes(symbols: &[Symbol], quotes: &HashMap<Symbol, Quote>) -> String {
    let mut report = String::new();
    for symbol in symbols {
        let line = match quotes.get(symbol) {
            Some(quote) => quote.to_string(),
            None => format!("{symbol}: no quote (is the symbol misspelled?)"),
        };
        push_line(&mut report, &line);
    }
    report
}

/// Lists positions. With `symbols`, only those are shown together with their gain or loss
/// at the current last price.
pub fn positions(
    positions: &[Position],
    symbols: &[Symbol],
    quotes: &HashMap<Symbol, Quote>,
) -> String {
    let mut report = String::new();
    let mut total = Decimal::ZERO;

    for position in positions {
        let name = position.instrument.symbol.as_str();
        let quantity = position.net_quantity();
        let average = position.average_price();

        if symbols.is_empty() {
            push_line(&mut report, &format!("{name}: {quantity} @ {average}"));
            continue;
        }

        let Some(symbol) = position
            .instrument
            .symbol
            .to_compact()
            .filter(|symbol| symbols.contains(symbol))
        else {
            continue;
        };

        match quotes.get(&symbol) {
            Some(quote) => {
                let gain = quantity * (quote.last - average);
                total += gain;
                push_line(
                    &mut report,
                    &format!(
                        "{symbol}: {quantity} @ {average} ({}); gain/loss: {}",
                        quote.last,
                        format_currency(gain)
                    ),
                );
            }
            None => push_line(
                &mut report,
                &format!("{symbol}: unable to retrieve quote (is the symbol misspelled?)"),
            ),
        }
    }

    if report.is_empty() {
        return "No open positions".to_owned();
    }

    if symbols.len() > 1 && !total.is_zero() {
        push_line(&mut report, "----");
        push_line(
            &mut report,
            &format!("Total gain/loss: {}", format_currency(total)),
        );
    }

    report
}

/// Market orders that bring every position back to zero shares.
pub fn flatten_orders(positions: &[Position]) -> Vec<(Instruction, Symbol, u32)> {
    positions
        .iter()
        .filter_map(|position| {
            let symbol = position.instrument.symbol.to_compact()?;
            let quantity = position.net_quantity();
            let shares = quantity.abs().trunc().to_u32().filter(|&shares| shares > 0)?;
            let instruction = if quantity > Decimal::ZERO {
                Instruction::Sell
            } else {
                Instruction::Buy
            };
            Some((instruction, symbol, shares))
        })
        .collect()
}

/// The local calendar day `days_ago` days before `local_now`, from midnight to 23:59:59.
pub fn day_window(local_now: OffsetDateTime, days_ago: u32) -> (OffsetDateTime, OffsetDateTime) {
    let start = local_now.replace_time(Time::MIDNIGHT) - Duration::days(days_ago.into());
    let end = start.replace_time(time!(23:59:59));
    (start, end)
}

pub fn write_round_trips(out: &mut String, symbol: Symbol, trips: &RoundTrips) -> fmt::Result {
    writeln!(out, "{symbol}")?;

    for orphan in &trips.orphans {
        writeln!(out, "  Active (ungrouped) fill: {orphan}")?;
    }

    for (index, group) in trips.groups.iter().enumerate() {
        writeln!(out, "  Group {}", index + 1)?;
        for fill in group.fills() {
            writeln!(out, "    {fill}")?;
        }
        writeln!(out, "    Group profit: {}", format_currency(group.profit()))?;
    }

    if !trips.incomplete.is_empty() {
        writeln!(out, "  Open group (not counted)")?;
        for fill in &trips.incomplete {
            writeln!(out, "    {fill}")?;
        }
    }

    writeln!(
        out,
        "  {symbol} profit: {}",
        format_currency(trips.total_profit())
    )
}

fn push_line(report: &mut String, line: &str) {
    if !report.is_empty() {
        report.push('\n');
    }
    report.push_str(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn position(json: &str) -> Position {
        serde_json::from_str(json).unwrap()
    }

    fn symbol(s: &str) -> Symbol {
        Symbol::from_str(s).unwrap()
    }

    fn sample_positions() -> Vec<Position> {
        vec![
            position(
                r#"{ "instrument": { "symbol": "XLE" }, "longQuantity": 10.0, "shortQuantity": 0.0, "averageLongPrice": 78.0 }"#,
            ),
            position(
                r#"{ "instrument": { "symbol": "SPY" }, "longQuantity": 0.0, "shortQuantity": 2.0, "averageShortPrice": 570.0 }"#,
            ),
        ]
    }

    #[test]
    fn positions_without_symbols_list_everything() {
        let report = positions(&sample_positions(), &[], &HashMap::new());
        assert_eq!(report, "XLE: 10 @ 78\nSPY: -2 @ 570");
    }

    #[test]
    fn positions_with_symbols_total_gain() {
        let quotes = [
            Quote {
                symbol: symbol("XLE"),
                last: dec!(79),
                bid: dec!(78.99),
                ask: dec!(79.01),
            },
            Quote {
                symbol: symbol("SPY"),
                last: dec!(575),
                bid: dec!(574.9),
                ask: dec!(575.1),
            },
        ]
        .into_iter()
        .map(|quote| (quote.symbol, quote))
        .collect::<HashMap<_, _>>();

        let report = positions(
            &sample_positions(),
            &[symbol("XLE"), symbol("SPY")],
            &quotes,
        );
        let lines = report.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "XLE: 10 @ 78 (79); gain/loss: $10.00");
        assert_eq!(lines[1], "SPY: -2 @ 570 (575); gain/loss: -$10.00");
        // The two cancel out, so no total line
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn no_positions() {
        assert_eq!(positions(&[], &[], &HashMap::new()), "No open positions");
    }

    #[test]
    fn flatten_reverses_each_position() {
        let orders = flatten_orders(&sample_positions());
        assert_eq!(
            orders,
            vec![
                (Instruction::Sell, symbol("XLE"), 10),
                (Instruction::Buy, symbol("SPY"), 2),
            ]
        );
    }

    #[test]
    fn day_window_covers_the_local_day() {
        let now = datetime!(2024-10-03 15:42:10 -4);
        let (start, end) = day_window(now, 1);

        assert_eq!(start, datetime!(2024-10-02 00:00:00 -4));
        assert_eq!(end, datetime!(2024-10-02 23:59:59 -4));
    }
}
