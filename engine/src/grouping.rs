use std::cmp::Ordering;

use entity::market::Fill;
use rust_decimal::Decimal;

/// A complete round trip: fills whose signed share counts add up to exactly zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeGroup {
    fills: Vec<Fill>,
}

impl TradeGroup {
    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    /// Realized profit: the negated sum of `shares * price` over the group.
    pub fn profit(&self) -> Decimal {
        self.fills.iter().map(Fill::cash_flow).sum()
    }
}

/// Every input fill ends up in exactly one of `groups`, `orphans` or `incomplete`.
#[derive(Debug, Default)]
pub struct RoundTrips {
    pub groups: Vec<TradeGroup>,
    /// Fills seen outside any group that do not open one, e.g. the close of a position
    /// opened before the window.
    pub orphans: Vec<Fill>,
    /// A group still open at the end of the window. Not counted in the total.
    pub incomplete: Vec<Fill>,
}

impl RoundTrips {
    pub fn total_profit(&self) -> Decimal {
        self.groups.iter().map(TradeGroup::profit).sum()
    }

    pub fn fill_count(&self) -> usize {
        self.groups
            .iter()
            .map(|group| group.fills.len())
            .sum::<usize>()
            + self.orphans.len()
            + self.incomplete.len()
    }
}

fn chronological(a: &Fill, b: &Fill) -> Ordering {
    (a.trade_time, a.effect).cmp(&(b.trade_time, b.effect))
}

/// Matches the fills of one symbol into round trips. Fills are put in trade order first;
/// input order only decides between fills with the same timestamp and effect.
pub fn group_round_trips(fills: impl IntoIterator<Item = Fill>) -> RoundTrips {
    let mut fills = fills.into_iter().collect::<Vec<_>>();
    fills.sort_by(chronological);

    let mut round_trips = RoundTrips::default();
    let mut open = Vec::new();
    let mut unmatched = Decimal::ZERO;

    for fill in fills {
        if open.is_empty() && !fill.is_opening() {
            round_trips.orphans.push(fill);
            continue;
        }

        unmatched += fill.shares;
        open.push(fill);

        if unmatched.is_zero() {
            let mut group = std::mem::take(&mut open);
            group.sort_by(chronological);
            round_trips.groups.push(TradeGroup { fills: group });
        }
    }

    round_trips.incomplete = open;
    round_trips
}
