use std::fmt::{self, Display, Formatter};

use common::{
    config::Config,
    util::{self, FILL_TIME_FORMAT},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stock_symbol::Symbol;
use time::OffsetDateTime;

use crate::trading::{BrokerId, RawQuote, Transaction, WideSymbol};

/// A single quote snapshot. It has no identity beyond the tick it was read on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub symbol: Symbol,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    pub fn from_raw(symbol: Symbol, raw: RawQuote) -> Self {
        Self {
            symbol,
            last: raw.last_price,
            bid: raw.bid_price,
            ask: raw.ask_price,
        }
    }
}

impl Display for Quote {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: last {}, bid {}, ask {}",
            self.symbol, self.last, self.bid, self.ask
        )
    }
}

// Declaration order matters: openings sort ahead of closings at the same timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionEffect {
    Opening,
    Closing,
}

impl Display for PositionEffect {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opening => f.write_str("OPENING"),
            Self::Closing => f.write_str("CLOSING"),
        }
    }
}

/// One executed trade leg as reported by the broker.
///
/// `shares` keeps the broker's sign: positive when shares were bought, negative when sold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub trade_time: OffsetDateTime,
    pub position_id: Option<BrokerId>,
    pub symbol: WideSymbol,
    pub shares: Decimal,
    pub price: Decimal,
    pub effect: PositionEffect,
}

impl Fill {
    pub fn is_opening(&self) -> bool {
        self.effect == PositionEffect::Opening
    }

    /// Cash moved by this fill: negative when buying, positive when selling.
    pub fn cash_flow(&self) -> Decimal {
        -(self.shares * self.price)
    }

    /// Expands a broker transaction into its fills. Legs without a position effect
    /// (fees, commissions) are not trades and are left out.
    pub fn from_transaction(transaction: &Transaction) -> impl Iterator<Item = Fill> + '_ {
        transaction.transfer_items.iter().filter_map(|item| {
            let effect = item.position_effect?;
            Some(Fill {
                trade_time: transaction.trade_date,
                position_id: transaction.position_id.clone(),
                symbol: item.instrument.symbol.clone(),
                shares: item.amount,
                price: item.price,
                effect,
            })
        })
    }
}

impl Display for Fill {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let when = util::format_or_placeholder(Config::localize(self.trade_time), &FILL_TIME_FORMAT);
        write!(
            f,
            "{when} {}: {}: {} shares @ {}",
            self.symbol, self.effect, self.shares, self.price
        )?;

        if let Some(position_id) = &self.position_id {
            write!(f, " [{position_id}]")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn opening_sorts_before_closing() {
        assert!(PositionEffect::Opening < PositionEffect::Closing);
    }

    #[test]
    fn transactions_expand_to_trade_fills_only() {
        let json = r#"{
            "tradeDate": "2024-10-03T14:01:02+0000",
            "positionId": 42,
            "transferItems": [
                { "instrument": { "symbol": "CURRENCY_USD" }, "amount": 0.01 },
                { "instrument": { "symbol": "XLE" }, "amount": 10.0, "price": 78.22, "positionEffect": "OPENING" }
            ]
        }"#;
        let transaction: Transaction = serde_json::from_str(json).unwrap();

        let fills = Fill::from_transaction(&transaction).collect::<Vec<_>>();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].symbol.as_str(), "XLE");
        assert_eq!(fills[0].shares, dec!(10));
        assert_eq!(fills[0].position_id, Some(BrokerId::Number(42)));
        assert!(fills[0].is_opening());
        assert_eq!(fills[0].cash_flow(), dec!(-782.2));
    }
}
