use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use common::util::deserialize_trade_timestamp;
use rust_decimal::Decimal;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stock_symbol::Symbol;
use time::OffsetDateTime;

use crate::market::PositionEffect;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AccountNumber {
    pub account_number: String,
    pub hash_value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub securities_account: SecuritiesAccount,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritiesAccount {
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub positions: Vec<Position>,
    pub current_balances: Balances,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balances {
    #[serde(with = "rust_decimal::serde::float")]
    pub equity: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub instrument: Instrument,
    #[serde(with = "rust_decimal::serde::float")]
    pub long_quantity: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub short_quantity: Decimal,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub average_long_price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub average_short_price: Option<Decimal>,
}

impl Position {
    /// Signed share count: positive for a long position, negative for a short one.
    pub fn net_quantity(&self) -> Decimal {
        self.long_quantity - self.short_quantity
    }

    pub fn average_price(&self) -> Decimal {
        self.average_long_price
            .or(self.average_short_price)
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub symbol: WideSymbol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
}

#[derive(Deserialize)]
pub struct QuoteEntry {
    #[serde(default)]
    pub quote: Option<RawQuote>,
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RawQuote {
    #[serde(with = "rust_decimal::serde::float")]
    pub last_price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub ask_price: Decimal,
}

// Keys are symbols, plus an "errors" entry when some symbols are invalid
pub type QuoteResponse = HashMap<String, QuoteEntry>;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum BrokerId {
    Number(i64),
    Text(String),
}

impl Display for BrokerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BrokerOrder {
    pub order_id: BrokerId,
    pub status: OrderStatus,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub order_strategy_type: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub order_leg_collection: Vec<OrderLeg>,
    #[serde(default)]
    pub child_order_strategies: Vec<BrokerOrder>,
}

impl BrokerOrder {
    /// The order carrying the legs. One-cancels-other orders keep them in their children.
    pub fn primary(&self) -> &BrokerOrder {
        match self.order_strategy_type.as_deref() {
            Some("OCO") => self.child_order_strategies.first().unwrap_or(self),
            _ => self,
        }
    }

    pub fn symbol(&self) -> Option<&WideSymbol> {
        self.primary()
            .order_leg_collection
            .first()
            .map(|leg| &leg.instrument.symbol)
    }

    pub fn is_working(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Working | OrderStatus::PendingActivation
        )
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OrderLeg {
    pub instruction: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub quantity: Decimal,
    pub instrument: Instrument,
}

#[derive(Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    AwaitingParentOrder,
    AwaitingCondition,
    AwaitingStopCondition,
    AwaitingManualReview,
    Accepted,
    PendingActivation,
    Queued,
    Working,
    Rejected,
    PendingCancel,
    Canceled,
    PendingReplace,
    Replaced,
    Filled,
    Expired,
    New,

    #[serde(other)]
    Other,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_type: OrderType,
    pub session: &'static str,
    pub duration: &'static str,
    pub order_strategy_type: &'static str,
    pub order_leg_collection: Vec<OrderLegRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complex_order_strategy_type: Option<&'static str>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub price: Option<Decimal>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price_link_basis: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price_link_type: Option<&'static str>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub stop_price_offset: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_type: Option<&'static str>,
}

impl OrderRequest {
    pub fn equity(order_type: OrderType, side: OrderSide, symbol: Symbol, shares: u32) -> Self {
        Self {
            order_type,
            session: "NORMAL",
            duration: "DAY",
            order_strategy_type: "SINGLE",
            order_leg_collection: vec![OrderLegRequest {
                order_leg_type: "EQUITY",
                instruction: side,
                quantity: shares,
                quantity_type: "SHARES",
                instrument: Instrument {
                    symbol: WideSymbol::Normal(symbol),
                    asset_type: Some("EQUITY".to_owned()),
                },
            }],
            complex_order_strategy_type: None,
            price: None,
            stop_price: None,
            stop_price_link_basis: None,
            stop_price_link_type: None,
            stop_price_offset: None,
            stop_type: None,
        }
    }

    /// Builds the request for a command-line instruction. Without a price, buys and sells
    /// go out as market orders.
    pub fn for_instruction(
        instruction: Instruction,
        symbol: Symbol,
        shares: u32,
        price: Option<Decimal>,
    ) -> Self {
        let order_type = instruction.order_type(price.is_some());
        let mut request = Self::equity(order_type, instruction.side(), symbol, shares);

        match order_type {
            OrderType::TrailingStop => {
                request.stop_price_link_basis = Some("LAST");
                request.stop_price_link_type = Some("VALUE");
                request.stop_price_offset = price;
                request.stop_type = Some("STANDARD");
            }
            OrderType::Stop => {
                request.complex_order_strategy_type = Some("NONE");
                request.stop_price = price;
            }
            OrderType::Limit => {
                request.complex_order_strategy_type = Some("NONE");
                request.price = price;
            }
            OrderType::Market => (),
        }

        request
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OrderLegRequest {
    pub order_leg_type: &'static str,
    pub instruction: OrderSide,
    pub quantity: u32,
    pub quantity_type: &'static str,
    pub instrument: Instrument,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    TrailingStop,
}

// The server works out short-related variants (sell short, buy to cover) on its own
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order instructions as typed at the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Buy,
    Sell,
    BuyStop,
    SellStop,
    BuyTrailingStop,
    SellTrailingStop,
}

impl Instruction {
    pub fn side(self) -> OrderSide {
        match self {
            Self::Buy | Self::BuyStop | Self::BuyTrailingStop => OrderSide::Buy,
            Self::Sell | Self::SellStop | Self::SellTrailingStop => OrderSide::Sell,
        }
    }

    pub fn order_type(self, has_price: bool) -> OrderType {
        match self {
            Self::BuyTrailingStop | Self::SellTrailingStop => OrderType::TrailingStop,
            Self::BuyStop | Self::SellStop => OrderType::Stop,
            Self::Buy | Self::Sell if has_price => OrderType::Limit,
            Self::Buy | Self::Sell => OrderType::Market,
        }
    }

    /// Stops need a stop price and trailing stops need an offset.
    pub fn requires_price(self) -> bool {
        !matches!(self, Self::Buy | Self::Sell)
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Buy => "b",
            Self::Sell => "s",
            Self::BuyStop => "bs",
            Self::SellStop => "ss",
            Self::BuyTrailingStop => "bts",
            Self::SellTrailingStop => "sts",
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug)]
pub struct UnknownInstruction(pub String);

impl Display for UnknownInstruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown instruction \"{}\", expected one of b, s, bs, ss, bts, sts",
            self.0
        )
    }
}

impl std::error::Error for UnknownInstruction {}

impl FromStr for Instruction {
    type Err = UnknownInstruction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "b" | "buy" => Ok(Self::Buy),
            "s" | "sell" => Ok(Self::Sell),
            "bs" => Ok(Self::BuyStop),
            "ss" => Ok(Self::SellStop),
            "bts" => Ok(Self::BuyTrailingStop),
            "sts" => Ok(Self::SellTrailingStop),
            _ => Err(UnknownInstruction(s.to_owned())),
        }
    }
}

/// What the broker said about a submitted order. An accepted order comes back with
/// a success status and an empty body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderResponse {
    pub ok: bool,
    pub text: String,
}

impl OrderResponse {
    pub fn accepted(&self) -> bool {
        self.ok && self.text.trim().is_empty()
    }
}

impl Display for OrderResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.ok, self.text.trim()) {
            (_, text) if !text.is_empty() => f.write_str(text),
            (true, _) => f.write_str("OK"),
            (false, _) => f.write_str("Order failed without a message"),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(deserialize_with = "deserialize_trade_timestamp")]
    pub trade_date: OffsetDateTime,
    #[serde(default)]
    pub position_id: Option<BrokerId>,
    #[serde(default)]
    pub transfer_items: Vec<TransferItem>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub instrument: Instrument,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub price: Decimal,
    // Fee and commission legs carry no position effect
    #[serde(default)]
    pub position_effect: Option<PositionEffect>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WideSymbol {
    Normal(Symbol),
    Long(Box<str>),
}

impl WideSymbol {
    pub fn to_compact(&self) -> Option<Symbol> {
        match self {
            &Self::Normal(symbol) => Some(symbol),
            Self::Long(..) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Normal(symbol) => symbol.as_str(),
            Self::Long(symbol) => symbol,
        }
    }
}

impl Display for WideSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for WideSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WideSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct WideSymbolVisitor;

        impl<'de> Visitor<'de> for WideSymbolVisitor {
            type Value = WideSymbol;

            fn expecting(&self, f: &mut Formatter) -> fmt::Result {
                write!(f, "A string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                // Option and class-share symbols don't fit the compact representation
                match Symbol::from_str(v) {
                    Ok(symbol) => Ok(WideSymbol::Normal(symbol)),
                    Err(_) => Ok(WideSymbol::Long(Box::from(v))),
                }
            }
        }

        deserializer.deserialize_str(WideSymbolVisitor)
    }
}
