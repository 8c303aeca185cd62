use std::fmt::{self, Display, Formatter};

use log::LevelFilter;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize};
use time::{
    format_description::{self, FormatItem},
    OffsetDateTime, UtcOffset,
};

pub static TIME_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[hour repr:24]:[minute]:[second]")
        .expect("Invalid time format description")
});

pub static DATE_FORMAT: Lazy<Vec<FormatItem<'static>>> =
    Lazy::new(|| format_description::parse("[year]-[month]-[day]").expect("Invalid date format"));

// Short day label used in transaction reports, e.g. "Thu 10/03/24"
pub static DAY_LABEL_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[weekday repr:short] [month]/[day]/[year repr:last_two]")
        .expect("Invalid day label format")
});

pub static FILL_TIME_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse(
        "[weekday repr:short] [hour repr:24]:[minute]:[second] ([month padding:none]/[day padding:none])",
    )
    .expect("Invalid fill time format")
});

// The broker reports trade dates like 2024-10-03T14:01:02+0000
static TRADE_TIMESTAMP_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse(
        "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]",
    )
    .expect("Invalid trade timestamp format")
});

// Query parameters must be UTC with millisecond precision, e.g. 2024-10-03T00:00:00.000Z
static API_TIMESTAMP_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z")
        .expect("Invalid API timestamp format")
});

pub fn format_or_placeholder(datetime: OffsetDateTime, format: &[FormatItem<'_>]) -> String {
    datetime
        .format(format)
        .unwrap_or_else(|_| "??".to_owned())
}

pub fn parse_trade_timestamp(input: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(input, &*TRADE_TIMESTAMP_FORMAT)
}

pub fn deserialize_trade_timestamp<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_trade_timestamp(&raw).map_err(de::Error::custom)
}

pub fn format_api_timestamp(datetime: OffsetDateTime) -> Result<String, time::error::Format> {
    datetime.to_offset(UtcOffset::UTC).format(&*API_TIMESTAMP_FORMAT)
}

/// Formats an amount of dollars with thousands separators, e.g. `-$1,234.50`.
pub fn format_currency(amount: Decimal) -> String {
    let rounded = amount.round_dp(2);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() {
        "-"
    } else {
        ""
    };

    let digits = format!("{:.2}", rounded.abs());
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, ch) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{sign}${grouped}.{fraction}")
}

#[derive(Debug)]
pub struct DecimalParseError {
    input: String,
}

impl Display for DecimalParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" is not a valid decimal number", self.input)
    }
}

impl std::error::Error for DecimalParseError {}

pub fn parse_decimal(input: &str) -> Result<Decimal, DecimalParseError> {
    input
        .trim()
        .parse::<Decimal>()
        .map_err(|_| DecimalParseError {
            input: input.to_owned(),
        })
}

#[derive(Serialize, Deserialize)]
#[serde(remote = "LevelFilter")]
pub enum SerdeLevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    #[test]
    fn currency_groups_thousands() {
        assert_eq!(format_currency(dec!(1234567.891)), "$1,234,567.89");
        assert_eq!(format_currency(dec!(-200)), "-$200.00");
        assert_eq!(format_currency(dec!(999.5)), "$999.50");
        assert_eq!(format_currency(dec!(-0.001)), "$0.00");
    }

    #[test]
    fn trade_timestamps_accept_offsets_without_colon() {
        let parsed = parse_trade_timestamp("2024-10-03T14:01:02+0000").unwrap();
        assert_eq!(parsed, datetime!(2024-10-03 14:01:02 UTC));

        let shifted = parse_trade_timestamp("2024-10-03T10:01:02-0400").unwrap();
        assert_eq!(shifted, parsed);
    }

    #[test]
    fn api_timestamps_are_utc_with_millis() {
        let local = datetime!(2024-10-03 00:00:00 -4);
        assert_eq!(
            format_api_timestamp(local).unwrap(),
            "2024-10-03T04:00:00.000Z"
        );
    }

    #[test]
    fn decimals_parse_with_surrounding_whitespace() {
        assert_eq!(parse_decimal(" 78.30 ").unwrap(), dec!(78.30));
        assert!(parse_decimal("seventy").is_err());
    }
}
