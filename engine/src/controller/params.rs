use std::fmt::{self, Display, Formatter};

use anyhow::anyhow;
use common::util::parse_decimal;
use rust_decimal::Decimal;

const UNSET: Decimal = Decimal::NEGATIVE_ONE;

/// How far price has to move away from the validated extreme before a run triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChange {
    Absolute(Decimal),
    /// Multiplier applied to the first observed last price. `"0.0025%"` means
    /// `0.0025 * last`, not a hundredth of it.
    Percent(Decimal),
}

impl TargetChange {
    pub fn parse(arg: &str) -> anyhow::Result<Self> {
        let (number, percent) = match arg.strip_suffix('%') {
            Some(number) => (number, true),
            None => (arg, false),
        };

        let value = parse_decimal(number)?;
        if value <= Decimal::ZERO {
            return Err(anyhow!("Target change must be positive, got {arg}"));
        }

        Ok(if percent {
            Self::Percent(value)
        } else {
            Self::Absolute(value)
        })
    }

    pub fn resolve(self, last: Decimal) -> anyhow::Result<Decimal> {
        match self {
            Self::Absolute(change) => Ok(change),
            Self::Percent(multiplier) => last
                .checked_mul(multiplier)
                .ok_or_else(|| anyhow!("Target change {self} is out of range at last price {last}")),
        }
    }
}

impl Display for TargetChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(change) => write!(f, "{change}"),
            Self::Percent(multiplier) => write!(f, "{multiplier}%"),
        }
    }
}

/// What happens around the entry besides the target-change trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitPolicy {
    /// Plain target-change entry, no protective stop afterwards.
    #[default]
    None,
    /// Target-change entry followed by a stop one target change away from the fill.
    DefaultStop,
    /// Enter with a market order as soon as last crosses this price.
    Price(Decimal),
}

impl LimitPolicy {
    pub fn parse(arg: &str) -> anyhow::Result<Self> {
        let value = parse_decimal(arg)?;

        if value == UNSET {
            Ok(Self::None)
        } else if value.is_zero() {
            Ok(Self::DefaultStop)
        } else if value > Decimal::ZERO {
            Ok(Self::Price(value))
        } else {
            Err(anyhow!(
                "Limit must be -1 (none), 0 (default stop) or a positive price, got {arg}"
            ))
        }
    }
}

impl Display for LimitPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::DefaultStop => f.write_str("default stop"),
            Self::Price(price) => write!(f, "{price}"),
        }
    }
}

/// Parses the optional starting extreme. `-1` leaves it unset.
pub fn parse_known_extreme(arg: &str) -> anyhow::Result<Option<Decimal>> {
    let value = parse_decimal(arg)?;

    if value == UNSET {
        Ok(None)
    } else if value > Decimal::ZERO {
        Ok(Some(value))
    } else {
        Err(anyhow!(
            "Known extreme must be -1 (unset) or a positive price, got {arg}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn percent_change_is_a_plain_multiplier() {
        let change = TargetChange::parse("0.0025%").unwrap();
        assert_eq!(change, TargetChange::Percent(dec!(0.0025)));
        assert_eq!(change.resolve(dec!(78.22)).unwrap(), dec!(0.195550));
    }

    #[test]
    fn absolute_change_ignores_price() {
        let change = TargetChange::parse("0.25").unwrap();
        assert_eq!(change.resolve(dec!(500)).unwrap(), dec!(0.25));
    }

    #[test]
    fn oversized_percent_is_an_error() {
        let change = TargetChange::parse("10000000000000000000000000000%").unwrap();
        assert!(change.resolve(dec!(78.22)).is_err());
    }

    #[test]
    fn bad_changes_are_rejected() {
        assert!(TargetChange::parse("abc").is_err());
        assert!(TargetChange::parse("0").is_err());
        assert!(TargetChange::parse("-0.5%").is_err());
    }

    #[test]
    fn limit_sentinels() {
        assert_eq!(LimitPolicy::parse("-1").unwrap(), LimitPolicy::None);
        assert_eq!(LimitPolicy::parse("0").unwrap(), LimitPolicy::DefaultStop);
        assert_eq!(
            LimitPolicy::parse("78.30").unwrap(),
            LimitPolicy::Price(dec!(78.30))
        );
        assert!(LimitPolicy::parse("-2").is_err());
    }

    #[test]
    fn known_extreme_sentinel() {
        assert_eq!(parse_known_extreme("-1").unwrap(), None);
        assert_eq!(parse_known_extreme("78.2").unwrap(), Some(dec!(78.2)));
        assert!(parse_known_extreme("0").is_err());
    }
}
