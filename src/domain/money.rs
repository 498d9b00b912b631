use crate::error::BookpayError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of decimal places money is stored and returned with.
pub const MONEY_SCALE: u32 = 2;

/// Rounds a monetary value to the persisted scale.
///
/// Calculations keep full precision and only call this where a value is
/// persisted on an entity or handed back to a caller.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Represents a strictly positive monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, BookpayError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(BookpayError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = BookpayError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// ISO-4217 style currency code, always upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, BookpayError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code))
        } else {
            Err(BookpayError::ValidationError(format!(
                "Invalid currency code '{}'",
                code
            )))
        }
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = BookpayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Converts a major-unit amount into the provider's minor units (cents, kobo).
pub fn to_minor_units(amount: Decimal) -> Result<i64, BookpayError> {
    use rust_decimal::prelude::ToPrimitive;

    (round_money(amount) * Decimal::ONE_HUNDRED)
        .trunc()
        .to_i64()
        .ok_or_else(|| {
            BookpayError::ValidationError(format!("Amount {} out of range", amount))
        })
}

/// Converts provider minor units back into a major-unit amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, MONEY_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(BookpayError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(BookpayError::ValidationError(_))
        ));
    }

    #[test]
    fn test_round_money_midpoint() {
        assert_eq!(round_money(dec!(2.345)), dec!(2.35));
        assert_eq!(round_money(dec!(2.344)), dec!(2.34));
        assert_eq!(round_money(dec!(102.5)), dec!(102.50));
    }

    #[test]
    fn test_currency_normalization() {
        assert_eq!(Currency::new("usd").unwrap().code(), "USD");
        assert!(Currency::new("US").is_err());
        assert!(Currency::new("U$D").is_err());
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(dec!(102.50)).unwrap(), 10250);
        assert_eq!(to_minor_units(dec!(0.305)).unwrap(), 31);
        assert_eq!(from_minor_units(10250), dec!(102.50));
    }
}
