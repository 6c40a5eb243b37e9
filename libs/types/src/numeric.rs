//! Fixed-point decimal types for prices and quantities
//!
//! Uses rust_decimal so that OHLC extremes, volume sums and VWAP numerators
//! are exact. Folding the same ticks live or in a batch therefore yields
//! identical candles regardless of grouping.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// A trade or quote price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn from_str(s: &str) -> Result<Self, rust_decimal::Error> {
        Decimal::from_str(s).map(Self)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Lossy conversion for feature computation.
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(f64::NAN)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Decimal> for Price {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

/// A non-negative size (trade size, book level size, open interest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    /// Returns `None` for negative values.
    pub fn try_new(value: Decimal) -> Option<Self> {
        (value >= Decimal::ZERO).then_some(Self(value))
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Decimal::from_str(s).ok().and_then(Self::try_new)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(f64::NAN)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Sum of two non-negative quantities stays non-negative.
impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 += rhs.0;
    }
}

impl std::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_parsing() {
        let p = Price::from_str("100.25").unwrap();
        assert_eq!(p.as_decimal(), Decimal::new(10025, 2));
        assert!(Price::from_str("abc").is_err());
    }

    #[test]
    fn test_quantity_rejects_negative() {
        assert!(Quantity::try_new(Decimal::from(-1)).is_none());
        assert!(Quantity::try_new(Decimal::ZERO).is_some());
        assert!(Quantity::from_str("-0.5").is_none());
        assert_eq!(Quantity::from_str("0.5").unwrap().to_f64(), 0.5);
    }

    #[test]
    fn test_quantity_sum() {
        let total: Quantity = ["1.5", "2", "0.25"]
            .iter()
            .map(|s| Quantity::from_str(s).unwrap())
            .sum();
        assert_eq!(total.as_decimal(), Decimal::new(375, 2));
    }

    #[test]
    fn test_price_ordering() {
        assert!(Price::from_u64(105) > Price::from_u64(98));
    }

    #[test]
    fn test_serialization_is_transparent() {
        let q = Quantity::from_str("1.5").unwrap();
        let json = serde_json::to_string(&q).unwrap();
        assert_eq!(json, "\"1.5\"");
        let back: Quantity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q);
    }
}
