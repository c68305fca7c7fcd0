//! Value objects for the fulfillment domain.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Largest supported number of decimal places.
pub const MAX_SCALE: u32 = 18;

/// Error returned when a decimal amount cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyParseError {
    #[error("Empty amount")]
    Empty,

    #[error("Invalid amount: {0}")]
    Invalid(String),

    #[error("Amount out of range: {0}")]
    OutOfRange(String),

    #[error("Fractional amount {0} must be sent as a decimal string")]
    FloatingPoint(String),
}

/// Fixed-point decimal amount.
///
/// Stored as `units / 10^scale`, so `"100.50"` is `units = 10050, scale = 2`.
/// Equality is numeric (`100.0 == 100.00`) while the written scale is kept
/// for display. Serialized as a decimal string. Deserializes from a decimal
/// string or a whole JSON number; fractional JSON numbers are rejected since
/// their scale is already lost to floating point.
#[derive(Debug, Clone, Copy)]
pub struct Money {
    units: i64,
    scale: u32,
}

impl Money {
    /// Creates an amount from raw units and scale.
    pub fn new(units: i64, scale: u32) -> Self {
        Self {
            units,
            scale: scale.min(MAX_SCALE),
        }
    }

    /// Creates an amount from cents (scale 2).
    pub fn from_cents(cents: i64) -> Self {
        Self::new(cents, 2)
    }

    /// Creates an amount from a whole number.
    pub fn from_major(amount: i64) -> Self {
        Self::new(amount, 0)
    }

    /// Returns zero money.
    pub fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Returns the raw units.
    pub fn units(&self) -> i64 {
        self.units
    }

    /// Returns the number of decimal places.
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Returns true if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.units > 0
    }

    /// Returns true if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.units == 0
    }

    /// Returns true if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.units < 0
    }

    /// Returns the same amount with trailing fractional zeros removed.
    pub fn normalized(&self) -> Self {
        let mut units = self.units;
        let mut scale = self.scale;
        while scale > 0 && units % 10 == 0 {
            units /= 10;
            scale -= 1;
        }
        Self { units, scale }
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        a.units == b.units && a.scale == b.scale
    }
}

impl Eq for Money {}

impl Hash for Money {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let n = self.normalized();
        n.units.hash(state);
        n.scale.hash(state);
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.units);
        }

        let sign = if self.units < 0 { "-" } else { "" };
        let abs = self.units.unsigned_abs();
        let divisor = 10u64.pow(self.scale);
        write!(
            f,
            "{sign}{}.{:0width$}",
            abs / divisor,
            abs % divisor,
            width = self.scale as usize
        )
    }
}

impl FromStr for Money {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MoneyParseError::Empty);
        }

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };

        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction)
        {
            return Err(MoneyParseError::Invalid(s.to_string()));
        }

        let scale = fraction.len() as u32;
        if scale > MAX_SCALE {
            return Err(MoneyParseError::OutOfRange(s.to_string()));
        }

        let combined = format!("{whole}{fraction}");
        let units: i64 = combined
            .parse()
            .map_err(|_| MoneyParseError::OutOfRange(s.to_string()))?;

        Ok(Self::new(if negative { -units } else { units }, scale))
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct MoneyVisitor;

impl Visitor<'_> for MoneyVisitor {
    type Value = Money;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal amount as a string or a whole number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Money, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Money, E> {
        Ok(Money::from_major(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Money, E> {
        i64::try_from(v)
            .map(Money::from_major)
            .map_err(|_| E::custom(MoneyParseError::OutOfRange(v.to_string())))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Money, E> {
        Err(E::custom(MoneyParseError::FloatingPoint(v.to_string())))
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MoneyVisitor)
    }
}

/// Product identifier (SKU).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Creates a new product ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the product ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProductId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A line of an order: which product and how many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl OrderLine {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}
