// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fixed-point money with exactly two fractional digits.
//!
//! Amounts are parsed once at the edge and stay fixed-point through every
//! computation on the ingest-to-ledger path. Serialization is always a
//! string with two fractional digits (`"1234.50"`), never a binary float.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// Errors produced when constructing a [`Money`] value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    /// The input was not a decimal number.
    #[error("not a decimal amount: {0:?}")]
    Invalid(String),
    /// The input carried more than two fractional digits.
    #[error("amount has more than two fractional digits: {0:?}")]
    TooPrecise(String),
    /// An arithmetic operation overflowed.
    #[error("money arithmetic overflow")]
    Overflow,
}

/// An exact monetary amount with two fractional digits.
///
/// The inner decimal is always normalized to scale 2, so `12`, `12.0`, and
/// `12.00` compare and render identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(Decimal);

impl Money {
    /// Zero dollars.
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Parse an amount from its canonical string form.
    ///
    /// Accepts an optional sign, digits, and at most two fractional digits.
    /// Rejects empty input, exponents, and anything `rust_decimal` cannot
    /// parse exactly.
    pub fn parse(raw: &str) -> Result<Self, MoneyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MoneyError::Invalid(raw.to_string()));
        }
        let dec =
            Decimal::from_str(trimmed).map_err(|_| MoneyError::Invalid(raw.to_string()))?;
        Self::from_decimal(dec).map_err(|_| MoneyError::TooPrecise(raw.to_string()))
    }

    /// Construct from a decimal, rejecting values with more than two
    /// fractional digits.
    pub fn from_decimal(dec: Decimal) -> Result<Self, MoneyError> {
        let normalized = dec.normalize();
        if normalized.scale() > 2 {
            return Err(MoneyError::TooPrecise(dec.to_string()));
        }
        let mut rescaled = normalized;
        rescaled.rescale(2);
        Ok(Self(rescaled))
    }

    /// Construct from a whole number of cents.
    #[must_use]
    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, 2))
    }

    /// The amount as a whole number of cents.
    #[must_use]
    pub fn cents(&self) -> i64 {
        (self.0 * Decimal::ONE_HUNDRED)
            .trunc()
            .try_into()
            .unwrap_or(i64::MAX)
    }

    /// The underlying decimal (scale 2).
    #[must_use]
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Checked addition.
    pub fn checked_add(&self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// Checked subtraction.
    pub fn checked_sub(&self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// Absolute difference between two amounts.
    #[must_use]
    pub fn abs_diff(&self, other: Money) -> Money {
        Money((self.0 - other.0).abs())
    }

    /// Whether the amount is strictly negative.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Whether the amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Whether two amounts agree within the standard tolerance: the greater
    /// of `abs_tolerance` and `rel_tolerance` of the larger magnitude.
    ///
    /// `rel_tolerance` is a fraction (0.005 for 0.5 %).
    #[must_use]
    pub fn within_tolerance(&self, other: Money, abs_tolerance: Money, rel_tolerance: Decimal) -> bool {
        let magnitude = self.0.abs().max(other.0.abs());
        let rel = magnitude * rel_tolerance;
        let allowed = rel.max(abs_tolerance.0);
        (self.0 - other.0).abs() <= allowed
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rendered = self.0;
        rendered.rescale(2);
        rendered.fmt(f)
    }
}

impl Sum<Money> for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| {
            Money(acc.0.saturating_add(m.0))
        })
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Money::parse(&raw).map_err(serde::de::Error::custom)
    }
}
