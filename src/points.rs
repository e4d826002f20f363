//! Fixed-point point amounts with 4 decimal places.
//!
//! Wraps `rust_decimal` so balances and history amounts never go through
//! floating point. Parsing is strict: inputs carrying more precision than
//! [`Points::SCALE`] are refused rather than rounded.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a string is not a valid point amount.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParsePointsError {
    #[error("not a decimal number: {0}")]
    Malformed(String),

    #[error("{0} has more than {scale} decimal places", scale = Points::SCALE)]
    TooPrecise(String),
}

/// An exact point amount, always held at [`Points::SCALE`] decimal places.
///
/// Signed: balances are kept non-negative by the engine, but history rows
/// for the debit leg of a transfer carry a negated amount.
///
/// # Examples
///
/// ```
/// use std::str::FromStr;
/// use points_ledger::Points;
///
/// let amount = Points::from_str("10.5").unwrap();
/// assert_eq!(amount.to_string(), "10.5000");
/// assert!(Points::from_str("0.00001").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Points(Decimal);

impl Points {
    /// The number of decimal places to maintain.
    pub const SCALE: u32 = 4;

    /// Zero points.
    pub const ZERO: Self = Points(Decimal::ZERO);

    /// Creates an amount from a `Decimal`, normalizing to 4 decimal places.
    ///
    /// Extra precision is rounded (banker's rounding). Use `from_str` when
    /// the input comes from outside and must be exact.
    pub fn new(value: Decimal) -> Self {
        let mut normalized = value.round_dp(Self::SCALE);
        normalized.rescale(Self::SCALE);
        Points(normalized)
    }

    /// Creates an amount from whole points.
    pub fn whole(points: i64) -> Self {
        Points::new(Decimal::from(points))
    }

    /// Returns the underlying decimal.
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns `true` for amounts strictly greater than zero.
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Adds two amounts, returning `None` unless the sum is exact at
    /// [`Points::SCALE`] places.
    ///
    /// Near the top of the `Decimal` range a sum no longer fits at scale 4
    /// and `Decimal::checked_add` rounds to a smaller scale instead of
    /// failing; that counts as overflow here.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let mut sum = self.0.checked_add(rhs.0)?;
        sum.rescale(Self::SCALE);
        if sum.scale() != Self::SCALE || sum.checked_sub(rhs.0) != Some(self.0) {
            return None;
        }
        Some(Points(sum))
    }

    /// Subtracts `rhs`, returning `None` if the result would be negative.
    ///
    /// This is the sufficiency check for every debit.
    pub fn checked_debit(self, rhs: Self) -> Option<Self> {
        if self.0 < rhs.0 {
            return None;
        }
        self.0.checked_sub(rhs.0).map(Points::new)
    }
}

impl FromStr for Points {
    type Err = ParsePointsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let decimal = Decimal::from_str(trimmed)
            .map_err(|_| ParsePointsError::Malformed(trimmed.to_string()))?;
        if decimal.normalize().scale() > Self::SCALE {
            return Err(ParsePointsError::TooPrecise(trimmed.to_string()));
        }
        Ok(Points::new(decimal))
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

impl Add for Points {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Points::new(self.0 + rhs.0)
    }
}

impl Sub for Points {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Points::new(self.0 - rhs.0)
    }
}

impl Neg for Points {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Points(-self.0)
    }
}

impl std::iter::Sum for Points {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Points::ZERO, |acc, p| acc + p)
    }
}

impl Serialize for Points {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Points {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Points::from_str(&s).map_err(serde::de::Error::custom)
    }
}
