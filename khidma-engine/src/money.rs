//! Fixed-point money arithmetic for fee computation
//!
//! Amounts are non-negative integer minor units (e.g. dirhams for QAR)
//! with an explicit currency code. Floating point is never used, so
//! repeated fee computations cannot drift.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;
use crate::EngineResult;

/// A non-negative monetary quantity in minor units of a currency
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Money {
    minor: u64,
    currency: String,
}

impl Money {
    /// Create from minor units (e.g. `Money::new(50_000, "QAR")` is 500.00 QAR)
    pub fn new<S: Into<String>>(minor: u64, currency: S) -> Self {
        Self {
            minor,
            currency: currency.into(),
        }
    }

    /// Zero in the given currency
    pub fn zero<S: Into<String>>(currency: S) -> Self {
        Self::new(0, currency)
    }

    /// Amount in minor units
    pub fn minor_units(&self) -> u64 {
        self.minor
    }

    /// Currency code
    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.minor == 0
    }

    /// Compute a percentage expressed in basis points (1 bp = 0.01%),
    /// rounding half-up to the nearest minor unit.
    ///
    /// 500 bp of 50_000 minor units is 2_500 (5%).
    pub fn percentage_of(&self, basis_points: u32) -> Money {
        let product = self.minor as u128 * basis_points as u128;
        let rounded = (product + 5_000) / 10_000;
        Money::new(rounded as u64, self.currency.clone())
    }

    /// Add another amount of the same currency; fails with `Overflow`
    /// rather than wrapping.
    pub fn checked_add(&self, other: &Money) -> EngineResult<Money> {
        self.require_same_currency(other)?;
        let minor = self.minor.checked_add(other.minor).ok_or_else(|| {
            EngineError::Overflow(format!(
                "{} + {} exceeds the representable amount",
                self.minor, other.minor
            ))
        })?;
        Ok(Money::new(minor, self.currency.clone()))
    }

    /// Subtract another amount of the same currency; fails with
    /// `NegativeResult` rather than wrapping below zero.
    pub fn checked_sub(&self, other: &Money) -> EngineResult<Money> {
        self.require_same_currency(other)?;
        let minor = self.minor.checked_sub(other.minor).ok_or_else(|| {
            EngineError::NegativeResult(format!(
                "{} - {} would go below zero",
                self.minor, other.minor
            ))
        })?;
        Ok(Money::new(minor, self.currency.clone()))
    }

    /// Split into two parts at `percent_to_a` (0..=100). The two parts
    /// always sum exactly to the original; any rounding remainder is
    /// assigned to the first part so no value is lost or created.
    pub fn split(&self, percent_to_a: u8) -> (Money, Money) {
        let pct = percent_to_a.min(100) as u128;
        let to_b = (self.minor as u128 * (100 - pct) / 100) as u64;
        let to_a = self.minor - to_b;
        (
            Money::new(to_a, self.currency.clone()),
            Money::new(to_b, self.currency.clone()),
        )
    }

    fn require_same_currency(&self, other: &Money) -> EngineResult<()> {
        if self.currency != other.currency {
            return Err(EngineError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} {}",
            self.minor / 100,
            self.minor % 100,
            self.currency
        )
    }
}
