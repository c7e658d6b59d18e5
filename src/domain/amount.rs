//! Amount type
//!
//! Domain primitive for transfer amounts in minor currency units.
//! Amounts are validated at construction time, so an `Amount` that exists
//! is always strictly positive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Amount represents a validated transfer value in minor units (e.g. cents).
///
/// # Invariants
/// - Value is always positive (> 0)
///
/// # Example
/// ```
/// use simple_bank::domain::Amount;
///
/// let amount = Amount::new(100).unwrap();
/// assert_eq!(amount.value(), 100);
/// assert_eq!(amount.debit(250).unwrap(), 150);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

/// Errors that can occur when creating an Amount
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount must be positive (got {0})")]
    NotPositive(i64),

    #[error("Invalid amount format: {0}")]
    ParseError(String),
}

/// Errors from applying an amount to an account balance
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("Insufficient balance: required {required}, available {balance}")]
    Insufficient { balance: i64, required: i64 },

    #[error("Balance overflow: {balance} + {amount}")]
    Overflow { balance: i64, amount: i64 },
}

impl Amount {
    /// Create a new Amount with validation.
    ///
    /// # Errors
    /// - `AmountError::NotPositive` if value <= 0
    pub fn new(value: i64) -> Result<Self, AmountError> {
        if value <= 0 {
            return Err(AmountError::NotPositive(value));
        }
        Ok(Self(value))
    }

    /// Get the underlying value in minor units.
    pub fn value(&self) -> i64 {
        self.0
    }

    /// Signed ledger amount for the debited side.
    pub fn negated(&self) -> i64 {
        -self.0
    }

    /// Subtract this amount from `balance`. The result is never negative.
    pub fn debit(&self, balance: i64) -> Result<i64, BalanceError> {
        match balance.checked_sub(self.0) {
            Some(remaining) if remaining >= 0 => Ok(remaining),
            _ => Err(BalanceError::Insufficient {
                balance,
                required: self.0,
            }),
        }
    }

    /// Add this amount to `balance`.
    pub fn credit(&self, balance: i64) -> Result<i64, BalanceError> {
        balance.checked_add(self.0).ok_or(BalanceError::Overflow {
            balance,
            amount: self.0,
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<i64>()
            .map_err(|e| AmountError::ParseError(e.to_string()))?;
        Amount::new(value)
    }
}

impl TryFrom<i64> for Amount {
    type Error = AmountError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}
