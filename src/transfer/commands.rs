//! Transfer command
//!
//! The caller's request and its validated form.

use serde::{Deserialize, Serialize};

use crate::domain::Amount;

use super::TransferError;

/// Command to move `amount` minor units between two accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCommand {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferCommand {
    pub fn new(from_account_id: i64, to_account_id: i64, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Check preconditions. Runs before any scope is opened.
    pub fn validate(&self) -> Result<ValidTransfer, TransferError> {
        let amount = Amount::new(self.amount)?;

        if self.from_account_id == self.to_account_id {
            return Err(TransferError::SameAccount(self.from_account_id));
        }

        Ok(ValidTransfer {
            from_account_id: self.from_account_id,
            to_account_id: self.to_account_id,
            amount,
        })
    }
}

/// A transfer whose preconditions hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidTransfer {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: Amount,
}
