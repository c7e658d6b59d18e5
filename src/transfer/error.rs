//! Transfer Errors
//!
//! Caller-facing error taxonomy for the transfer operation.

use serde::Serialize;

use crate::domain::{AmountError, BalanceError};
use crate::store::{ConflictKind, StoreError};

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request itself is invalid (bad amount, same account, currency)
    Validation,
    /// An account or record does not exist
    NotFound,
    /// The source balance cannot cover the amount
    InsufficientFunds,
    /// Transient conflict; the call may be retried as-is
    RetryableConflict,
    /// Transient conflicts persisted past the retry bound; retry later
    RetriesExhausted,
    /// The deadline elapsed; the attempt was rolled back
    Cancelled,
    /// Infrastructure failure
    StorageFault,
}

/// Transfer error types
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    #[error("Cannot transfer to the same account: {0}")]
    SameAccount(i64),

    #[error("Currency mismatch: account {from_account_id} is {from_currency}, account {to_account_id} is {to_currency}")]
    CurrencyMismatch {
        from_account_id: i64,
        from_currency: String,
        to_account_id: i64,
        to_currency: String,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    #[error("Insufficient funds in account {account_id}: balance {balance}, required {required}")]
    InsufficientFunds {
        account_id: i64,
        balance: i64,
        required: i64,
    },

    #[error("Balance overflow on account {account_id}")]
    BalanceOverflow { account_id: i64 },

    #[error("Transaction conflict: {0}")]
    Conflict(ConflictKind),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ConflictKind },

    #[error("Deadline exceeded, transfer rolled back")]
    DeadlineExceeded,

    #[error(transparent)]
    Storage(StoreError),
}

impl TransferError {
    /// Attach the affected account to a balance arithmetic failure
    pub fn from_balance(account_id: i64, err: BalanceError) -> Self {
        match err {
            BalanceError::Insufficient { balance, required } => Self::InsufficientFunds {
                account_id,
                balance,
                required,
            },
            BalanceError::Overflow { .. } => Self::BalanceOverflow { account_id },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidAmount(_)
            | Self::SameAccount(_)
            | Self::CurrencyMismatch { .. }
            | Self::BalanceOverflow { .. } => ErrorClass::Validation,
            Self::AccountNotFound(_) => ErrorClass::NotFound,
            Self::InsufficientFunds { .. } => ErrorClass::InsufficientFunds,
            Self::Conflict(_) => ErrorClass::RetryableConflict,
            Self::RetriesExhausted { .. } => ErrorClass::RetriesExhausted,
            Self::DeadlineExceeded => ErrorClass::Cancelled,
            Self::Storage(StoreError::TransferNotFound(_)) => ErrorClass::NotFound,
            Self::Storage(_) => ErrorClass::StorageFault,
        }
    }

    /// The conflict kind, if this error is a transient conflict
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            Self::Conflict(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Check if re-running the whole transfer may succeed
    pub fn is_retryable(&self) -> bool {
        self.conflict_kind().is_some()
    }

    /// Check if this is the caller's fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Validation | ErrorClass::NotFound | ErrorClass::InsufficientFunds
        )
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidAmount(_) => "invalid_amount",
            Self::SameAccount(_) => "same_account_transfer",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::AccountNotFound(_) => "account_not_found",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::BalanceOverflow { .. } => "balance_overflow",
            Self::Conflict(_) => "transaction_conflict",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Storage(_) => "storage_error",
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => Self::AccountNotFound(id),
            StoreError::Conflict(kind) => Self::Conflict(kind),
            StoreError::DeadlineExceeded => Self::DeadlineExceeded,
            other => Self::Storage(other),
        }
    }
}
