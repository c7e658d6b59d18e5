//! Storage Errors
//!
//! Error types for the storage gateway and unit-of-work executor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// SQLSTATE raised by PostgreSQL when it breaks a deadlock
pub const DEADLOCK_DETECTED: &str = "40P01";

/// SQLSTATE for serialization failures under REPEATABLE READ / SERIALIZABLE
pub const SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE for foreign key violations
pub const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Transient conflicts the engine resolved by aborting our transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Deadlock,
    SerializationFailure,
}

impl ConflictKind {
    /// Classify a SQLSTATE code.
    pub fn from_sqlstate(code: &str) -> Option<Self> {
        match code {
            DEADLOCK_DETECTED => Some(Self::Deadlock),
            SERIALIZATION_FAILURE => Some(Self::SerializationFailure),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Deadlock => write!(f, "deadlock detected"),
            ConflictKind::SerializationFailure => write!(f, "serialization failure"),
        }
    }
}

/// Errors that can occur in the storage layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Account row does not exist
    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    /// Transfer row does not exist
    #[error("Transfer not found: {0}")]
    TransferNotFound(i64),

    /// Deadlock or serialization failure; the whole scope was aborted
    #[error("Transaction conflict: {0}")]
    Conflict(ConflictKind),

    /// The scope's deadline elapsed and it was rolled back
    #[error("Deadline exceeded before the unit of work completed")]
    DeadlineExceeded,

    /// The work panicked; the scope was rolled back
    #[error("Unit of work aborted: {0}")]
    Aborted(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Non-SQL engine failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// The conflict kind, if this error is a transient conflict
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            StoreError::Conflict(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Check if re-running the scope from scratch may succeed
    pub fn is_retryable(&self) -> bool {
        self.conflict_kind().is_some()
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let conflict = err
            .as_database_error()
            .and_then(|db| db.code())
            .and_then(|code| ConflictKind::from_sqlstate(&code));

        match conflict {
            Some(kind) => {
                tracing::debug!(error = %err, kind = %kind, "Database reported a transaction conflict");
                StoreError::Conflict(kind)
            }
            None => StoreError::Database(err),
        }
    }
}
