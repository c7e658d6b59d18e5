//! Storage module
//!
//! The storage gateway (`Ledger`) is the row-level capability set the
//! transfer core runs against. `UnitOfWork` opens one atomic scope per call
//! and hands the work a `Ledger` bound to that scope.
//!
//! Two engines implement both traits: PostgreSQL through `sqlx`, and an
//! in-memory engine with real row locks.

mod error;
mod memory;
mod postgres;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;

use crate::domain::{Account, Entry, NewAccount, Transfer};

pub use error::{
    ConflictKind, StoreError, DEADLOCK_DETECTED, FOREIGN_KEY_VIOLATION, SERIALIZATION_FAILURE,
};
pub use memory::{MemoryLedger, MemoryStats, MemoryStore};
pub use postgres::{PgLedger, PgUnitOfWork};

/// Future returned by the work handed to [`UnitOfWork::run`]
pub type WorkFuture<'s, T, E> = BoxFuture<'s, Result<T, E>>;

/// Row-level operations available inside an atomic scope.
///
/// Writes become visible to other scopes only when the enclosing scope
/// commits.
#[async_trait]
pub trait Ledger: Send {
    /// Insert a new account row
    async fn create_account(&mut self, params: NewAccount) -> Result<Account, StoreError>;

    /// Read an account without locking it
    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Read an account and hold its row lock until the scope ends.
    /// Blocks while another scope holds the lock.
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Overwrite the balance. No non-negativity check is made here.
    async fn update_account_balance(&mut self, id: i64, balance: i64)
        -> Result<Account, StoreError>;

    /// Append a ledger entry
    async fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry, StoreError>;

    /// Append a transfer record
    async fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer, StoreError>;

    /// Read a transfer record
    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;

    /// All entries of an account, oldest first
    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError>;
}

/// A `Ledger` that can finish its scope.
#[async_trait]
pub trait TransactionScope: Ledger + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Runs work inside a fresh atomic scope. Nested scopes are not supported;
/// every call opens a new top-level scope on its own connection.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Run `work` atomically, aborting with `StoreError::DeadlineExceeded`
    /// if `deadline` passes first.
    ///
    /// Commits when `work` returns `Ok`. Rolls back when it returns `Err`,
    /// panics, or times out.
    async fn run_until<T, E, F>(&self, deadline: Option<Instant>, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: for<'s> FnOnce(&'s mut dyn Ledger) -> WorkFuture<'s, T, E> + Send + 'static;

    /// Run `work` atomically with no deadline.
    async fn run<T, E, F>(&self, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: for<'s> FnOnce(&'s mut dyn Ledger) -> WorkFuture<'s, T, E> + Send + 'static,
    {
        self.run_until(None, work).await
    }
}

/// Transaction isolation level applied at the start of every scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Statement that sets this level on a freshly opened transaction
    pub fn set_transaction_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "read_committed"),
            IsolationLevel::RepeatableRead => write!(f, "repeatable_read"),
            IsolationLevel::Serializable => write!(f, "serializable"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(|c: char| c == ' ' || c == '-', "_").as_str() {
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level '{other}'")),
        }
    }
}

/// Await `fut`, giving up once `deadline` passes.
pub(crate) async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Drive `work` on `scope`, then commit or roll back.
///
/// Rollback happens on every non-success path: error, panic, deadline.
pub(crate) async fn run_scope<S, T, E, F>(
    mut scope: S,
    deadline: Option<Instant>,
    work: F,
) -> Result<T, E>
where
    S: TransactionScope + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
    F: for<'s> FnOnce(&'s mut dyn Ledger) -> WorkFuture<'s, T, E> + Send + 'static,
{
    let outcome = {
        let ledger: &mut dyn Ledger = &mut scope;
        // The closure itself may panic before handing back its future.
        match std::panic::catch_unwind(AssertUnwindSafe(move || work(ledger))) {
            Ok(fut) => within(deadline, AssertUnwindSafe(fut).catch_unwind()).await,
            Err(payload) => Some(Err(payload)),
        }
    };

    match outcome {
        Some(Ok(Ok(value))) => {
            scope.commit().await?;
            tracing::debug!("Unit of work committed");
            Ok(value)
        }
        Some(Ok(Err(err))) => {
            rollback_quietly(scope).await;
            Err(err)
        }
        Some(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "Unit of work panicked, rolling back");
            rollback_quietly(scope).await;
            Err(StoreError::Aborted(message).into())
        }
        None => {
            tracing::warn!("Unit of work deadline exceeded, rolling back");
            rollback_quietly(scope).await;
            Err(StoreError::DeadlineExceeded.into())
        }
    }
}

/// Roll back, logging instead of returning a rollback failure so the
/// original error reaches the caller.
async fn rollback_quietly<S: TransactionScope>(scope: S) {
    match scope.rollback().await {
        Ok(()) => tracing::debug!("Unit of work rolled back"),
        Err(e) => tracing::warn!(error = %e, "Rollback failed"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
