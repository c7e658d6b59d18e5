//! simple_bank Library
//!
//! Money transfers between accounts as atomic units of work, with
//! deterministic lock ordering and bounded retry on deadlocks.

pub mod config;
pub mod db;
pub mod domain;
pub mod store;
pub mod transfer;

pub use config::{Config, ConfigError, LogFormat};
pub use domain::{Account, Amount, AmountError, Entry, NewAccount, OperationContext, Transfer, TransferResult};
pub use store::{ConflictKind, Ledger, MemoryStore, PgUnitOfWork, StoreError, UnitOfWork};
pub use transfer::{ErrorClass, RetryPolicy, TransferCommand, TransferError, TransferService};
