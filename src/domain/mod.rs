//! Domain module
//!
//! Core domain types: validated amounts, persisted rows and call context.

pub mod amount;
pub mod context;
pub mod model;

pub use amount::{Amount, AmountError, BalanceError};
pub use context::OperationContext;
pub use model::{Account, Entry, NewAccount, Transfer, TransferResult};
