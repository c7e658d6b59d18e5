//! Transfer module
//!
//! The transfer operation: validation, lock ordering, the atomic balance
//! move and deadlock recovery.

mod commands;
mod error;
mod ordering;
mod retry;
mod service;

pub use commands::{TransferCommand, ValidTransfer};
pub use error::{ErrorClass, TransferError};
pub use ordering::LockOrder;
pub use retry::{Disposition, RetryPolicy};
pub use service::TransferService;
