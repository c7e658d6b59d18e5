//! Transfer Service
//!
//! Executes a transfer as one unit of work: lock both accounts in id order,
//! move the balance, append two entries and one transfer record. Conflicts
//! restart the whole unit of work under the retry policy.

use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;

use crate::domain::{OperationContext, TransferResult};
use crate::store::{Ledger, UnitOfWork};

use super::{LockOrder, RetryPolicy, TransferCommand, TransferError, ValidTransfer};

/// Orchestrates transfers on top of a unit-of-work executor.
///
/// Share it between tasks behind an `Arc`; it holds no per-call state.
#[derive(Debug, Clone)]
pub struct TransferService<U> {
    uow: U,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl<U: UnitOfWork> TransferService<U> {
    pub fn new(uow: U) -> Self {
        Self {
            uow,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Upper bound for every call, retries and backoff included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn unit_of_work(&self) -> &U {
        &self.uow
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Move `amount` minor units from one account to another.
    pub async fn transfer(
        &self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<TransferResult, TransferError> {
        let command = TransferCommand::new(from_account_id, to_account_id, amount);
        self.execute(command, &OperationContext::new()).await
    }

    /// Execute a transfer command.
    ///
    /// Not idempotent: every successful call records a new transfer.
    pub async fn execute(
        &self,
        command: TransferCommand,
        context: &OperationContext,
    ) -> Result<TransferResult, TransferError> {
        let transfer = command.validate().map_err(|e| {
            tracing::debug!(
                from_account_id = command.from_account_id,
                to_account_id = command.to_account_id,
                amount = command.amount,
                error = %e,
                "Transfer rejected"
            );
            e
        })?;

        let deadline = context.effective_deadline(self.timeout.map(|t| Instant::now() + t));

        let result = self
            .retry
            .run(deadline, |attempt| {
                if attempt > 0 {
                    tracing::debug!(
                        correlation_id = ?context.correlation_id,
                        attempt = attempt + 1,
                        "Restarting transfer in a fresh unit of work"
                    );
                }
                self.uow.run_until(deadline, move |ledger| {
                    apply_transfer(ledger, transfer).boxed()
                })
            })
            .await;

        match &result {
            Ok(done) => tracing::info!(
                correlation_id = ?context.correlation_id,
                transfer_id = done.transfer.id,
                from_account_id = transfer.from_account_id,
                to_account_id = transfer.to_account_id,
                amount = transfer.amount.value(),
                "Transfer completed"
            ),
            Err(e) if e.is_client_error() => tracing::info!(
                correlation_id = ?context.correlation_id,
                from_account_id = transfer.from_account_id,
                to_account_id = transfer.to_account_id,
                error_code = e.error_code(),
                error = %e,
                "Transfer refused"
            ),
            Err(e) => tracing::error!(
                correlation_id = ?context.correlation_id,
                from_account_id = transfer.from_account_id,
                to_account_id = transfer.to_account_id,
                error_code = e.error_code(),
                error = %e,
                "Transfer failed"
            ),
        }

        result
    }
}

/// The body of one transfer attempt, run inside an open scope.
async fn apply_transfer(
    ledger: &mut dyn Ledger,
    transfer: ValidTransfer,
) -> Result<TransferResult, TransferError> {
    let ValidTransfer {
        from_account_id,
        to_account_id,
        amount,
    } = transfer;
    let order = LockOrder::new(from_account_id, to_account_id);

    let first = ledger.get_account_for_update(order.first()).await?;
    let second = ledger.get_account_for_update(order.second()).await?;
    let (from_account, to_account) = order.to_transfer_order(first, second);

    if from_account.currency != to_account.currency {
        return Err(TransferError::CurrencyMismatch {
            from_account_id,
            from_currency: from_account.currency,
            to_account_id,
            to_currency: to_account.currency,
        });
    }

    let from_balance = amount
        .debit(from_account.balance)
        .map_err(|e| TransferError::from_balance(from_account_id, e))?;
    let to_balance = amount
        .credit(to_account.balance)
        .map_err(|e| TransferError::from_balance(to_account_id, e))?;

    let (first_balance, second_balance) = order.to_lock_order(from_balance, to_balance);
    let first = ledger
        .update_account_balance(order.first(), first_balance)
        .await?;
    let second = ledger
        .update_account_balance(order.second(), second_balance)
        .await?;
    let (from_account, to_account) = order.to_transfer_order(first, second);

    let from_entry = ledger
        .create_entry(from_account_id, amount.negated())
        .await?;
    let to_entry = ledger.create_entry(to_account_id, amount.value()).await?;

    let transfer = ledger
        .create_transfer(from_account_id, to_account_id, amount.value())
        .await?;

    Ok(TransferResult {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}
