//! PostgreSQL engine
//!
//! `PgUnitOfWork` opens one `sqlx` transaction per scope on a pooled
//! connection. `PgLedger` runs the row-level queries on that transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::time::Instant;

use crate::domain::{Account, Entry, NewAccount, Transfer};

use super::{
    run_scope, within, IsolationLevel, Ledger, StoreError, TransactionScope, UnitOfWork,
    WorkFuture, FOREIGN_KEY_VIOLATION,
};

type AccountRow = (i64, String, i64, String, DateTime<Utc>);
type EntryRow = (i64, i64, i64, DateTime<Utc>);
type TransferRow = (i64, i64, i64, i64, DateTime<Utc>);

fn account_from_row((id, owner, balance, currency, created_at): AccountRow) -> Account {
    Account {
        id,
        owner,
        balance,
        currency,
        created_at,
    }
}

fn entry_from_row((id, account_id, amount, created_at): EntryRow) -> Entry {
    Entry {
        id,
        account_id,
        amount,
        created_at,
    }
}

fn transfer_from_row(
    (id, from_account_id, to_account_id, amount, created_at): TransferRow,
) -> Transfer {
    Transfer {
        id,
        from_account_id,
        to_account_id,
        amount,
        created_at,
    }
}

/// Map a foreign key violation on insert to the missing account.
fn missing_account(err: sqlx::Error, from_account_id: i64, to_account_id: i64) -> StoreError {
    let violated = err.as_database_error().and_then(|db| {
        let is_fk = db.code().map_or(false, |code| code == FOREIGN_KEY_VIOLATION);
        is_fk.then(|| db.constraint().unwrap_or_default().contains("to_account"))
    });

    match violated {
        Some(true) => StoreError::AccountNotFound(to_account_id),
        Some(false) => StoreError::AccountNotFound(from_account_id),
        None => StoreError::from(err),
    }
}

/// Unit-of-work executor over a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgUnitOfWork {
    pool: PgPool,
    isolation: IsolationLevel,
}

impl PgUnitOfWork {
    /// Create an executor using READ COMMITTED
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            isolation: IsolationLevel::default(),
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn run_until<T, E, F>(&self, deadline: Option<Instant>, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: for<'s> FnOnce(&'s mut dyn Ledger) -> WorkFuture<'s, T, E> + Send + 'static,
    {
        // Waiting for a pooled connection counts against the deadline too.
        let mut tx = within(deadline, self.pool.begin())
            .await
            .ok_or(StoreError::DeadlineExceeded)?
            .map_err(StoreError::from)?;

        within(
            deadline,
            sqlx::query(self.isolation.set_transaction_sql()).execute(&mut *tx),
        )
        .await
        .ok_or(StoreError::DeadlineExceeded)?
        .map_err(StoreError::from)?;

        tracing::debug!(isolation = %self.isolation, "Unit of work started");

        run_scope(PgLedger { tx }, deadline, work).await
    }
}

/// Ledger bound to one open PostgreSQL transaction.
///
/// Dropping it without commit rolls the transaction back when the
/// connection returns to the pool.
pub struct PgLedger {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Ledger for PgLedger {
    async fn create_account(&mut self, params: NewAccount) -> Result<Account, StoreError> {
        let row: AccountRow = sqlx::query_as(
            r#"
            INSERT INTO accounts (owner, balance, currency)
            VALUES ($1, $2, $3)
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(&params.owner)
        .bind(params.balance)
        .bind(&params.currency)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(account_from_row(row))
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(account_from_row)
            .ok_or(StoreError::AccountNotFound(id))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        // NO KEY UPDATE does not conflict with the KEY SHARE locks taken by
        // foreign keys when entries/transfers referencing this row are inserted.
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE id = $1
            LIMIT 1
            FOR NO KEY UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(account_from_row)
            .ok_or(StoreError::AccountNotFound(id))
    }

    async fn update_account_balance(
        &mut self,
        id: i64,
        balance: i64,
    ) -> Result<Account, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            UPDATE accounts
            SET balance = $2
            WHERE id = $1
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(id)
        .bind(balance)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(account_from_row)
            .ok_or(StoreError::AccountNotFound(id))
    }

    async fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry, StoreError> {
        let row: EntryRow = sqlx::query_as(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| missing_account(e, account_id, account_id))?;

        Ok(entry_from_row(row))
    }

    async fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer, StoreError> {
        let row: TransferRow = sqlx::query_as(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(from_account_id)
        .bind(to_account_id)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| missing_account(e, from_account_id, to_account_id))?;

        Ok(transfer_from_row(row))
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        let row: Option<TransferRow> = sqlx::query_as(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(transfer_from_row)
            .ok_or(StoreError::TransferNotFound(id))
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries
            WHERE account_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(entry_from_row).collect())
    }
}

#[async_trait]
impl TransactionScope for PgLedger {
    async fn commit(self) -> Result<(), StoreError> {
        // Serialization failures can surface here; they classify as conflicts.
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
