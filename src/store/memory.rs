//! In-memory engine
//!
//! Committed rows live behind one mutex; each account row has its own
//! async lock. A scope stages its writes and applies them on commit, so
//! other scopes only ever observe committed state (READ COMMITTED).
//!
//! A row lock that cannot be acquired within the lock-wait window is
//! reported as a deadlock, the way lock-timeout based detectors do.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::domain::{Account, Entry, NewAccount, Transfer};

use super::{
    run_scope, ConflictKind, Ledger, StoreError, TransactionScope, UnitOfWork, WorkFuture,
};

/// Default time a scope waits for a row lock before presuming a deadlock
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

#[derive(Debug, Default)]
struct Counters {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    conflicts: AtomicU64,
}

/// Snapshot of engine activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub commits: u64,
    pub rollbacks: u64,
    /// Deadlocks detected plus injected conflicts
    pub conflicts: u64,
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    injected: Mutex<VecDeque<ConflictKind>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    lock_wait: Duration,
    counters: Counters,
}

impl Shared {
    fn row_lock(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.row_locks).entry(id).or_default().clone()
    }

    fn take_injected(&self) -> Option<ConflictKind> {
        lock(&self.injected).pop_front()
    }
}

/// In-memory storage engine. Cloning shares the same tables.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    /// Engine that presumes a deadlock after waiting `lock_wait` for a row lock.
    ///
    /// Any wait that long reports `Conflict(Deadlock)`, cycle or not, so under
    /// heavy contention `lock_wait` must exceed the longest expected queue.
    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                injected: Mutex::new(VecDeque::new()),
                account_seq: AtomicI64::new(0),
                entry_seq: AtomicI64::new(0),
                transfer_seq: AtomicI64::new(0),
                lock_wait,
                counters: Counters::default(),
            }),
        }
    }

    /// Make the next `count` row-lock acquisitions fail with `kind`.
    pub fn inject_conflicts(&self, kind: ConflictKind, count: usize) {
        lock(&self.shared.injected).extend(std::iter::repeat(kind).take(count));
    }

    /// Committed state of one account
    pub fn account(&self, id: i64) -> Option<Account> {
        lock(&self.shared.tables).accounts.get(&id).cloned()
    }

    /// Committed accounts ordered by id
    pub fn accounts(&self) -> Vec<Account> {
        lock(&self.shared.tables).accounts.values().cloned().collect()
    }

    /// Committed entries in insertion order
    pub fn entries(&self) -> Vec<Entry> {
        lock(&self.shared.tables).entries.clone()
    }

    /// Committed transfers in insertion order
    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.shared.tables).transfers.clone()
    }

    /// Whether some scope currently holds the row lock of `id`
    pub fn is_locked(&self, id: i64) -> bool {
        self.shared.row_lock(id).try_lock().is_err()
    }

    pub fn stats(&self) -> MemoryStats {
        let counters = &self.shared.counters;
        MemoryStats {
            commits: counters.commits.load(Ordering::SeqCst),
            rollbacks: counters.rollbacks.load(Ordering::SeqCst),
            conflicts: counters.conflicts.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryStore {
    async fn run_until<T, E, F>(&self, deadline: Option<Instant>, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: for<'s> FnOnce(&'s mut dyn Ledger) -> WorkFuture<'s, T, E> + Send + 'static,
    {
        if deadline.map_or(false, |d| d <= Instant::now()) {
            return Err(StoreError::DeadlineExceeded.into());
        }

        run_scope(MemoryLedger::new(self.shared.clone()), deadline, work).await
    }
}

/// Scope handle for the in-memory engine.
///
/// Holds the row locks it acquired and the writes it staged. Dropping it
/// without commit discards both.
pub struct MemoryLedger {
    shared: Arc<Shared>,
    held: HashMap<i64, OwnedMutexGuard<()>>,
    new_accounts: BTreeMap<i64, Account>,
    balances: HashMap<i64, i64>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

impl MemoryLedger {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            held: HashMap::new(),
            new_accounts: BTreeMap::new(),
            balances: HashMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
        }
    }

    /// Committed row overlaid with this scope's own writes
    fn visible_account(&self, id: i64) -> Option<Account> {
        let mut account = match self.new_accounts.get(&id) {
            Some(account) => account.clone(),
            None => lock(&self.shared.tables).accounts.get(&id).cloned()?,
        };
        if let Some(balance) = self.balances.get(&id) {
            account.balance = *balance;
        }
        Some(account)
    }

    fn require_account(&self, id: i64) -> Result<Account, StoreError> {
        self.visible_account(id)
            .ok_or(StoreError::AccountNotFound(id))
    }

    async fn lock_row(&mut self, id: i64) -> Result<(), StoreError> {
        if self.held.contains_key(&id) {
            return Ok(());
        }

        if let Some(kind) = self.shared.take_injected() {
            self.shared.counters.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict(kind));
        }

        let row = self.shared.row_lock(id);
        match tokio::time::timeout(self.shared.lock_wait, row.lock_owned()).await {
            Ok(guard) => {
                self.held.insert(id, guard);
                Ok(())
            }
            Err(_) => {
                self.shared.counters.conflicts.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    account_id = id,
                    lock_wait_ms = self.shared.lock_wait.as_millis() as u64,
                    "Row lock wait exceeded, presuming deadlock"
                );
                Err(StoreError::Conflict(ConflictKind::Deadlock))
            }
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_account(&mut self, params: NewAccount) -> Result<Account, StoreError> {
        let account = Account {
            id: self.shared.account_seq.fetch_add(1, Ordering::SeqCst) + 1,
            owner: params.owner,
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };
        self.new_accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.require_account(id)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, StoreError> {
        self.require_account(id)?;
        self.lock_row(id).await?;
        // Re-read: the row may have changed while we waited for the lock.
        self.require_account(id)
    }

    async fn update_account_balance(
        &mut self,
        id: i64,
        balance: i64,
    ) -> Result<Account, StoreError> {
        self.require_account(id)?;
        self.lock_row(id).await?;
        self.balances.insert(id, balance);
        self.require_account(id)
    }

    async fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry, StoreError> {
        self.require_account(account_id)?;

        let entry = Entry {
            id: self.shared.entry_seq.fetch_add(1, Ordering::SeqCst) + 1,
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer, StoreError> {
        self.require_account(from_account_id)?;
        self.require_account(to_account_id)?;

        if from_account_id == to_account_id || amount <= 0 {
            return Err(StoreError::Backend(format!(
                "transfers check constraint violated: {from_account_id} -> {to_account_id} ({amount})"
            )));
        }

        let transfer = Transfer {
            id: self.shared.transfer_seq.fetch_add(1, Ordering::SeqCst) + 1,
            from_account_id,
            to_account_id,
            amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        if let Some(transfer) = self.transfers.iter().find(|t| t.id == id) {
            return Ok(transfer.clone());
        }
        lock(&self.shared.tables)
            .transfers
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(StoreError::TransferNotFound(id))
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        let mut entries: Vec<Entry> = lock(&self.shared.tables)
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        entries.extend(
            self.entries
                .iter()
                .filter(|e| e.account_id == account_id)
                .cloned(),
        );
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }
}

#[async_trait]
impl TransactionScope for MemoryLedger {
    async fn commit(mut self) -> Result<(), StoreError> {
        {
            let mut tables = lock(&self.shared.tables);
            tables.accounts.append(&mut self.new_accounts);
            for (id, balance) in self.balances.drain() {
                if let Some(account) = tables.accounts.get_mut(&id) {
                    account.balance = balance;
                }
            }
            tables.entries.append(&mut self.entries);
            tables.transfers.append(&mut self.transfers);
        }
        self.shared.counters.commits.fetch_add(1, Ordering::SeqCst);
        // Row locks are released when `self` drops, after the writes landed.
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.shared.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
