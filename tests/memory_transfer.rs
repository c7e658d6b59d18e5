//! Transfer tests against the in-memory engine

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{oneshot, Barrier};
use tokio_test::{assert_err, assert_ok};

use simple_bank::store::{ConflictKind, StoreError, UnitOfWork};
use simple_bank::{
    Account, ErrorClass, MemoryStore, NewAccount, OperationContext, RetryPolicy, TransferCommand,
    TransferError, TransferService,
};

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5))
}

async fn open_accounts(store: &MemoryStore, accounts: &[(i64, &str)]) -> Vec<i64> {
    let params: Vec<NewAccount> = accounts
        .iter()
        .enumerate()
        .map(|(i, (balance, currency))| NewAccount::new(format!("owner-{i}"), *balance, *currency))
        .collect();

    let created: Vec<Account> = store
        .run(move |ledger| {
            async move {
                let mut created = Vec::new();
                for p in params {
                    created.push(ledger.create_account(p).await?);
                }
                Ok::<_, StoreError>(created)
            }
            .boxed()
        })
        .await
        .unwrap();

    created.into_iter().map(|a| a.id).collect()
}

fn balance(store: &MemoryStore, id: i64) -> i64 {
    store.account(id).unwrap().balance
}

fn total(store: &MemoryStore) -> i64 {
    store.accounts().iter().map(|a| a.balance).sum()
}

#[tokio::test]
async fn test_transfer_moves_balance_and_records_ledger() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (50, "USD")]).await;
    let service = TransferService::new(store.clone());

    let result = assert_ok!(service.transfer(ids[0], ids[1], 30).await);

    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 80);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.amount, 30);
    assert_eq!(result.transfer.amount, 30);

    assert_eq!(balance(&store, ids[0]), 70);
    assert_eq!(balance(&store, ids[1]), 80);
    assert_eq!(total(&store), 150);
    assert_eq!(store.transfers().len(), 1);
    assert_eq!(store.entries().len(), 2);

    // Committed rows agree with the returned records.
    let entries_sum: i64 = store.entries().iter().map(|e| e.amount).sum();
    assert_eq!(entries_sum, 0);
    assert_eq!(store.transfers()[0].id, result.transfer.id);
}

#[tokio::test]
async fn test_transfer_in_either_direction() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (100, "USD")]).await;
    let service = TransferService::new(store.clone());

    assert_ok!(service.transfer(ids[1], ids[0], 40).await);
    assert_ok!(service.transfer(ids[0], ids[1], 15).await);

    assert_eq!(balance(&store, ids[0]), 125);
    assert_eq!(balance(&store, ids[1]), 75);
}

#[tokio::test]
async fn test_insufficient_funds_changes_nothing() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(20, "USD"), (0, "USD")]).await;
    let service = TransferService::new(store.clone());

    let err = assert_err!(service.transfer(ids[0], ids[1], 21).await);

    assert_eq!(err.class(), ErrorClass::InsufficientFunds);
    assert!(!err.is_retryable());
    assert_eq!(balance(&store, ids[0]), 20);
    assert_eq!(balance(&store, ids[1]), 0);
    assert!(store.transfers().is_empty());
    assert!(store.entries().is_empty());
    assert!(!store.is_locked(ids[0]));
    assert!(!store.is_locked(ids[1]));
}

#[tokio::test]
async fn test_exact_balance_can_be_drained() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(20, "USD"), (0, "USD")]).await;
    let service = TransferService::new(store.clone());

    assert_ok!(service.transfer(ids[0], ids[1], 20).await);
    assert_eq!(balance(&store, ids[0]), 0);
    assert_eq!(balance(&store, ids[1]), 20);
}

#[tokio::test]
async fn test_unknown_account_is_not_found() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD")]).await;
    let service = TransferService::new(store.clone());

    let err = assert_err!(service.transfer(ids[0], 999, 10).await);
    assert!(matches!(err, TransferError::AccountNotFound(999)));

    let err = assert_err!(service.transfer(999, ids[0], 10).await);
    assert!(matches!(err, TransferError::AccountNotFound(999)));

    assert_eq!(balance(&store, ids[0]), 100);
    assert!(store.transfers().is_empty());
}

#[tokio::test]
async fn test_invalid_requests_never_open_a_scope() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (100, "USD")]).await;
    let service = TransferService::new(store.clone());
    let before = store.stats();

    let err = assert_err!(service.transfer(ids[0], ids[0], 10).await);
    assert!(matches!(err, TransferError::SameAccount(_)));

    let err = assert_err!(service.transfer(ids[0], ids[1], 0).await);
    assert!(matches!(err, TransferError::InvalidAmount(_)));

    let err = assert_err!(service.transfer(ids[0], ids[1], -5).await);
    assert_eq!(err.class(), ErrorClass::Validation);

    assert_eq!(store.stats(), before);
}

#[tokio::test]
async fn test_currency_mismatch_rejected() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (100, "EUR")]).await;
    let service = TransferService::new(store.clone());

    let err = assert_err!(service.transfer(ids[0], ids[1], 10).await);

    assert!(matches!(err, TransferError::CurrencyMismatch { .. }));
    assert_eq!(total(&store), 200);
    assert!(store.entries().is_empty());
}

#[tokio::test]
async fn test_repeated_call_records_two_transfers() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (0, "USD")]).await;
    let service = TransferService::new(store.clone());
    let command = TransferCommand::new(ids[0], ids[1], 10);
    let context = OperationContext::new();

    let first = assert_ok!(service.execute(command, &context).await);
    let second = assert_ok!(service.execute(command, &context).await);

    assert_ne!(first.transfer.id, second.transfer.id);
    assert_eq!(store.transfers().len(), 2);
    assert_eq!(balance(&store, ids[0]), 80);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opposite_transfers_conserve_total() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (100, "USD")]).await;
    let service = Arc::new(TransferService::new(store.clone()).with_retry_policy(fast_retry(5)));
    let (a, b) = (ids[0], ids[1]);

    let mut handles = Vec::new();
    for i in 0..20 {
        let service = service.clone();
        let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
        handles.push(tokio::spawn(async move {
            service.transfer(from, to, 10).await
        }));
    }

    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    assert_eq!(balance(&store, a), 100);
    assert_eq!(balance(&store, b), 100);
    assert_eq!(store.transfers().len(), 20);
    assert_eq!(store.entries().len(), 40);
    // Ordered locking never waits in a cycle.
    assert_eq!(store.stats().conflicts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_accounts_never_go_negative() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(50, "USD"); 5]).await;
    let service = Arc::new(TransferService::new(store.clone()).with_retry_policy(fast_retry(5)));

    let mut handles = Vec::new();
    for i in 0..60 {
        let service = service.clone();
        let from = ids[i % ids.len()];
        let to = ids[(i * 3 + 1) % ids.len()];
        handles.push(tokio::spawn(async move {
            if from == to {
                return None;
            }
            Some(service.transfer(from, to, 20).await)
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Some(Ok(_)) => succeeded += 1,
            Some(Err(e)) => assert_eq!(e.class(), ErrorClass::InsufficientFunds),
            None => {}
        }
    }

    assert_eq!(total(&store), 250);
    assert!(store.accounts().iter().all(|a| a.balance >= 0));
    assert_eq!(store.transfers().len(), succeeded);
    assert_eq!(store.entries().len(), succeeded * 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_order_locking_deadlock_recovered_by_retry() {
    let store = MemoryStore::with_lock_wait(Duration::from_millis(50));
    let ids = open_accounts(&store, &[(100, "USD"), (100, "USD")]).await;
    let barrier = Arc::new(Barrier::new(2));
    let policy = RetryPolicy::new(8, Duration::from_millis(5), Duration::from_millis(40));

    // Lock in call order, not id order, so the first attempts wait on each other.
    let spawn_move = |from: i64, to: i64, amount: i64| {
        let store = store.clone();
        let barrier = barrier.clone();
        let policy = policy.clone();
        tokio::spawn(async move {
            policy
                .run(None, |attempt| {
                    let barrier = barrier.clone();
                    store.run(move |ledger| {
                        async move {
                            let source = ledger.get_account_for_update(from).await?;
                            if attempt == 0 {
                                barrier.wait().await;
                            }
                            let dest = ledger.get_account_for_update(to).await?;
                            ledger
                                .update_account_balance(from, source.balance - amount)
                                .await?;
                            ledger
                                .update_account_balance(to, dest.balance + amount)
                                .await?;
                            Ok::<_, TransferError>(())
                        }
                        .boxed()
                    })
                })
                .await
        })
    };

    let first = spawn_move(ids[0], ids[1], 10);
    let second = spawn_move(ids[1], ids[0], 30);

    assert_ok!(first.await.unwrap());
    assert_ok!(second.await.unwrap());

    assert!(store.stats().conflicts >= 1);
    assert_eq!(balance(&store, ids[0]), 120);
    assert_eq!(balance(&store, ids[1]), 80);
    assert!(!store.is_locked(ids[0]));
    assert!(!store.is_locked(ids[1]));
}

#[tokio::test]
async fn test_injected_conflicts_are_retried() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (0, "USD")]).await;
    let service = TransferService::new(store.clone()).with_retry_policy(fast_retry(3));

    store.inject_conflicts(ConflictKind::Deadlock, 2);
    assert_ok!(service.transfer(ids[0], ids[1], 25).await);

    let stats = store.stats();
    assert_eq!(stats.conflicts, 2);
    assert_eq!(store.transfers().len(), 1);
    assert_eq!(store.entries().len(), 2);
    assert_eq!(balance(&store, ids[1]), 25);
}

#[tokio::test]
async fn test_retries_exhausted_leaves_no_rows() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (0, "USD")]).await;
    let service = TransferService::new(store.clone()).with_retry_policy(fast_retry(2));

    store.inject_conflicts(ConflictKind::SerializationFailure, 10);
    let err = assert_err!(service.transfer(ids[0], ids[1], 25).await);

    assert!(matches!(
        err,
        TransferError::RetriesExhausted {
            attempts: 3,
            last: ConflictKind::SerializationFailure
        }
    ));
    assert_eq!(err.class(), ErrorClass::RetriesExhausted);
    assert_eq!(store.stats().conflicts, 3);
    assert!(store.transfers().is_empty());
    assert!(store.entries().is_empty());
    assert_eq!(balance(&store, ids[0]), 100);
}

#[tokio::test]
async fn test_no_retry_policy_surfaces_first_conflict() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (0, "USD")]).await;
    let service = TransferService::new(store.clone()).with_retry_policy(RetryPolicy::no_retry());

    store.inject_conflicts(ConflictKind::Deadlock, 1);
    let err = assert_err!(service.transfer(ids[0], ids[1], 5).await);

    assert!(matches!(
        err,
        TransferError::RetriesExhausted { attempts: 1, .. }
    ));
    assert_ok!(service.transfer(ids[0], ids[1], 5).await);
}

#[tokio::test]
async fn test_panic_in_scope_rolls_back_and_releases_locks() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD")]).await;
    let id = ids[0];

    let result: Result<(), StoreError> = store
        .run(move |ledger| {
            async move {
                ledger.get_account_for_update(id).await?;
                ledger.update_account_balance(id, 0).await?;
                if id > 0 {
                    panic!("boom");
                }
                Ok::<_, StoreError>(())
            }
            .boxed()
        })
        .await;

    assert!(matches!(result, Err(StoreError::Aborted(msg)) if msg == "boom"));
    assert_eq!(balance(&store, id), 100);
    assert!(!store.is_locked(id));
    assert_eq!(store.stats().rollbacks, 1);
}

#[tokio::test]
async fn test_panic_before_future_is_built_rolls_back() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD")]).await;
    let id = ids[0];
    let before = store.stats();

    let result: Result<(), StoreError> = store
        .run(move |_ledger| {
            if id > 0 {
                panic!("sync boom");
            }
            async { Ok::<_, StoreError>(()) }.boxed()
        })
        .await;

    assert!(matches!(result, Err(StoreError::Aborted(msg)) if msg == "sync boom"));
    assert_eq!(store.stats().rollbacks, before.rollbacks + 1);
    assert_eq!(store.stats().commits, before.commits);
    assert_eq!(balance(&store, id), 100);
    assert!(!store.is_locked(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_scope_releases_locks_and_discards_writes() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD")]).await;
    let id = ids[0];

    let holder = store.clone();
    let (locked_tx, locked_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        holder
            .run(move |ledger| {
                async move {
                    ledger.get_account_for_update(id).await?;
                    ledger.update_account_balance(id, 0).await?;
                    ledger.create_entry(id, -100).await?;
                    let _ = locked_tx.send(());
                    futures::future::pending::<()>().await;
                    Ok::<_, StoreError>(())
                }
                .boxed()
            })
            .await
    });
    locked_rx.await.unwrap();
    assert!(store.is_locked(id));

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    assert!(!store.is_locked(id));
    assert_eq!(balance(&store, id), 100);
    assert!(store.entries().is_empty());

    // The row can be locked by the next scope straight away.
    let service = TransferService::new(store.clone());
    let other = open_accounts(&store, &[(0, "USD")]).await[0];
    assert_ok!(service.transfer(id, other, 40).await);
}

#[tokio::test]
async fn test_deadline_rolls_back_and_releases_locks() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (0, "USD")]).await;
    let source = ids[0];
    let service = TransferService::new(store.clone());

    // Another scope holds the source row until told to let go.
    let holder = store.clone();
    let (locked_tx, locked_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        holder
            .run(move |ledger| {
                async move {
                    ledger.get_account_for_update(source).await?;
                    let _ = locked_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, StoreError>(())
                }
                .boxed()
            })
            .await
    });
    locked_rx.await.unwrap();

    let context = OperationContext::new().with_timeout(Duration::from_millis(50));
    let err = assert_err!(
        service
            .execute(TransferCommand::new(ids[0], ids[1], 10), &context)
            .await
    );
    assert!(matches!(err, TransferError::DeadlineExceeded));
    assert_eq!(err.class(), ErrorClass::Cancelled);

    release_tx.send(()).unwrap();
    assert_ok!(handle.await.unwrap());

    assert!(!store.is_locked(ids[0]));
    assert!(!store.is_locked(ids[1]));
    assert_eq!(balance(&store, ids[0]), 100);
    assert!(store.transfers().is_empty());

    // The rows are usable again once the holder is gone.
    assert_ok!(service.transfer(ids[0], ids[1], 10).await);
}

#[tokio::test]
async fn test_service_timeout_bounds_every_call() {
    let store = MemoryStore::new();
    let ids = open_accounts(&store, &[(100, "USD"), (0, "USD")]).await;
    let service = TransferService::new(store.clone())
        .with_retry_policy(RetryPolicy::new(
            10,
            Duration::from_millis(200),
            Duration::from_millis(200),
        ))
        .with_timeout(Duration::from_millis(100));

    // The first backoff alone would overrun the deadline.
    store.inject_conflicts(ConflictKind::Deadlock, 1);
    let err = assert_err!(service.transfer(ids[0], ids[1], 10).await);

    assert!(matches!(err, TransferError::DeadlineExceeded));
    assert!(store.transfers().is_empty());
}
