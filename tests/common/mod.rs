//! Common test utilities

use futures::FutureExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use simple_bank::store::{StoreError, UnitOfWork};
use simple_bank::{NewAccount, PgUnitOfWork};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Connect to DATABASE_URL and make sure the schema exists.
///
/// Tests share the database, so each one works on accounts it creates
/// itself instead of truncating tables.
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    simple_bank::db::verify_connection(&pool)
        .await
        .expect("Database is not answering");

    let mut tx = pool.begin().await.expect("Failed to begin transaction");

    // Serialize concurrent schema setup from parallel tests.
    sqlx::query("SELECT pg_advisory_xact_lock(727274)")
        .execute(&mut *tx)
        .await
        .expect("Failed to take schema lock");

    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .expect("Failed to apply schema");
    }

    tx.commit().await.expect("Failed to commit schema");

    pool
}

/// Open accounts with the given balances and currency, returning their ids
pub async fn open_accounts(uow: &PgUnitOfWork, balances: &[i64], currency: &str) -> Vec<i64> {
    let params: Vec<NewAccount> = balances
        .iter()
        .map(|b| NewAccount::new(format!("test-{}", uuid::Uuid::new_v4()), *b, currency))
        .collect();

    uow.run(move |ledger| {
        async move {
            let mut ids = Vec::new();
            for p in params {
                ids.push(ledger.create_account(p).await?.id);
            }
            Ok::<_, StoreError>(ids)
        }
        .boxed()
    })
    .await
    .expect("Failed to open accounts")
}

/// Committed balance of one account
pub async fn balance(pool: &PgPool, id: i64) -> i64 {
    sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("Failed to read balance")
}

/// Number of committed transfers touching an account
pub async fn transfer_count(pool: &PgPool, id: i64) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM transfers WHERE from_account_id = $1 OR to_account_id = $1",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .expect("Failed to count transfers")
}

/// Sum of committed entry amounts of an account
pub async fn entry_sum(pool: &PgPool, id: i64) -> i64 {
    sqlx::query_scalar("SELECT COALESCE(SUM(amount), 0)::BIGINT FROM entries WHERE account_id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("Failed to sum entries")
}
