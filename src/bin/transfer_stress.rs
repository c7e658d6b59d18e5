//! Transfer Stress Tool
//!
//! Seeds a set of accounts, fires random transfers between them from many
//! tasks at once, then checks that money was neither created nor lost.
//!
//! Run with: cargo run --bin transfer_stress --release -- --accounts 10 --transfers 1000

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simple_bank::store::{StoreError, UnitOfWork};
use simple_bank::{
    db, Config, LogFormat, NewAccount, OperationContext, PgUnitOfWork, TransferCommand,
    TransferService,
};

fn arg<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> T {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "simple_bank=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn seed_accounts(
    uow: &PgUnitOfWork,
    count: usize,
    initial: i64,
) -> Result<Vec<i64>, StoreError> {
    uow.run(move |ledger| {
        async move {
            let mut ids = Vec::with_capacity(count);
            for i in 0..count {
                let account = ledger
                    .create_account(NewAccount::new(format!("stress-{i}"), initial, "USD"))
                    .await?;
                ids.push(account.id);
            }
            Ok::<_, StoreError>(ids)
        }
        .boxed()
    })
    .await
}

async fn total_balance(uow: &PgUnitOfWork, ids: Vec<i64>) -> Result<i64, StoreError> {
    uow.run(move |ledger| {
        async move {
            let mut total = 0i64;
            for id in ids {
                total += ledger.get_account(id).await?.balance;
            }
            Ok::<_, StoreError>(total)
        }
        .boxed()
    })
    .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    let args: Vec<String> = std::env::args().collect();
    let account_count: usize = arg(&args, "--accounts", 10).max(2);
    let transfer_count: usize = arg(&args, "--transfers", 1000);
    let concurrency: usize = arg(&args, "--concurrency", 16).max(1);
    let initial: i64 = arg(&args, "--initial", 1_000);

    println!(
        "Transfer Stress - {} transfers across {} accounts ({} tasks)",
        transfer_count, account_count, concurrency
    );
    println!("Connecting to database...");

    let pool = db::connect(&config).await?;
    db::verify_connection(&pool).await?;
    if !db::check_schema(&pool).await? {
        anyhow::bail!("schema missing, apply migrations/0001_init.sql first");
    }

    let uow = PgUnitOfWork::new(pool).with_isolation(config.isolation_level);
    let ids = seed_accounts(&uow, account_count, initial).await?;
    let before = total_balance(&uow, ids.clone()).await?;

    let mut service = TransferService::new(uow).with_retry_policy(config.retry_policy());
    if let Some(timeout) = config.transfer_timeout() {
        service = service.with_timeout(timeout);
    }
    let service = Arc::new(service);

    // Draw the whole workload up front, then deal it out to the tasks.
    let mut plan: Vec<Vec<TransferCommand>> = vec![Vec::new(); concurrency];
    {
        let mut rng = rand::thread_rng();
        for i in 0..transfer_count {
            let from = rng.gen_range(0..ids.len());
            let mut to = rng.gen_range(0..ids.len() - 1);
            if to >= from {
                to += 1;
            }
            let amount = rng.gen_range(1..=initial.max(1) / 4 + 1);
            plan[i % concurrency].push(TransferCommand::new(ids[from], ids[to], amount));
        }
    }

    let start = Instant::now();
    let mut handles = Vec::with_capacity(concurrency);
    for commands in plan {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
            for command in commands {
                let context = OperationContext::new().with_correlation_id(uuid::Uuid::new_v4());
                let key = match service.execute(command, &context).await {
                    Ok(_) => "ok",
                    Err(e) => e.error_code(),
                };
                *outcomes.entry(key).or_default() += 1;
            }
            outcomes
        }));
    }

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    for handle in handles {
        for (key, count) in handle.await? {
            *outcomes.entry(key).or_default() += count;
        }
    }
    let elapsed = start.elapsed();

    let after = total_balance(service.unit_of_work(), ids.clone()).await?;
    let succeeded = outcomes.get("ok").copied().unwrap_or(0);

    let report = serde_json::json!({
        "accounts": account_count,
        "transfers": transfer_count,
        "concurrency": concurrency,
        "isolation_level": config.isolation_level.to_string(),
        "outcomes": outcomes,
        "elapsed_secs": elapsed.as_secs_f64(),
        "rate_per_sec": succeeded as f64 / elapsed.as_secs_f64(),
        "total_before": before,
        "total_after": after,
        "conserved": before == after,
    });

    println!("\n=== Transfer Stress Results ===");
    println!("{}", serde_json::to_string_pretty(&report)?);

    if before != after {
        anyhow::bail!("total balance changed: {} -> {}", before, after);
    }

    Ok(())
}
