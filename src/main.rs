//! Accrual reconciliation service.
//!
//! Resumes every unfinished order found in storage, keeps sweeping for orders
//! written by the HTTP layer, and drains workers on Ctrl-C or SIGTERM.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use loyalty_accrual::accrual::HttpAccrualClient;
use loyalty_accrual::ratelimit::PacedLimiter;
use loyalty_accrual::reconcile::{recover_unfinished, Reconciler, Scheduler, SchedulerHandle};
use loyalty_accrual::store::{MemoryStore, OrderStore, SqliteStore};
use loyalty_accrual::shutdown::shutdown_signal;
use loyalty_accrual::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("loyalty_accrual=info")),
        )
        .init();

    let config = Config::from_env()?;
    let shutdown_requested = shutdown_signal()?;
    tracing::info!(
        accrual = %config.accrual_address,
        database = ?config.database_path,
        workers = config.workers,
        rate_limit_per_minute = config.rate_limit_per_minute.get(),
        retry_interval_ms = config.retry_policy.default_interval.as_millis() as u64,
        max_retries = config.retry_policy.max_retries,
        "Starting accrual reconciliation"
    );

    let store: Arc<dyn OrderStore> = match &config.database_path {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => {
            tracing::warn!("DATABASE_URI not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let limiter = Arc::new(PacedLimiter::per_minute(config.rate_limit_per_minute));
    let client = Arc::new(HttpAccrualClient::new(
        config.accrual_address.clone(),
        limiter,
        config.request_timeout,
    )?);
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        client,
        config.retry_policy,
    ));

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::start(reconciler, config.workers, &shutdown);

    let sweeper = tokio::spawn(sweep_loop(
        Arc::clone(&store),
        scheduler.handle(),
        config.sweep_interval,
        shutdown.clone(),
    ));

    shutdown_requested.await;
    tracing::info!("Shutdown...");
    shutdown.cancel();

    let _ = sweeper.await;
    if scheduler.shutdown(config.shutdown_grace).await {
        tracing::info!("All reconciliation workers stopped");
    }
    Ok(())
}

/// Queue unfinished orders now and then every `interval`.
async fn sweep_loop(
    store: Arc<dyn OrderStore>,
    scheduler: SchedulerHandle,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match recover_unfinished(store.as_ref(), &scheduler).await {
            Ok(0) => {}
            Ok(queued) => tracing::info!(queued, "Queued unfinished orders"),
            Err(e) => tracing::error!(error = %e, "Failed to list unfinished orders"),
        }
    }
}
