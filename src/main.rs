//! Transfer reconciler service
//!
//! ```text
//! ┌──────────────┐    ┌───────────────┐    ┌──────────────┐
//! │ Redis queue  │───▶│ EventConsumer │───▶│  PostgreSQL  │
//! │ (callbacks)  │    │  (N workers)  │    │ transactions │
//! └──────────────┘    └───────────────┘    └──────────────┘
//!                                                 ▲
//! ┌──────────────┐    ┌───────────────┐           │
//! │   Provider   │◀───│  SweepWorker  │───────────┘
//! └──────────────┘    └───────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use transfer_reconciler::config::AppConfig;
use transfer_reconciler::db::Database;
use transfer_reconciler::notify::{LogNotifier, NotificationSink, RedisNotifier};
use transfer_reconciler::provider::{HttpTransferProvider, TransferProvider};
use transfer_reconciler::queue::{MessageQueue, RedisListQueue, run_consumer};
use transfer_reconciler::reconcile::{
    EventConsumer, PgReconcileRepository, ReconcileRepository, ReconciliationSweep, SweepWorker,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn ensure_schema_requested() -> bool {
    std::env::args().any(|a| a == "--ensure-schema")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("loading config for {env}"))?;
    let _log_guard = transfer_reconciler::logging::init_logging(&config);

    tracing::info!(env = %env, "Starting transfer reconciler");

    let db = Database::connect(&config.postgres_url)
        .await
        .context("connecting to PostgreSQL")?;
    db.health_check().await.context("PostgreSQL health check")?;
    if ensure_schema_requested() {
        db.ensure_schema().await.context("applying schema")?;
    }

    let repo: Arc<dyn ReconcileRepository> =
        Arc::new(PgReconcileRepository::new(db.pool().clone()));
    let provider: Arc<dyn TransferProvider> = Arc::new(HttpTransferProvider::new(&config.provider)?);

    let redis_client = match &config.redis_url {
        Some(url) => Some(redis::Client::open(url.as_str()).context("parsing redis_url")?),
        None => None,
    };

    let notifier: Arc<dyn NotificationSink> = match &redis_client {
        Some(client) => {
            let conn = client
                .get_connection_manager()
                .await
                .context("connecting to Redis")?;
            Arc::new(RedisNotifier::new(conn, config.notifications.channel.clone()))
        }
        None => Arc::new(LogNotifier),
    };

    let sweep = Arc::new(ReconciliationSweep::new(
        repo.clone(),
        provider,
        Duration::from_secs(config.sweep.min_age_secs),
    ));
    let sweep_worker = SweepWorker::new(sweep, config.sweep.clone());
    let sweep_handle = tokio::spawn(async move {
        sweep_worker.run().await;
    });

    match &redis_client {
        Some(client) => {
            let consumer = Arc::new(EventConsumer::new(repo, notifier, config.consumer.clone()));
            let receive_timeout = Duration::from_millis(config.consumer.receive_timeout_ms);

            let recovery = RedisListQueue::connect(
                client,
                config.consumer.queue_key.clone(),
                config.consumer.processing_key.clone(),
            )
            .await?;
            recovery.recover_processing().await?;

            for worker_id in 0..config.consumer.workers.max(1) {
                let queue: Arc<dyn MessageQueue> = Arc::new(
                    RedisListQueue::connect(
                        client,
                        config.consumer.queue_key.clone(),
                        config.consumer.processing_key.clone(),
                    )
                    .await?,
                );
                let consumer = consumer.clone();
                tokio::spawn(async move {
                    run_consumer(worker_id, queue, consumer, receive_timeout).await;
                });
            }
            tracing::info!(
                workers = config.consumer.workers.max(1),
                queue = %config.consumer.queue_key,
                "Callback consumers started"
            );
        }
        None => {
            tracing::warn!("redis_url not configured; status callbacks will not be consumed");
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        result = sweep_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Sweep worker terminated");
            }
        }
    }

    Ok(())
}
