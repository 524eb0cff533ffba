//! Worker process composition root.
//!
//! Wires the durable store, account pool, protocol-client config and
//! generation queue together, then runs until interrupted. The queue
//! instance is owned here and passed by reference; nothing in the
//! system reaches for a global.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidpool_accounts::{AccountPool, PoolLimits};
use vidpool_queue::{GenerationQueue, LogNotifier, QueueConfig};
use vidpool_sora::SoraConfig;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    /// Bound on concurrently running job tasks (default: `5`).
    max_workers: usize,
    /// Optional proxy URL for all upstream traffic.
    proxy: Option<String>,
    /// Override for the upstream base URL (default: production).
    base_url: Option<String>,
}

impl WorkerConfig {
    /// | Env Var        | Default      |
    /// |----------------|--------------|
    /// | `DATABASE_URL` | required     |
    /// | `MAX_WORKERS`  | `5`          |
    /// | `PROXY_URL`    | unset        |
    /// | `SORA_BASE_URL`| production   |
    fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let max_workers: usize = std::env::var("MAX_WORKERS")
            .unwrap_or_else(|_| "5".into())
            .parse()
            .expect("MAX_WORKERS must be a positive integer");

        let proxy = std::env::var("PROXY_URL").ok().filter(|s| !s.is_empty());
        let base_url = std::env::var("SORA_BASE_URL").ok().filter(|s| !s.is_empty());

        Self {
            database_url,
            max_workers,
            proxy,
            base_url,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vidpool_worker=debug,vidpool_queue=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!(max_workers = config.max_workers, "loaded worker configuration");

    let pool = vidpool_db::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    vidpool_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    vidpool_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("database ready");

    let mut sora = SoraConfig {
        proxy: config.proxy.clone(),
        ..SoraConfig::default()
    };
    if let Some(base_url) = &config.base_url {
        sora.base_url = base_url.clone();
    }

    let accounts = AccountPool::new(pool.clone(), PoolLimits::default(), sora.clone());

    let queue = GenerationQueue::new(
        pool,
        accounts,
        sora,
        Arc::new(LogNotifier),
        QueueConfig {
            max_workers: config.max_workers,
            ..QueueConfig::default()
        },
    );

    queue.start().await.expect("Failed to start generation queue");
    tracing::info!("worker started");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("shutdown signal received");

    queue.shutdown().await;
}
