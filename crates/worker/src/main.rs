#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! MemberPay Background Worker
//!
//! Runs the outbox dispatcher: polls the outbox table, delivers due events
//! through the configured publisher, and applies the retry/backoff schedule.

mod publisher;

use std::sync::Arc;
use std::time::Duration;

use memberpay_pipeline::{DispatcherConfig, OutboxDispatcher, Publisher};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::publisher::{HttpPublisher, TracingPublisher};

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Broadcast endpoint when configured, otherwise minimal mode
fn select_publisher() -> Arc<dyn Publisher> {
    match std::env::var("BROADCAST_ENDPOINT_URL") {
        Ok(endpoint) if !endpoint.is_empty() => {
            info!(endpoint = %endpoint, "HTTP broadcast publisher enabled");
            Arc::new(HttpPublisher::new(endpoint))
        }
        _ => {
            warn!("BROADCAST_ENDPOINT_URL not set - running in minimal mode, events are logged only");
            Arc::new(TracingPublisher)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting MemberPay Worker v{}", env!("CARGO_PKG_VERSION"));

    let pool = create_db_pool().await?;
    let config = DispatcherConfig::from_env();
    let dispatcher = OutboxDispatcher::new(pool, select_publisher(), config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping dispatcher");
            let _ = shutdown_tx.send(true);
        }
    });

    dispatcher.run(shutdown_rx).await;

    info!("MemberPay Worker stopped");
    Ok(())
}
