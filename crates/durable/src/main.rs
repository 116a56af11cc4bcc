//! Maintenance service
//!
//! Applies migrations, then runs the engine's sweeps (due timers, expired
//! task leases, parent notifications, cancellation repair) until Ctrl-C.
//! Workers embedding the engine can leave maintenance to this process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use ledgerflow_durable::{EngineConfig, PostgresWorkflowEventStore, WorkflowEngine};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgerflow_durable=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let interval = std::env::var("DURABLE_MAINTENANCE_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(1));

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;
    let store = PostgresWorkflowEventStore::new(pool);
    store.migrate().await.context("failed to run migrations")?;

    let engine = WorkflowEngine::with_config(Arc::new(store), EngineConfig::from_env());
    tracing::info!(interval_ms = interval.as_millis() as u64, "Maintenance service starting");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.run_maintenance(Utc::now()).await {
                    tracing::error!("Maintenance pass failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Maintenance service stopped");
    Ok(())
}
