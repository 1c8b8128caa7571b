#![cfg_attr(test, allow(clippy::unwrap_used))]

//! EduGate Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription lifecycle sweep (every 15 minutes)
//! - Expiry reminders (daily at 06:00 UTC)
//! - Usage recalculation for live organizations (hourly)
//! - Entitlement invariant checks (daily at 04:00 UTC)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use edugate_entitlements::{EngineConfig, EntitlementEngine};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Create a database connection pool
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,edugate_worker=debug,edugate_entitlements=debug".into());
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting EduGate Worker");

    let pool = create_db_pool().await?;
    let engine_config = EngineConfig::from_env()?;
    let engine = Arc::new(EntitlementEngine::connect(pool, &engine_config).await?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Lifecycle sweep every 15 minutes
    let sweep_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let engine = sweep_engine.clone();
            Box::pin(async move {
                jobs::run_lifecycle_sweep(&engine, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Lifecycle sweep (every 15 minutes)");

    // Job 2: Expiry reminders (daily at 06:00 UTC)
    let reminder_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let engine = reminder_engine.clone();
            Box::pin(async move {
                jobs::run_expiry_reminders(&engine, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Expiry reminders (daily at 06:00 UTC)");

    // Job 3: Usage recalculation (hourly)
    let usage_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let engine = usage_engine.clone();
            Box::pin(async move {
                if let Err(e) = jobs::run_usage_recalculation(&engine).await {
                    error!(error = %e, "Usage recalculation failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Usage recalculation (hourly)");

    // Job 4: Invariant checks (daily at 04:00 UTC)
    let invariant_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let engine = invariant_engine.clone();
            Box::pin(async move {
                jobs::run_invariant_checks(&engine, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 04:00 UTC)");

    // Catch up on anything that lapsed while the worker was down
    jobs::run_lifecycle_sweep(&engine, OffsetDateTime::now_utc()).await;

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("EduGate Worker started successfully with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
