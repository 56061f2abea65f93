// Main entry point for the scheduling server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scheduler_core::common::InstanceId;
use scheduler_core::kernel::schedules::{PostgresScheduleStore, ScheduleService};
use scheduler_core::kernel::tasks::{HandlerRegistry, MemoryTaskStore, PostgresTaskStore, TaskService};
use scheduler_core::kernel::PostgresJobQueue;
use scheduler_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scheduler_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting scheduling server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire up the scheduling core
    let instance_id = InstanceId::generate();
    tracing::info!(instance_id = %instance_id, "instance id assigned");

    let job_queue = Arc::new(PostgresJobQueue::with_completion_check_interval(
        pool.clone(),
        Duration::from_millis(config.scheduler.completion_check_interval_ms),
    ));
    let schedule_store = Arc::new(PostgresScheduleStore::new(pool.clone()));
    let task_store = Arc::new(PostgresTaskStore::new(pool.clone()));
    let memory_task_store = Arc::new(MemoryTaskStore::new());
    let registry = Arc::new(HandlerRegistry::new());

    let schedule_service = ScheduleService::new(
        schedule_store,
        job_queue.clone(),
        config.scheduler.clone(),
    );
    let task_service = TaskService::new(
        task_store,
        memory_task_store,
        registry.clone(),
        config.scheduler.clone(),
        instance_id,
    );

    schedule_service
        .start()
        .await
        .context("Failed to start schedule service")?;
    task_service
        .start()
        .await
        .context("Failed to start task service")?;

    tracing::info!("Scheduling server running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    task_service.stop().await;
    schedule_service.stop().await;

    tracing::info!("Scheduling server stopped");
    Ok(())
}
