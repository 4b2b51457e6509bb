mod config;
mod docker;
mod error;
mod evaluator;
mod health;
mod manager;
mod pool;
mod queue;
mod sandbox;
mod worker;

#[cfg(test)]
mod testing;

use anyhow::Context;
use config::LanguageConfigManager;
use docker::DockerRuntime;
use judge_common::config::WorkerConfig;
use manager::PoolManager;
use pool::PoolSettings;
use queue::{JobSource, RedisJobSource, RedisResultSink};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use worker::JobWorkerPool;

/// How long in-flight jobs get to finish once a shutdown signal arrives
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = WorkerConfig::from_env();
    init_tracing(settings.json_logs);

    info!("Judge worker booting...");

    // Load language configurations
    let languages = LanguageConfigManager::load(Path::new(&settings.languages_config))
        .map_err(|e| {
            error!("Failed to load language configurations: {:#}", e);
            error!("Set LANGUAGES_CONFIG or provide config/languages.json");
            e
        })?;

    info!(languages = ?languages.list_languages(), "Loaded language configurations");

    // Engine errors are fatal: exit non-zero and let the supervisor restart us
    let runtime = DockerRuntime::connect().await.context("Container engine unavailable")?;

    let manager = Arc::new(PoolManager::new(
        &languages,
        Arc::new(runtime),
        PoolSettings {
            acquire_timeout: settings.acquire_timeout,
            case_settle_delay: settings.case_settle_delay,
        },
    ));
    manager
        .initialize()
        .await
        .context("Failed to initialize sandbox pools")?;

    // Connect to Redis
    let client = ::redis::Client::open(settings.redis_url.as_str())
        .context("Invalid REDIS_URL")?;

    let results = match RedisResultSink::connect(&client, &settings.result_queue).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            manager.shutdown().await;
            return Err(e);
        }
    };

    let mut sources: Vec<Box<dyn JobSource>> = Vec::with_capacity(settings.concurrency);
    for _ in 0..settings.concurrency {
        match RedisJobSource::connect(&client, &settings.job_queue).await {
            Ok(source) => sources.push(Box::new(source)),
            Err(e) => {
                manager.shutdown().await;
                return Err(e);
            }
        }
    }

    info!(
        redis = %settings.redis_url,
        job_queue = %settings.job_queue,
        result_queue = %settings.result_queue,
        "Connected to Redis"
    );

    let (health_stop_tx, health_stop_rx) = watch::channel(false);
    let health_task = if settings.health_addr.is_empty() {
        None
    } else {
        let addr = settings.health_addr.clone();
        let manager = Arc::clone(&manager);
        Some(tokio::spawn(async move {
            if let Err(e) = health::serve(&addr, manager, health_stop_rx).await {
                error!("Health endpoint stopped: {:#}", e);
            }
        }))
    };

    let workers = JobWorkerPool::start(
        Arc::clone(&manager),
        sources,
        results,
        settings.pop_timeout,
    );

    info!(workers = workers.worker_count(), "Ready to accept jobs");

    if let Err(e) = shutdown_signal().await {
        warn!("Signal handling failed ({}), shutting down", e);
    }
    warn!("Received shutdown signal, draining workers...");

    workers.shutdown(SHUTDOWN_GRACE).await;

    let _ = health_stop_tx.send(true);
    if let Some(task) = health_task {
        let _ = task.await;
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
