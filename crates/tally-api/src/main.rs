//! tally server: HTTP ingestion plus the aggregation worker pool.

mod config;
mod handlers;
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_core::{defaults, AggregateStore, AnalyticsStore, RecentFeed, Snowflake, StoragePort};
use tally_db::{ClickHouseStore, Database, PoolConfig, RedisRecentFeed, RedisStreams};
use tally_jobs::WorkerPool;

use crate::config::AppConfig;
use crate::handlers::AppState;
use crate::metrics::PrometheusMetrics;

/// Interval between database pool samples.
const POOL_SAMPLE_SECS: u64 = 15;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "tally_api=info,tally_jobs=info,tally_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tally_api=info,tally_jobs=info,tally_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("tally-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = AppConfig::load().context("loading configuration")?;
    let metrics = Arc::new(PrometheusMetrics::new().context("registering metrics")?);

    // Relational store
    let db = Database::connect_with_config(
        &config.database_url,
        PoolConfig::default()
            .with_max_connections(config.database_max_connections)
            .sized_for_workers(if config.worker.enabled {
                config.worker.worker_count
            } else {
                0
            }),
    )
    .await
    .context("connecting to PostgreSQL")?;
    db.migrate().await.context("running migrations")?;

    // Stream broker
    let streams = Arc::new(
        RedisStreams::connect(config.stream.clone())
            .await
            .context("connecting to Redis")?,
    );
    streams
        .ensure_group()
        .await
        .context("creating consumer group")?;

    // Best-effort sinks
    let clickhouse = Arc::new(ClickHouseStore::new(config.clickhouse.clone())?);
    if let Err(e) = clickhouse.ensure_schema().await {
        warn!(
            subsystem = "analytics",
            error = %e,
            "ClickHouse schema bootstrap failed, analytics writes will be retried per batch"
        );
    }
    let feed = Arc::new(RedisRecentFeed::new(streams.connection()));

    let aggregates: Arc<dyn AggregateStore> = Arc::new(db.aggregates.clone());
    let analytics: Arc<dyn AnalyticsStore> = clickhouse;
    let feed: Arc<dyn RecentFeed> = feed;

    // Workers, one consumer connection each
    let mut ports = Vec::new();
    if config.worker.enabled {
        for index in 0..config.worker.worker_count {
            let consumer = streams
                .consumer(config.worker.consumer_name(index))
                .await
                .context("opening stream consumer")?;
            ports.push(StoragePort {
                stream: Arc::new(consumer),
                aggregates: aggregates.clone(),
                analytics: analytics.clone(),
                feed: feed.clone(),
            });
        }
    }
    let pool = WorkerPool::start(ports, config.worker.clone(), metrics.clone());

    let pool_sampler = {
        let pg = db.pool.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(POOL_SAMPLE_SECS));
            loop {
                interval.tick().await;
                let stats = tally_db::log_pool_metrics(&pg);
                metrics.db_connections(stats.active(), stats.idle);
            }
        })
    };

    let state = AppState {
        producer: streams.clone(),
        aggregates,
        analytics,
        feed,
        ids: Arc::new(Snowflake::new(config.snowflake_node_id)?),
        metrics,
        request_timeout: Duration::from_secs(defaults::INGEST_TIMEOUT_SECS),
    };
    let app = handlers::router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(
        subsystem = "api",
        op = "listen",
        %addr,
        workers = pool.len(),
        "Starting server"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining workers");
    pool.shutdown().await;
    pool_sampler.abort();
    info!("Shutdown complete");

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
