//! Aggregation worker: drains the stream consumer group into windowed
//! aggregates.
//!
//! One batch runs `read → parse → aggregate → commit aggregates → commit
//! user maps → fan out → ack`. The two relational commits and the ack are
//! strictly sequential and any failure among them leaves the batch
//! unacknowledged, so the broker redelivers it. Writes to the analytical
//! store and the recent feed are handed to a [`BestEffortDispatcher`] and
//! never block the ack.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use tally_core::defaults;
use tally_core::{
    aggregate, bounded, parse_message, Error, MetricsSink, NoopMetrics, RawEvent, Result, StoragePort,
    StreamMessage, WindowSize,
};

use crate::fanout::BestEffortDispatcher;

/// Metric label for failed analytical-store inserts.
pub const OP_CLICKHOUSE_INSERT: &str = "clickhouse_insert";
/// Metric label for failed recent-feed pushes.
pub const OP_RECENT_FEED_PUSH: &str = "recent_feed_push";

/// Configuration for the aggregation workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether to run workers at all.
    pub enabled: bool,
    /// Number of concurrent consumers.
    pub worker_count: usize,
    /// Consumer names are `{prefix}-{index}`.
    pub consumer_prefix: String,
    /// Maximum messages per read.
    pub batch_size: usize,
    /// How long a read blocks waiting for the first message.
    pub block_timeout: Duration,
    /// Aggregation window.
    pub window: WindowSize,
    /// Pause after a failed batch.
    pub error_backoff: Duration,
    /// Upper bound on every store call.
    pub store_timeout: Duration,
    /// Best-effort writes allowed in flight per worker.
    pub best_effort_max_in_flight: usize,
    /// How long shutdown waits for in-flight best-effort writes.
    pub shutdown_drain: Duration,
    /// How often the pool samples the group's pending count.
    pub backlog_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_count: defaults::WORKER_COUNT,
            consumer_prefix: defaults::CONSUMER_PREFIX.to_string(),
            batch_size: defaults::BATCH_SIZE,
            block_timeout: Duration::from_millis(defaults::BLOCK_TIMEOUT_MS),
            window: WindowSize::default(),
            error_backoff: Duration::from_millis(defaults::ERROR_BACKOFF_MS),
            store_timeout: Duration::from_millis(defaults::STORE_TIMEOUT_MS),
            best_effort_max_in_flight: defaults::BEST_EFFORT_MAX_IN_FLIGHT,
            shutdown_drain: Duration::from_secs(defaults::SHUTDOWN_DRAIN_SECS),
            backlog_interval: Duration::from_secs(defaults::BACKLOG_SAMPLE_SECS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable aggregation |
    /// | `WORKER_COUNT` | `4` | Concurrent consumers |
    /// | `WORKER_CONSUMER_PREFIX` | `worker` | Consumer name prefix |
    /// | `WORKER_BATCH_SIZE` | `100` | Max messages per read |
    /// | `WORKER_BLOCK_TIMEOUT_MS` | `300` | Blocking read timeout |
    /// | `WORKER_WINDOW_SECS` | `5` | Aggregation window |
    /// | `WORKER_ERROR_BACKOFF_MS` | `1000` | Sleep after a failed batch |
    /// | `WORKER_STORE_TIMEOUT_MS` | `5000` | Per-call store timeout |
    /// | `WORKER_BEST_EFFORT_MAX_IN_FLIGHT` | `64` | Best-effort writes in flight |
    pub fn from_env() -> Self {
        let base = Self::default();

        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(base.enabled);

        let window = match env_parse::<u64>("WORKER_WINDOW_SECS") {
            Some(secs) => WindowSize::from_secs(secs).unwrap_or_else(|e| {
                warn!(error = %e, "Invalid WORKER_WINDOW_SECS, using default");
                base.window
            }),
            None => base.window,
        };

        Self {
            enabled,
            worker_count: env_parse("WORKER_COUNT")
                .unwrap_or(base.worker_count)
                .max(1),
            consumer_prefix: std::env::var("WORKER_CONSUMER_PREFIX")
                .unwrap_or(base.consumer_prefix),
            batch_size: env_parse("WORKER_BATCH_SIZE")
                .unwrap_or(base.batch_size)
                .max(1),
            block_timeout: env_parse("WORKER_BLOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.block_timeout),
            window,
            error_backoff: env_parse("WORKER_ERROR_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.error_backoff),
            store_timeout: env_parse("WORKER_STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(base.store_timeout),
            best_effort_max_in_flight: env_parse("WORKER_BEST_EFFORT_MAX_IN_FLIGHT")
                .unwrap_or(base.best_effort_max_in_flight)
                .max(1),
            shutdown_drain: base.shutdown_drain,
            backlog_interval: base.backlog_interval,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_window(mut self, window: WindowSize) -> Self {
        self.window = window;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_best_effort_max_in_flight(mut self, max: usize) -> Self {
        self.best_effort_max_in_flight = max;
        self
    }

    pub fn with_shutdown_drain(mut self, drain: Duration) -> Self {
        self.shutdown_drain = drain;
        self
    }

    pub fn with_backlog_interval(mut self, interval: Duration) -> Self {
        self.backlog_interval = interval;
        self
    }

    /// Consumer name of the worker at `index`.
    pub fn consumer_name(&self, index: usize) -> String {
        format!("{}-{}", self.consumer_prefix, index)
    }
}

/// Where the worker is in its batch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Grouping,
    PersistingAggregates,
    PersistingCorrelations,
    Acking,
    ErrorBackoff,
}

/// Step of a batch that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Read,
    PersistAggregates,
    PersistCorrelations,
    Ack,
}

impl BatchStage {
    /// Label recorded with `event_failed`.
    pub fn metric_operation(&self) -> &'static str {
        match self {
            BatchStage::Read => "stream_read",
            BatchStage::PersistAggregates | BatchStage::PersistCorrelations => "aggregation",
            BatchStage::Ack => "ack",
        }
    }
}

impl std::fmt::Display for BatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchStage::Read => "read",
            BatchStage::PersistAggregates => "persist_aggregates",
            BatchStage::PersistCorrelations => "persist_correlations",
            BatchStage::Ack => "ack",
        };
        f.write_str(name)
    }
}

/// Counts for one acknowledged batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub messages: usize,
    pub aggregates: usize,
    pub user_maps: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The read returned nothing. No store was touched.
    Empty,
    Processed(BatchSummary),
}

/// A batch that was not acknowledged.
#[derive(Debug)]
pub struct BatchFailure {
    pub batch_id: Option<Uuid>,
    pub stage: BatchStage,
    pub error: Error,
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch failed at {}: {}", self.stage, self.error)
    }
}

impl std::error::Error for BatchFailure {}

/// Event emitted by aggregation workers.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    WorkerStarted {
        consumer: String,
    },
    BatchCompleted {
        consumer: String,
        summary: BatchSummary,
    },
    BatchFailed {
        consumer: String,
        batch_id: Option<Uuid>,
        stage: BatchStage,
        error: String,
    },
    WorkerStopped {
        consumer: String,
    },
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    ///
    /// A blocked read is abandoned; a batch already past its read finishes.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait for the worker task to exit.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("worker task failed: {e}")))
    }

    /// Shut down and wait for the worker to report stopped.
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.join().await
    }
}

/// One consumer of the group and everything it writes to.
pub struct AggregationWorker {
    port: StoragePort,
    config: WorkerConfig,
    metrics: Arc<dyn MetricsSink>,
    dispatcher: BestEffortDispatcher,
    event_tx: broadcast::Sender<WorkerEvent>,
    state_tx: watch::Sender<WorkerState>,
}

impl AggregationWorker {
    pub fn new(port: StoragePort, config: WorkerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self::with_event_sender(port, config, metrics, event_tx)
    }

    /// Worker publishing on an existing event channel (shared by a pool).
    pub fn with_event_sender(
        port: StoragePort,
        config: WorkerConfig,
        metrics: Arc<dyn MetricsSink>,
        event_tx: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        let dispatcher = BestEffortDispatcher::new(config.best_effort_max_in_flight, metrics.clone());
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        Self {
            port,
            config,
            metrics,
            dispatcher,
            event_tx,
            state_tx,
        }
    }

    pub fn consumer(&self) -> &str {
        self.port.stream.consumer()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_rx = self.event_tx.subscribe();
        let task = self.spawn(shutdown_rx);
        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Run on a shared shutdown signal.
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown_rx).await })
    }

    fn transition(&self, next: WorkerState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            trace!(consumer = %self.consumer(), ?previous, ?next, "Worker state");
        }
    }

    /// Run the read/process loop until shutdown.
    #[instrument(skip(self, shutdown_rx), fields(consumer = %self.consumer()))]
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let consumer = self.consumer().to_string();
        info!(
            subsystem = "worker",
            component = "aggregation",
            op = "start",
            batch_size = self.config.batch_size,
            window_ms = self.config.window.as_duration().as_millis() as u64,
            "Aggregation worker started"
        );
        self.metrics.worker_started();
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted {
            consumer: consumer.clone(),
        });

        loop {
            if *shutdown_rx.borrow_and_update() {
                info!("Aggregation worker received shutdown signal");
                break;
            }
            self.metrics.worker_iteration();

            // Only the read is abandoned on shutdown; everything after it
            // runs to completion.
            let read = tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Aggregation worker received shutdown signal");
                    break;
                }
                read = self.read() => read,
            };

            let result = match read {
                Ok(messages) => self.process_messages(messages).await,
                Err(failure) => Err(failure),
            };

            if result.is_err() {
                self.transition(WorkerState::ErrorBackoff);
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = sleep(self.config.error_backoff) => {}
                }
                self.transition(WorkerState::Idle);
            }
        }

        if !self.dispatcher.drain(self.config.shutdown_drain).await {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                "Best-effort writes still running at shutdown"
            );
        }
        self.transition(WorkerState::Idle);
        self.metrics.worker_stopped();
        let _ = self.event_tx.send(WorkerEvent::WorkerStopped { consumer });
        info!("Aggregation worker stopped");
    }

    /// Read and process one batch.
    pub async fn process_batch(&self) -> std::result::Result<BatchOutcome, BatchFailure> {
        let messages = self.read().await?;
        self.process_messages(messages).await
    }

    async fn read(&self) -> std::result::Result<Vec<StreamMessage>, BatchFailure> {
        self.transition(WorkerState::Idle);
        let limit = self.config.block_timeout + self.config.store_timeout;
        bounded(
            "read_batch",
            limit,
            Error::BrokerUnavailable,
            self.port
                .stream
                .read_batch(self.config.batch_size, self.config.block_timeout),
        )
        .await
        .map_err(|error| self.fail(None, BatchStage::Read, error))
    }

    async fn process_messages(
        &self,
        messages: Vec<StreamMessage>,
    ) -> std::result::Result<BatchOutcome, BatchFailure> {
        if messages.is_empty() {
            return Ok(BatchOutcome::Empty);
        }
        let start = Instant::now();
        let batch_id = Uuid::now_v7();
        let timeout = self.config.store_timeout;

        self.transition(WorkerState::Grouping);
        let parsed_at = Utc::now();
        let mut message_ids = Vec::with_capacity(messages.len());
        let mut events = Vec::with_capacity(messages.len());
        let mut scores = Vec::with_capacity(messages.len());
        for message in &messages {
            let parsed = parse_message(message, parsed_at);
            if let Some(error) = parsed.malformation(&message.id) {
                warn!(%batch_id, %error, "Malformed fields replaced with defaults");
                for field in parsed.malformed() {
                    self.metrics.malformed_field(field);
                }
            }
            message_ids.push(message.id.clone());
            scores.push(parsed.event.id.or_else(|| message.arrival_order()));
            events.push(parsed.event);
        }
        self.metrics.batch_size(events.len());

        let plan = aggregate(&events, self.config.window);
        debug!(
            %batch_id,
            messages = events.len(),
            groups = plan.len(),
            "Batch grouped"
        );

        self.transition(WorkerState::PersistingAggregates);
        let mut aggregates = plan.aggregated_events();
        bounded(
            "commit_aggregates",
            timeout,
            Error::StoreWrite,
            self.port.aggregates.commit_aggregates(&mut aggregates),
        )
        .await
        .map_err(|e| self.fail(Some(batch_id), BatchStage::PersistAggregates, e))?;
        self.metrics.aggregated_events_created(aggregates.len());

        self.transition(WorkerState::PersistingCorrelations);
        let user_maps = plan
            .user_maps(&aggregates)
            .map_err(|e| self.fail(Some(batch_id), BatchStage::PersistCorrelations, e))?;
        bounded(
            "commit_user_maps",
            timeout,
            Error::StoreWrite,
            self.port.aggregates.commit_user_maps(&user_maps),
        )
        .await
        .map_err(|e| self.fail(Some(batch_id), BatchStage::PersistCorrelations, e))?;

        self.fan_out(batch_id, events, scores);

        self.transition(WorkerState::Acking);
        bounded(
            "ack",
            timeout,
            Error::BrokerUnavailable,
            self.port.stream.ack(&message_ids),
        )
        .await
        .map_err(|e| self.fail(Some(batch_id), BatchStage::Ack, e))?;

        self.transition(WorkerState::Idle);
        let elapsed = start.elapsed();
        self.metrics.events_processed(message_ids.len());
        self.metrics.processing_duration(elapsed);

        let summary = BatchSummary {
            batch_id,
            messages: message_ids.len(),
            aggregates: aggregates.len(),
            user_maps: user_maps.len(),
        };
        info!(
            %batch_id,
            messages = summary.messages,
            aggregates = summary.aggregates,
            duration_ms = elapsed.as_millis() as u64,
            "Batch acknowledged"
        );
        let _ = self.event_tx.send(WorkerEvent::BatchCompleted {
            consumer: self.consumer().to_string(),
            summary: summary.clone(),
        });
        Ok(BatchOutcome::Processed(summary))
    }

    /// Hand the raw events to the best-effort sinks.
    fn fan_out(&self, batch_id: Uuid, events: Vec<RawEvent>, scores: Vec<Option<i64>>) {
        let timeout = self.config.store_timeout;

        let feed_entries: Vec<(String, i64)> = events
            .iter()
            .zip(scores)
            .filter_map(|(event, score)| {
                let Some(score) = score else {
                    debug!(%batch_id, "Event has no feed score, skipping feed push");
                    return None;
                };
                match serde_json::to_string(event) {
                    Ok(json) => Some((json, score)),
                    Err(e) => {
                        warn!(%batch_id, error = %e, "Event not serializable for feed");
                        None
                    }
                }
            })
            .collect();

        let analytics = self.port.analytics.clone();
        self.dispatcher.dispatch(OP_CLICKHOUSE_INSERT, async move {
            bounded(
                "commit_raw_events",
                timeout,
                Error::AnalyticalStore,
                analytics.commit_raw_events(&events),
            )
            .await
        });

        if feed_entries.is_empty() {
            return;
        }
        let feed = self.port.feed.clone();
        self.dispatcher.dispatch(OP_RECENT_FEED_PUSH, async move {
            let mut failed = 0usize;
            let mut last_error = None;
            for (json, score) in &feed_entries {
                if let Err(e) = bounded("push", timeout, Error::Cache, feed.push(json, *score)).await
                {
                    failed += 1;
                    last_error = Some(e);
                }
            }
            match last_error {
                None => Ok(()),
                Some(e) => Err(Error::Cache(format!(
                    "{failed} of {} pushes failed, last: {e}",
                    feed_entries.len()
                ))),
            }
        });
    }

    fn fail(&self, batch_id: Option<Uuid>, stage: BatchStage, error: Error) -> BatchFailure {
        self.metrics.event_failed(stage.metric_operation());
        match stage {
            BatchStage::Read => warn!(%stage, error = %error, "Stream read failed"),
            _ => error!(
                ?batch_id,
                %stage,
                error = %error,
                "Batch not acknowledged, will be redelivered"
            ),
        }
        let _ = self.event_tx.send(WorkerEvent::BatchFailed {
            consumer: self.consumer().to_string(),
            batch_id,
            stage,
            error: error.to_string(),
        });
        BatchFailure {
            batch_id,
            stage,
            error,
        }
    }
}

/// Builder for creating an aggregation worker.
pub struct WorkerBuilder {
    port: StoragePort,
    config: WorkerConfig,
    metrics: Arc<dyn MetricsSink>,
    event_tx: Option<broadcast::Sender<WorkerEvent>>,
}

impl WorkerBuilder {
    pub fn new(port: StoragePort) -> Self {
        Self {
            port,
            config: WorkerConfig::default(),
            metrics: Arc::new(NoopMetrics),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_event_sender(mut self, event_tx: broadcast::Sender<WorkerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn build(self) -> AggregationWorker {
        match self.event_tx {
            Some(tx) => AggregationWorker::with_event_sender(self.port, self.config, self.metrics, tx),
            None => AggregationWorker::new(self.port, self.config, self.metrics),
        }
    }
}

/// N workers sharing one shutdown signal and one event channel, plus the
/// backlog sampler.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<WorkerEvent>,
    workers: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start one worker per port. Each port must carry its own consumer.
    pub fn start(ports: Vec<StoragePort>, config: WorkerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);

        if !config.enabled {
            info!("Aggregation workers are disabled, not starting");
            return Self {
                shutdown_tx,
                event_tx,
                workers: Vec::new(),
                monitor: None,
            };
        }

        let monitor = ports.first().map(|port| {
            let stream = port.stream.clone();
            let period = config.backlog_interval.max(Duration::from_millis(1));
            let metrics = metrics.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = interval.tick() => {}
                    }
                    match stream.pending_count().await {
                        Ok(pending) => metrics.stream_backlog(pending),
                        Err(e) => debug!(error = %e, "Backlog sample failed"),
                    }
                }
            })
        });

        let workers: Vec<JoinHandle<()>> = ports
            .into_iter()
            .map(|port| {
                WorkerBuilder::new(port)
                    .with_config(config.clone())
                    .with_metrics(metrics.clone())
                    .with_event_sender(event_tx.clone())
                    .build()
                    .spawn(shutdown_rx.clone())
            })
            .collect();

        info!(
            subsystem = "worker",
            component = "pool",
            op = "start",
            workers = workers.len(),
            "Aggregation worker pool started"
        );

        Self {
            shutdown_tx,
            event_tx,
            workers,
            monitor,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Get a receiver for events from every worker.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Signal every worker and wait for all of them to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                error!(error = ?e, "Aggregation worker task panicked");
            }
        }
        if let Some(monitor) = self.monitor {
            let _ = monitor.await;
        }
        info!("Aggregation worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.block_timeout, Duration::from_millis(300));
        assert_eq!(config.window, WindowSize::from_secs(5).unwrap());
        assert_eq!(config.error_backoff, Duration::from_secs(1));
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.best_effort_max_in_flight, 64);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_enabled(false)
            .with_worker_count(8)
            .with_batch_size(10)
            .with_block_timeout(Duration::from_millis(50))
            .with_error_backoff(Duration::from_millis(5))
            .with_consumer_prefix("agg");

        assert!(!config.enabled);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.block_timeout, Duration::from_millis(50));
        assert_eq!(config.error_backoff, Duration::from_millis(5));
        assert_eq!(config.consumer_name(3), "agg-3");
    }

    #[test]
    fn test_stage_metric_operations() {
        assert_eq!(BatchStage::Read.metric_operation(), "stream_read");
        assert_eq!(BatchStage::PersistAggregates.metric_operation(), "aggregation");
        assert_eq!(BatchStage::PersistCorrelations.metric_operation(), "aggregation");
        assert_eq!(BatchStage::Ack.metric_operation(), "ack");
    }

    #[test]
    fn test_batch_failure_display() {
        let failure = BatchFailure {
            batch_id: None,
            stage: BatchStage::PersistCorrelations,
            error: Error::StoreWrite("fk violation".into()),
        };
        assert_eq!(
            failure.to_string(),
            "batch failed at persist_correlations: Store write error: fk violation"
        );
    }

    #[test]
    fn test_worker_event_clone() {
        let event = WorkerEvent::BatchFailed {
            consumer: "worker-0".into(),
            batch_id: None,
            stage: BatchStage::Ack,
            error: "boom".into(),
        };
        let cloned = event.clone();
        assert!(matches!(cloned, WorkerEvent::BatchFailed { stage: BatchStage::Ack, .. }));
    }
}
