//! Prometheus implementation of [`MetricsSink`].
//!
//! All metrics live in a private registry under the `tally` namespace and are
//! rendered in the text exposition format by `GET /metrics`.

use std::time::Duration;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use tally_core::MetricsSink;

const NAMESPACE: &str = "tally";

pub struct PrometheusMetrics {
    registry: Registry,

    // Ingestion
    events_received: Counter,
    events_ingested: Counter,

    // Aggregation
    events_processed: Counter,
    events_failed: CounterVec,
    malformed_fields: CounterVec,
    batch_size: Histogram,
    processing_duration: Histogram,
    aggregated_events_created: Counter,

    // Workers
    worker_iterations: Counter,
    active_workers: Gauge,
    stream_backlog: Gauge,

    // HTTP and database
    http_request_duration: HistogramVec,
    db_connections: GaugeVec,
}

impl PrometheusMetrics {
    /// Creates the metrics with everything registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total number of events received via HTTP.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_ingested = Counter::with_opts(
            Opts::new(
                "events_ingested_total",
                "Total number of events appended to the stream.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_processed = Counter::with_opts(
            Opts::new(
                "events_processed_total",
                "Total number of events acknowledged by workers.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_failed = CounterVec::new(
            Opts::new(
                "events_failed_total",
                "Total number of failed operations by operation.",
            )
            .namespace(NAMESPACE),
            &["operation"],
        )?;
        let malformed_fields = CounterVec::new(
            Opts::new(
                "malformed_fields_total",
                "Stream message fields replaced with defaults, by field.",
            )
            .namespace(NAMESPACE),
            &["field"],
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("aggregation_batch_size", "Number of events per batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
        )?;
        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "event_processing_seconds",
                "Time from read to acknowledgment of one batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        let aggregated_events_created = Counter::with_opts(
            Opts::new(
                "aggregated_events_created_total",
                "Total number of aggregate rows committed.",
            )
            .namespace(NAMESPACE),
        )?;
        let worker_iterations = Counter::with_opts(
            Opts::new("worker_iterations_total", "Total worker loop iterations.")
                .namespace(NAMESPACE),
        )?;
        let active_workers = Gauge::with_opts(
            Opts::new("active_workers", "Number of running aggregation workers.")
                .namespace(NAMESPACE),
        )?;
        let stream_backlog = Gauge::with_opts(
            Opts::new(
                "stream_backlog",
                "Delivered but unacknowledged messages in the consumer group.",
            )
            .namespace(NAMESPACE),
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds.",
            )
            .namespace(NAMESPACE),
            &["method", "endpoint", "status"],
        )?;
        let db_connections = GaugeVec::new(
            Opts::new("db_connections", "PostgreSQL pool connections by state.")
                .namespace(NAMESPACE),
            &["state"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_ingested.clone()))?;
        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(events_failed.clone()))?;
        registry.register(Box::new(malformed_fields.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(processing_duration.clone()))?;
        registry.register(Box::new(aggregated_events_created.clone()))?;
        registry.register(Box::new(worker_iterations.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(stream_backlog.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(db_connections.clone()))?;

        Ok(Self {
            registry,
            events_received,
            events_ingested,
            events_processed,
            events_failed,
            malformed_fields,
            batch_size,
            processing_duration,
            aggregated_events_created,
            worker_iterations,
            active_workers,
            stream_backlog,
            http_request_duration,
            db_connections,
        })
    }

    pub fn observe_http_request(&self, method: &str, endpoint: &str, status: u16, elapsed: Duration) {
        self.http_request_duration
            .with_label_values(&[method, endpoint, &status.to_string()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn db_connections(&self, active: u32, idle: u32) {
        self.db_connections
            .with_label_values(&["active"])
            .set(active as f64);
        self.db_connections.with_label_values(&["idle"]).set(idle as f64);
    }

    /// Render every registered metric in the text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn events_received(&self) {
        self.events_received.inc();
    }

    fn events_ingested(&self) {
        self.events_ingested.inc();
    }

    fn events_processed(&self, count: usize) {
        self.events_processed.inc_by(count as f64);
    }

    fn event_failed(&self, operation: &str) {
        self.events_failed.with_label_values(&[operation]).inc();
    }

    fn malformed_field(&self, field: &str) {
        self.malformed_fields.with_label_values(&[field]).inc();
    }

    fn batch_size(&self, size: usize) {
        self.batch_size.observe(size as f64);
    }

    fn processing_duration(&self, elapsed: Duration) {
        self.processing_duration.observe(elapsed.as_secs_f64());
    }

    fn aggregated_events_created(&self, count: usize) {
        self.aggregated_events_created.inc_by(count as f64);
    }

    fn worker_iteration(&self) {
        self.worker_iterations.inc();
    }

    fn worker_started(&self) {
        self.active_workers.inc();
    }

    fn worker_stopped(&self) {
        self.active_workers.dec();
    }

    fn stream_backlog(&self, pending: u64) {
        self.stream_backlog.set(pending as f64);
    }
}
