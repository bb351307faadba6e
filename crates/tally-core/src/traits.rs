//! Core traits for tally abstractions.
//!
//! These traits define the storage port the aggregation worker drives plus
//! the write-only collaborators (metrics, id generation) injected into it.
//! Each trait has its own failure kind; see [`crate::Error`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// STREAM BROKER
// =============================================================================

/// One consumer's view of a consumer group.
///
/// Implementations must be safe for concurrent use, but each worker holds its
/// own instance so blocking reads never stall another worker.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Consumer name within the group.
    fn consumer(&self) -> &str;

    /// Read up to `max_count` messages, blocking up to `block_timeout` for at
    /// least one. Returns an empty vec (not an error) when nothing arrives.
    ///
    /// Fails with [`crate::Error::BrokerUnavailable`].
    async fn read_batch(
        &self,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamMessage>>;

    /// Remove the given message ids from the group's pending list.
    ///
    /// Fails with [`crate::Error::BrokerUnavailable`].
    async fn ack(&self, message_ids: &[String]) -> Result<()>;

    /// Number of delivered-but-unacknowledged entries in the group.
    async fn pending_count(&self) -> Result<u64>;
}

/// Producer side of the stream.
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Append an event; returns the broker-assigned message id.
    async fn append(&self, event: &RawEvent) -> Result<String>;
}

// =============================================================================
// DURABLE STORES
// =============================================================================

/// Relational store for aggregates and their user correlations.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Insert all rows; on success every element's `id` and `created_at` are
    /// filled in place, in slice order.
    ///
    /// Fails with [`crate::Error::StoreWrite`].
    async fn commit_aggregates(&self, aggregates: &mut [AggregatedEvent]) -> Result<()>;

    /// Insert correlation rows. All parents must already be committed; the
    /// whole slice is written atomically.
    ///
    /// Fails with [`crate::Error::StoreWrite`].
    async fn commit_user_maps(&self, maps: &[UserEventMap]) -> Result<()>;

    /// Most recent aggregates by window start, newest first.
    async fn list_recent(&self, limit: i64) -> Result<Vec<AggregatedEvent>>;

    /// Aggregates a user contributed to, newest window first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<AggregatedEvent>>;
}

// =============================================================================
// BEST-EFFORT SINKS
// =============================================================================

/// Columnar store receiving every raw event.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Fails with [`crate::Error::AnalyticalStore`].
    async fn commit_raw_events(&self, events: &[RawEvent]) -> Result<()>;

    /// Per-action counts and average duration, most frequent first.
    async fn summarize(&self) -> Result<Vec<ActionSummary>>;
}

/// Bounded top-N recent-activity cache ordered by score.
#[async_trait]
pub trait RecentFeed: Send + Sync {
    /// Insert and trim to the N highest scores.
    ///
    /// Fails with [`crate::Error::Cache`].
    async fn push(&self, serialized_event: &str, score: i64) -> Result<()>;

    /// Up to N entries, highest score first.
    async fn recent(&self) -> Result<Vec<String>>;
}

/// Every store the aggregation worker depends on.
#[derive(Clone)]
pub struct StoragePort {
    pub stream: Arc<dyn EventStream>,
    pub aggregates: Arc<dyn AggregateStore>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub feed: Arc<dyn RecentFeed>,
}

impl StoragePort {
    /// Same stores, different consumer.
    pub fn with_stream(&self, stream: Arc<dyn EventStream>) -> Self {
        Self {
            stream,
            ..self.clone()
        }
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Write-only metrics surface. Never read back by pipeline logic.
pub trait MetricsSink: Send + Sync {
    fn events_received(&self) {}
    fn events_ingested(&self) {}
    fn events_processed(&self, _count: usize) {}
    /// A failed operation, labelled by what failed
    /// (`aggregation`, `stream_read`, `ack`, `clickhouse_insert`, ...).
    fn event_failed(&self, _operation: &str) {}
    fn malformed_field(&self, _field: &str) {}
    fn batch_size(&self, _size: usize) {}
    fn processing_duration(&self, _elapsed: Duration) {}
    fn aggregated_events_created(&self, _count: usize) {}
    fn worker_iteration(&self) {}
    fn worker_started(&self) {}
    fn worker_stopped(&self) {}
    fn stream_backlog(&self, _pending: u64) {}
}

/// Metrics sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Source of unique, monotonically increasing 63-bit event ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> i64;
}
