//! In-memory implementations of the storage port.
//!
//! Used by unit and integration tests across the workspace (always compiled
//! so `tests/` directories of other crates can reach them). Each store can be
//! told to fail, and counts how often it was called.
//!
//! [`MemoryBroker`] models a single consumer group: delivered messages sit in
//! a pending list until acked, and pending entries idle longer than the claim
//! timeout are redelivered to whichever consumer reads next.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// BROKER
// =============================================================================

/// Millisecond part of the first [`MemoryBroker`] message id; message `n`
/// (1-based) gets `<start + n>-0`.
pub const MEMORY_STREAM_START_MILLIS: u64 = crate::snowflake::EPOCH_MILLIS;

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct BrokerState {
    log: Vec<StreamMessage>,
    /// Index of the first never-delivered message.
    cursor: usize,
    /// Log index → pending entry.
    pending: BTreeMap<usize, PendingEntry>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    claim_min_idle: Duration,
    fail_reads: AtomicBool,
    fail_acks: AtomicBool,
    fail_appends: AtomicBool,
    read_calls: AtomicUsize,
    ack_calls: AtomicUsize,
    acked: AtomicUsize,
}

/// In-memory stream with one consumer group.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_millis(defaults::CLAIM_MIN_IDLE_MS))
    }
}

impl MemoryBroker {
    /// Broker whose pending entries become reclaimable after `claim_min_idle`.
    pub fn new(claim_min_idle: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                claim_min_idle,
                fail_reads: AtomicBool::new(false),
                fail_acks: AtomicBool::new(false),
                fail_appends: AtomicBool::new(false),
                read_calls: AtomicUsize::new(0),
                ack_calls: AtomicUsize::new(0),
                acked: AtomicUsize::new(0),
            }),
        }
    }

    /// A consumer handle in the group.
    pub fn consumer(&self, name: impl Into<String>) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            name: name.into(),
        }
    }

    /// Append a message with arbitrary fields; returns its id.
    pub fn push_fields(&self, fields: HashMap<String, JsonValue>) -> String {
        let id = {
            let mut state = lock(&self.inner.state);
            let id = format!("{}-0", MEMORY_STREAM_START_MILLIS + state.log.len() as u64 + 1);
            state.log.push(StreamMessage::new(id.clone(), fields));
            id
        };
        self.inner.notify.notify_waiters();
        id
    }

    /// Append string-valued fields; returns the message id.
    pub fn push_pairs(&self, pairs: &[(&str, &str)]) -> String {
        self.push_fields(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), JsonValue::String(v.to_string())))
                .collect(),
        )
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_acks(&self, fail: bool) {
        self.inner.fail_acks.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.inner.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn read_calls(&self) -> usize {
        self.inner.read_calls.load(Ordering::SeqCst)
    }

    pub fn ack_calls(&self) -> usize {
        self.inner.ack_calls.load(Ordering::SeqCst)
    }

    /// Messages removed from the pending list so far.
    pub fn acked(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    /// Messages ever appended.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids currently delivered but not acked, in stream order.
    pub fn pending_ids(&self) -> Vec<String> {
        let state = lock(&self.inner.state);
        state
            .pending
            .keys()
            .map(|&i| state.log[i].id.clone())
            .collect()
    }

    /// Times the message has been delivered, if it is pending.
    pub fn deliveries(&self, message_id: &str) -> Option<u32> {
        let state = lock(&self.inner.state);
        let index = state.log.iter().position(|m| m.id == message_id)?;
        state.pending.get(&index).map(|p| p.deliveries)
    }

    fn take_batch(&self, consumer: &str, max_count: usize) -> Vec<StreamMessage> {
        let now = Instant::now();
        let mut state = lock(&self.inner.state);
        let state = &mut *state;
        let mut batch = Vec::new();

        for (&index, entry) in state.pending.iter_mut() {
            if batch.len() >= max_count {
                break;
            }
            if now.duration_since(entry.delivered_at) >= self.inner.claim_min_idle {
                entry.consumer = consumer.to_string();
                entry.delivered_at = now;
                entry.deliveries += 1;
                batch.push(state.log[index].clone());
            }
        }

        while batch.len() < max_count && state.cursor < state.log.len() {
            let index = state.cursor;
            state.cursor += 1;
            state.pending.insert(
                index,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            batch.push(state.log[index].clone());
        }

        batch
    }
}

#[async_trait]
impl EventProducer for MemoryBroker {
    async fn append(&self, event: &RawEvent) -> Result<String> {
        if self.inner.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::BrokerUnavailable("append rejected".into()));
        }
        let fields = event
            .to_stream_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), JsonValue::String(v)))
            .collect();
        Ok(self.push_fields(fields))
    }
}

/// One named consumer of a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    name: String,
}

#[async_trait]
impl EventStream for MemoryConsumer {
    fn consumer(&self) -> &str {
        &self.name
    }

    async fn read_batch(
        &self,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let inner = &self.broker.inner;
        inner.read_calls.fetch_add(1, Ordering::SeqCst);
        if inner.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::BrokerUnavailable("read rejected".into()));
        }

        let deadline = Instant::now() + block_timeout;
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.broker.take_batch(&self.name, max_count.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, message_ids: &[String]) -> Result<()> {
        let inner = &self.broker.inner;
        inner.ack_calls.fetch_add(1, Ordering::SeqCst);
        if inner.fail_acks.load(Ordering::SeqCst) {
            return Err(Error::BrokerUnavailable("ack rejected".into()));
        }

        let mut state = lock(&inner.state);
        let mut removed = 0;
        for id in message_ids {
            if let Some(index) = state.log.iter().position(|m| &m.id == id) {
                if state.pending.remove(&index).is_some() {
                    removed += 1;
                }
            }
        }
        inner.acked.fetch_add(removed, Ordering::SeqCst);
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(lock(&self.broker.inner.state).pending.len() as u64)
    }
}

// =============================================================================
// AGGREGATE STORE
// =============================================================================

#[derive(Debug, Default)]
struct AggregateTables {
    aggregates: Vec<AggregatedEvent>,
    user_maps: Vec<UserEventMap>,
}

/// In-memory relational store assigning sequential ids.
#[derive(Default)]
pub struct MemoryAggregateStore {
    tables: Mutex<AggregateTables>,
    next_aggregate_id: AtomicI64,
    next_map_id: AtomicI64,
    fail_aggregates: AtomicBool,
    fail_user_maps: AtomicBool,
    delay_ms: AtomicU64,
    aggregate_calls: AtomicUsize,
    user_map_calls: AtomicUsize,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_aggregates(&self, fail: bool) {
        self.fail_aggregates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_user_maps(&self, fail: bool) {
        self.fail_user_maps.store(fail, Ordering::SeqCst);
    }

    /// Delay every commit, to exercise call timeouts.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }

    pub fn user_map_calls(&self) -> usize {
        self.user_map_calls.load(Ordering::SeqCst)
    }

    pub fn aggregates(&self) -> Vec<AggregatedEvent> {
        lock(&self.tables).aggregates.clone()
    }

    pub fn user_maps(&self) -> Vec<UserEventMap> {
        lock(&self.tables).user_maps.clone()
    }

    /// Correlation rows pointing at one aggregate.
    pub fn user_maps_for(&self, aggregated_event_id: i64) -> Vec<UserEventMap> {
        lock(&self.tables)
            .user_maps
            .iter()
            .filter(|m| m.aggregated_event_id == aggregated_event_id)
            .cloned()
            .collect()
    }

    async fn maybe_delay(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn commit_aggregates(&self, aggregates: &mut [AggregatedEvent]) -> Result<()> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_delay().await;
        if self.fail_aggregates.load(Ordering::SeqCst) {
            return Err(Error::StoreWrite("aggregate insert rejected".into()));
        }

        let now = Utc::now();
        let mut tables = lock(&self.tables);
        for row in aggregates.iter_mut() {
            row.id = Some(self.next_aggregate_id.fetch_add(1, Ordering::SeqCst) + 1);
            row.created_at = Some(now);
            tables.aggregates.push(row.clone());
        }
        Ok(())
    }

    async fn commit_user_maps(&self, maps: &[UserEventMap]) -> Result<()> {
        self.user_map_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_delay().await;
        if self.fail_user_maps.load(Ordering::SeqCst) {
            return Err(Error::StoreWrite("user map insert rejected".into()));
        }

        let mut tables = lock(&self.tables);
        if let Some(orphan) = maps.iter().find(|m| {
            !tables
                .aggregates
                .iter()
                .any(|a| a.id == Some(m.aggregated_event_id))
        }) {
            return Err(Error::StoreWrite(format!(
                "aggregated_event_id {} does not exist",
                orphan.aggregated_event_id
            )));
        }
        for map in maps {
            let mut row = map.clone();
            row.id = Some(self.next_map_id.fetch_add(1, Ordering::SeqCst) + 1);
            tables.user_maps.push(row);
        }
        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<AggregatedEvent>> {
        let mut rows = self.aggregates();
        rows.sort_by(|a, b| b.window_start.cmp(&a.window_start).then(b.id.cmp(&a.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<AggregatedEvent>> {
        let tables = lock(&self.tables);
        let mut rows: Vec<AggregatedEvent> = tables
            .aggregates
            .iter()
            .filter(|a| {
                tables
                    .user_maps
                    .iter()
                    .any(|m| m.user_id == user_id && Some(m.aggregated_event_id) == a.id)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.window_start.cmp(&a.window_start));
        Ok(rows)
    }
}

// =============================================================================
// ANALYTICS STORE
// =============================================================================

/// In-memory analytical store.
#[derive(Default)]
pub struct MemoryAnalyticsStore {
    events: Mutex<Vec<RawEvent>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<RawEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl AnalyticsStore for MemoryAnalyticsStore {
    async fn commit_raw_events(&self, events: &[RawEvent]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::AnalyticalStore("insert rejected".into()));
        }
        lock(&self.events).extend_from_slice(events);
        Ok(())
    }

    async fn summarize(&self) -> Result<Vec<ActionSummary>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::AnalyticalStore("query rejected".into()));
        }
        let mut totals: HashMap<String, (u64, f64)> = HashMap::new();
        for event in lock(&self.events).iter() {
            let entry = totals.entry(event.action.clone()).or_default();
            entry.0 += 1;
            entry.1 += event.duration;
        }
        let mut summary: Vec<ActionSummary> = totals
            .into_iter()
            .map(|(action, (count, total))| ActionSummary {
                action,
                count,
                avg_duration: total / count as f64,
            })
            .collect();
        summary.sort_by(|a, b| b.count.cmp(&a.count).then(a.action.cmp(&b.action)));
        Ok(summary)
    }
}

// =============================================================================
// RECENT FEED
// =============================================================================

/// In-memory top-N feed.
pub struct MemoryRecentFeed {
    capacity: usize,
    entries: Mutex<Vec<(i64, String)>>,
    fail: AtomicBool,
    pushes: AtomicUsize,
}

impl Default for MemoryRecentFeed {
    fn default() -> Self {
        Self::new(defaults::RECENT_FEED_SIZE)
    }
}

impl MemoryRecentFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            pushes: AtomicUsize::new(0),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Retained scores, highest first.
    pub fn scores(&self) -> Vec<i64> {
        lock(&self.entries).iter().map(|(s, _)| *s).collect()
    }
}

#[async_trait]
impl RecentFeed for MemoryRecentFeed {
    async fn push(&self, serialized_event: &str, score: i64) -> Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Cache("push rejected".into()));
        }
        let mut entries = lock(&self.entries);
        // Sorted-set semantics: an identical member only moves.
        entries.retain(|(_, member)| member != serialized_event);
        entries.push((score, serialized_event.to_string()));
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        entries.truncate(self.capacity);
        Ok(())
    }

    async fn recent(&self) -> Result<Vec<String>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Cache("read rejected".into()));
        }
        Ok(lock(&self.entries).iter().map(|(_, e)| e.clone()).collect())
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Metrics sink that keeps every count for assertions.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<String, u64>>,
    durations: Mutex<Vec<Duration>>,
    active_workers: AtomicI64,
    backlog: AtomicU64,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, name: impl Into<String>, value: u64) {
        *lock(&self.counters).entry(name.into()).or_default() += value;
    }

    pub fn counter(&self, name: &str) -> u64 {
        lock(&self.counters).get(name).copied().unwrap_or(0)
    }

    /// Failures recorded for one operation label.
    pub fn failures(&self, operation: &str) -> u64 {
        self.counter(&format!("failed:{operation}"))
    }

    pub fn total_failures(&self) -> u64 {
        lock(&self.counters)
            .iter()
            .filter(|(k, _)| k.starts_with("failed:"))
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn durations(&self) -> Vec<Duration> {
        lock(&self.durations).clone()
    }

    pub fn active_workers(&self) -> i64 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::SeqCst)
    }
}

impl MetricsSink for RecordingMetrics {
    fn events_received(&self) {
        self.add("received", 1);
    }

    fn events_ingested(&self) {
        self.add("ingested", 1);
    }

    fn events_processed(&self, count: usize) {
        self.add("processed", count as u64);
    }

    fn event_failed(&self, operation: &str) {
        self.add(format!("failed:{operation}"), 1);
    }

    fn malformed_field(&self, field: &str) {
        self.add(format!("malformed:{field}"), 1);
    }

    fn batch_size(&self, size: usize) {
        self.add("batches", 1);
        self.add("batch_events", size as u64);
    }

    fn processing_duration(&self, elapsed: Duration) {
        lock(&self.durations).push(elapsed);
    }

    fn aggregated_events_created(&self, count: usize) {
        self.add("aggregates_created", count as u64);
    }

    fn worker_iteration(&self) {
        self.add("iterations", 1);
    }

    fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn stream_backlog(&self, pending: u64) {
        self.backlog.store(pending, Ordering::SeqCst);
    }
}

// =============================================================================
// BUNDLE
// =============================================================================

/// A broker plus one of each store, wired together.
#[derive(Clone)]
pub struct MemoryStores {
    pub broker: MemoryBroker,
    pub aggregates: Arc<MemoryAggregateStore>,
    pub analytics: Arc<MemoryAnalyticsStore>,
    pub feed: Arc<MemoryRecentFeed>,
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::with_broker(MemoryBroker::default())
    }
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(broker: MemoryBroker) -> Self {
        Self {
            broker,
            aggregates: Arc::new(MemoryAggregateStore::new()),
            analytics: Arc::new(MemoryAnalyticsStore::new()),
            feed: Arc::new(MemoryRecentFeed::default()),
        }
    }

    /// Storage port for one named consumer.
    pub fn port(&self, consumer: &str) -> StoragePort {
        StoragePort {
            stream: Arc::new(self.broker.consumer(consumer)),
            aggregates: self.aggregates.clone(),
            analytics: self.analytics.clone(),
            feed: self.feed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_empty_times_out_without_error() {
        let broker = MemoryBroker::default();
        let consumer = broker.consumer("c1");
        let batch = consumer
            .read_batch(10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_message_delivered_to_one_consumer() {
        let broker = MemoryBroker::default();
        broker.push_pairs(&[("user_id", "u1")]);
        let a = broker.consumer("a");
        let b = broker.consumer("b");

        let first = a.read_batch(10, Duration::from_millis(10)).await.unwrap();
        let second = b.read_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(broker.pending_ids(), vec![first[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let broker = MemoryBroker::default();
        let id = broker.push_pairs(&[("user_id", "u1")]);
        let c = broker.consumer("c");
        c.read_batch(10, Duration::from_millis(10)).await.unwrap();
        c.ack(&[id]).await.unwrap();
        assert!(broker.pending_ids().is_empty());
        assert_eq!(broker.acked(), 1);
        assert_eq!(c.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_pending_entries_are_redelivered() {
        let broker = MemoryBroker::new(Duration::ZERO);
        let id = broker.push_pairs(&[("user_id", "u1")]);
        let a = broker.consumer("a");
        let b = broker.consumer("b");
        a.read_batch(10, Duration::from_millis(10)).await.unwrap();

        let again = b.read_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
        assert_eq!(broker.deliveries(&id), Some(2));
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_append() {
        let broker = MemoryBroker::default();
        let consumer = broker.consumer("c");
        let producer = broker.clone();
        let reader =
            tokio::spawn(async move { consumer.read_batch(10, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.push_pairs(&[("user_id", "late")]);
        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_store_assigns_ids_in_order() {
        let store = MemoryAggregateStore::new();
        let mut rows = vec![
            AggregatedEvent {
                id: None,
                action: "a".into(),
                element: "e".into(),
                count: 1,
                window_start: Utc::now(),
                created_at: None,
            };
            3
        ];
        store.commit_aggregates(&mut rows).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(rows.iter().all(|r| r.created_at.is_some()));
    }

    #[tokio::test]
    async fn test_user_maps_require_parent() {
        let store = MemoryAggregateStore::new();
        let orphan = UserEventMap {
            id: None,
            aggregated_event_id: 99,
            user_id: "u".into(),
        };
        assert!(matches!(
            store.commit_user_maps(&[orphan]).await,
            Err(Error::StoreWrite(_))
        ));
        assert!(store.user_maps().is_empty());
    }

    #[tokio::test]
    async fn test_feed_keeps_top_n_by_score() {
        let feed = MemoryRecentFeed::new(3);
        for score in [5, 1, 9, 7, 3] {
            feed.push(&format!("e{score}"), score).await.unwrap();
        }
        assert_eq!(feed.scores(), vec![9, 7, 5]);
        assert_eq!(feed.recent().await.unwrap(), vec!["e9", "e7", "e5"]);
    }

    #[tokio::test]
    async fn test_analytics_summary_orders_by_count() {
        let store = MemoryAnalyticsStore::new();
        let mk = |action: &str, duration: f64| RawEvent {
            id: None,
            user_id: "u".into(),
            action: action.into(),
            element: "e".into(),
            duration,
            timestamp: Utc::now(),
        };
        store
            .commit_raw_events(&[mk("view", 1.0), mk("click", 2.0), mk("click", 4.0)])
            .await
            .unwrap();
        let summary = store.summarize().await.unwrap();
        assert_eq!(summary[0].action, "click");
        assert_eq!(summary[0].count, 2);
        assert_eq!(summary[0].avg_duration, 3.0);
    }
}
