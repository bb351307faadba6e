//! Aggregation worker behavior against the in-memory storage port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tally_core::memory::{MemoryBroker, MemoryStores, RecordingMetrics, MEMORY_STREAM_START_MILLIS};
use tally_core::{aggregate, Error, EventProducer, RawEvent, RecentFeed, Snowflake, WindowSize};
use tally_jobs::{
    AggregationWorker, BatchOutcome, BatchStage, WorkerBuilder, WorkerConfig, WorkerEvent,
    WorkerPool, WorkerState,
};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn event(user: &str, action: &str, element: &str, secs: i64) -> RawEvent {
    RawEvent {
        id: None,
        user_id: user.to_string(),
        action: action.to_string(),
        element: element.to_string(),
        duration: 1.0,
        timestamp: ts(secs),
    }
}

fn test_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_block_timeout(Duration::from_millis(20))
        .with_error_backoff(Duration::from_millis(10))
        .with_shutdown_drain(Duration::from_secs(2))
}

fn worker_for(stores: &MemoryStores, metrics: &Arc<RecordingMetrics>) -> AggregationWorker {
    WorkerBuilder::new(stores.port("worker-0"))
        .with_config(test_config())
        .with_metrics(metrics.clone())
        .build()
}

async fn append_all(broker: &MemoryBroker, events: &[RawEvent]) {
    for event in events {
        broker.append(event).await.unwrap();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}

#[tokio::test]
async fn test_single_group_creates_one_aggregate() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);

    append_all(
        &stores.broker,
        &[
            event("u1", "click", "btn", 1_700_000_001),
            event("u2", "click", "btn", 1_700_000_002),
        ],
    )
    .await;

    let outcome = worker.process_batch().await.unwrap();
    let BatchOutcome::Processed(summary) = outcome else {
        panic!("expected a processed batch");
    };
    assert_eq!(summary.messages, 2);
    assert_eq!(summary.aggregates, 1);
    assert_eq!(summary.user_maps, 2);

    let rows = stores.aggregates.aggregates();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].count, 2);
    assert_eq!(rows[0].window_start, ts(1_700_000_000));

    let maps = stores.aggregates.user_maps_for(rows[0].id.unwrap());
    let users: Vec<_> = maps.iter().map(|m| m.user_id.as_str()).collect();
    assert_eq!(users, vec!["u1", "u2"]);

    assert_eq!(stores.broker.ack_calls(), 1);
    assert_eq!(stores.broker.acked(), 2);
    assert!(stores.broker.pending_ids().is_empty());
    assert_eq!(metrics.counter("processed"), 2);
    assert_eq!(metrics.counter("aggregates_created"), 1);
    assert_eq!(worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn test_batch_size_and_duration_recorded_per_committed_batch() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);

    // An empty read records neither.
    assert_eq!(worker.process_batch().await.unwrap(), BatchOutcome::Empty);
    assert_eq!(metrics.counter("batches"), 0);
    assert!(metrics.durations().is_empty());

    append_all(
        &stores.broker,
        &[
            event("u1", "click", "btn", 10),
            event("u2", "view", "page", 10),
        ],
    )
    .await;
    worker.process_batch().await.unwrap();

    assert_eq!(metrics.counter("batches"), 1);
    assert_eq!(metrics.counter("batch_events"), 2);
    assert_eq!(metrics.durations().len(), 1);

    // A batch that fails before the ack is sized but never timed.
    stores.aggregates.set_fail_aggregates(true);
    append_all(&stores.broker, &[event("u3", "click", "btn", 20)]).await;
    worker.process_batch().await.unwrap_err();

    assert_eq!(metrics.counter("batches"), 2);
    assert_eq!(metrics.counter("batch_events"), 3);
    assert_eq!(metrics.durations().len(), 1);
}

#[tokio::test]
async fn test_empty_batch_touches_nothing() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);

    let outcome = worker.process_batch().await.unwrap();
    assert_eq!(outcome, BatchOutcome::Empty);
    assert_eq!(stores.aggregates.aggregate_calls(), 0);
    assert_eq!(stores.aggregates.user_map_calls(), 0);
    assert_eq!(stores.analytics.calls(), 0);
    assert_eq!(stores.feed.pushes(), 0);
    assert_eq!(stores.broker.ack_calls(), 0);
    assert_eq!(metrics.total_failures(), 0);
}

#[tokio::test]
async fn test_user_map_failure_leaves_batch_unacked() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);
    stores.aggregates.set_fail_user_maps(true);

    append_all(
        &stores.broker,
        &[
            event("u1", "click", "btn", 10),
            event("u2", "view", "page", 10),
        ],
    )
    .await;

    let failure = worker.process_batch().await.unwrap_err();
    assert_eq!(failure.stage, BatchStage::PersistCorrelations);
    assert!(matches!(failure.error, Error::StoreWrite(_)));
    assert!(failure.batch_id.is_some());

    assert_eq!(stores.broker.ack_calls(), 0);
    assert_eq!(stores.broker.pending_ids().len(), 2);
    assert_eq!(metrics.failures("aggregation"), 1);
    assert_eq!(metrics.total_failures(), 1);
    // Nothing is fanned out for a batch that will be redelivered.
    assert_eq!(stores.analytics.calls(), 0);
    assert_eq!(stores.feed.pushes(), 0);
}

#[tokio::test]
async fn test_aggregate_failure_skips_correlations_and_ack() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);
    stores.aggregates.set_fail_aggregates(true);

    append_all(&stores.broker, &[event("u1", "click", "btn", 10)]).await;

    let failure = worker.process_batch().await.unwrap_err();
    assert_eq!(failure.stage, BatchStage::PersistAggregates);
    assert_eq!(stores.aggregates.user_map_calls(), 0);
    assert_eq!(stores.broker.ack_calls(), 0);
    assert_eq!(metrics.failures("aggregation"), 1);
}

#[tokio::test]
async fn test_read_failure_is_recorded() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);
    stores.broker.set_fail_reads(true);

    let failure = worker.process_batch().await.unwrap_err();
    assert_eq!(failure.stage, BatchStage::Read);
    assert!(matches!(failure.error, Error::BrokerUnavailable(_)));
    assert!(failure.batch_id.is_none());
    assert_eq!(metrics.failures("stream_read"), 1);
}

#[tokio::test]
async fn test_ack_failure_keeps_messages_pending() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);
    stores.broker.set_fail_acks(true);

    append_all(&stores.broker, &[event("u1", "click", "btn", 10)]).await;

    let failure = worker.process_batch().await.unwrap_err();
    assert_eq!(failure.stage, BatchStage::Ack);
    assert_eq!(stores.aggregates.aggregates().len(), 1);
    assert_eq!(stores.broker.pending_ids().len(), 1);
    assert_eq!(metrics.failures("ack"), 1);
}

#[tokio::test]
async fn test_slow_store_times_out_as_store_write() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = WorkerBuilder::new(stores.port("worker-0"))
        .with_config(test_config().with_store_timeout(Duration::from_millis(30)))
        .with_metrics(metrics.clone())
        .build();
    stores.aggregates.set_delay(Duration::from_millis(500));

    append_all(&stores.broker, &[event("u1", "click", "btn", 10)]).await;

    let failure = worker.process_batch().await.unwrap_err();
    assert_eq!(failure.stage, BatchStage::PersistAggregates);
    assert!(matches!(failure.error, Error::StoreWrite(ref m) if m.contains("timed out")));
    assert_eq!(stores.broker.ack_calls(), 0);
}

#[tokio::test]
async fn test_redelivery_reprocesses_and_duplicates_aggregates() {
    let stores = MemoryStores::with_broker(MemoryBroker::new(Duration::ZERO));
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);

    append_all(
        &stores.broker,
        &[
            event("u1", "click", "btn", 10),
            event("u2", "click", "btn", 11),
        ],
    )
    .await;

    stores.aggregates.set_fail_user_maps(true);
    assert!(worker.process_batch().await.is_err());

    stores.aggregates.set_fail_user_maps(false);
    let outcome = worker.process_batch().await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Processed(ref s) if s.messages == 2));

    // The first attempt's aggregate row stays behind without user maps.
    let rows = stores.aggregates.aggregates();
    assert_eq!(rows.len(), 2);
    assert_eq!(stores.aggregates.user_maps_for(rows[0].id.unwrap()).len(), 0);
    assert_eq!(stores.aggregates.user_maps_for(rows[1].id.unwrap()).len(), 2);
    assert!(stores.broker.pending_ids().is_empty());
}

#[tokio::test]
async fn test_correlation_integrity_across_groups() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);

    let actions = ["click", "view", "hover"];
    let elements = ["btn", "link"];
    let events: Vec<RawEvent> = (0..60)
        .map(|i| {
            event(
                &format!("u{}", i % 9),
                actions[i % 3],
                elements[i % 2],
                1_700_000_000 + (i as i64 % 12),
            )
        })
        .collect();
    append_all(&stores.broker, &events).await;

    let BatchOutcome::Processed(summary) = worker.process_batch().await.unwrap() else {
        panic!("expected a processed batch");
    };
    assert_eq!(summary.messages, 60);

    let expected = aggregate(&events, WindowSize::from_secs(5).unwrap());
    let rows = stores.aggregates.aggregates();
    assert_eq!(rows.len(), expected.len());
    assert_eq!(rows.iter().map(|r| r.count).sum::<i64>(), 60);

    for (row, group) in rows.iter().zip(expected.groups()) {
        let maps = stores.aggregates.user_maps_for(row.id.unwrap());
        assert_eq!(maps.len() as i64, row.count);

        let mut stored: Vec<_> = maps.iter().map(|m| m.user_id.clone()).collect();
        let mut grouped = group.user_ids.clone();
        stored.sort();
        grouped.sort();
        assert_eq!(stored, grouped);
    }
}

#[tokio::test]
async fn test_malformed_duration_defaults_and_is_counted() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);

    stores.broker.push_pairs(&[
        ("user_id", "u1"),
        ("action", "click"),
        ("element", "btn"),
        ("duration", "abc"),
        ("timestamp", "2026-05-04T10:00:01Z"),
    ]);

    let outcome = worker.process_batch().await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Processed(_)));
    assert_eq!(metrics.counter("malformed:duration"), 1);
    assert_eq!(stores.aggregates.aggregates()[0].action, "click");

    let analytics = stores.analytics.clone();
    wait_until(|| analytics.events().len() == 1).await;
    assert_eq!(stores.analytics.events()[0].duration, 0.0);
}

#[tokio::test]
async fn test_best_effort_failures_do_not_block_ack() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);
    stores.analytics.set_fail(true);
    stores.feed.set_fail(true);

    let mut tagged = event("u1", "click", "btn", 10);
    tagged.id = Some(7);
    append_all(&stores.broker, &[tagged]).await;

    let outcome = worker.process_batch().await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Processed(_)));
    assert_eq!(stores.broker.acked(), 1);

    let m = metrics.clone();
    wait_until(move || {
        m.failures("clickhouse_insert") == 1 && m.failures("recent_feed_push") == 1
    })
    .await;
    assert_eq!(metrics.failures("aggregation"), 0);
}

#[tokio::test]
async fn test_feed_scored_by_event_id_then_arrival_order() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);

    let event_id = Snowflake::compose(MEMORY_STREAM_START_MILLIS + 9, 1, 0);
    let mut with_id = event("u1", "click", "btn", 10);
    with_id.id = Some(event_id);
    append_all(&stores.broker, &[with_id, event("u2", "view", "page", 10)]).await;

    worker.process_batch().await.unwrap();

    let feed = stores.feed.clone();
    wait_until(|| feed.pushes() == 2).await;
    // The second message arrived 2ms after the stream start and has no id.
    let arrival = Snowflake::compose(MEMORY_STREAM_START_MILLIS + 2, 0, 0);
    assert_eq!(stores.feed.scores(), vec![event_id, arrival]);

    let recent = stores.feed.recent().await.unwrap();
    let newest: RawEvent = serde_json::from_str(&recent[0]).unwrap();
    assert_eq!(newest.user_id, "u1");
}

#[tokio::test]
async fn test_concurrent_workers_process_each_message_once() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let config = test_config().with_worker_count(4).with_batch_size(7);

    let ports = (0..config.worker_count)
        .map(|i| stores.port(&config.consumer_name(i)))
        .collect();
    let pool = WorkerPool::start(ports, config, metrics.clone());
    assert_eq!(pool.len(), 4);

    let events: Vec<RawEvent> = (0..200)
        .map(|i| event(&format!("u{i}"), "click", "btn", 1_700_000_000 + (i % 30)))
        .collect();
    append_all(&stores.broker, &events).await;

    let broker = stores.broker.clone();
    wait_until(move || broker.acked() == 200).await;
    pool.shutdown().await;

    let rows = stores.aggregates.aggregates();
    assert_eq!(rows.iter().map(|r| r.count).sum::<i64>(), 200);

    let mut seen: HashMap<String, usize> = HashMap::new();
    for map in stores.aggregates.user_maps() {
        *seen.entry(map.user_id).or_default() += 1;
    }
    assert_eq!(seen.len(), 200);
    assert!(seen.values().all(|&n| n == 1));
    assert_eq!(metrics.counter("processed"), 200);
    assert_eq!(metrics.active_workers(), 0);
}

#[tokio::test]
async fn test_graceful_shutdown_emits_lifecycle_events() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let worker = worker_for(&stores, &metrics);
    let mut events = worker.events();
    let handle = worker.start();

    tokio::time::timeout(Duration::from_secs(2), handle.stop())
        .await
        .expect("worker did not stop")
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(WorkerEvent::WorkerStarted { .. })));
    assert!(matches!(seen.last(), Some(WorkerEvent::WorkerStopped { .. })));
    assert_eq!(metrics.active_workers(), 0);
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_batch_finish() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    stores.aggregates.set_delay(Duration::from_millis(100));

    let worker = worker_for(&stores, &metrics);
    let mut states = worker.state_changes();
    let handle = worker.start();

    append_all(&stores.broker, &[event("u1", "click", "btn", 10)]).await;
    tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == WorkerState::PersistingAggregates),
    )
    .await
    .expect("batch never started")
    .unwrap();

    handle.stop().await.unwrap();
    assert_eq!(stores.broker.acked(), 1);
    assert_eq!(stores.aggregates.user_maps().len(), 1);
}

#[tokio::test]
async fn test_worker_loop_backs_off_and_recovers() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    stores.broker.set_fail_reads(true);

    let handle = worker_for(&stores, &metrics).start();
    let m = metrics.clone();
    wait_until(move || m.failures("stream_read") >= 2).await;

    stores.broker.set_fail_reads(false);
    append_all(&stores.broker, &[event("u1", "click", "btn", 10)]).await;
    let broker = stores.broker.clone();
    wait_until(move || broker.acked() == 1).await;

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_pool_samples_stream_backlog() {
    let stores = MemoryStores::new();
    let metrics = Arc::new(RecordingMetrics::new());
    // Failed batches stay pending until the claim timeout, far beyond this test.
    stores.aggregates.set_fail_aggregates(true);
    append_all(
        &stores.broker,
        &[
            event("u1", "click", "btn", 10),
            event("u2", "click", "btn", 10),
            event("u3", "view", "page", 10),
        ],
    )
    .await;

    let config = test_config()
        .with_worker_count(1)
        .with_backlog_interval(Duration::from_millis(10));
    let pool = WorkerPool::start(vec![stores.port("worker-0")], config, metrics.clone());

    let m = metrics.clone();
    wait_until(move || m.backlog() == 3).await;

    stores.aggregates.set_fail_aggregates(false);
    pool.shutdown().await;
    assert_eq!(stores.broker.acked(), 0);
}

#[tokio::test]
async fn test_disabled_pool_starts_nothing() {
    let stores = MemoryStores::new();
    let pool = WorkerPool::start(
        vec![stores.port("worker-0")],
        test_config().with_enabled(false),
        Arc::new(RecordingMetrics::new()),
    );
    assert!(pool.is_empty());
    pool.shutdown().await;
}
