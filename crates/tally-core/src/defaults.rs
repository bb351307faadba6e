//! Centralized default constants for tally.
//!
//! Every crate references these constants instead of defining its own magic
//! numbers. Organized by domain area.

// =============================================================================
// STREAM BROKER
// =============================================================================

/// Stream key that ingested events are appended to.
pub const STREAM_NAME: &str = "events";

/// Consumer group shared by all aggregation workers.
pub const CONSUMER_GROUP: &str = "event-group";

/// Prefix for per-worker consumer names (`<prefix>-<index>`).
pub const CONSUMER_PREFIX: &str = "worker";

/// Maximum messages fetched per `read_batch` call.
pub const BATCH_SIZE: usize = 100;

/// How long `read_batch` blocks waiting for at least one message.
pub const BLOCK_TIMEOUT_MS: u64 = 300;

/// Pending entries idle longer than this are reclaimed for redelivery.
pub const CLAIM_MIN_IDLE_MS: u64 = 30_000;

// =============================================================================
// AGGREGATION
// =============================================================================

/// Aggregation window size in seconds.
pub const WINDOW_SECS: u64 = 5;

/// Rows per statement when inserting user correlation maps.
pub const USER_MAP_CHUNK_SIZE: usize = 500;

// =============================================================================
// WORKER
// =============================================================================

/// Number of concurrent aggregation workers.
pub const WORKER_COUNT: usize = 4;

/// Sleep after a failed batch before polling again.
pub const ERROR_BACKOFF_MS: u64 = 1_000;

/// Upper bound on any single store call.
pub const STORE_TIMEOUT_MS: u64 = 5_000;

/// Maximum detached best-effort tasks in flight per worker.
pub const BEST_EFFORT_MAX_IN_FLIGHT: usize = 64;

/// How long shutdown waits for best-effort tasks to drain.
pub const SHUTDOWN_DRAIN_SECS: u64 = 30;

/// Worker event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Interval between stream backlog samples.
pub const BACKLOG_SAMPLE_SECS: u64 = 15;

// =============================================================================
// RECENT FEED
// =============================================================================

/// Sorted-set key holding the recent-activity feed.
pub const RECENT_FEED_KEY: &str = "events:recent";

/// Number of entries retained in the recent-activity feed.
pub const RECENT_FEED_SIZE: usize = 10;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 8080;

/// Timeout for appending an ingested event to the stream.
pub const INGEST_TIMEOUT_SECS: u64 = 5;

/// Default page size for aggregate listings.
pub const PAGE_LIMIT: i64 = 100;

/// Maximum page size for aggregate listings.
pub const PAGE_LIMIT_MAX: i64 = 1_000;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Default snowflake node id for a single-instance deployment.
pub const SNOWFLAKE_NODE_ID: u16 = 1;
