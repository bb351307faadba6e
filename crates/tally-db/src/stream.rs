//! Redis Streams consumer group.
//!
//! [`RedisStreams`] owns the client and a shared connection used for
//! appends and group management. Every worker gets its own
//! [`RedisEventStream`] with a dedicated connection, because a blocking
//! `XREADGROUP` occupies the connection it runs on.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
//! - `STREAM_NAME`: stream key (default: events)
//! - `CONSUMER_GROUP`: consumer group name (default: event-group)
//! - `WORKER_CLAIM_MIN_IDLE_MS`: idle time before a pending entry is reclaimed (default: 30000)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, Value};
use serde_json::Value as JsonValue;
use tracing::{debug, info, trace, warn};

use tally_core::defaults;
use tally_core::{Error, EventProducer, EventStream, RawEvent, Result, StreamMessage};

/// Default Redis URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

fn broker_error(e: RedisError) -> Error {
    Error::BrokerUnavailable(e.to_string())
}

/// Stream and group naming plus reclaim policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub redis_url: String,
    pub stream: String,
    pub group: String,
    /// Pending entries idle at least this long are claimed by the next reader.
    pub claim_min_idle: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream: defaults::STREAM_NAME.to_string(),
            group: defaults::CONSUMER_GROUP.to_string(),
            claim_min_idle: Duration::from_millis(defaults::CLAIM_MIN_IDLE_MS),
        }
    }
}

impl StreamConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(base.redis_url),
            stream: std::env::var("STREAM_NAME").unwrap_or(base.stream),
            group: std::env::var("CONSUMER_GROUP").unwrap_or(base.group),
            claim_min_idle: std::env::var("WORKER_CLAIM_MIN_IDLE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(base.claim_min_idle),
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_claim_min_idle(mut self, idle: Duration) -> Self {
        self.claim_min_idle = idle;
        self
    }
}

/// Entry point to the stream: producer side plus a factory for consumers.
#[derive(Clone)]
pub struct RedisStreams {
    client: redis::Client,
    shared: ConnectionManager,
    config: StreamConfig,
}

impl RedisStreams {
    pub async fn connect(config: StreamConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| Error::Config(format!("invalid Redis URL: {e}")))?;
        let shared = ConnectionManager::new(client.clone())
            .await
            .map_err(broker_error)?;

        info!(
            subsystem = "broker",
            component = "stream",
            op = "connect",
            stream = %config.stream,
            group = %config.group,
            "Connected to Redis stream"
        );
        Ok(Self {
            client,
            shared,
            config,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Shared connection, for collaborators such as the recent feed.
    pub fn connection(&self) -> ConnectionManager {
        self.shared.clone()
    }

    /// Create the consumer group (and the stream) if missing.
    ///
    /// New groups start at `$`, so only events appended afterwards are
    /// delivered. An existing group is left untouched.
    pub async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.shared.clone();
        let created: std::result::Result<(), RedisError> = conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "$")
            .await;

        match created {
            Ok(()) => {
                info!(
                    subsystem = "broker",
                    component = "stream",
                    op = "ensure_group",
                    group = %self.config.group,
                    "Consumer group created"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(group = %self.config.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(broker_error(e)),
        }
    }

    /// A consumer with its own connection.
    pub async fn consumer(&self, name: impl Into<String>) -> Result<RedisEventStream> {
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(broker_error)?;
        Ok(RedisEventStream {
            conn,
            stream: self.config.stream.clone(),
            group: self.config.group.clone(),
            consumer: name.into(),
            claim_min_idle: self.config.claim_min_idle,
        })
    }
}

#[async_trait]
impl EventProducer for RedisStreams {
    async fn append(&self, event: &RawEvent) -> Result<String> {
        let mut conn = self.shared.clone();
        let fields = event.to_stream_fields();
        let id: String = conn
            .xadd(&self.config.stream, "*", fields.as_slice())
            .await
            .map_err(broker_error)?;
        trace!(message_id = %id, "Event appended to stream");
        Ok(id)
    }
}

/// One consumer of the group, backed by a dedicated connection.
pub struct RedisEventStream {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    claim_min_idle: Duration,
}

impl RedisEventStream {
    /// Claim up to `count` pending entries idle past the claim threshold.
    async fn reclaim(&self, count: usize) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;

        let claimed = parse_autoclaim(&reply)?;
        if !claimed.is_empty() {
            warn!(
                subsystem = "broker",
                component = "stream",
                op = "reclaim",
                consumer = %self.consumer,
                count = claimed.len(),
                "Reclaimed idle pending entries"
            );
        }
        Ok(claimed)
    }

    async fn read_new(&self, count: usize, block: Option<Duration>) -> Result<Vec<StreamMessage>> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);
        // BLOCK 0 would block forever.
        if let Some(block) = block.filter(|b| !b.is_zero()) {
            options = options.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.stream.as_str()], &[">"], &options)
            .await
            .map_err(broker_error)?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| StreamMessage::new(entry.id, fields_to_json(entry.map)))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    fn consumer(&self) -> &str {
        &self.consumer
    }

    async fn read_batch(
        &self,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let max_count = max_count.max(1);
        let mut batch = self.reclaim(max_count).await?;
        if batch.len() < max_count {
            // Never block when reclaimed work is already in hand.
            let block = batch.is_empty().then_some(block_timeout);
            batch.extend(self.read_new(max_count - batch.len(), block).await?);
        }
        Ok(batch)
    }

    async fn ack(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let acked: i64 = conn
            .xack(&self.stream, &self.group, message_ids)
            .await
            .map_err(broker_error)?;
        if acked as usize != message_ids.len() {
            // Another consumer reclaimed and acked some of them first.
            debug!(
                consumer = %self.consumer,
                requested = message_ids.len(),
                acked,
                "Partial acknowledgment"
            );
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;
        parse_pending_summary(&reply)
    }
}

fn fields_to_json(map: HashMap<String, Value>) -> HashMap<String, JsonValue> {
    map.into_iter()
        .map(|(field, value)| {
            let value = redis::from_redis_value::<String>(&value)
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null);
            (field, value)
        })
        .collect()
}

/// `XAUTOCLAIM` reply: `[next-id, [[id, [f, v, ...]] | nil, ...], (deleted-ids)]`.
///
/// Nil entries (deleted while pending) are skipped.
fn parse_autoclaim(reply: &Value) -> Result<Vec<StreamMessage>> {
    let malformed = || Error::BrokerUnavailable("unexpected XAUTOCLAIM reply".into());
    let Value::Array(parts) = reply else {
        return Err(malformed());
    };
    let Some(Value::Array(entries)) = parts.get(1) else {
        return Err(malformed());
    };

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(pair) = entry else {
            continue;
        };
        let (Some(id), Some(fields)) = (pair.first(), pair.get(1)) else {
            continue;
        };
        let id: String = redis::from_redis_value(id).map_err(broker_error)?;
        let fields: HashMap<String, Value> = match fields {
            Value::Nil => HashMap::new(),
            other => redis::from_redis_value(other).map_err(broker_error)?,
        };
        messages.push(StreamMessage::new(id, fields_to_json(fields)));
    }
    Ok(messages)
}

/// `XPENDING key group` summary: `[count, min-id, max-id, consumers]`.
fn parse_pending_summary(reply: &Value) -> Result<u64> {
    match reply {
        Value::Array(parts) => match parts.first() {
            Some(count) => redis::from_redis_value::<u64>(count).map_err(broker_error),
            None => Ok(0),
        },
        Value::Nil => Ok(0),
        _ => Err(Error::BrokerUnavailable("unexpected XPENDING reply".into())),
    }
}
