//! Core data models for tally.
//!
//! These types are shared across all tally crates and represent the
//! interaction events as they travel from the stream to the durable stores.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::snowflake::Snowflake;

// =============================================================================
// EVENTS
// =============================================================================

/// A single user-interaction event.
///
/// Immutable once appended to the stream. `id` is assigned by the producer
/// (snowflake) and is distinct from the broker's message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub user_id: String,
    pub action: String,
    pub element: String,
    /// Seconds spent on the interaction.
    #[serde(default)]
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    /// Encode as the stream field map used by producers.
    pub fn to_stream_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("user_id", self.user_id.clone()),
            ("action", self.action.clone()),
            ("element", self.element.clone()),
            ("duration", self.duration.to_string()),
            ("timestamp", self.timestamp.to_rfc3339()),
        ];
        if let Some(id) = self.id {
            fields.push(("id", id.to_string()));
        }
        fields
    }
}

/// A message as delivered by the stream broker.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Broker-assigned id, monotonic within the stream (`<ms>-<seq>`).
    pub id: String,
    /// Untyped field map.
    pub fields: HashMap<String, JsonValue>,
}

impl StreamMessage {
    pub fn new(id: impl Into<String>, fields: HashMap<String, JsonValue>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a message from string-valued fields.
    pub fn from_pairs<K, V>(id: impl Into<String>, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), JsonValue::String(v.into())))
            .collect();
        Self::new(id, fields)
    }

    /// Arrival order derived from the message id, on the event id scale.
    ///
    /// `<ms>-<seq>` becomes the id a node-0 generator would have issued at
    /// that millisecond, so events without an id rank among events with one
    /// by time. Ids that do not follow the broker format yield `None`.
    pub fn arrival_order(&self) -> Option<i64> {
        let (ms, seq) = self.id.split_once('-')?;
        let ms: u64 = ms.parse().ok()?;
        let seq: u64 = seq.parse().ok()?;
        let seq = u16::try_from(seq).unwrap_or(u16::MAX);
        Some(Snowflake::compose(ms, 0, seq))
    }
}

// =============================================================================
// AGGREGATION
// =============================================================================

/// Composite grouping key. Aggregation is across users, so `user_id` is not
/// part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationKey {
    pub action: String,
    pub element: String,
    pub window_start: DateTime<Utc>,
}

/// Transient per-batch group: one key and every user id that hit it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedGroup {
    pub key: AggregationKey,
    /// In arrival order; duplicates are kept.
    pub user_ids: Vec<String>,
}

impl AggregatedGroup {
    pub fn count(&self) -> usize {
        self.user_ids.len()
    }
}

/// Durable aggregate row.
///
/// `id` and `created_at` are `None` until the aggregate store commits the
/// row and fills them in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEvent {
    pub id: Option<i64>,
    pub action: String,
    pub element: String,
    pub count: i64,
    pub window_start: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
}

impl AggregatedEvent {
    /// Uncommitted row for a group.
    pub fn for_group(group: &AggregatedGroup) -> Self {
        Self {
            id: None,
            action: group.key.action.clone(),
            element: group.key.element.clone(),
            count: group.count() as i64,
            window_start: group.key.window_start,
            created_at: None,
        }
    }
}

/// Durable correlation row linking a user to an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEventMap {
    pub id: Option<i64>,
    pub aggregated_event_id: i64,
    pub user_id: String,
}

// =============================================================================
// ANALYTICS
// =============================================================================

/// Per-action summary computed by the analytical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub action: String,
    pub count: u64,
    pub avg_duration: f64,
}
