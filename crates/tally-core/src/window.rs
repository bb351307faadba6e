//! Fixed-size window bucketing and per-batch grouping.
//!
//! The grouping map is consumed once into an ordered [`AggregationPlan`].
//! Both persistence steps read from that plan and are correlated by index,
//! so the user list of group `i` always lands under the id assigned to
//! aggregate row `i`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{AggregatedEvent, AggregatedGroup, AggregationKey, RawEvent, UserEventMap};

/// A strictly positive window length with millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    millis: i64,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            millis: defaults::WINDOW_SECS as i64 * 1000,
        }
    }
}

impl WindowSize {
    pub fn new(size: Duration) -> Result<Self> {
        let millis = i64::try_from(size.as_millis())
            .map_err(|_| Error::InvalidInput(format!("window size {size:?} is too large")))?;
        if millis <= 0 {
            return Err(Error::InvalidInput(format!(
                "window size must be at least 1ms, got {size:?}"
            )));
        }
        Ok(Self { millis })
    }

    pub fn from_secs(secs: u64) -> Result<Self> {
        Self::new(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.millis as u64)
    }

    /// `floor(timestamp / size) * size`.
    ///
    /// Floor (not truncation toward zero) keeps pre-epoch timestamps in the
    /// window that contains them.
    pub fn window_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let ts = timestamp.timestamp_millis();
        let start = ts.div_euclid(self.millis) * self.millis;
        Utc.timestamp_millis_opt(start).single().unwrap_or(timestamp)
    }
}

/// Groups of one batch, in first-seen key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationPlan {
    groups: Vec<AggregatedGroup>,
}

impl AggregationPlan {
    pub fn groups(&self) -> &[AggregatedGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total events across all groups.
    pub fn event_count(&self) -> usize {
        self.groups.iter().map(AggregatedGroup::count).sum()
    }

    /// One uncommitted aggregate row per group, same order as [`groups`](Self::groups).
    pub fn aggregated_events(&self) -> Vec<AggregatedEvent> {
        self.groups.iter().map(AggregatedEvent::for_group).collect()
    }

    /// Correlation rows for rows returned by the aggregate store.
    ///
    /// `committed` must be the slice built by [`aggregated_events`](Self::aggregated_events)
    /// after the store filled in the ids.
    pub fn user_maps(&self, committed: &[AggregatedEvent]) -> Result<Vec<UserEventMap>> {
        if committed.len() != self.groups.len() {
            return Err(Error::Internal(format!(
                "aggregate rows ({}) do not line up with groups ({})",
                committed.len(),
                self.groups.len()
            )));
        }

        let mut maps = Vec::with_capacity(self.event_count());
        for (index, (group, row)) in self.groups.iter().zip(committed).enumerate() {
            let aggregated_event_id = row.id.ok_or_else(|| {
                Error::Internal(format!("aggregate row {index} has no durable id"))
            })?;
            if row.action != group.key.action
                || row.element != group.key.element
                || row.window_start != group.key.window_start
                || row.count != group.count() as i64
            {
                return Err(Error::Internal(format!(
                    "aggregate row {index} does not match its group"
                )));
            }
            maps.extend(group.user_ids.iter().map(|user_id| UserEventMap {
                id: None,
                aggregated_event_id,
                user_id: user_id.clone(),
            }));
        }
        Ok(maps)
    }
}

/// Group events by `(action, element, window_start)` in a single pass.
pub fn aggregate(events: &[RawEvent], window: WindowSize) -> AggregationPlan {
    let mut index: HashMap<AggregationKey, usize> = HashMap::new();
    let mut groups: Vec<AggregatedGroup> = Vec::new();

    for event in events {
        let key = AggregationKey {
            action: event.action.clone(),
            element: event.element.clone(),
            window_start: window.window_start(event.timestamp),
        };
        match index.get(&key) {
            Some(&i) => groups[i].user_ids.push(event.user_id.clone()),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(AggregatedGroup {
                    key,
                    user_ids: vec![event.user_id.clone()],
                });
            }
        }
    }

    AggregationPlan { groups }
}
