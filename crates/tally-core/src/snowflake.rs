//! Snowflake-style event identifiers.
//!
//! Layout (63 bits, always positive as `i64`):
//!
//! ```text
//! | 41 bits: ms since EPOCH | 10 bits: node id | 12 bits: sequence |
//! ```
//!
//! Ids from one generator are strictly increasing; ids from different nodes
//! are unique as long as node ids are.
//!
//! Ids double as recent-feed scores. Redis scores are f64, exact only up to
//! 2^53, so ids within one millisecond may share a score (Redis then orders
//! them by member). Ordering across milliseconds is always preserved.

use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::traits::IdGenerator;

/// Custom epoch (2024-01-01T00:00:00Z) in milliseconds.
pub const EPOCH_MILLIS: u64 = 1_704_067_200_000;
const NODE_ID_BITS: u8 = 10;
const SEQUENCE_BITS: u8 = 12;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

pub const MAX_NODE_ID: u16 = (1 << NODE_ID_BITS) - 1;

#[derive(Debug)]
struct State {
    last_timestamp: u64,
    sequence: u16,
}

/// Thread-safe snowflake generator for one node.
#[derive(Debug)]
pub struct Snowflake {
    node_id: u16,
    state: Mutex<State>,
}

impl Snowflake {
    pub fn new(node_id: u16) -> Result<Self> {
        if node_id > MAX_NODE_ID {
            return Err(Error::Config(format!(
                "snowflake node id {node_id} exceeds {MAX_NODE_ID}"
            )));
        }
        Ok(Self {
            node_id,
            state: Mutex::new(State {
                last_timestamp: 0,
                sequence: 0,
            }),
        })
    }

    /// Assemble an id from its parts. Timestamps before [`EPOCH_MILLIS`]
    /// clamp to it; node and sequence clamp to their field widths.
    pub fn compose(timestamp_millis: u64, node_id: u16, sequence: u16) -> i64 {
        let elapsed = timestamp_millis.saturating_sub(EPOCH_MILLIS);
        let id = (elapsed << (NODE_ID_BITS + SEQUENCE_BITS))
            | ((node_id.min(MAX_NODE_ID) as u64) << SEQUENCE_BITS)
            | sequence.min(MAX_SEQUENCE) as u64;
        (id & (i64::MAX as u64)) as i64
    }

    /// Milliseconds since the Unix epoch encoded in an id.
    pub fn timestamp_millis(id: i64) -> u64 {
        ((id as u64) >> (NODE_ID_BITS + SEQUENCE_BITS)) + EPOCH_MILLIS
    }

    fn generate(&self) -> i64 {
        // A poisoned lock only means another thread panicked mid-generate;
        // the state itself is two integers and stays consistent.
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut timestamp = current_millis();
        if timestamp < state.last_timestamp {
            // Clock went backwards: keep issuing from the last timestamp.
            timestamp = state.last_timestamp;
        }

        if timestamp == state.last_timestamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                timestamp = wait_next_millis(state.last_timestamp);
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = timestamp;
        Self::compose(timestamp, self.node_id, state.sequence)
    }
}

impl IdGenerator for Snowflake {
    fn next_id(&self) -> i64 {
        self.generate()
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MILLIS)
}

fn wait_next_millis(last_timestamp: u64) -> u64 {
    loop {
        let timestamp = current_millis();
        if timestamp > last_timestamp {
            return timestamp;
        }
        sleep(Duration::from_micros(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_rejects_out_of_range_node() {
        assert!(Snowflake::new(MAX_NODE_ID + 1).is_err());
        assert!(Snowflake::new(MAX_NODE_ID).is_ok());
    }

    #[test]
    fn test_ids_strictly_increase() {
        let gen = Snowflake::new(1).unwrap();
        let mut last = gen.next_id();
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > last);
            assert!(id > 0);
            last = id;
        }
    }

    #[test]
    fn test_timestamp_round_trip_is_recent() {
        let gen = Snowflake::new(7).unwrap();
        let before = current_millis();
        let ts = Snowflake::timestamp_millis(gen.next_id());
        assert!(ts >= before && ts <= current_millis());
    }

    #[test]
    fn test_compose_matches_layout() {
        let id = Snowflake::compose(EPOCH_MILLIS + 5, 2, 3);
        assert_eq!(id, (5 << 22) | (2 << 12) | 3);
        assert_eq!(Snowflake::timestamp_millis(id), EPOCH_MILLIS + 5);

        // Out-of-range parts clamp instead of bleeding into other fields.
        assert_eq!(Snowflake::compose(0, 0, 0), 0);
        assert_eq!(
            Snowflake::compose(EPOCH_MILLIS, u16::MAX, u16::MAX),
            ((MAX_NODE_ID as i64) << 12) | MAX_SEQUENCE as i64
        );
    }

    #[test]
    fn test_f64_scores_keep_millisecond_order() {
        let now = current_millis();
        let earlier = Snowflake::compose(now, MAX_NODE_ID, MAX_SEQUENCE) as f64;
        let later = Snowflake::compose(now + 1, 0, 0) as f64;
        assert!(later > earlier);
    }

    #[test]
    fn test_unique_across_threads() {
        let gen = Arc::new(Snowflake::new(3).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || (0..2_000).map(|_| gen.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 8_000);
    }
}
