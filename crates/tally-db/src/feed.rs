//! Recent-activity feed on a Redis sorted set.
//!
//! Members are serialized events, scores are event ids (or arrival order).
//! Each push adds and trims in one `MULTI`/`EXEC` so the set never holds more
//! than the configured size once the push returns.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use tracing::warn;

use tally_core::defaults;
use tally_core::{Error, RecentFeed, Result};

fn cache_error(e: RedisError) -> Error {
    Error::Cache(e.to_string())
}

fn is_wrong_type(e: &RedisError) -> bool {
    e.code() == Some("WRONGTYPE") || e.to_string().contains("WRONGTYPE")
}

/// `ZREMRANGEBYRANK` stop index that keeps the `size` highest scores.
fn trim_stop(size: usize) -> isize {
    -(size as isize) - 1
}

/// Bounded top-N feed.
#[derive(Clone)]
pub struct RedisRecentFeed {
    conn: ConnectionManager,
    key: String,
    size: usize,
}

impl RedisRecentFeed {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_key(conn, defaults::RECENT_FEED_KEY, defaults::RECENT_FEED_SIZE)
    }

    pub fn with_key(conn: ConnectionManager, key: impl Into<String>, size: usize) -> Self {
        Self {
            conn,
            key: key.into(),
            size: size.max(1),
        }
    }

    async fn push_once(&self, serialized_event: &str, score: i64) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(&self.key, serialized_event, score)
            .ignore()
            .zremrangebyrank(&self.key, 0, trim_stop(self.size))
            .ignore();
        let result: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
        result
    }
}

#[async_trait]
impl RecentFeed for RedisRecentFeed {
    async fn push(&self, serialized_event: &str, score: i64) -> Result<()> {
        match self.push_once(serialized_event, score).await {
            Ok(()) => Ok(()),
            Err(e) if is_wrong_type(&e) => {
                warn!(
                    subsystem = "cache",
                    component = "recent_feed",
                    key = %self.key,
                    "Feed key holds the wrong type, replacing it"
                );
                let mut conn = self.conn.clone();
                conn.del::<_, ()>(&self.key).await.map_err(cache_error)?;
                self.push_once(serialized_event, score)
                    .await
                    .map_err(cache_error)
            }
            Err(e) => Err(cache_error(e)),
        }
    }

    async fn recent(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .zrevrange(&self.key, 0, self.size as isize - 1)
            .await
            .map_err(cache_error)?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_keeps_top_n() {
        // Ranks are ascending by score; removing 0..=-(N+1) leaves the last N.
        assert_eq!(trim_stop(10), -11);
        assert_eq!(trim_stop(1), -2);
    }
}
