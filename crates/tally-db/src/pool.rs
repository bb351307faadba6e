//! PostgreSQL connection pool.
//!
//! Every aggregation worker holds at most one connection at a time (its
//! aggregate or user-map transaction), and the read endpoints share the rest.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use tally_core::{Error, Result};

/// Default maximum number of connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Connections kept free for the HTTP read endpoints.
pub const API_HEADROOM_CONNECTIONS: u32 = 2;

const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MAX_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS)),
        }
    }
}

impl PoolConfig {
    /// Read `DATABASE_MAX_CONNECTIONS` (default 20).
    pub fn from_env() -> Self {
        let base = Self::default();
        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(base.max_connections);
        base.with_max_connections(max_connections)
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }

    pub fn with_min_connections(mut self, n: u32) -> Self {
        self.min_connections = n.min(self.max_connections);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Connections needed so `workers` concurrent batches never wait on
    /// each other or starve the read endpoints.
    pub fn required_for_workers(workers: usize) -> u32 {
        u32::try_from(workers)
            .unwrap_or(u32::MAX)
            .saturating_add(API_HEADROOM_CONNECTIONS)
    }

    /// Raise `max_connections` to what `workers` need, warning when the
    /// configured value was too small.
    pub fn sized_for_workers(self, workers: usize) -> Self {
        let required = Self::required_for_workers(workers);
        if self.max_connections >= required {
            return self;
        }
        warn!(
            subsystem = "database",
            component = "pool",
            configured = self.max_connections,
            required,
            workers,
            "DATABASE_MAX_CONNECTIONS below worker count, raising pool size"
        );
        self.with_max_connections(required)
    }
}

/// Connect with the default configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout);
    if let Some(max_lifetime) = config.max_lifetime {
        options = options.max_lifetime(max_lifetime);
    }

    let pool = options
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "PostgreSQL pool established"
    );
    Ok(pool)
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
}

impl PoolStats {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            size: pool.size(),
            idle: u32::try_from(pool.num_idle()).unwrap_or(u32::MAX),
        }
    }

    pub fn active(&self) -> u32 {
        self.size.saturating_sub(self.idle)
    }

    /// Every open connection is checked out.
    pub fn saturated(&self) -> bool {
        self.size > 0 && self.idle == 0
    }
}

/// Sample the pool and log its occupancy.
pub fn log_pool_metrics(pool: &PgPool) -> PoolStats {
    let stats = PoolStats::of(pool);
    debug!(
        subsystem = "database",
        component = "pool",
        op = "sample",
        pool_size = stats.size,
        pool_idle = stats.idle,
        "Pool sample"
    );
    if stats.saturated() {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = stats.size,
            "Connection pool has no idle connections"
        );
    }
    stats
}
