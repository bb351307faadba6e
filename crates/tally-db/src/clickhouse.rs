//! ClickHouse analytical store over the HTTP interface.
//!
//! Every raw event of a batch is inserted as one `JSONEachRow` request.
//! The table is created on startup if missing and expires rows after a month.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `CLICKHOUSE_URL`: HTTP endpoint (default: http://localhost:8123)
//! - `CLICKHOUSE_DATABASE`: database name (default: default)
//! - `CLICKHOUSE_USER`: user (default: default)
//! - `CLICKHOUSE_PASSWORD`: password (default: empty)

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use tally_core::{ActionSummary, AnalyticsStore, Error, RawEvent, Result};

/// Default ClickHouse HTTP endpoint.
pub const DEFAULT_CLICKHOUSE_URL: &str = "http://localhost:8123";

/// Per-request timeout of the HTTP client.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn analytics_error(e: impl std::fmt::Display) -> Error {
    Error::AnalyticalStore(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub request_timeout: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CLICKHOUSE_URL.to_string(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl ClickHouseConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            url: std::env::var("CLICKHOUSE_URL").unwrap_or(base.url),
            database: std::env::var("CLICKHOUSE_DATABASE").unwrap_or(base.database),
            user: std::env::var("CLICKHOUSE_USER").unwrap_or(base.user),
            password: std::env::var("CLICKHOUSE_PASSWORD").unwrap_or(base.password),
            request_timeout: base.request_timeout,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }
}

/// Row layout of the `events` table.
#[derive(Debug, Serialize)]
struct EventRow<'a> {
    user_id: &'a str,
    action: &'a str,
    element: &'a str,
    duration: f64,
    timestamp: String,
}

impl<'a> From<&'a RawEvent> for EventRow<'a> {
    fn from(event: &'a RawEvent) -> Self {
        Self {
            user_id: &event.user_id,
            action: &event.action,
            element: &event.element,
            duration: event.duration,
            timestamp: event.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// HTTP client for the analytical store.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseStore {
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("ClickHouse client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    fn table(&self) -> String {
        format!("{}.events", self.config.database)
    }

    /// Run one statement; `body` carries data for inserts.
    async fn execute(&self, query: &str, body: String, extra: &[(&str, &str)]) -> Result<String> {
        let mut params: Vec<(&str, &str)> = vec![("query", query)];
        params.extend_from_slice(extra);

        let response = self
            .client
            .post(&self.config.url)
            .query(&params)
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(body)
            .send()
            .await
            .map_err(analytics_error)?;

        let status = response.status();
        let text = response.text().await.map_err(analytics_error)?;
        if !status.is_success() {
            return Err(Error::AnalyticalStore(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text.trim()
            )));
        }
        Ok(text)
    }

    /// Create the events table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                user_id String, \
                action String, \
                element String, \
                duration Float64, \
                timestamp DateTime\
            ) ENGINE = MergeTree() \
            ORDER BY (action, timestamp) \
            PARTITION BY toYYYYMM(timestamp) \
            TTL timestamp + INTERVAL 1 MONTH",
            self.table()
        );
        self.execute(&ddl, String::new(), &[]).await?;
        info!(
            subsystem = "analytics",
            component = "clickhouse",
            op = "ensure_schema",
            table = %self.table(),
            "ClickHouse schema ensured"
        );
        Ok(())
    }
}

#[async_trait]
impl AnalyticsStore for ClickHouseStore {
    async fn commit_raw_events(&self, events: &[RawEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let start = Instant::now();

        let mut body = String::new();
        for event in events {
            body.push_str(&serde_json::to_string(&EventRow::from(event))?);
            body.push('\n');
        }

        let query = format!("INSERT INTO {} FORMAT JSONEachRow", self.table());
        self.execute(&query, body, &[]).await?;

        debug!(
            subsystem = "analytics",
            component = "clickhouse",
            op = "insert",
            rows = events.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Raw events inserted"
        );
        Ok(())
    }

    async fn summarize(&self) -> Result<Vec<ActionSummary>> {
        let query = format!(
            "SELECT action, count() AS count, avg(duration) AS avg_duration \
             FROM {} GROUP BY action ORDER BY count DESC FORMAT JSONEachRow",
            self.table()
        );
        let text = self
            .execute(
                &query,
                String::new(),
                &[("output_format_json_quote_64bit_integers", "0")],
            )
            .await?;

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<ActionSummary>(line).map_err(analytics_error))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_row_timestamp_format() {
        let event = RawEvent {
            id: Some(1),
            user_id: "u".into(),
            action: "click".into(),
            element: "btn".into(),
            duration: 0.5,
            timestamp: Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap(),
        };
        let json = serde_json::to_value(EventRow::from(&event)).unwrap();
        assert_eq!(json["timestamp"], "2026-02-03 04:05:06");
        assert_eq!(json["duration"], 0.5);
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config = ClickHouseConfig::default();
        assert_eq!(config.url, DEFAULT_CLICKHOUSE_URL);
        assert_eq!(config.database, "default");
        assert!(config.password.is_empty());
    }
}
