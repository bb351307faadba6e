//! Aggregate and user-correlation repository.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use tally_core::defaults::USER_MAP_CHUNK_SIZE;
use tally_core::{AggregateStore, AggregatedEvent, Error, Result, UserEventMap};

/// PostgreSQL implementation of [`AggregateStore`].
#[derive(Clone)]
pub struct PgAggregateRepository {
    pool: Pool<Postgres>,
}

fn store_write(e: sqlx::Error) -> Error {
    Error::StoreWrite(e.to_string())
}

impl PgAggregateRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> AggregatedEvent {
        AggregatedEvent {
            id: Some(row.get("id")),
            action: row.get("action"),
            element: row.get("element"),
            count: row.get("count"),
            window_start: row.get("window_start"),
            created_at: Some(row.get("created_at")),
        }
    }

    /// Number of correlation rows pointing at an aggregate.
    pub async fn count_user_maps(&self, aggregated_event_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM user_event_maps WHERE aggregated_event_id = $1",
        )
        .bind(aggregated_event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl AggregateStore for PgAggregateRepository {
    async fn commit_aggregates(&self, aggregates: &mut [AggregatedEvent]) -> Result<()> {
        if aggregates.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(store_write)?;

        // Ids are drawn up front so each row's id is known by position,
        // independent of the order RETURNING yields rows in.
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT nextval(pg_get_serial_sequence('aggregated_events', 'id')) \
             FROM generate_series(1, $1)",
        )
        .bind(aggregates.len() as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_write)?;

        if ids.len() != aggregates.len() {
            return Err(Error::StoreWrite(format!(
                "sequence returned {} ids for {} rows",
                ids.len(),
                aggregates.len()
            )));
        }

        let actions: Vec<String> = aggregates.iter().map(|a| a.action.clone()).collect();
        let elements: Vec<String> = aggregates.iter().map(|a| a.element.clone()).collect();
        let counts: Vec<i64> = aggregates.iter().map(|a| a.count).collect();
        let windows: Vec<DateTime<Utc>> = aggregates.iter().map(|a| a.window_start).collect();

        let rows = sqlx::query(
            r#"
            INSERT INTO aggregated_events (id, action, element, count, window_start)
            SELECT * FROM UNNEST($1::int8[], $2::text[], $3::text[], $4::int8[], $5::timestamptz[])
            RETURNING id, created_at
            "#,
        )
        .bind(&ids)
        .bind(&actions)
        .bind(&elements)
        .bind(&counts)
        .bind(&windows)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_write)?;

        let created: HashMap<i64, DateTime<Utc>> = rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("created_at")))
            .collect();

        tx.commit().await.map_err(store_write)?;

        for (row, id) in aggregates.iter_mut().zip(ids) {
            row.id = Some(id);
            row.created_at = created.get(&id).copied();
        }

        debug!(
            subsystem = "database",
            component = "aggregates",
            op = "commit_aggregates",
            rows = aggregates.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Aggregates committed"
        );
        Ok(())
    }

    async fn commit_user_maps(&self, maps: &[UserEventMap]) -> Result<()> {
        if maps.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let mut tx = self.pool.begin().await.map_err(store_write)?;

        for chunk in maps.chunks(USER_MAP_CHUNK_SIZE) {
            let parent_ids: Vec<i64> = chunk.iter().map(|m| m.aggregated_event_id).collect();
            let user_ids: Vec<String> = chunk.iter().map(|m| m.user_id.clone()).collect();

            sqlx::query(
                r#"
                INSERT INTO user_event_maps (aggregated_event_id, user_id)
                SELECT * FROM UNNEST($1::int8[], $2::text[])
                "#,
            )
            .bind(&parent_ids)
            .bind(&user_ids)
            .execute(&mut *tx)
            .await
            .map_err(store_write)?;
        }

        tx.commit().await.map_err(store_write)?;

        debug!(
            subsystem = "database",
            component = "aggregates",
            op = "commit_user_maps",
            rows = maps.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "User maps committed"
        );
        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<AggregatedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, action, element, count, window_start, created_at
            FROM aggregated_events
            ORDER BY window_start DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<AggregatedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, action, element, count, window_start, created_at
            FROM aggregated_events
            WHERE id IN (SELECT aggregated_event_id FROM user_event_maps WHERE user_id = $1)
            ORDER BY window_start DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_row).collect())
    }
}
