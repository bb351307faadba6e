//! Event ingestion and the recent-activity feed.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use tally_core::{bounded, Error, MetricsSink, RawEvent};

use super::{ApiError, AppState};

/// Body of `POST /event`.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub element: String,
    #[serde(default)]
    pub duration: f64,
    /// Defaults to the time of ingestion.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl IngestRequest {
    /// Check the request and stamp it with `id`.
    pub fn into_event(self, id: i64, now: DateTime<Utc>) -> Result<RawEvent, ApiError> {
        for (name, value) in [
            ("user_id", &self.user_id),
            ("action", &self.action),
            ("element", &self.element),
        ] {
            if value.trim().is_empty() {
                return Err(ApiError::BadRequest(format!("{name} is required")));
            }
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(ApiError::BadRequest(
                "duration must be a non-negative number".to_string(),
            ));
        }

        Ok(RawEvent {
            id: Some(id),
            user_id: self.user_id,
            action: self.action,
            element: self.element,
            duration: self.duration,
            timestamp: self.timestamp.unwrap_or(now),
        })
    }
}

/// `POST /event`: validate, assign an id, append to the stream.
pub async fn ingest_event(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    state.metrics.events_received();

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            state.metrics.event_failed("parse");
            return Err(ApiError::BadRequest(rejection.body_text()));
        }
    };
    let event = request
        .into_event(state.ids.next_id(), Utc::now())
        .inspect_err(|_| state.metrics.event_failed("parse"))?;

    match bounded(
        "append",
        state.request_timeout,
        Error::BrokerUnavailable,
        state.producer.append(&event),
    )
    .await
    {
        Ok(message_id) => {
            debug!(%message_id, event_id = ?event.id, "Event accepted");
        }
        Err(e) => {
            warn!(error = %e, "Appending event to stream failed");
            state.metrics.event_failed("ingest");
            return Err(ApiError::Store(e));
        }
    }

    state.metrics.events_ingested();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "event": event })),
    ))
}

/// `GET /events/recent`: the feed, newest first. Entries that no longer
/// decode are skipped.
pub async fn recent_events(State(state): State<AppState>) -> Result<Json<Vec<RawEvent>>, ApiError> {
    let entries = bounded(
        "recent",
        state.request_timeout,
        Error::Cache,
        state.feed.recent(),
    )
    .await?;
    let events = entries
        .iter()
        .filter_map(|entry| match serde_json::from_str::<RawEvent>(entry) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "Skipping undecodable feed entry");
                None
            }
        })
        .collect();
    Ok(Json(events))
}
