//! Read endpoints over aggregates and the analytical store.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use tally_core::{bounded, defaults, ActionSummary, AggregatedEvent, Error};

use super::{ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ListAggregatesQuery {
    pub limit: Option<i64>,
}

impl ListAggregatesQuery {
    /// Requested page size clamped to `1..=PAGE_LIMIT_MAX`.
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX)
    }
}

#[derive(Debug, Serialize)]
pub struct AggregateList {
    pub aggregates: Vec<AggregatedEvent>,
    pub limit: i64,
}

/// `GET /aggregates?limit=`: most recent windows first.
pub async fn list_aggregates(
    State(state): State<AppState>,
    Query(query): Query<ListAggregatesQuery>,
) -> Result<Json<AggregateList>, ApiError> {
    let limit = query.effective_limit();
    let aggregates = bounded(
        "list_recent",
        state.request_timeout,
        Error::Timeout,
        state.aggregates.list_recent(limit),
    )
    .await?;
    Ok(Json(AggregateList { aggregates, limit }))
}

#[derive(Debug, Serialize)]
pub struct UserAggregates {
    pub user_id: String,
    pub aggregates: Vec<AggregatedEvent>,
}

/// `GET /users/{user_id}/aggregates`.
pub async fn user_aggregates(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserAggregates>, ApiError> {
    let aggregates = bounded(
        "list_for_user",
        state.request_timeout,
        Error::Timeout,
        state.aggregates.list_for_user(&user_id),
    )
    .await?;
    Ok(Json(UserAggregates {
        user_id,
        aggregates,
    }))
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AnalyticsSummary {
    pub action_counts: BTreeMap<String, u64>,
    /// Mean duration across all events, weighted by per-action counts.
    pub avg_duration: f64,
    pub total_events: u64,
    pub actions: Vec<ActionSummary>,
}

impl AnalyticsSummary {
    pub fn from_actions(actions: Vec<ActionSummary>) -> Self {
        let total_events: u64 = actions.iter().map(|a| a.count).sum();
        let weighted: f64 = actions
            .iter()
            .map(|a| a.avg_duration * a.count as f64)
            .sum();
        let avg_duration = if total_events > 0 {
            weighted / total_events as f64
        } else {
            0.0
        };
        Self {
            action_counts: actions
                .iter()
                .map(|a| (a.action.clone(), a.count))
                .collect(),
            avg_duration,
            total_events,
            actions,
        }
    }
}

/// `GET /analytics`: per-action counts from the analytical store.
pub async fn analytics_summary(
    State(state): State<AppState>,
) -> Result<Json<AnalyticsSummary>, ApiError> {
    let actions = bounded(
        "summarize",
        state.request_timeout,
        Error::AnalyticalStore,
        state.analytics.summarize(),
    )
    .await?;
    Ok(Json(AnalyticsSummary::from_actions(actions)))
}
