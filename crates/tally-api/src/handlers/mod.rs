//! HTTP adapter: routes, shared state, and error mapping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use tally_core::{AggregateStore, AnalyticsStore, EventProducer, IdGenerator, RecentFeed};

use crate::metrics::PrometheusMetrics;

pub mod aggregates;
pub mod events;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Everything a handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<dyn EventProducer>,
    pub aggregates: Arc<dyn AggregateStore>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub feed: Arc<dyn RecentFeed>,
    pub ids: Arc<dyn IdGenerator>,
    pub metrics: Arc<PrometheusMetrics>,
    /// Upper bound on any store call made from a request.
    pub request_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/event", post(events::ingest_event))
        .route("/events/recent", get(events::recent_events))
        .route("/aggregates", get(aggregates::list_aggregates))
        .route("/users/:user_id/aggregates", get(aggregates::user_aggregates))
        .route("/analytics", get(aggregates::analytics_summary))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            track_http_metrics,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

// =============================================================================
// HEALTH AND METRICS
// =============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Encoding metrics failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

async fn track_http_metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().as_str().to_owned();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    let start = Instant::now();
    let response = next.run(req).await;
    state.metrics.observe_http_request(
        &method,
        &endpoint,
        response.status().as_u16(),
        start.elapsed(),
    );
    response
}

// =============================================================================
// ERROR HANDLING
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Store(tally_core::Error),
}

impl From<tally_core::Error> for ApiError {
    fn from(err: tally_core::Error) -> Self {
        match err {
            tally_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Store(err) => {
                error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
