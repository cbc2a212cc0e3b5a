//! Read-only dashboard over the capture buffer
//!
//! Mounted under [`DASHBOARD_PREFIX`] on the proxy listener and optionally on
//! its own port. Records are served oldest first; `/events` streams the
//! backlog followed by live records as server-sent events.

use crate::capture::{BufferStats, CaptureBuffer, CaptureId, CaptureRecord};
use crate::pipeline::{LoggingPipeline, PipelineStats};
use crate::proxy::error_response::{standard_error_response, ErrorResponse};
use crate::proxy::headers::DASHBOARD_PREFIX;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

/// SSE event name for a capture record
pub const RECORD_EVENT: &str = "record";

/// Shared state behind every dashboard route
#[derive(Debug, Clone)]
pub struct DashboardState {
    buffer: Arc<CaptureBuffer>,
    pipeline: Option<Arc<LoggingPipeline>>,
    providers: Arc<Vec<String>>,
    started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(
        buffer: Arc<CaptureBuffer>,
        pipeline: Option<Arc<LoggingPipeline>>,
        providers: Vec<String>,
    ) -> Self {
        Self {
            buffer,
            pipeline,
            providers: Arc::new(providers),
            started_at: Utc::now(),
        }
    }

    pub fn stats(&self) -> DashboardStats {
        DashboardStats {
            buffer: self.buffer.stats(),
            pipeline: self.pipeline.as_ref().map(|p| p.stats()),
            sink: self.pipeline.as_ref().map(|p| p.sink_name()),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub buffer: BufferStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink: Option<&'static str>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct Index {
    name: &'static str,
    version: &'static str,
    endpoints: Vec<String>,
    providers: Arc<Vec<String>>,
    stats: DashboardStats,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_backlog")]
    backlog: bool,
}

fn default_backlog() -> bool {
    true
}

/// Routes relative to the dashboard prefix
///
/// Unknown paths under the prefix are answered here and never forwarded.
pub fn routes<S>(state: DashboardState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/api/records", get(records))
        .route("/api/records/{id}", get(record))
        .route("/api/stats", get(stats))
        .route("/events", get(events))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

/// Routes mounted under [`DASHBOARD_PREFIX`]
pub fn router(state: DashboardState) -> Router {
    Router::new().nest(DASHBOARD_PREFIX, routes(state))
}

async fn index(State(state): State<DashboardState>) -> Json<Index> {
    let endpoints = ["", "/api/records", "/api/records/{id}", "/api/stats", "/events", "/health"]
        .iter()
        .map(|path| format!("{DASHBOARD_PREFIX}{path}"))
        .collect();

    Json(Index {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        endpoints,
        providers: Arc::clone(&state.providers),
        stats: state.stats(),
    })
}

async fn records(State(state): State<DashboardState>) -> Json<Vec<Arc<CaptureRecord>>> {
    Json(state.buffer.snapshot())
}

async fn record(State(state): State<DashboardState>, Path(id): Path<String>) -> Response {
    let found = id
        .parse::<CaptureId>()
        .ok()
        .and_then(|id| state.buffer.get(&id));

    match found {
        Some(record) => Json(record).into_response(),
        None => ErrorResponse::new("NOT_FOUND", format!("No buffered record with id {id}"))
            .into_response_with_status(StatusCode::NOT_FOUND),
    }
}

async fn stats(State(state): State<DashboardState>) -> Json<DashboardStats> {
    Json(state.stats())
}

async fn health() -> &'static str {
    "OK"
}

async fn not_found() -> Response {
    standard_error_response(StatusCode::NOT_FOUND)
}

async fn events(
    State(state): State<DashboardState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (backlog, mut subscription) = if query.backlog {
        state.buffer.subscribe_with_snapshot()
    } else {
        (Vec::new(), state.buffer.subscribe())
    };
    debug!(backlog = backlog.len(), "Dashboard feed subscribed");

    let stream = async_stream::stream! {
        for record in backlog {
            if let Some(event) = record_event(&record) {
                yield Ok(event);
            }
        }
        while let Some(record) = subscription.recv().await {
            if let Some(event) = record_event(&record) {
                yield Ok(event);
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn record_event(record: &CaptureRecord) -> Option<Event> {
    match Event::default()
        .event(RECORD_EVENT)
        .id(record.id.to_string())
        .json_data(record)
    {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(capture_id = %record.id, error = %e, "Cannot serialize record for dashboard");
            None
        }
    }
}
