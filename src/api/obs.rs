use axum::{extract::State, Json};
use chrono::Utc;

use crate::aggregate::{error_digest, summarize, AggregateView, ErrorTrace};
use crate::api_errors::AppError;
use crate::app_state::SharedState;
use crate::metrics::MetricsSnapshot;

/// Dashboard view over the most recent durable traces.
pub async fn summary(State(state): State<SharedState>) -> Result<Json<AggregateView>, AppError> {
    let traces = state
        .traces
        .recent_with_events(state.config.trace.summary_window)?;
    Ok(Json(summarize(&traces, Utc::now())))
}

pub async fn errors(State(state): State<SharedState>) -> Result<Json<Vec<ErrorTrace>>, AppError> {
    let traces = state.traces.recent_errors(state.config.trace.errors_limit)?;
    Ok(Json(error_digest(&traces)))
}

pub async fn metrics(State(state): State<SharedState>) -> Json<MetricsSnapshot> {
    Json(state.counters.snapshot().with_log_drops(&state.events))
}
