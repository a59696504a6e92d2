use axum::{
    extract::{Path, Query, State},
    Json,
};

use super::LimitQuery;
use crate::api_errors::AppError;
use crate::app_state::SharedState;
use crate::trace_store::Trace;

pub async fn recent(
    State(state): State<SharedState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<Trace>>, AppError> {
    let limit = q.or(state.config.trace.recent_limit);
    Ok(Json(state.traces.recent(limit)?))
}

pub async fn get_trace(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Trace>, AppError> {
    state
        .traces
        .get(&id)?
        .map(Json)
        .ok_or_else(|| AppError::not_found("trace not found"))
}
