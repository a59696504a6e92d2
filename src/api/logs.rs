use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::LimitQuery;
use crate::api_errors::AppError;
use crate::app_state::SharedState;
use crate::event_log::LogEntry;

const RECENT_DEFAULT: usize = 200;
const DOWNLOAD_DEFAULT: usize = 1000;

/// Most recent persisted log entries, newest first.
pub async fn recent(
    State(state): State<SharedState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<LogEntry>>, AppError> {
    Ok(Json(state.telemetry.recent_logs(q.or(RECENT_DEFAULT))?))
}

/// In-memory history as NDJSON, newest first.
pub async fn download(State(state): State<SharedState>, Query(q): Query<LimitQuery>) -> Response {
    let mut body = Vec::new();
    for entry in state.events.recent(q.or(DOWNLOAD_DEFAULT)) {
        if serde_json::to_writer(&mut body, &entry).is_ok() {
            body.push(b'\n');
        }
    }
    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-store"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"hermes-logs.ndjson\"",
            ),
        ],
        body,
    )
        .into_response()
}

pub async fn get_level(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "level": state.events.level() }))
}

#[derive(Debug, Deserialize)]
pub struct LevelRequest {
    pub level: Option<String>,
}

/// Set the threshold. Unknown tokens are accepted and become `info`.
pub async fn set_level(
    State(state): State<SharedState>,
    body: Result<Json<LevelRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(req) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    let token = req
        .level
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("level required"))?;
    let level = state.events.set_level(&token);
    tracing::info!(level = %level, "log level changed");
    Ok(Json(json!({ "ok": true, "level": level })))
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub level: Option<String>,
}

/// Server-sent events: recent history oldest-first, then live entries.
pub async fn stream_logs(
    State(state): State<SharedState>,
    Query(q): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let wanted = q
        .level
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty());

    // Subscribe first so nothing written during the backlog snapshot is lost.
    let live = state.events.subscribe();
    let mut backlog = state.events.recent(state.config.log.stream_backlog);
    backlog.reverse();

    let entries = stream::iter(backlog.into_iter().map(Arc::new)).chain(live);
    let events = entries
        .filter(move |entry| {
            let keep = wanted
                .as_deref()
                .map_or(true, |level| entry.level.as_str() == level);
            futures::future::ready(keep)
        })
        .map(|entry| Event::default().json_data(&*entry));

    Sse::new(events).keep_alive(KeepAlive::default())
}
