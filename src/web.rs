use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;

use crate::api::{logs, objects, obs, traces};
use crate::app_state::SharedState;
use crate::middleware::{cors, handle_panic, trace_requests};

/// Full HTTP surface: `/health`, `/api/version` and everything under `/api/v1`.
pub fn build_router(state: SharedState) -> Router {
    let upload_limit = match state.config.upload_limit() {
        Some(limit) => DefaultBodyLimit::max(usize::try_from(limit).unwrap_or(usize::MAX)),
        None => DefaultBodyLimit::disable(),
    };

    let bucket = Router::new()
        .route("/objects", get(objects::list).delete(objects::delete))
        .route("/upload", post(objects::upload).layer(upload_limit))
        .route("/download", get(objects::download))
        .route("/copy", post(objects::copy))
        .route("/move", post(objects::relocate));

    let api = Router::new()
        .route("/logs/recent", get(logs::recent))
        .route("/logs/download", get(logs::download))
        .route(
            "/logs/level",
            get(logs::get_level).put(logs::set_level).post(logs::set_level),
        )
        .route("/logs/stream", get(logs::stream_logs))
        .route("/trace/recent", get(traces::recent))
        .route("/trace/{id}", get(traces::get_trace))
        .route("/obs/summary", get(obs::summary))
        .route("/obs/errors", get(obs::errors))
        .route("/obs/metrics", get(obs::metrics))
        .nest("/endpoints/{endpoint}/buckets/{bucket}", bucket);

    Router::new()
        .route("/health", get(health))
        .route("/api/version", get(version))
        .nest("/api/v1", api)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(from_fn_with_state(state.clone(), trace_requests))
        .layer(cors())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
