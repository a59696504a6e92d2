//! Object handlers under `/endpoints/{endpoint}/buckets/{bucket}`.

use axum::{
    body::Body,
    extract::{
        multipart::{Field, MultipartError},
        rejection::JsonRejection,
        Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::io;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use super::endpoint;
use crate::api_errors::AppError;
use crate::app_state::SharedState;
use crate::fields;
use crate::object_store::{ObjectBody, ObjectInfo, StorageError};
use crate::trace_store::TraceHandle;
use crate::transfer::{Locator, TransferMode, TransferRequest};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
pub struct BucketPath {
    pub endpoint: String,
    pub bucket: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    pub key: Option<String>,
}

impl KeyQuery {
    fn required(self) -> Result<String, AppError> {
        self.key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::bad_request("key required"))
    }
}

pub async fn list(
    State(state): State<SharedState>,
    Extension(trace): Extension<TraceHandle>,
    Path(p): Path<BucketPath>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<ObjectInfo>>, AppError> {
    let store = endpoint(&state, &p.endpoint)?;
    let objects = store.list(&p.bucket, &q.prefix, q.recursive).await?;
    trace.add_event(
        "objects.list",
        fields!(
            "endpoint" => p.endpoint,
            "bucket" => p.bucket,
            "prefix" => q.prefix,
            "recursive" => q.recursive,
            "count" => objects.len(),
        ),
    );
    Ok(Json(objects))
}

pub async fn delete(
    State(state): State<SharedState>,
    Extension(trace): Extension<TraceHandle>,
    Path(p): Path<BucketPath>,
    Query(q): Query<KeyQuery>,
) -> Result<Json<Value>, AppError> {
    let key = q.required()?;
    let store = endpoint(&state, &p.endpoint)?;
    store.delete(&p.bucket, &key).await?;
    trace.add_event("object.delete", fields!("bucket" => p.bucket, "key" => key));
    Ok(Json(json!({ "ok": true })))
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::payload_too_large()
    } else {
        AppError::bad_request(err.body_text())
    }
}

/// Body-limit failures surface from inside the store as wrapped I/O errors.
fn upload_error(err: StorageError) -> AppError {
    if let StorageError::Io(io_err) = &err {
        let multipart = io_err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<MultipartError>());
        if let Some(inner) = multipart {
            return if inner.status() == StatusCode::PAYLOAD_TOO_LARGE {
                AppError::payload_too_large()
            } else {
                AppError::bad_request("upload interrupted")
            };
        }
    }
    err.into()
}

fn field_reader(field: Field<'_>) -> ObjectBody<'_> {
    Box::pin(StreamReader::new(field.map_err(io::Error::other)))
}

/// Multipart upload: a `key` field followed by a `file` field, streamed
/// straight into the store. The file name is used when no key was sent.
pub async fn upload(
    State(state): State<SharedState>,
    Extension(trace): Extension<TraceHandle>,
    Path(p): Path<BucketPath>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<ObjectInfo>, AppError> {
    if let Some(limit) = state.config.upload_limit() {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(AppError::payload_too_large());
        }
    }
    let store = endpoint(&state, &p.endpoint)?;

    let mut key: Option<String> = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("key") => {
                let text = field.text().await.map_err(multipart_error)?;
                key = Some(text.trim().to_string()).filter(|k| !k.is_empty());
            }
            Some("file") => {
                let key = key
                    .clone()
                    .or_else(|| field.file_name().map(str::to_string))
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| AppError::bad_request("key required"))?;
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();

                trace.add_event(
                    "object.upload",
                    fields!("bucket" => p.bucket, "key" => key, "contentType" => content_type),
                );
                let info = store
                    .put(&p.bucket, &key, field_reader(field), None, &content_type)
                    .await
                    .map_err(upload_error)?;
                trace.add_event(
                    "object.upload.done",
                    fields!("bucket" => p.bucket, "key" => key, "size" => info.size),
                );
                return Ok(Json(info));
            }
            _ => {}
        }
    }
    Err(AppError::bad_request("file field required"))
}

pub async fn download(
    State(state): State<SharedState>,
    Extension(trace): Extension<TraceHandle>,
    Path(p): Path<BucketPath>,
    Query(q): Query<KeyQuery>,
) -> Result<Response, AppError> {
    let key = q.required()?;
    let store = endpoint(&state, &p.endpoint)?;
    let reader = store.get(&p.bucket, &key).await?;
    trace.add_event(
        "object.download",
        fields!("bucket" => p.bucket, "key" => key, "size" => reader.size),
    );

    let filename = key.rsplit('/').next().unwrap_or(&key).replace('"', "");
    let mut response = Body::from_stream(ReaderStream::new(reader.body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(size) = reader.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    #[serde(default)]
    pub src_key: String,
    #[serde(default)]
    pub dst_bucket: String,
    pub dst_key: Option<String>,
    pub dst_endpoint: Option<String>,
}

async fn run_transfer(
    state: SharedState,
    trace: TraceHandle,
    p: BucketPath,
    body: Result<Json<TransferBody>, JsonRejection>,
    mode: TransferMode,
) -> Result<Response, AppError> {
    let Json(req) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    if req.src_key.is_empty() {
        return Err(AppError::bad_request("srcKey required"));
    }
    if req.dst_bucket.is_empty() {
        return Err(AppError::bad_request("dstBucket required"));
    }

    let source_store = endpoint(&state, &p.endpoint)?;
    let dest_endpoint = req
        .dst_endpoint
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| p.endpoint.clone());
    let dest_store = endpoint(&state, &dest_endpoint)?;
    let dst_key = req
        .dst_key
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| req.src_key.clone());

    let request = TransferRequest {
        mode,
        source: Locator::new(source_store, p.bucket, req.src_key),
        destination: Locator::new(dest_store, req.dst_bucket, dst_key),
    };
    let frames = state
        .transfers
        .transfer(request, Some(trace), &CancellationToken::new())
        .await?;

    let body = Body::from_stream(frames.map(|frame| Ok::<_, Infallible>(frame.to_line())));
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response())
}

pub async fn copy(
    State(state): State<SharedState>,
    Extension(trace): Extension<TraceHandle>,
    Path(p): Path<BucketPath>,
    body: Result<Json<TransferBody>, JsonRejection>,
) -> Result<Response, AppError> {
    run_transfer(state, trace, p, body, TransferMode::Copy).await
}

/// Copy then delete the source once the destination write succeeded.
pub async fn relocate(
    State(state): State<SharedState>,
    Extension(trace): Extension<TraceHandle>,
    Path(p): Path<BucketPath>,
    body: Result<Json<TransferBody>, JsonRejection>,
) -> Result<Response, AppError> {
    run_transfer(state, trace, p, body, TransferMode::Move).await
}
