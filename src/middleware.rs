//! Request instrumentation: one trace per request, finished when the response
//! body completes or is dropped.

use axum::{
    body::{Body, BodyDataStream, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::Stream;
use std::any::Any;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_http::cors::{Any as AnyOrigin, CorsLayer};

use crate::api_errors::{AppError, ErrorMessage};
use crate::app_state::SharedState;
use crate::fields;
use crate::trace_store::{new_trace_id, TraceHandle, TraceStart, ERROR_EVENT};

pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First address of `X-Forwarded-For`, else the socket peer.
fn remote_ip(req: &Request) -> Option<String> {
    header_str(req.headers(), "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
}

pub async fn trace_requests(State(state): State<SharedState>, mut req: Request, next: Next) -> Response {
    let headers = req.headers();
    let identity = state.identity.resolve(headers);
    let req_bytes = header_str(headers, header::CONTENT_LENGTH)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let start = TraceStart {
        id: new_trace_id(),
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        started: Some(Utc::now()),
        user_email: identity.as_ref().map(|i| i.email.clone()),
        user_role: identity.as_ref().map(|i| i.role.to_string()),
        user_agent: header_str(headers, header::USER_AGENT),
        remote_ip: remote_ip(&req),
        req_bytes,
    };
    let request_fields = fields!("method" => start.method, "path" => start.path);
    let trace_id = start.id.clone();

    let handle = state.traces.begin(start);
    handle.add_event("request.start", request_fields);
    req.extensions_mut().insert(handle.clone());

    let mut response = next.run(req).await;
    let status = response.status().as_u16();
    if let Some(ErrorMessage(message)) = response.extensions().get::<ErrorMessage>() {
        handle.add_event(ERROR_EVENT, fields!("code" => status, "message" => message));
    }
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value.clone());
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let (parts, body) = response.into_parts();
    let traced = TracedBody {
        inner: body.into_data_stream(),
        bytes: 0,
        finisher: Some(Finisher {
            state,
            handle,
            status,
        }),
    };
    Response::from_parts(parts, Body::from_stream(traced))
}

struct Finisher {
    state: SharedState,
    handle: TraceHandle,
    status: u16,
}

impl Finisher {
    fn finish(self, resp_bytes: u64) {
        self.handle.add_event(
            "request.end",
            fields!("status" => self.status, "respBytes" => resp_bytes),
        );
        let trace = self
            .state
            .traces
            .finish(&self.handle, self.status, Utc::now(), resp_bytes);
        self.state
            .counters
            .record(trace.status, trace.req_bytes, resp_bytes, trace.duration_ns);

        tracing::info!(
            method = %trace.method,
            path = %trace.path,
            status = trace.status,
            durationMs = trace.duration_ms(),
            user = trace.user_email.as_deref().unwrap_or(""),
            role = trace.user_role.as_deref().unwrap_or(""),
            traceId = %trace.id,
            bytesIn = trace.req_bytes,
            bytesOut = resp_bytes,
            "http_request"
        );
    }
}

/// Response body wrapper that counts bytes and finishes the trace exactly once.
struct TracedBody {
    inner: BodyDataStream,
    bytes: u64,
    finisher: Option<Finisher>,
}

impl TracedBody {
    fn finish(&mut self) {
        if let Some(finisher) = self.finisher.take() {
            finisher.finish(self.bytes);
        }
    }
}

impl Stream for TracedBody {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TracedBody {
    fn drop(&mut self) {
        // Client went away before the body completed.
        self.finish();
    }
}

/// Answer a handler panic with a plain 500 and log it.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");
    AppError::internal("internal error").into_response()
}

pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin)
        .expose_headers([TRACE_ID_HEADER, REQUEST_ID_HEADER])
}
