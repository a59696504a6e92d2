//! Per-request traces: a bounded in-memory ring of live traces backed by a
//! durable store that answers every read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::errors::{HermesResult, LockRecover};
use crate::event_log::Fields;
use crate::ring::Ring;
use crate::telemetry_store::TelemetryStore;

/// Name of the event recorded for every error response.
pub const ERROR_EVENT: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub time: DateTime<Utc>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub method: String,
    pub path: String,
    /// HTTP status; 0 until the request finishes.
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(default)]
    pub req_bytes: u64,
    #[serde(default)]
    pub resp_bytes: u64,
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub ended: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ns: i64,
    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

impl Trace {
    pub fn duration_ms(&self) -> f64 {
        (self.duration_ns as f64 / 1e6).max(0.0)
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// Message of the most recent `error` event, if any.
    pub fn last_error_message(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .filter(|e| e.name == ERROR_EVENT)
            .find_map(|e| e.fields.get("message").and_then(|m| m.as_str()))
    }
}

/// Request metadata captured when a trace begins.
#[derive(Debug, Clone, Default)]
pub struct TraceStart {
    pub id: String,
    pub method: String,
    pub path: String,
    pub started: Option<DateTime<Utc>>,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
    pub req_bytes: u64,
}

#[derive(Debug)]
struct LiveTrace {
    trace: Trace,
    finished: bool,
}

/// Shared reference to a live trace, owned by the request that began it.
#[derive(Debug, Clone)]
pub struct TraceHandle(Arc<Mutex<LiveTrace>>);

impl TraceHandle {
    pub fn add_event(&self, name: impl Into<String>, fields: Fields) {
        let event = TraceEvent {
            time: Utc::now(),
            name: name.into(),
            fields,
        };
        self.0.lock_recover().trace.events.push(event);
    }

    pub fn snapshot(&self) -> Trace {
        self.0.lock_recover().trace.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.0.lock_recover().finished
    }
}

pub struct TraceStore {
    ring: Mutex<Ring<TraceHandle>>,
    store: Arc<dyn TelemetryStore>,
}

impl TraceStore {
    pub fn new(ring_capacity: usize, store: Arc<dyn TelemetryStore>) -> Self {
        Self {
            ring: Mutex::new(Ring::new(ring_capacity)),
            store,
        }
    }

    /// Create a trace and make it visible in the ring immediately.
    pub fn begin(&self, start: TraceStart) -> TraceHandle {
        let trace = Trace {
            id: start.id,
            method: start.method,
            path: start.path,
            status: 0,
            user_email: start.user_email,
            user_role: start.user_role,
            user_agent: start.user_agent,
            remote_ip: start.remote_ip,
            req_bytes: start.req_bytes,
            resp_bytes: 0,
            started: start.started.unwrap_or_else(Utc::now),
            ended: None,
            duration_ns: 0,
            events: Vec::new(),
        };
        let handle = TraceHandle(Arc::new(Mutex::new(LiveTrace {
            trace,
            finished: false,
        })));
        self.ring.lock_recover().push(handle.clone());
        handle
    }

    pub fn append_event(&self, handle: &TraceHandle, name: impl Into<String>, fields: Fields) {
        handle.add_event(name, fields);
    }

    /// Set the terminal fields and persist. Only the first call has effect;
    /// persistence failures are logged and never returned.
    pub fn finish(
        &self,
        handle: &TraceHandle,
        status: u16,
        ended: DateTime<Utc>,
        resp_bytes: u64,
    ) -> Trace {
        let snapshot = {
            let mut live = handle.0.lock_recover();
            if live.finished {
                return live.trace.clone();
            }
            let trace = &mut live.trace;
            let ended = ended.max(trace.started);
            trace.status = status;
            trace.ended = Some(ended);
            trace.resp_bytes = resp_bytes;
            trace.duration_ns = (ended - trace.started).num_nanoseconds().unwrap_or(i64::MAX);
            live.finished = true;
            live.trace.clone()
        };

        if let Err(e) = self.store.save_trace(&snapshot) {
            tracing::error!(trace_id = %snapshot.id, error = %e, "failed to persist trace");
        }
        snapshot
    }

    /// Most recent durable traces, started-descending, without events.
    pub fn recent(&self, limit: usize) -> HermesResult<Vec<Trace>> {
        self.store.recent_traces(limit)
    }

    /// Most recent durable traces including their events.
    pub fn recent_with_events(&self, limit: usize) -> HermesResult<Vec<Trace>> {
        self.store.recent_traces_with_events(limit)
    }

    /// Most recent durable error traces (status >= 400) with their events.
    pub fn recent_errors(&self, limit: usize) -> HermesResult<Vec<Trace>> {
        self.store.recent_error_traces(limit)
    }

    pub fn get(&self, id: &str) -> HermesResult<Option<Trace>> {
        self.store.get_trace(id)
    }

    /// Snapshot of the in-memory ring, newest first. Includes unfinished traces.
    pub fn cached(&self, limit: usize) -> Vec<Trace> {
        let handles = self.ring.lock_recover().newest_first(limit);
        handles.iter().map(TraceHandle::snapshot).collect()
    }
}

/// Random 16-hex-digit trace identifier.
pub fn new_trace_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::telemetry_store_sled::SledTelemetryStore;
    use chrono::Duration;

    fn store() -> (TraceStore, Arc<SledTelemetryStore>) {
        let sled = Arc::new(SledTelemetryStore::temporary().expect("temporary sled store"));
        (TraceStore::new(3, sled.clone()), sled)
    }

    fn start(id: &str, path: &str) -> TraceStart {
        TraceStart {
            id: id.to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            ..TraceStart::default()
        }
    }

    #[test]
    fn begin_is_visible_before_finish() {
        let (traces, _) = store();
        let handle = traces.begin(start("t1", "/a"));
        let cached = traces.cached(10);
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].status, 0);
        assert!(cached[0].ended.is_none());
        assert!(!handle.is_finished());
    }

    #[test]
    fn finish_computes_duration_and_persists_events_in_order() {
        let (traces, _) = store();
        let t0 = Utc::now();
        let handle = traces.begin(TraceStart {
            started: Some(t0),
            ..start("t2", "/b")
        });
        traces.append_event(&handle, "request.start", fields!("path" => "/b"));
        traces.append_event(&handle, "step", fields!("n" => 1));
        traces.append_event(&handle, "step", fields!("n" => 2));

        let done = traces.finish(&handle, 200, t0 + Duration::milliseconds(25), 42);
        assert_eq!(done.duration_ns, 25_000_000);
        assert_eq!(done.ended, Some(t0 + Duration::milliseconds(25)));

        let loaded = traces.get("t2").unwrap().expect("trace persisted");
        assert_eq!(loaded.status, 200);
        assert_eq!(loaded.resp_bytes, 42);
        let names: Vec<_> = loaded.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["request.start", "step", "step"]);
        assert_eq!(loaded.events[2].fields["n"], 2);
    }

    #[test]
    fn ended_before_started_is_clamped() {
        let (traces, _) = store();
        let t0 = Utc::now();
        let handle = traces.begin(TraceStart {
            started: Some(t0),
            ..start("t3", "/c")
        });
        let done = traces.finish(&handle, 500, t0 - Duration::seconds(1), 0);
        assert_eq!(done.ended, Some(t0));
        assert_eq!(done.duration_ns, 0);
    }

    #[test]
    fn second_finish_is_ignored() {
        let (traces, _) = store();
        let handle = traces.begin(start("t4", "/d"));
        traces.finish(&handle, 201, Utc::now(), 1);
        let again = traces.finish(&handle, 500, Utc::now(), 99);
        assert_eq!(again.status, 201);
        assert_eq!(traces.get("t4").unwrap().unwrap().resp_bytes, 1);
    }

    #[test]
    fn ring_is_bounded_but_store_keeps_everything() {
        let (traces, _) = store();
        for i in 0..5 {
            let h = traces.begin(start(&format!("id{i}"), "/p"));
            traces.finish(&h, 200, Utc::now(), 0);
        }
        let cached: Vec<_> = traces.cached(10).into_iter().map(|t| t.id).collect();
        assert_eq!(cached, vec!["id4", "id3", "id2"]);
        assert_eq!(traces.recent(10).unwrap().len(), 5);
    }

    #[test]
    fn last_error_message_prefers_latest() {
        let (traces, _) = store();
        let handle = traces.begin(start("t5", "/e"));
        handle.add_event(ERROR_EVENT, fields!("code" => 400, "message" => "first"));
        handle.add_event(ERROR_EVENT, fields!("code" => 404, "message" => "second"));
        assert_eq!(handle.snapshot().last_error_message(), Some("second"));
    }

    #[test]
    fn trace_ids_are_hex() {
        let id = new_trace_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
