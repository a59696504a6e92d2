use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sled::{Batch, Db, Tree};
use std::path::Path;

use crate::errors::{HermesError, HermesResult};
use crate::event_log::LogEntry;
use crate::telemetry_store::TelemetryStore;
use crate::trace_store::{Trace, TraceEvent};

const LOGS_TREE: &str = "logs";
const TRACES_TREE: &str = "traces";
const TRACES_BY_START_TREE: &str = "traces_by_start";
const TRACE_EVENTS_TREE: &str = "trace_events";
const ERRORS_BY_START_TREE: &str = "errors_by_start";

/// A sled-backed implementation of TelemetryStore.
///
/// Keys are big-endian so sled's byte ordering is chronological:
/// `logs` is keyed by (time, unique id), `traces_by_start` by (started, id),
/// and `trace_events` by (trace id, 0x00, sequence). `errors_by_start` uses
/// the same keys as `traces_by_start` but only holds traces with status >= 400.
pub struct SledTelemetryStore {
    db: Db,
    logs: Tree,
    traces: Tree,
    by_start: Tree,
    errors_by_start: Tree,
    events: Tree,
}

fn nanos(time: &DateTime<Utc>) -> u64 {
    time.timestamp_nanos_opt().unwrap_or(0).max(0) as u64
}

fn start_key(trace: &Trace) -> Vec<u8> {
    let mut key = nanos(&trace.started).to_be_bytes().to_vec();
    key.extend_from_slice(trace.id.as_bytes());
    key
}

fn events_prefix(id: &str) -> Vec<u8> {
    let mut prefix = id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn decode<T: DeserializeOwned>(context: &str, bytes: &[u8]) -> HermesResult<T> {
    serde_json::from_slice(bytes).map_err(|e| HermesError::serialization(context, e))
}

impl SledTelemetryStore {
    pub fn open(path: impl AsRef<Path>) -> HermesResult<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| HermesError::database(format!("open {}", path.as_ref().display()), e))?;
        Self::from_db(db)
    }

    /// Store that lives only as long as this value; used by tests.
    pub fn temporary() -> HermesResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| HermesError::database("open temporary", e))?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> HermesResult<Self> {
        Ok(Self {
            logs: db.open_tree(LOGS_TREE)?,
            traces: db.open_tree(TRACES_TREE)?,
            by_start: db.open_tree(TRACES_BY_START_TREE)?,
            errors_by_start: db.open_tree(ERRORS_BY_START_TREE)?,
            events: db.open_tree(TRACE_EVENTS_TREE)?,
            db,
        })
    }

    fn load_events(&self, id: &str) -> HermesResult<Vec<TraceEvent>> {
        self.events
            .scan_prefix(events_prefix(id))
            .values()
            .map(|v| decode("trace event", &v?))
            .collect()
    }

    fn load_row(&self, id: &[u8]) -> HermesResult<Option<Trace>> {
        match self.traces.get(id)? {
            Some(bytes) => Ok(Some(decode("trace row", &bytes)?)),
            None => Ok(None),
        }
    }
}

impl TelemetryStore for SledTelemetryStore {
    fn append_log(&self, entry: &LogEntry) -> HermesResult<()> {
        let mut key = nanos(&entry.time).to_be_bytes().to_vec();
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        self.logs.insert(key, serde_json::to_vec(entry)?)?;
        Ok(())
    }

    fn recent_logs(&self, limit: usize) -> HermesResult<Vec<LogEntry>> {
        self.logs
            .iter()
            .values()
            .rev()
            .take(limit)
            .map(|v| decode("log entry", &v?))
            .collect()
    }

    fn save_trace(&self, trace: &Trace) -> HermesResult<()> {
        // Last write wins: drop the previous index entry and events for this id.
        if let Some(previous) = self.load_row(trace.id.as_bytes())? {
            let key = start_key(&previous);
            self.by_start.remove(&key)?;
            self.errors_by_start.remove(&key)?;
        }
        let mut stale = Batch::default();
        for key in self.events.scan_prefix(events_prefix(&trace.id)).keys() {
            stale.remove(key?);
        }
        self.events.apply_batch(stale)?;

        let row = Trace {
            events: Vec::new(),
            ..trace.clone()
        };
        self.traces.insert(trace.id.as_bytes(), serde_json::to_vec(&row)?)?;

        let mut events = Batch::default();
        for (seq, event) in trace.events.iter().enumerate() {
            let mut key = events_prefix(&trace.id);
            key.extend_from_slice(&(seq as u32).to_be_bytes());
            events.insert(key, serde_json::to_vec(event)?);
        }
        self.events.apply_batch(events)?;

        let key = start_key(trace);
        if trace.is_error() {
            self.errors_by_start.insert(&key, trace.id.as_bytes())?;
        }
        self.by_start.insert(key, trace.id.as_bytes())?;
        Ok(())
    }

    fn recent_traces(&self, limit: usize) -> HermesResult<Vec<Trace>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        for id in self.by_start.iter().values().rev() {
            if out.len() >= limit {
                break;
            }
            if let Some(trace) = self.load_row(&id?)? {
                out.push(trace);
            }
        }
        Ok(out)
    }

    fn recent_traces_with_events(&self, limit: usize) -> HermesResult<Vec<Trace>> {
        let mut traces = self.recent_traces(limit)?;
        for trace in traces.iter_mut() {
            trace.events = self.load_events(&trace.id)?;
        }
        Ok(traces)
    }

    fn recent_error_traces(&self, limit: usize) -> HermesResult<Vec<Trace>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        for id in self.errors_by_start.iter().values().rev() {
            if out.len() >= limit {
                break;
            }
            if let Some(mut trace) = self.load_row(&id?)? {
                trace.events = self.load_events(&trace.id)?;
                out.push(trace);
            }
        }
        Ok(out)
    }

    fn get_trace(&self, id: &str) -> HermesResult<Option<Trace>> {
        match self.load_row(id.as_bytes())? {
            Some(mut trace) => {
                trace.events = self.load_events(id)?;
                Ok(Some(trace))
            }
            None => Ok(None),
        }
    }

    fn flush(&self) -> HermesResult<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| HermesError::database("flush", e))
    }
}

impl Drop for SledTelemetryStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            tracing::warn!(error = %e, "failed to flush telemetry store on close");
        }
    }
}
