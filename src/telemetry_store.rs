use std::sync::Arc;

use crate::errors::HermesResult;
use crate::event_log::{LogEntry, LogSink};
use crate::trace_store::Trace;

/// Durable persistence for log entries and finished traces.
///
/// Reads are newest-first. Writes are append-only except that saving a
/// trace id again replaces the earlier row and its events.
pub trait TelemetryStore: Send + Sync {
    fn append_log(&self, entry: &LogEntry) -> HermesResult<()>;

    fn recent_logs(&self, limit: usize) -> HermesResult<Vec<LogEntry>>;

    /// Persist the trace row plus one row per event, in append order.
    fn save_trace(&self, trace: &Trace) -> HermesResult<()>;

    /// Started-descending trace rows without their events.
    fn recent_traces(&self, limit: usize) -> HermesResult<Vec<Trace>>;

    fn recent_traces_with_events(&self, limit: usize) -> HermesResult<Vec<Trace>>;

    /// Started-descending traces with status >= 400, including their events.
    fn recent_error_traces(&self, limit: usize) -> HermesResult<Vec<Trace>>;

    fn get_trace(&self, id: &str) -> HermesResult<Option<Trace>>;

    fn flush(&self) -> HermesResult<()>;
}

/// Adapts a telemetry store into the event log's durable sink.
pub struct DurableLogSink(pub Arc<dyn TelemetryStore>);

impl LogSink for DurableLogSink {
    fn persist(&self, entry: &LogEntry) -> HermesResult<()> {
        self.0.append_log(entry)
    }
}
