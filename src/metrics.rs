use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event_log::EventLog;

/// Process-wide request counters, updated once per finished request.
#[derive(Debug)]
pub struct RequestCounters {
    started: DateTime<Utc>,
    requests: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    duration_ns: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_seconds: i64,
    pub requests: u64,
    #[serde(rename = "status4xx")]
    pub client_errors: u64,
    #[serde(rename = "status5xx")]
    pub server_errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_duration_ms: f64,
    /// Log entries a full subscriber queue did not take.
    pub dropped_log_deliveries: u64,
    /// Log entries the durable sink queue did not take.
    pub dropped_sink_entries: u64,
}

impl MetricsSnapshot {
    pub fn with_log_drops(mut self, events: &EventLog) -> Self {
        self.dropped_log_deliveries = events.dropped_deliveries();
        self.dropped_sink_entries = events.dropped_sink_entries();
        self
    }
}

impl Default for RequestCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCounters {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            requests: AtomicU64::new(0),
            client_errors: AtomicU64::new(0),
            server_errors: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            duration_ns: AtomicU64::new(0),
        }
    }

    pub fn record(&self, status: u16, bytes_in: u64, bytes_out: u64, duration_ns: i64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            self.server_errors.fetch_add(1, Ordering::Relaxed);
        } else if status >= 400 {
            self.client_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        self.duration_ns
            .fetch_add(duration_ns.max(0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let total_ns = self.duration_ns.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_seconds: (Utc::now() - self.started).num_seconds(),
            requests,
            client_errors: self.client_errors.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            avg_duration_ms: if requests == 0 {
                0.0
            } else {
                total_ns as f64 / requests as f64 / 1e6
            },
            dropped_log_deliveries: 0,
            dropped_sink_entries: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_status_class() {
        let counters = RequestCounters::new();
        counters.record(200, 10, 100, 2_000_000);
        counters.record(404, 0, 20, 4_000_000);
        counters.record(503, 5, 0, -1);

        let snap = counters.snapshot();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.client_errors, 1);
        assert_eq!(snap.server_errors, 1);
        assert_eq!(snap.bytes_in, 15);
        assert_eq!(snap.bytes_out, 120);
        assert!((snap.avg_duration_ms - 2.0).abs() < 1e-9);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status4xx"], 1);
        assert!(json.get("uptimeSeconds").is_some());
        assert_eq!(json["droppedSinkEntries"], 0);
    }

    #[test]
    fn log_drop_counters_are_included() {
        let events = EventLog::default();
        let idle = events.subscribe();
        for i in 0..150 {
            events.info(format!("m{i}"), crate::fields!());
        }
        let snap = RequestCounters::new().snapshot().with_log_drops(&events);
        assert_eq!(snap.dropped_log_deliveries, 50);
        assert_eq!(snap.dropped_sink_entries, 0);
        drop(idle);
    }
}
