//! Dashboard aggregation over a window of finished traces.
//!
//! Everything here is a pure function of its input: the same traces and the
//! same `now` always produce the same view. Ranking ties keep the order in
//! which paths were first seen in the (newest-first) input.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::trace_store::Trace;

pub const MINUTE_BUCKETS: usize = 12;
pub const LATENCY_SAMPLE_CAP: usize = 100;
pub const TOP_SLOW_LIMIT: usize = 5;
pub const TOP_SLOW_MIN_COUNT: usize = 3;
pub const TOP_ERRORS_LIMIT: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusCounts {
    #[serde(rename = "2xx")]
    pub ok: u64,
    #[serde(rename = "3xx")]
    pub redirect: u64,
    #[serde(rename = "4xx")]
    pub client_error: u64,
    #[serde(rename = "5xx")]
    pub server_error: u64,
}

impl StatusCounts {
    fn record(&mut self, status: u16) {
        match status {
            s if s >= 500 => self.server_error += 1,
            s if s >= 400 => self.client_error += 1,
            s if s >= 300 => self.redirect += 1,
            _ => self.ok += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinuteBucket {
    /// Unix seconds of the bucket's minute boundary.
    pub ts: i64,
    pub count: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowPath {
    pub path: String,
    pub count: usize,
    pub avg_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPath {
    pub path: String,
    pub count: usize,
    pub last_message: String,
    pub last_status: u16,
    pub sample_trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateView {
    pub recent_latencies: Vec<f64>,
    pub status_counts: StatusCounts,
    /// Oldest to newest, always `MINUTE_BUCKETS` long.
    pub per_minute: Vec<MinuteBucket>,
    pub top_slow: Vec<SlowPath>,
    pub top_errors: Vec<ErrorPath>,
}

/// One error trace with its last error message, for the error digest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTrace {
    pub id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub message: String,
    pub started: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PathAggregate {
    path: String,
    count: usize,
    sum_ms: f64,
    samples: Vec<f64>,
    errors: usize,
    // Taken from the newest error trace.
    last_message: Option<String>,
    last_status: u16,
    sample_id: Option<String>,
}

/// Nearest-rank percentile: sort ascending and take index
/// `floor(p / 100 * (n - 1))`, clamped into range. Empty input yields 0.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let last = sorted.len() - 1;
    let idx = (p / 100.0 * last as f64).floor();
    let idx = if idx.is_nan() || idx < 0.0 {
        0
    } else {
        (idx as usize).min(last)
    };
    sorted[idx]
}

fn minute_floor(time: DateTime<Utc>) -> i64 {
    time.duration_trunc(TimeDelta::minutes(1))
        .unwrap_or(time)
        .timestamp()
}

/// Build the dashboard view from `traces` (newest first) as of `now`.
pub fn summarize(traces: &[Trace], now: DateTime<Utc>) -> AggregateView {
    let mut status_counts = StatusCounts::default();
    let mut recent_latencies = Vec::with_capacity(traces.len());

    let newest_minute = minute_floor(now);
    let mut per_minute: Vec<MinuteBucket> = (0..MINUTE_BUCKETS as i64)
        .rev()
        .map(|i| MinuteBucket {
            ts: newest_minute - i * 60,
            count: 0,
            errors: 0,
        })
        .collect();
    let oldest_minute = per_minute[0].ts;

    let mut paths: Vec<PathAggregate> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for trace in traces {
        let ms = trace.duration_ms();
        recent_latencies.push(ms);
        status_counts.record(trace.status);

        let minute = minute_floor(trace.started);
        if minute >= oldest_minute && minute <= newest_minute {
            let bucket = &mut per_minute[((minute - oldest_minute) / 60) as usize];
            bucket.count += 1;
            if trace.is_error() {
                bucket.errors += 1;
            }
        }

        let slot = *index.entry(trace.path.clone()).or_insert_with(|| {
            paths.push(PathAggregate {
                path: trace.path.clone(),
                ..PathAggregate::default()
            });
            paths.len() - 1
        });
        let agg = &mut paths[slot];
        agg.count += 1;
        agg.sum_ms += ms;
        if agg.samples.len() < LATENCY_SAMPLE_CAP {
            agg.samples.push(ms);
        }
        if trace.is_error() {
            agg.errors += 1;
            if agg.sample_id.is_none() {
                agg.sample_id = Some(trace.id.clone());
                agg.last_status = trace.status;
            }
            if agg.last_message.is_none() {
                agg.last_message = trace.last_error_message().map(str::to_string);
            }
        }
    }

    let mut top_slow: Vec<SlowPath> = paths
        .iter()
        .filter(|a| a.count >= TOP_SLOW_MIN_COUNT)
        .map(|a| SlowPath {
            path: a.path.clone(),
            count: a.count,
            avg_ms: a.sum_ms / a.count as f64,
            p95_ms: percentile(&a.samples, 95.0),
        })
        .collect();
    // Stable sort: equal p95 keeps first-seen order.
    top_slow.sort_by(|a, b| b.p95_ms.total_cmp(&a.p95_ms));
    top_slow.truncate(TOP_SLOW_LIMIT);

    let mut top_errors: Vec<ErrorPath> = paths
        .iter()
        .filter(|a| a.errors > 0)
        .map(|a| ErrorPath {
            path: a.path.clone(),
            count: a.errors,
            last_message: a.last_message.clone().unwrap_or_default(),
            last_status: a.last_status,
            sample_trace_id: a.sample_id.clone().unwrap_or_default(),
        })
        .collect();
    top_errors.sort_by(|a, b| b.count.cmp(&a.count));
    top_errors.truncate(TOP_ERRORS_LIMIT);

    AggregateView {
        recent_latencies,
        status_counts,
        per_minute,
        top_slow,
        top_errors,
    }
}

/// Error traces (status >= 400) from `traces`, keeping input order.
pub fn error_digest(traces: &[Trace]) -> Vec<ErrorTrace> {
    traces
        .iter()
        .filter(|t| t.is_error())
        .map(|t| ErrorTrace {
            id: t.id.clone(),
            method: t.method.clone(),
            path: t.path.clone(),
            status: t.status,
            duration_ms: t.duration_ms(),
            user_email: t.user_email.clone(),
            message: t.last_error_message().unwrap_or_default().to_string(),
            started: t.started,
        })
        .collect()
}
