//! Structured event log: bounded history, live fan-out, optional durable sink.
//!
//! One `EventLog` is constructed at process start and shared by reference.
//! Writers never block on readers: subscriber queues are bounded and a full
//! queue drops the newest entry, and the durable sink is fed through its
//! own bounded queue drained by a dedicated worker thread.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::errors::{HermesResult, LockRecover};
use crate::ring::Ring;

/// Structured key/value payload attached to log entries and trace events.
pub type Fields = Map<String, Value>;

/// `tracing` target used for sink failure diagnostics. The event log layer
/// skips this target so a failing sink never logs into itself.
pub const SINK_TARGET: &str = "hermes::event_log::sink";

/// Severity of a log entry, ordered `Debug < Info < Error < Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    /// Parse a level token, treating anything unrecognized as `Info`.
    pub fn lenient(token: &str) -> LogLevel {
        token.parse().unwrap_or(LogLevel::Info)
    }

    fn from_u8(raw: u8) -> LogLevel {
        match raw {
            0 => LogLevel::Debug,
            2 => LogLevel::Error,
            3 => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Error => 2,
            LogLevel::Fatal => 3,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(input: &str) -> Result<LogLevel, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(rename = "msg")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Fields,
}

/// Durable destination for accepted log entries.
pub trait LogSink: Send + Sync {
    fn persist(&self, entry: &LogEntry) -> HermesResult<()>;
}

impl<F> LogSink for F
where
    F: Fn(&LogEntry) -> HermesResult<()> + Send + Sync,
{
    fn persist(&self, entry: &LogEntry) -> HermesResult<()> {
        self(entry)
    }
}

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub ring_capacity: usize,
    pub subscriber_buffer: usize,
    pub sink_queue: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1000,
            subscriber_buffer: 100,
            sink_queue: 1024,
        }
    }
}

type SubscriberMap = Mutex<HashMap<u64, mpsc::Sender<Arc<LogEntry>>>>;

struct SinkWorker {
    tx: mpsc::Sender<Arc<LogEntry>>,
    handle: JoinHandle<()>,
}

/// Process-wide log store.
pub struct EventLog {
    config: EventLogConfig,
    ring: Mutex<Ring<Arc<LogEntry>>>,
    level: AtomicU8,
    subscribers: Arc<SubscriberMap>,
    next_subscriber: AtomicU64,
    sink: Mutex<Option<SinkWorker>>,
    dropped_deliveries: AtomicU64,
    dropped_sink: AtomicU64,
}

impl EventLog {
    pub fn new(config: EventLogConfig) -> Self {
        Self {
            ring: Mutex::new(Ring::new(config.ring_capacity)),
            level: AtomicU8::new(LogLevel::Info.as_u8()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
            sink: Mutex::new(None),
            dropped_deliveries: AtomicU64::new(0),
            dropped_sink: AtomicU64::new(0),
            config,
        }
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Set the threshold from a token; invalid tokens become `info`.
    pub fn set_level(&self, token: &str) -> LogLevel {
        let level = LogLevel::lenient(token);
        self.set_threshold(level);
        level
    }

    pub fn set_threshold(&self, level: LogLevel) {
        self.level.store(level.as_u8(), Ordering::Relaxed);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level()
    }

    /// Record an entry. Returns `false` when the level is below threshold.
    pub fn write(&self, level: LogLevel, message: impl Into<String>, fields: Fields) -> bool {
        if !self.enabled(level) {
            return false;
        }
        let entry = Arc::new(LogEntry {
            time: Utc::now(),
            level,
            message: message.into(),
            fields,
        });

        self.ring.lock_recover().push(entry.clone());
        self.broadcast(&entry);
        self.forward_to_sink(entry);
        true
    }

    pub fn debug(&self, message: impl Into<String>, fields: Fields) -> bool {
        self.write(LogLevel::Debug, message, fields)
    }

    pub fn info(&self, message: impl Into<String>, fields: Fields) -> bool {
        self.write(LogLevel::Info, message, fields)
    }

    pub fn error(&self, message: impl Into<String>, fields: Fields) -> bool {
        self.write(LogLevel::Error, message, fields)
    }

    pub fn fatal(&self, message: impl Into<String>, fields: Fields) -> bool {
        self.write(LogLevel::Fatal, message, fields)
    }

    /// Last words before the process exits: write a fatal entry and wait
    /// for the sink to persist everything queued, that entry included.
    pub fn fatal_and_close(&self, message: impl Into<String>, fields: Fields) {
        self.fatal(message, fields);
        self.close_sink();
    }

    /// Up to `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let snapshot = self.ring.lock_recover().newest_first(n);
        snapshot.iter().map(|e| LogEntry::clone(e)).collect()
    }

    /// Subscribe to entries written from now on.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock_recover().insert(id, tx);
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock_recover().len()
    }

    /// Install the durable sink, replacing (and closing) any previous one.
    pub fn register_sink(&self, sink: Arc<dyn LogSink>) {
        let (tx, mut rx) = mpsc::channel::<Arc<LogEntry>>(self.config.sink_queue.max(1));
        let spawned = std::thread::Builder::new()
            .name("event-log-sink".into())
            .spawn(move || {
                while let Some(entry) = rx.blocking_recv() {
                    if let Err(e) = sink.persist(&entry) {
                        tracing::warn!(target: SINK_TARGET, error = %e, "log sink write failed");
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                // The previous worker drains its queue and exits once its sender is gone.
                let _previous = self.sink.lock_recover().replace(SinkWorker { tx, handle });
            }
            Err(e) => {
                tracing::warn!(target: SINK_TARGET, error = %e, "failed to start log sink worker");
            }
        }
    }

    /// Detach the sink and wait for queued entries to be persisted.
    pub fn close_sink(&self) {
        let worker = self.sink.lock_recover().take();
        if let Some(SinkWorker { tx, handle }) = worker {
            drop(tx);
            if handle.join().is_err() {
                tracing::warn!(target: SINK_TARGET, "log sink worker panicked");
            }
        }
    }

    /// Entries not delivered to a subscriber because its queue was full.
    pub fn dropped_deliveries(&self) -> u64 {
        self.dropped_deliveries.load(Ordering::Relaxed)
    }

    /// Entries not forwarded to the sink because its queue was full.
    pub fn dropped_sink_entries(&self) -> u64 {
        self.dropped_sink.load(Ordering::Relaxed)
    }

    fn broadcast(&self, entry: &Arc<LogEntry>) {
        let mut subscribers = self.subscribers.lock_recover();
        let mut closed = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(entry.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            subscribers.remove(&id);
        }
    }

    fn forward_to_sink(&self, entry: Arc<LogEntry>) {
        let sink = self.sink.lock_recover();
        if let Some(worker) = sink.as_ref() {
            if worker.tx.try_send(entry).is_err() {
                self.dropped_sink.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EventLogConfig::default())
    }
}

/// Live feed of log entries. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<LogEntry>>,
    registry: Weak<SubscriberMap>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<LogEntry>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<LogEntry>> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving; no further deliveries are attempted.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock_recover().remove(&self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = Arc<LogEntry>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
