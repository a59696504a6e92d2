//! Streaming copy/move between object store endpoints.
//!
//! Bytes flow from the source reader straight into the destination's `put`
//! through a counting pass-through, so memory use is bounded by the buffer
//! size. A ticker task samples the counter and emits progress frames; it is
//! tied to the transfer by a child cancellation token that trips on every
//! exit path.

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::event_log::Fields;
use crate::fields;
use crate::object_store::{ObjectBody, ObjectInfo, ObjectStore, StorageError, StorageResult};
use crate::trace_store::{TraceHandle, ERROR_EVENT};

const FRAME_QUEUE: usize = 16;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Move,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Copy => "copy",
            TransferMode::Move => "move",
        }
    }
}

/// An object at a specific endpoint.
#[derive(Clone)]
pub struct Locator {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
    pub key: String,
}

impl Locator {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Same store instance, bucket and key.
    pub fn same_object(&self, other: &Locator) -> bool {
        Arc::ptr_eq(&self.store, &other.store) && self.bucket == other.bucket && self.key == other.key
    }
}

pub struct TransferRequest {
    pub mode: TransferMode,
    pub source: Locator,
    pub destination: Locator,
}

impl TransferRequest {
    /// Writing an object onto itself would truncate it, and a move would
    /// then delete the only copy.
    pub fn check_distinct(&self) -> StorageResult<()> {
        if self.source.same_object(&self.destination) {
            return Err(StorageError::SameObject {
                bucket: self.source.bucket.clone(),
                key: self.source.key.clone(),
            });
        }
        Ok(())
    }
}

/// One newline-delimited JSON frame of a transfer response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransferFrame {
    Done {
        progress: u64,
        bytes: u64,
        total: u64,
        done: bool,
    },
    Progress {
        progress: u64,
        bytes: u64,
        total: u64,
    },
    Error {
        error: String,
    },
}

impl TransferFrame {
    pub fn progress(bytes: u64, total: u64) -> Self {
        TransferFrame::Progress {
            progress: percent(bytes, total),
            bytes,
            total,
        }
    }

    pub fn done(bytes: u64, total: u64) -> Self {
        TransferFrame::Done {
            progress: 100,
            bytes,
            total,
            done: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TransferFrame::Error {
            error: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferFrame::Progress { .. })
    }

    /// The frame as one NDJSON line.
    pub fn to_line(&self) -> Bytes {
        let mut line = serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"error":"frame encoding failed"}"#.to_vec());
        line.push(b'\n');
        Bytes::from(line)
    }
}

/// floor(bytes * 100 / total), capped at 100; 0 when the total is unknown.
pub fn percent(bytes: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    ((bytes as u128 * 100 / total as u128).min(100)) as u64
}

#[derive(Debug, Error)]
enum TransferFailure {
    #[error("read source: {0}")]
    Source(StorageError),
    #[error("write destination: {0}")]
    Destination(StorageError),
    #[error("delete source after copy: {0}")]
    Delete(StorageError),
    #[error("cancelled")]
    Cancelled,
}

impl TransferFailure {
    fn stage(&self) -> &'static str {
        match self {
            TransferFailure::Source(_) => "source",
            TransferFailure::Destination(_) => "destination",
            TransferFailure::Delete(_) => "delete",
            TransferFailure::Cancelled => "cancelled",
        }
    }

    /// Short message for the client; storage internals stay in the logs.
    fn client_message(&self) -> String {
        let classify = |e: &StorageError, fallback: &str| match e {
            StorageError::BucketNotFound { .. } => "bucket not found".to_string(),
            StorageError::ObjectNotFound { .. } => "object not found".to_string(),
            StorageError::InvalidKey { .. } => "invalid object key".to_string(),
            StorageError::SameObject { .. } => "source and destination are the same object".to_string(),
            _ => fallback.to_string(),
        };
        match self {
            TransferFailure::Source(e) => classify(e, "failed to read source object"),
            TransferFailure::Destination(e) => classify(e, "failed to write destination object"),
            TransferFailure::Delete(_) => "copied, but failed to delete source object".to_string(),
            TransferFailure::Cancelled => "transfer cancelled".to_string(),
        }
    }
}

/// Pass-through reader that counts the bytes handed to its consumer.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            self.count.fetch_add(read as u64, Ordering::Relaxed);
        }
        poll
    }
}

/// Frames of one running transfer. Dropping it cancels the transfer.
pub struct TransferStream {
    frames: mpsc::Receiver<TransferFrame>,
    finished: bool,
    _cancel_on_drop: DropGuard,
}

impl Stream for TransferStream {
    type Item = TransferFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.frames.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                // Nothing is delivered after a terminal frame.
                if frame.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(frame))
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferEngine {
    progress_interval: Duration,
    buffer_size: usize,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(300), 64 * 1024)
    }
}

impl TransferEngine {
    pub fn new(progress_interval: Duration, buffer_size: usize) -> Self {
        Self {
            progress_interval: progress_interval.max(Duration::from_millis(1)),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// Best-effort stat of the source. A missing source is an error; any
    /// other failure just means the total size is unknown.
    pub async fn probe(&self, source: &Locator) -> StorageResult<Option<ObjectInfo>> {
        match source.store.stat(&source.bucket, &source.key).await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                tracing::debug!(bucket = %source.bucket, key = %source.key, error = %e, "stat failed; total unknown");
                Ok(None)
            }
        }
    }

    /// Probe the source, then start streaming. Errors here happen before any
    /// frame is produced and can still become an HTTP status.
    pub async fn transfer(
        &self,
        request: TransferRequest,
        trace: Option<TraceHandle>,
        cancel: &CancellationToken,
    ) -> StorageResult<TransferStream> {
        request.check_distinct()?;
        let info = self.probe(&request.source).await?;
        Ok(self.start(request, info, trace, cancel))
    }

    /// Spawn the transfer task. It stops when `cancel` (or the returned
    /// stream) goes away.
    pub fn start(
        &self,
        request: TransferRequest,
        info: Option<ObjectInfo>,
        trace: Option<TraceHandle>,
        cancel: &CancellationToken,
    ) -> TransferStream {
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        let token = cancel.child_token();
        let engine = self.clone();
        tokio::spawn(engine.run(request, info, trace, tx, token.clone()));
        TransferStream {
            frames: rx,
            finished: false,
            _cancel_on_drop: token.drop_guard(),
        }
    }

    async fn run(
        self,
        request: TransferRequest,
        info: Option<ObjectInfo>,
        trace: Option<TraceHandle>,
        tx: mpsc::Sender<TransferFrame>,
        cancel: CancellationToken,
    ) {
        let verb = request.mode.as_str();
        let record = |name: &str, fields: Fields| {
            if let Some(trace) = &trace {
                trace.add_event(name, fields);
            }
        };
        record(
            &format!("object.{verb}.start"),
            fields!(
                "srcBucket" => request.source.bucket,
                "srcKey" => request.source.key,
                "dstBucket" => request.destination.bucket,
                "dstKey" => request.destination.key,
                "total" => info.as_ref().map(|i| i.size),
            ),
        );

        let counter = Arc::new(AtomicU64::new(0));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferFailure::Cancelled),
            result = self.execute(&request, info, counter.clone(), &tx, &cancel) => result,
        };
        let bytes = counter.load(Ordering::Relaxed);

        match outcome {
            Ok(total) => {
                record(&format!("object.{verb}.end"), fields!("bytes" => bytes, "ok" => true));
                let _ = tx.send(TransferFrame::done(bytes, total)).await;
            }
            Err(failure) => {
                let message = failure.client_message();
                match &failure {
                    TransferFailure::Cancelled => {
                        tracing::info!(mode = verb, bytes, "transfer cancelled");
                    }
                    other => {
                        tracing::error!(mode = verb, bytes, error = %other, "transfer failed");
                    }
                }
                record(ERROR_EVENT, fields!("message" => message, "stage" => failure.stage()));
                record(&format!("object.{verb}.end"), fields!("bytes" => bytes, "ok" => false));
                let frame = TransferFrame::error(message);
                if matches!(failure, TransferFailure::Cancelled) {
                    let _ = tx.try_send(frame);
                } else {
                    let _ = tx.send(frame).await;
                }
            }
        }
    }

    async fn execute(
        &self,
        request: &TransferRequest,
        info: Option<ObjectInfo>,
        counter: Arc<AtomicU64>,
        tx: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferFailure> {
        let source = &request.source;
        let destination = &request.destination;
        request.check_distinct().map_err(TransferFailure::Destination)?;

        let reader = source
            .store
            .get(&source.bucket, &source.key)
            .await
            .map_err(TransferFailure::Source)?;
        let size = info.as_ref().map(|i| i.size).or(reader.size);
        let total = size.unwrap_or(0);
        let content_type = info
            .as_ref()
            .and_then(|i| i.content_type.clone())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let _ = tx.send(TransferFrame::progress(0, total)).await;

        let ticker = cancel.child_token();
        let _stop_ticker = ticker.clone().drop_guard();
        tokio::spawn(report_progress(
            self.progress_interval,
            counter.clone(),
            total,
            tx.clone(),
            ticker,
        ));

        let body: ObjectBody<'static> = Box::pin(CountingReader {
            inner: BufReader::with_capacity(self.buffer_size, reader.body),
            count: counter,
        });
        destination
            .store
            .put(&destination.bucket, &destination.key, body, size, &content_type)
            .await
            .map_err(TransferFailure::Destination)?;

        if request.mode == TransferMode::Move {
            source
                .store
                .delete(&source.bucket, &source.key)
                .await
                .map_err(TransferFailure::Delete)?;
        }
        Ok(total)
    }
}

async fn report_progress(
    interval: Duration,
    counter: Arc<AtomicU64>,
    total: u64,
    tx: mpsc::Sender<TransferFrame>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial frame is already out.
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let frame = TransferFrame::progress(counter.load(Ordering::Relaxed), total);
                // A slow client skips frames; a gone client ends the ticker.
                if let Err(TrySendError::Closed(_)) = tx.try_send(frame) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::ObjectReader;
    use crate::object_store_memory::MemoryObjectStore;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    fn memory(buckets: &[&str]) -> Arc<MemoryObjectStore> {
        Arc::new(MemoryObjectStore::with_buckets(buckets.iter().copied()))
    }

    async fn collect(stream: TransferStream) -> Vec<TransferFrame> {
        stream.collect().await
    }

    /// Store whose reads report no size and whose stat always fails.
    struct Unsized(Arc<MemoryObjectStore>);

    #[async_trait]
    impl ObjectStore for Unsized {
        async fn list(&self, b: &str, p: &str, r: bool) -> StorageResult<Vec<ObjectInfo>> {
            self.0.list(b, p, r).await
        }
        async fn get(&self, b: &str, k: &str) -> StorageResult<ObjectReader> {
            let reader = self.0.get(b, k).await?;
            Ok(ObjectReader {
                body: reader.body,
                size: None,
            })
        }
        async fn put<'a>(
            &self,
            b: &str,
            k: &str,
            body: ObjectBody<'a>,
            size: Option<u64>,
            ct: &str,
        ) -> StorageResult<ObjectInfo> {
            self.0.put(b, k, body, size, ct).await
        }
        async fn delete(&self, b: &str, k: &str) -> StorageResult<()> {
            self.0.delete(b, k).await
        }
        async fn stat(&self, _: &str, _: &str) -> StorageResult<ObjectInfo> {
            Err(StorageError::Other("stat unsupported".into()))
        }
    }

    /// Source whose body never yields, to hold a transfer open.
    struct Stalled {
        writers: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl ObjectStore for Stalled {
        async fn list(&self, _: &str, _: &str, _: bool) -> StorageResult<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }
        async fn get(&self, _: &str, _: &str) -> StorageResult<ObjectReader> {
            let (writer, reader) = tokio::io::duplex(64);
            self.writers.lock().unwrap().push(writer);
            Ok(ObjectReader {
                body: Box::pin(reader),
                size: Some(1_000),
            })
        }
        async fn put<'a>(
            &self,
            _: &str,
            k: &str,
            mut body: ObjectBody<'a>,
            _: Option<u64>,
            _: &str,
        ) -> StorageResult<ObjectInfo> {
            let size = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            Ok(ObjectInfo {
                key: k.into(),
                size,
                content_type: None,
                last_modified: None,
                is_prefix: false,
            })
        }
        async fn delete(&self, _: &str, _: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn stat(&self, _: &str, _: &str) -> StorageResult<ObjectInfo> {
            Err(StorageError::Other("stat unsupported".into()))
        }
    }

    #[test]
    fn percent_is_floored_and_capped() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 0), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(10, 3), 100);
        assert_eq!(percent(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn frames_serialize_to_the_wire_shapes() {
        assert_eq!(
            TransferFrame::progress(5, 10).to_line(),
            Bytes::from_static(b"{\"progress\":50,\"bytes\":5,\"total\":10}\n")
        );
        assert_eq!(
            serde_json::to_value(TransferFrame::done(0, 0)).unwrap(),
            serde_json::json!({"progress": 100, "bytes": 0, "total": 0, "done": true})
        );
        assert_eq!(
            serde_json::to_value(TransferFrame::error("object not found")).unwrap(),
            serde_json::json!({"error": "object not found"})
        );
    }

    #[tokio::test]
    async fn empty_object_of_unknown_size() {
        let backing = memory(&["src"]);
        backing.insert("src", "empty.bin", Bytes::new());
        let store: Arc<dyn ObjectStore> = Arc::new(Unsized(backing.clone()));

        let request = TransferRequest {
            mode: TransferMode::Copy,
            source: Locator::new(store.clone(), "src", "empty.bin"),
            destination: Locator::new(store, "src", "copy.bin"),
        };
        let stream = TransferEngine::default()
            .transfer(request, None, &CancellationToken::new())
            .await
            .unwrap();
        let frames = collect(stream).await;

        assert_eq!(frames.first(), Some(&TransferFrame::progress(0, 0)));
        assert_eq!(frames.last(), Some(&TransferFrame::done(0, 0)));
        assert_eq!(backing.contents("src", "copy.bin"), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn copy_reports_known_total_and_keeps_source() {
        let store = memory(&["a", "b"]);
        store.insert("a", "k", vec![9u8; 4096]);
        let dyn_store: Arc<dyn ObjectStore> = store.clone();

        let request = TransferRequest {
            mode: TransferMode::Copy,
            source: Locator::new(dyn_store.clone(), "a", "k"),
            destination: Locator::new(dyn_store, "b", "k2"),
        };
        let frames = collect(
            TransferEngine::new(Duration::from_millis(5), 512)
                .transfer(request, None, &CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(frames[0], TransferFrame::progress(0, 4096));
        assert_eq!(frames.last(), Some(&TransferFrame::done(4096, 4096)));
        assert!(store.contents("a", "k").is_some());
        assert_eq!(store.contents("b", "k2").unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn move_deletes_source_and_records_trace_events() {
        use crate::telemetry_store_sled::SledTelemetryStore;
        use crate::trace_store::{TraceStart, TraceStore};

        let store = memory(&["a"]);
        store.insert("a", "from", "hello");
        let dyn_store: Arc<dyn ObjectStore> = store.clone();

        let traces = TraceStore::new(4, Arc::new(SledTelemetryStore::temporary().unwrap()));
        let handle = traces.begin(TraceStart {
            id: "mv".into(),
            ..TraceStart::default()
        });
        let request = TransferRequest {
            mode: TransferMode::Move,
            source: Locator::new(dyn_store.clone(), "a", "from"),
            destination: Locator::new(dyn_store, "a", "to"),
        };
        let frames = collect(
            TransferEngine::default()
                .transfer(request, Some(handle.clone()), &CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(frames.last(), Some(&TransferFrame::done(5, 5)));
        assert!(store.contents("a", "from").is_none());
        assert_eq!(store.contents("a", "to").unwrap(), Bytes::from("hello"));
        let names: Vec<_> = handle.snapshot().events.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["object.move.start", "object.move.end"]);
    }

    #[tokio::test]
    async fn failed_destination_leaves_source_in_place() {
        let store = memory(&["a"]);
        store.insert("a", "keep", "data");
        let dyn_store: Arc<dyn ObjectStore> = store.clone();

        let request = TransferRequest {
            mode: TransferMode::Move,
            source: Locator::new(dyn_store.clone(), "a", "keep"),
            destination: Locator::new(dyn_store, "missing-bucket", "keep"),
        };
        let frames = collect(
            TransferEngine::default()
                .transfer(request, None, &CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(frames.last(), Some(&TransferFrame::error("bucket not found")));
        assert_eq!(store.contents("a", "keep").unwrap(), Bytes::from("data"));
    }

    #[tokio::test]
    async fn missing_source_fails_before_streaming() {
        let store: Arc<dyn ObjectStore> = memory(&["a"]);
        let request = TransferRequest {
            mode: TransferMode::Copy,
            source: Locator::new(store.clone(), "a", "ghost"),
            destination: Locator::new(store, "a", "copy"),
        };
        let result = TransferEngine::default()
            .transfer(request, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StorageError::ObjectNotFound { .. })));
    }

    /// Memory store whose deletes always fail.
    struct Undeletable(Arc<MemoryObjectStore>);

    #[async_trait]
    impl ObjectStore for Undeletable {
        async fn list(&self, b: &str, p: &str, r: bool) -> StorageResult<Vec<ObjectInfo>> {
            self.0.list(b, p, r).await
        }
        async fn get(&self, b: &str, k: &str) -> StorageResult<ObjectReader> {
            self.0.get(b, k).await
        }
        async fn put<'a>(
            &self,
            b: &str,
            k: &str,
            body: ObjectBody<'a>,
            size: Option<u64>,
            ct: &str,
        ) -> StorageResult<ObjectInfo> {
            self.0.put(b, k, body, size, ct).await
        }
        async fn delete(&self, _: &str, _: &str) -> StorageResult<()> {
            Err(StorageError::Other("permission denied".into()))
        }
        async fn stat(&self, b: &str, k: &str) -> StorageResult<ObjectInfo> {
            self.0.stat(b, k).await
        }
    }

    #[tokio::test]
    async fn failed_source_delete_keeps_copy_and_reports_error() {
        use crate::telemetry_store_sled::SledTelemetryStore;
        use crate::trace_store::{TraceStart, TraceStore};

        let backing = memory(&["a", "b"]);
        backing.insert("a", "report.csv", "x,y\n");
        let store: Arc<dyn ObjectStore> = Arc::new(Undeletable(backing.clone()));

        let traces = TraceStore::new(4, Arc::new(SledTelemetryStore::temporary().unwrap()));
        let handle = traces.begin(TraceStart {
            id: "partial".into(),
            ..TraceStart::default()
        });
        let request = TransferRequest {
            mode: TransferMode::Move,
            source: Locator::new(store.clone(), "a", "report.csv"),
            destination: Locator::new(store, "b", "report.csv"),
        };
        let frames = collect(
            TransferEngine::default()
                .transfer(request, Some(handle.clone()), &CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;

        assert_eq!(
            frames.last(),
            Some(&TransferFrame::error("copied, but failed to delete source object"))
        );
        assert!(frames[..frames.len() - 1].iter().all(|f| !f.is_terminal()));
        assert_eq!(backing.contents("b", "report.csv").unwrap(), Bytes::from("x,y\n"));
        assert_eq!(backing.contents("a", "report.csv").unwrap(), Bytes::from("x,y\n"));

        let events = handle.snapshot().events;
        let error = events.iter().find(|e| e.name == ERROR_EVENT).unwrap();
        assert_eq!(error.fields["stage"], "delete");
        assert_eq!(
            events.last().map(|e| e.fields["ok"].clone()),
            Some(serde_json::json!(false))
        );
    }

    #[tokio::test]
    async fn moving_an_object_onto_itself_is_rejected() {
        let store = memory(&["a"]);
        store.insert("a", "k", "precious");
        let dyn_store: Arc<dyn ObjectStore> = store.clone();

        for mode in [TransferMode::Move, TransferMode::Copy] {
            let request = TransferRequest {
                mode,
                source: Locator::new(dyn_store.clone(), "a", "k"),
                destination: Locator::new(dyn_store.clone(), "a", "k"),
            };
            let result = TransferEngine::default()
                .transfer(request, None, &CancellationToken::new())
                .await;
            assert!(matches!(result, Err(StorageError::SameObject { .. })));
        }

        // Starting without the up-front check still refuses before touching data.
        let request = TransferRequest {
            mode: TransferMode::Move,
            source: Locator::new(dyn_store.clone(), "a", "k"),
            destination: Locator::new(dyn_store.clone(), "a", "k"),
        };
        let frames = collect(TransferEngine::default().start(
            request,
            None,
            None,
            &CancellationToken::new(),
        ))
        .await;
        assert_eq!(
            frames,
            vec![TransferFrame::error("source and destination are the same object")]
        );
        assert_eq!(store.contents("a", "k").unwrap(), Bytes::from("precious"));

        // Same bucket and key on a different store is a real transfer.
        let other: Arc<dyn ObjectStore> = memory(&["a"]);
        let request = TransferRequest {
            mode: TransferMode::Copy,
            source: Locator::new(dyn_store, "a", "k"),
            destination: Locator::new(other, "a", "k"),
        };
        assert!(request.check_distinct().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_copy_and_ticker() {
        use tokio::io::AsyncWriteExt;

        let stalled = Arc::new(Stalled {
            writers: Mutex::new(Vec::new()),
        });
        let dyn_store: Arc<dyn ObjectStore> = stalled.clone();
        let interval = Duration::from_millis(300);
        let engine = TransferEngine::new(interval, 1024);
        let cancel = CancellationToken::new();
        let request = TransferRequest {
            mode: TransferMode::Copy,
            source: Locator::new(dyn_store.clone(), "a", "slow"),
            destination: Locator::new(dyn_store, "a", "never"),
        };
        let mut stream = engine.start(request, None, None, &cancel);

        assert_eq!(stream.next().await, Some(TransferFrame::progress(0, 1000)));
        tokio::time::sleep(interval * 3).await;
        cancel.cancel();

        // The raw queue only closes once every sender, the ticker's included, is gone.
        let mut frames = stream.frames;
        let rest = tokio::time::timeout(interval, async {
            let mut rest = Vec::new();
            while let Some(frame) = frames.recv().await {
                rest.push(frame);
            }
            rest
        })
        .await
        .expect("transfer and ticker stop within one interval");

        assert_eq!(rest.last(), Some(&TransferFrame::error("transfer cancelled")));
        assert!(rest[..rest.len() - 1]
            .iter()
            .all(|f| matches!(f, TransferFrame::Progress { .. })));

        // The source body was released with the copy.
        let mut writer = stalled.writers.lock().unwrap().pop().unwrap();
        assert!(writer.write_all(b"late").await.is_err());
    }
}
