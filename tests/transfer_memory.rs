//! A large transfer must run in bounded memory. Kept in its own test binary
//! because it installs a counting global allocator.

use async_trait::async_trait;
use futures::StreamExt;
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use hermes::object_store::{
    ObjectBody, ObjectInfo, ObjectReader, ObjectStore, StorageError, StorageResult,
};
use hermes::transfer::{Locator, TransferEngine, TransferFrame, TransferMode, TransferRequest};

struct PeakAlloc;

static CURRENT: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for PeakAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            let now = CURRENT.fetch_add(layout.size(), Ordering::Relaxed) + layout.size();
            PEAK.fetch_max(now, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        CURRENT.fetch_sub(layout.size(), Ordering::Relaxed);
    }
}

#[global_allocator]
static ALLOC: PeakAlloc = PeakAlloc;

/// Serves every key as `size` zero bytes generated on the fly.
struct Generated {
    size: u64,
}

/// Discards everything written, remembering only the byte count.
#[derive(Default)]
struct Discard {
    written: AtomicU64,
}

fn unsupported() -> StorageError {
    StorageError::Other("unsupported".into())
}

#[async_trait]
impl ObjectStore for Generated {
    async fn list(&self, _: &str, _: &str, _: bool) -> StorageResult<Vec<ObjectInfo>> {
        Err(unsupported())
    }

    async fn get(&self, _: &str, _: &str) -> StorageResult<ObjectReader> {
        Ok(ObjectReader {
            body: Box::pin(tokio::io::repeat(0).take(self.size)),
            size: Some(self.size),
        })
    }

    async fn put<'a>(
        &self,
        _: &str,
        _: &str,
        _: ObjectBody<'a>,
        _: Option<u64>,
        _: &str,
    ) -> StorageResult<ObjectInfo> {
        Err(unsupported())
    }

    async fn delete(&self, _: &str, _: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn stat(&self, _: &str, key: &str) -> StorageResult<ObjectInfo> {
        Ok(ObjectInfo {
            key: key.to_string(),
            size: self.size,
            content_type: None,
            last_modified: None,
            is_prefix: false,
        })
    }
}

#[async_trait]
impl ObjectStore for Discard {
    async fn list(&self, _: &str, _: &str, _: bool) -> StorageResult<Vec<ObjectInfo>> {
        Ok(Vec::new())
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<ObjectReader> {
        Err(StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    async fn put<'a>(
        &self,
        _: &str,
        key: &str,
        mut body: ObjectBody<'a>,
        _: Option<u64>,
        _: &str,
    ) -> StorageResult<ObjectInfo> {
        let n = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        self.written.fetch_add(n, Ordering::Relaxed);
        Ok(ObjectInfo {
            key: key.to_string(),
            size: n,
            content_type: None,
            last_modified: None,
            is_prefix: false,
        })
    }

    async fn delete(&self, _: &str, _: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        Err(StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

async fn peak_growth(size: u64) -> usize {
    let engine = TransferEngine::new(Duration::from_millis(5), 64 * 1024);
    let dest = Arc::new(Discard::default());
    let request = TransferRequest {
        mode: TransferMode::Copy,
        source: Locator::new(Arc::new(Generated { size }), "src", "blob.bin"),
        destination: Locator::new(dest.clone(), "dst", "blob.bin"),
    };

    let baseline = CURRENT.load(Ordering::Relaxed);
    PEAK.store(baseline, Ordering::Relaxed);

    let stream = engine
        .transfer(request, None, &CancellationToken::new())
        .await
        .unwrap();
    let frames: Vec<TransferFrame> = stream.collect().await;

    assert_eq!(frames.last(), Some(&TransferFrame::done(size, size)));
    assert_eq!(dest.written.load(Ordering::Relaxed), size);
    PEAK.load(Ordering::Relaxed).saturating_sub(baseline)
}

#[tokio::test]
async fn large_copy_uses_bounded_memory() {
    const MIB: u64 = 1024 * 1024;

    // Warm up the runtime so one-off allocations are not charged to the big run.
    let small = peak_growth(MIB).await;
    let large = peak_growth(64 * MIB).await;

    assert!(
        large < 4 * MIB as usize,
        "64 MiB copy grew the heap by {large} bytes"
    );
    assert!(
        large < small + 2 * MIB as usize,
        "peak grew with object size: small={small} large={large}"
    );
}
