use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::RwLock;
use tokio::io::AsyncReadExt;

use crate::errors::RwLockRecover;
use crate::object_store::{
    collapse_listing, validate_key, ObjectBody, ObjectInfo, ObjectReader, ObjectStore,
    StorageError, StorageResult,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    modified: DateTime<Utc>,
}

impl StoredObject {
    fn info(&self, key: &str) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: self.data.len() as u64,
            content_type: Some(self.content_type.clone()),
            last_modified: Some(self.modified),
            is_prefix: false,
        }
    }
}

/// In-process object store. Objects live in memory for the lifetime of the store.
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buckets<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for name in names {
            store.create_bucket(name);
        }
        store
    }

    pub fn create_bucket(&self, name: impl Into<String>) {
        self.buckets.write_recover().entry(name.into()).or_default();
    }

    /// Insert an object directly, bypassing streaming.
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut buckets = self.buckets.write_recover();
        buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: "application/octet-stream".to_string(),
                modified: Utc::now(),
            },
        );
    }

    pub fn contents(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets
            .read_recover()
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.clone())
    }
}

fn bucket_missing(bucket: &str) -> StorageError {
    StorageError::BucketNotFound {
        bucket: bucket.to_string(),
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> StorageResult<Vec<ObjectInfo>> {
        let buckets = self.buckets.read_recover();
        let objects = buckets.get(bucket).ok_or_else(|| bucket_missing(bucket))?;
        let matched = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| o.info(k))
            .collect();
        Ok(collapse_listing(prefix, matched, recursive))
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<ObjectReader> {
        let buckets = self.buckets.read_recover();
        let objects = buckets.get(bucket).ok_or_else(|| bucket_missing(bucket))?;
        let obj = objects.get(key).ok_or_else(|| StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        Ok(ObjectReader {
            size: Some(obj.data.len() as u64),
            body: Box::pin(Cursor::new(obj.data.clone())),
        })
    }

    async fn put<'a>(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectBody<'a>,
        size: Option<u64>,
        content_type: &str,
    ) -> StorageResult<ObjectInfo> {
        validate_key(key)?;
        if !self.buckets.read_recover().contains_key(bucket) {
            return Err(bucket_missing(bucket));
        }

        let mut data = Vec::with_capacity(size.unwrap_or(0).min(1 << 20) as usize);
        body.read_to_end(&mut data).await?;

        let stored = StoredObject {
            data: Bytes::from(data),
            content_type: content_type.to_string(),
            modified: Utc::now(),
        };
        let info = stored.info(key);
        let mut buckets = self.buckets.write_recover();
        let objects = buckets.get_mut(bucket).ok_or_else(|| bucket_missing(bucket))?;
        objects.insert(key.to_string(), stored);
        Ok(info)
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write_recover();
        let objects = buckets.get_mut(bucket).ok_or_else(|| bucket_missing(bucket))?;
        objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let buckets = self.buckets.read_recover();
        let objects = buckets.get(bucket).ok_or_else(|| bucket_missing(bucket))?;
        objects
            .get(key)
            .map(|o| o.info(key))
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}
