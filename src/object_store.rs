//! Storage capability consumed by the object handlers and the transfer engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Streaming object body. Boxed and pinned so every store accepts any reader.
pub type ObjectBody<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket not found: {bucket}")]
    BucketNotFound { bucket: String },

    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("invalid object key: {key}")]
    InvalidKey { key: String },

    #[error("source and destination are the same object: {bucket}/{key}")]
    SameObject { bucket: String, key: String },

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::BucketNotFound { .. } | StorageError::ObjectNotFound { .. }
        )
    }

    /// Classify an error reported by a foreign client by its message.
    pub fn from_message(bucket: &str, key: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("nosuchbucket") || lower.contains("bucket does not exist") {
            StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            }
        } else if lower.contains("nosuchkey")
            || lower.contains("not found")
            || lower.contains("does not exist")
        {
            StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        } else {
            StorageError::Other(message)
        }
    }
}

/// Descriptor of a stored object (or a common prefix in non-recursive listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_prefix: bool,
}

impl ObjectInfo {
    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            content_type: None,
            last_modified: None,
            is_prefix: true,
        }
    }
}

/// Readable object plus its size when the store knows it.
pub struct ObjectReader {
    pub body: ObjectBody<'static>,
    pub size: Option<u64>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> StorageResult<Vec<ObjectInfo>>;

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<ObjectReader>;

    /// Store `body` under `key`. `size` is a hint and may be unknown.
    async fn put<'a>(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody<'a>,
        size: Option<u64>,
        content_type: &str,
    ) -> StorageResult<ObjectInfo>;

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo>;
}

/// Reject keys that are empty or could escape their bucket.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|seg| seg == ".." || seg == ".");
    if bad {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Group keys under `prefix` the way a non-recursive listing shows them:
/// direct children as objects, deeper keys collapsed into `dir/` prefixes.
pub fn collapse_listing(prefix: &str, objects: Vec<ObjectInfo>, recursive: bool) -> Vec<ObjectInfo> {
    if recursive {
        return objects;
    }
    let mut out: Vec<ObjectInfo> = Vec::new();
    for obj in objects {
        let rest = &obj.key[prefix.len().min(obj.key.len())..];
        match rest.find('/') {
            Some(idx) => {
                let dir = format!("{}{}", prefix, &rest[..=idx]);
                if !out.iter().any(|o| o.is_prefix && o.key == dir) {
                    out.push(ObjectInfo::prefix(dir));
                }
            }
            None => out.push(obj),
        }
    }
    out
}
