//! Filesystem-backed object store: one directory per bucket, keys as relative paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::object_store::{
    collapse_listing, validate_key, ObjectBody, ObjectInfo, ObjectReader, ObjectStore,
    StorageError, StorageResult,
};

const TEMP_SUFFIX: &str = ".hermes-part";

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
        validate_key(bucket)?;
        fs::create_dir_all(self.root.join(bucket)).await?;
        Ok(())
    }

    async fn bucket_dir(&self, bucket: &str) -> StorageResult<PathBuf> {
        if validate_key(bucket).is_err() || bucket.contains('/') {
            return Err(StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            });
        }
        let dir = self.root.join(bucket);
        match fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_dir(bucket).await?.join(key))
    }
}

fn not_found_or(err: std::io::Error, bucket: &str, key: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        err.into()
    }
}

fn info_from_meta(key: String, meta: &std::fs::Metadata) -> ObjectInfo {
    ObjectInfo {
        key,
        size: meta.len(),
        content_type: None,
        last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        is_prefix: false,
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> StorageResult<Vec<ObjectInfo>> {
        let base = self.bucket_dir(bucket).await?;
        let mut found = Vec::new();
        let mut pending = vec![(base.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(TEMP_SUFFIX) {
                    continue;
                }
                let key = format!("{rel}{name}");
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    let dir_key = format!("{key}/");
                    // Only descend where the prefix can still match.
                    if dir_key.starts_with(prefix) || prefix.starts_with(&dir_key) {
                        pending.push((entry.path(), dir_key));
                    }
                } else if key.starts_with(prefix) {
                    found.push(info_from_meta(key, &meta));
                }
            }
        }

        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(collapse_listing(prefix, found, recursive))
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<ObjectReader> {
        let path = self.object_path(bucket, key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or(e, bucket, key))?;
        let size = file.metadata().await.ok().map(|m| m.len());
        Ok(ObjectReader {
            body: Box::pin(file),
            size,
        })
    }

    async fn put<'a>(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectBody<'a>,
        _size: Option<u64>,
        content_type: &str,
    ) -> StorageResult<ObjectInfo> {
        let path = self.object_path(bucket, key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename, so readers never see a partial
        // object. Each put gets its own temp file; the last rename wins.
        let temp = PathBuf::from(format!(
            "{}.{:016x}{}",
            path.display(),
            rand::random::<u64>(),
            TEMP_SUFFIX
        ));
        let written = async {
            let mut writer = BufWriter::new(fs::File::create(&temp).await?);
            let size = tokio::io::copy(&mut body, &mut writer).await?;
            writer.flush().await?;
            let file = writer.into_inner();
            file.sync_all().await?;
            let meta = file.metadata().await?;
            fs::rename(&temp, &path).await?;
            Ok::<_, std::io::Error>((size, meta))
        }
        .await;

        let (size, meta) = match written {
            Ok(done) => done,
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                return Err(e.into());
            }
        };

        // A concurrent put may already have replaced the file; report what this one wrote.
        let mut info = info_from_meta(key.to_string(), &meta);
        info.size = size;
        info.content_type = Some(content_type.to_string());
        Ok(info)
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = self.object_path(bucket, key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or(e, bucket, key))
    }

    async fn stat(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let path = self.object_path(bucket, key).await?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or(e, bucket, key))?;
        if meta.is_dir() {
            return Err(StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(info_from_meta(key.to_string(), &meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn store_with_bucket() -> (FsObjectStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let store = FsObjectStore::new(dir.path());
        store.create_bucket("media").await.unwrap();
        (store, dir)
    }

    async fn put_str(store: &FsObjectStore, key: &str, data: &'static str) {
        let body: ObjectBody<'_> = Box::pin(data.as_bytes());
        store.put("media", key, body, None, "text/plain").await.unwrap();
    }

    #[tokio::test]
    async fn put_then_get_streams_back_contents() {
        let (store, _dir) = store_with_bucket().await;
        put_str(&store, "nested/dir/file.txt", "payload").await;

        let mut reader = store.get("media", "nested/dir/file.txt").await.unwrap();
        assert_eq!(reader.size, Some(7));
        let mut out = String::new();
        reader.body.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "payload");
        assert_eq!(store.stat("media", "nested/dir/file.txt").await.unwrap().size, 7);
    }

    #[tokio::test]
    async fn listing_respects_prefix_and_recursion() {
        let (store, _dir) = store_with_bucket().await;
        put_str(&store, "a.txt", "1").await;
        put_str(&store, "img/x.png", "22").await;
        put_str(&store, "img/deep/y.png", "333").await;

        let flat = store.list("media", "", false).await.unwrap();
        let keys: Vec<_> = flat.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a.txt", "img/"]);

        let deep = store.list("media", "img/", true).await.unwrap();
        let keys: Vec<_> = deep.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["img/deep/y.png", "img/x.png"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_puts_to_one_key_never_mix() {
        let (store, dir) = store_with_bucket().await;
        let big = vec![b'A'; 2 << 20];
        let small = vec![b'B'; 1 << 20];

        for _ in 0..5 {
            let (first, second) = tokio::join!(
                store.put("media", "obj", Box::pin(&big[..]), None, "application/octet-stream"),
                store.put("media", "obj", Box::pin(&small[..]), None, "application/octet-stream"),
            );
            assert_eq!(first.unwrap().size, big.len() as u64);
            assert_eq!(second.unwrap().size, small.len() as u64);

            let stored = std::fs::read(dir.path().join("media/obj")).unwrap();
            assert!(stored == big || stored == small, "stored object mixes both writes");
        }

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("media"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn missing_things_are_classified() {
        let (store, _dir) = store_with_bucket().await;
        assert!(matches!(
            store.list("ghost", "", true).await,
            Err(StorageError::BucketNotFound { .. })
        ));
        assert!(matches!(
            store.stat("media", "nope").await,
            Err(StorageError::ObjectNotFound { .. })
        ));
        assert!(store.delete("media", "nope").await.unwrap_err().is_not_found());
        assert!(matches!(
            store.get("media", "../escape").await,
            Err(StorageError::InvalidKey { .. })
        ));
    }
}
