//! Object storage collaborator.
//!
//! Cache entries only keep the key of their blob. Bytes live here.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use md5::Md5;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::StorageError;

/// Stream of blob chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Blob written by [`ObjectStorage::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub size: i64,
    pub sha1: String,
    pub md5: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store the stream under `key`, replacing any previous blob.
    async fn put(&self, key: &str, stream: ByteStream) -> Result<StoredObject, StorageError>;

    async fn read(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Returns `false` if there was nothing to delete.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Move the blob stored under `from` to `to`, replacing any blob there.
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;
}

/// Blobs stored as files under a root directory.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    /// Use `root` as storage directory, creating it if needed.
    pub async fn init<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = std::path::absolute(root)?;
        if !root.exists() {
            fs::create_dir_all(&root).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob stored under `key`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if valid {
            Ok(self.root.join(relative))
        } else {
            Err(StorageError::InvalidKey(key.to_string()))
        }
    }

    async fn write_stream(
        path: &Path,
        mut stream: ByteStream,
    ) -> Result<StoredObject, StorageError> {
        let mut output = fs::File::create_new(path).await?;
        let mut sha1 = Sha1::new();
        let mut md5 = Md5::new();
        let mut size = 0i64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            sha1.update(&chunk);
            md5.update(&chunk);
            size += chunk.len() as i64;
            output.write_all(&chunk).await?;
        }
        output.flush().await?;
        Ok(StoredObject {
            size,
            sha1: hex::encode(sha1.finalize()),
            md5: hex::encode(md5.finalize()),
        })
    }
}

#[async_trait]
impl ObjectStorage for FileSystemStorage {
    async fn put(&self, key: &str, stream: ByteStream) -> Result<StoredObject, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Readers never observe a partially written blob
        let tmp = path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        trace!("writing blob {} into {}", key, tmp.display());
        match Self::write_stream(&tmp, stream).await {
            Ok(stored) => {
                fs::rename(&tmp, &path).await?;
                debug!("stored blob {} ({} bytes)", key, stored.size);
                Ok(stored)
            }
            Err(err) => {
                if let Err(remove_err) = fs::remove_file(&tmp).await {
                    trace!("failed to remove {}: {}", tmp.display(), remove_err);
                }
                Err(err)
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        Ok(Bytes::from(fs::read(path).await?))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("deleted blob {}", key);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(path).await?)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.path_for(from)?;
        let target = self.path_for(to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;
        debug!("moved blob {} to {}", from, to);
        Ok(())
    }
}

/// Single-chunk stream, mostly useful in tests and for small blobs.
pub fn stream_from_bytes(bytes: impl Into<Bytes>) -> ByteStream {
    let bytes: Bytes = bytes.into();
    Box::pin(futures_util::stream::once(async move { Ok(bytes) }))
}
