//! Object storage for originals, extracted text and chunks.
//!
//! Keys are `/`-separated relative paths such as
//! `documents/{org}/{kb}/{id}/proposal.pdf`.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ServiceResult, StorageError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object, replacing any previous content
    async fn put(&self, key: &str, body: Bytes) -> ServiceResult<()>;

    async fn get(&self, key: &str) -> ServiceResult<Bytes>;

    async fn exists(&self, key: &str) -> ServiceResult<bool>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> ServiceResult<Vec<String>>;
}

/// Reject absolute keys, empty segments and parent references
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if invalid {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Object store on the local filesystem.
///
/// Objects live under `{data_dir}/objects`. Writes go to `{data_dir}/staging`
/// first and are renamed into place, so readers never see a partial object.
pub struct FsObjectStore {
    root: PathBuf,
    staging: PathBuf,
}

impl FsObjectStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("objects"),
            staging: data_dir.join("staging"),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    if source.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound {
            key: key.to_string(),
        }
    } else {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: Bytes) -> ServiceResult<()> {
        let path = self.path_for(key)?;
        let io = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::create_dir_all(&self.staging).await.map_err(io)?;

        let tmp = self.staging.join(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &body).await.map_err(io)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io(e).into());
        }

        debug!(key = %key, bytes = body.len(), "Object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> ServiceResult<Bytes> {
        let path = self.path_for(key)?;
        let content = tokio::fs::read(&path).await.map_err(|e| io_error(key, e))?;
        Ok(Bytes::from(content))
    }

    async fn exists(&self, key: &str) -> ServiceResult<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(key, e).into())
    }

    async fn list(&self, prefix: &str) -> ServiceResult<Vec<String>> {
        // Walk from the deepest directory named by the prefix
        let base = match prefix.rsplit_once('/') {
            Some((dir, _)) => {
                validate_key(dir)?;
                dir.to_string()
            }
            None => String::new(),
        };
        let start = if base.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&base)
        };

        let mut keys = Vec::new();
        let mut pending = vec![(start, base)];
        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(prefix, e).into()),
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(prefix, e))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if dir_key.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir_key, name)
                };

                let file_type = entry.file_type().await.map_err(|e| io_error(&key, e))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
