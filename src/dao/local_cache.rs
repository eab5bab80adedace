//! File-backed local cache holding one serialized [`LocalCacheRecord`] per storage key.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::dao::models::LocalCacheRecord;

/// Convenient result alias returning [`CacheError`] failures.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failures that can occur while reading or writing the local cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache file or its directory could not be read or written.
    #[error("local cache I/O failed for `{path}`")]
    Io {
        /// Cache file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The stored record is not valid JSON for the expected shape.
    #[error("local cache record `{path}` is corrupt")]
    Corrupt {
        /// Cache file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: serde_json::Error,
    },
    /// The record could not be serialized before writing.
    #[error("failed to encode local cache record for `{path}`")]
    Encode {
        /// Cache file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Durable client-local storage for a single activity record.
#[derive(Debug, Clone)]
pub struct LocalCache {
    storage_key: Arc<str>,
    path: Arc<Path>,
}

impl LocalCache {
    /// Cache addressed by `storage_key` inside `directory`.
    pub fn new(directory: impl AsRef<Path>, storage_key: impl Into<String>) -> Self {
        let storage_key: String = storage_key.into();
        let path = directory.as_ref().join(file_name(&storage_key));
        Self {
            storage_key: Arc::from(storage_key),
            path: Arc::from(path),
        }
    }

    /// Storage key this cache reads and writes.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored record; `None` when nothing was cached yet.
    pub async fn read(&self) -> CacheResult<Option<LocalCacheRecord>> {
        let bytes = match fs::read(&*self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Io {
                    path: self.path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Corrupt {
                path: self.path.to_path_buf(),
                source,
            })
    }

    /// Replace the stored record. The file is swapped in atomically so a crash mid-write
    /// leaves the previous record intact.
    pub async fn write(&self, record: &LocalCacheRecord) -> CacheResult<()> {
        let encoded = serde_json::to_vec_pretty(record).map_err(|source| CacheError::Encode {
            path: self.path.to_path_buf(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|source| CacheError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, encoded)
            .await
            .map_err(|source| CacheError::Io {
                path: staging.clone(),
                source,
            })?;
        fs::rename(&staging, &*self.path)
            .await
            .map_err(|source| CacheError::Io {
                path: self.path.to_path_buf(),
                source,
            })?;

        debug!(storage_key = %self.storage_key, "local cache record written");
        Ok(())
    }

    /// Drop the stored record, if any.
    pub async fn clear(&self) -> CacheResult<()> {
        match fs::remove_file(&*self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                path: self.path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Map a storage key onto a file name, replacing anything outside `[A-Za-z0-9_-]`.
fn file_name(storage_key: &str) -> String {
    let sanitized: String = storage_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{sanitized}.json")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;

    fn record(score: u64) -> LocalCacheRecord {
        LocalCacheRecord {
            state: json!({ "score": score }),
            cached_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            total_elapsed_time: 90,
            session_elapsed_time: 30,
        }
    }

    #[tokio::test]
    async fn missing_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "progress::quiz");
        assert_eq!(cache.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_then_read_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path().join("nested"), "progress::quiz");

        cache.write(&record(1)).await.unwrap();
        cache.write(&record(2)).await.unwrap();

        assert_eq!(cache.read().await.unwrap(), Some(record(2)));
        assert!(cache.path().ends_with("progress__quiz.json"));
    }

    #[tokio::test]
    async fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "progress::quiz");
        tokio::fs::write(cache.path(), b"{not json").await.unwrap();

        let err = cache.read().await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path(), "progress::farm");
        cache.write(&record(5)).await.unwrap();

        cache.clear().await.unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.read().await.unwrap(), None);
    }
}
