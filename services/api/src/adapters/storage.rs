//! services/api/src/adapters/storage.rs
//!
//! Object storage on the local filesystem. Objects are written under a root
//! directory and addressed by a public base URL that the API serves statically.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use storybook_core::ports::{ObjectStorage, PortError, PortResult};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Stores objects as files below `root`; URLs are `{public_base_url}/{key}`.
#[derive(Clone, Debug)]
pub struct FileSystemObjectStorage {
    root: PathBuf,
    public_base_url: String,
}

impl FileSystemObjectStorage {
    /// Creates the storage, making sure the root directory exists.
    pub async fn new(root: impl Into<PathBuf>, public_base_url: &str) -> PortResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| PortError::Unexpected(format!("Cannot create {}: {}", root.display(), e)))?;
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> PortResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(PortError::Upstream(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStorage for FileSystemObjectStorage {
    async fn put(&self, bytes: Bytes, key: &str, content_type: &str) -> PortResult<String> {
        let path = self.object_path(key)?;
        let partial = path.with_extension("partial");

        let write = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            tokio::fs::rename(&partial, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(PortError::Upstream(format!("Failed to store {}: {}", key, e)));
        }

        debug!(key, content_type, size = bytes.len(), "Object stored");
        Ok(format!("{}/{}", self.public_base_url, key))
    }
}
