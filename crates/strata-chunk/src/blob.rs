//! Blob store for archived chunks.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use strata_common::{Error, Result};
use tokio::io::AsyncWriteExt;

/// Durable object storage addressed by relative path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` at `path`, replacing anything already there.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Bytes>;
}

/// Blob store rooted at a local directory.
///
/// Writes land in a temporary sibling and are renamed into place, so a
/// reader never sees a partial blob and a repeated put is harmless.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !clean {
            return Err(Error::invalid_config(format!("invalid blob path: {path}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let target = self.resolve(path)?;
        Ok(Bytes::from(tokio::fs::read(&target).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.put("p0/a.chunk", Bytes::from_static(b"v1")).await.unwrap();
        store.put("p0/a.chunk", Bytes::from_static(b"v2")).await.unwrap();
        assert_eq!(store.get("p0/a.chunk").await.unwrap(), Bytes::from_static(b"v2"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("p0"))
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../x", Bytes::new()).await.is_err());
        assert!(store.put("/abs", Bytes::new()).await.is_err());
        assert!(store.get("missing").await.is_err());
    }
}
