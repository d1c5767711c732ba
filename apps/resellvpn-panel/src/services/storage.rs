use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Object storage collaborator for receipt images.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get(&self, name: &str) -> Result<Vec<u8>>;
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<()>;
    async fn delete(&self, names: &[String]) -> Result<()>;
}

/// Filesystem-backed store. Object names may contain `/` separators; parent
/// directories are created on demand.
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.path_for(name))
            .await
            .with_context(|| format!("Failed to read object {}", name))
    }

    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create object directory")?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write object {}", name))
    }

    async fn delete(&self, names: &[String]) -> Result<()> {
        for name in names {
            match tokio::fs::remove_file(self.path_for(name)).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete object {}", name));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStorage::new(dir.path());

        store
            .upload("receipts/tmp/abc.jpg", b"image-bytes")
            .await
            .unwrap();
        let bytes = store.get("receipts/tmp/abc.jpg").await.unwrap();
        assert_eq!(bytes, b"image-bytes");

        store
            .delete(&["receipts/tmp/abc.jpg".to_string()])
            .await
            .unwrap();
        assert!(store.get("receipts/tmp/abc.jpg").await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStorage::new(dir.path());
        store.delete(&["missing.jpg".to_string()]).await.unwrap();
    }
}
