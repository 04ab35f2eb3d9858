use anyhow::bail;
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};

use super::{BlobStore, ObjectMeta, StoreError};

/// Blob store backed by a directory tree: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an object path, refusing anything that could leave the root.
    fn object_path(&self, bucket: &str, key: &str) -> anyhow::Result<PathBuf> {
        let mut path = self.root.clone();
        for part in [bucket, key] {
            if part.is_empty() {
                bail!("empty bucket or key");
            }
            for component in Path::new(part).components() {
                match component {
                    Component::Normal(c) => path.push(c),
                    Component::CurDir => {}
                    _ => bail!("object name {part:?} escapes the store root"),
                }
            }
        }
        Ok(path)
    }

    fn map_io(err: io::Error, bucket: &str, key: &str) -> StoreError {
        match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(format!("{bucket}/{key}")),
            io::ErrorKind::TimedOut => StoreError::Timeout(format!("{bucket}/{key}")),
            _ => StoreError::Other(anyhow::Error::new(err).context(format!("reading {bucket}/{key}"))),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        let path = self.object_path(bucket, key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::map_io(e, bucket, key))?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(format!("{bucket}/{key}")));
        }
        Ok(ObjectMeta { size: meta.len() })
    }

    async fn download_object(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        tokio::fs::copy(&path, destination)
            .await
            .map_err(|e| Self::map_io(e, bucket, key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(bucket: &str, key: &str, data: &[u8]) -> (TempDir, LocalBlobStore) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(bucket).join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        let store = LocalBlobStore::new(tmp.path());
        (tmp, store)
    }

    #[tokio::test]
    async fn head_and_download() {
        let (tmp, store) = store_with("uploads", "site/area.kml", b"<kml/>");

        let meta = store.head_object("uploads", "site/area.kml").await.unwrap();
        assert_eq!(meta.size, 6);

        let dest = tmp.path().join("copy.kml");
        store.download_object("uploads", "site/area.kml", &dest).await.unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"<kml/>");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (_tmp, store) = store_with("uploads", "a.kml", b"x");
        let err = store.head_object("uploads", "b.kml").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = store.head_object("uploads", "").await.unwrap_err();
        assert!(matches!(err, StoreError::Other(_)));
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_tmp, store) = store_with("uploads", "a.kml", b"x");
        for (bucket, key) in [("uploads", "../uploads/a.kml"), ("..", "a.kml"), ("uploads", "/etc/passwd")] {
            let err = store.head_object(bucket, key).await.unwrap_err();
            assert!(matches!(err, StoreError::Other(_)), "{bucket}/{key}");
        }
    }
}
