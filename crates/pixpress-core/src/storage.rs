//! Storage adapters for source and compressed files.
//!
//! Keys are `/`-separated relative paths. The pipeline only needs to open,
//! create, and delete objects, plus build sibling keys.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed reader returned by [`Storage::open`].
pub type StorageReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer returned by [`Storage::create`].
pub type StorageWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Object or local storage backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open an existing object for reading.
    async fn open(&self, key: &str) -> io::Result<StorageReader>;

    /// Create (or truncate) an object for writing.
    async fn create(&self, key: &str) -> io::Result<StorageWriter>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> io::Result<()>;

    /// Build the key of `name` inside the directory `dir`.
    fn join(&self, dir: &str, name: &str) -> String {
        let dir = dir.trim_end_matches('/');
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    }
}

/// Directory part of a key (empty for top-level keys).
pub fn parent_key(key: &str) -> &str {
    key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Filesystem storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root, rejecting escapes.
    pub fn resolve(&self, key: &str) -> io::Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
        });
        if key.is_empty() || escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage key: {key:?}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn open(&self, key: &str) -> io::Result<StorageReader> {
        let file = tokio::fs::File::open(self.resolve(key)?).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, key: &str) -> io::Result<StorageWriter> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        tokio::fs::remove_file(self.resolve(key)?).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::{mpsc, Semaphore};

    /// Local storage whose reads report the key being opened and then wait
    /// for a permit on the gate.
    pub(crate) struct GatedStorage {
        inner: LocalStorage,
        opened: mpsc::UnboundedSender<String>,
        gate: Arc<Semaphore>,
    }

    impl GatedStorage {
        pub(crate) fn new(
            root: &Path,
        ) -> (Self, mpsc::UnboundedReceiver<String>, Arc<Semaphore>) {
            let (opened, opened_rx) = mpsc::unbounded_channel();
            let gate = Arc::new(Semaphore::new(0));
            let storage = Self {
                inner: LocalStorage::new(root),
                opened,
                gate: gate.clone(),
            };
            (storage, opened_rx, gate)
        }
    }

    #[async_trait]
    impl Storage for GatedStorage {
        async fn open(&self, key: &str) -> io::Result<StorageReader> {
            let _ = self.opened.send(key.to_string());
            self.gate.acquire().await.map_err(io::Error::other)?.forget();
            self.inner.open(key).await
        }

        async fn create(&self, key: &str) -> io::Result<StorageWriter> {
            self.inner.create(key).await
        }

        async fn delete(&self, key: &str) -> io::Result<()> {
            self.inner.delete(key).await
        }
    }

    #[test]
    fn test_join_and_parent_key() {
        let storage = LocalStorage::new("/tmp");
        assert_eq!(storage.join("uploads", "a.webp"), "uploads/a.webp");
        assert_eq!(storage.join("uploads/", "a.webp"), "uploads/a.webp");
        assert_eq!(storage.join("", "a.webp"), "a.webp");

        assert_eq!(parent_key("uploads/2024/a.png"), "uploads/2024");
        assert_eq!(parent_key("a.png"), "");
    }

    #[test]
    fn test_resolve_rejects_escaping_keys() {
        let storage = LocalStorage::new("/srv/files");
        assert!(storage.resolve("../etc/passwd").is_err());
        assert!(storage.resolve("/etc/passwd").is_err());
        assert!(storage.resolve("").is_err());
        assert_eq!(
            storage.resolve("uploads/a.png").unwrap(),
            PathBuf::from("/srv/files/uploads/a.png")
        );
    }

    #[tokio::test]
    async fn test_create_open_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let mut writer = storage.create("nested/dir/file.bin").await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = storage.open("nested/dir/file.bin").await.unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello");

        storage.delete("nested/dir/file.bin").await.unwrap();
        let err = storage.open("nested/dir/file.bin").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
