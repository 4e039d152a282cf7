//! Local side of a transfer: where outgoing bytes come from and incoming
//! bytes go.

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};

pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Opens local files for a transfer.
pub trait LocalStorage: Send + Sync {
    /// Size of an existing file in bytes.
    fn size<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, u64>;

    fn open_read<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, LocalReader>;

    /// Creates (or truncates) the destination of an incoming transfer.
    fn create<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, LocalWriter>;
}

/// Files on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskStorage;

impl LocalStorage for DiskStorage {
    fn size<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, u64> {
        Box::pin(async move { Ok(tokio::fs::metadata(path).await?.len()) })
    }

    fn open_read<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, LocalReader> {
        Box::pin(async move {
            let file = tokio::fs::File::open(path).await?;
            Ok(Box::new(file) as LocalReader)
        })
    }

    fn create<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, LocalWriter> {
        Box::pin(async move {
            let file = tokio::fs::File::create(path).await?;
            Ok(Box::new(file) as LocalWriter)
        })
    }
}

type FileMap = Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>;

/// In-memory files keyed by path.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    files: FileMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), data.into());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path.as_ref())
            .cloned()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file: {}", path.display()),
    )
}

impl LocalStorage for MemoryStorage {
    fn size<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, u64> {
        let size = self.get(path).map(|data| data.len() as u64);
        Box::pin(async move { size.ok_or_else(|| not_found(path)) })
    }

    fn open_read<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, LocalReader> {
        let data = self.get(path);
        Box::pin(async move {
            let data = data.ok_or_else(|| not_found(path))?;
            Ok(Box::new(Cursor::new(data)) as LocalReader)
        })
    }

    fn create<'a>(&'a self, path: &'a Path) -> StorageFuture<'a, LocalWriter> {
        self.insert(path, Vec::new());
        let writer = MemoryWriter {
            files: Arc::clone(&self.files),
            path: path.to_path_buf(),
        };
        Box::pin(async move { Ok(Box::new(writer) as LocalWriter) })
    }
}

struct MemoryWriter {
    files: FileMap,
    path: PathBuf,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        let path = Path::new("/out/file.bin");
        let mut writer = storage.create(path).await.unwrap();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(storage.size(path).await.unwrap(), 11);
        let mut reader = storage.open_read(path).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn memory_storage_missing_file() {
        let storage = MemoryStorage::new();
        let err = storage.size(Path::new("/nope")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(storage.open_read(Path::new("/nope")).await.is_err());
    }

    #[tokio::test]
    async fn disk_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let storage = DiskStorage;
        let mut writer = storage.create(&path).await.unwrap();
        writer.write_all(b"abc").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        assert_eq!(storage.size(&path).await.unwrap(), 3);
    }
}
