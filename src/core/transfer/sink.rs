//! Byte sources and sinks at the transfer boundary.
//!
//! The sender reads from a [`FileSource`] (random access, known size);
//! the receiver streams into a [`ByteSink`]. Both are capability traits
//! so the engine never touches the embedder's storage directly. When the
//! receiver has no sink, it falls back to an in-memory chunk list
//! assembled at completion.

use crate::core::error::{EngineError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, error};

// ── Source ───────────────────────────────────────────────────────────────────

/// A random-access byte source with a known size.
#[async_trait]
pub trait FileSource: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> u64;

    /// Read exactly `len` bytes at `offset`. Callers never request past
    /// the end.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;
}

/// In-memory source.
pub struct MemorySource {
    name: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl FileSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                EngineError::SinkError(format!("read past end: {offset}+{len}"))
            })?;
        Ok(self.data.slice(start..end))
    }
}

/// Disk-backed source over `tokio::fs`.
pub struct FsSource {
    name: String,
    size: u64,
    file: tokio::sync::Mutex<File>,
}

impl FsSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .map_err(|e| EngineError::SinkError(format!("open {}: {e}", path.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| EngineError::SinkError(format!("stat {}: {e}", path.display())))?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            name,
            size,
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl FileSource for FsSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| EngineError::SinkError(format!("seek: {e}")))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| EngineError::SinkError(format!("read: {e}")))?;
        Ok(Bytes::from(buf))
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────────

/// A streaming write target for an incoming transfer.
#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Flush and finalize. Called exactly once, after the last byte.
    async fn close(&mut self) -> Result<()>;

    /// Discard everything written so far. Called on cancellation.
    async fn abort(&mut self) -> Result<()>;
}

/// In-memory sink with an external handle for reading the result back.
pub struct MemorySink {
    buffers: Arc<Mutex<Vec<Bytes>>>,
}

impl MemorySink {
    pub fn new() -> (Self, MemorySinkHandle) {
        let buffers = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                buffers: Arc::clone(&buffers),
            },
            MemorySinkHandle { buffers },
        )
    }
}

/// Read-side handle to a [`MemorySink`].
#[derive(Clone)]
pub struct MemorySinkHandle {
    buffers: Arc<Mutex<Vec<Bytes>>>,
}

impl MemorySinkHandle {
    pub fn contents(&self) -> Vec<u8> {
        let buffers = self.buffers.lock().expect("sink lock poisoned");
        let mut out = BytesMut::with_capacity(buffers.iter().map(Bytes::len).sum());
        for b in buffers.iter() {
            out.extend_from_slice(b);
        }
        out.to_vec()
    }

    pub fn len(&self) -> usize {
        self.buffers
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .map(Bytes::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.buffers.lock().expect("sink lock poisoned").push(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.buffers.lock().expect("sink lock poisoned").clear();
        Ok(())
    }
}

/// Disk sink: streams into `<dest>.partial`, renamed into place on close
/// so a torn transfer never masquerades as a complete file.
pub struct FileSink {
    dest: PathBuf,
    tmp: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub async fn create(dest: impl Into<PathBuf>) -> Result<Self> {
        let dest = dest.into();
        if let Some(parent) = dest.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let tmp = dest.with_extension("partial");
        let file = File::create(&tmp)
            .await
            .map_err(|e| EngineError::SinkError(format!("create {}: {e}", tmp.display())))?;
        Ok(Self {
            dest,
            tmp,
            file: Some(file),
        })
    }
}

#[async_trait]
impl ByteSink for FileSink {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EngineError::SinkError("sink already closed".into()))?;
        file.write_all(&data)
            .await
            .map_err(|e| EngineError::SinkError(format!("write: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| EngineError::SinkError("sink already closed".into()))?;
        file.flush()
            .await
            .map_err(|e| EngineError::SinkError(format!("flush: {e}")))?;
        drop(file);
        tokio::fs::rename(&self.tmp, &self.dest).await.map_err(|e| {
            error!(
                event = "sink_rename_failure",
                from = %self.tmp.display(),
                to = %self.dest.display(),
                error = %e,
                "Failed to finalize received file"
            );
            EngineError::SinkError(format!("rename: {e}"))
        })?;
        debug!(event = "sink_finalized", path = %self.dest.display());
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.file = None;
        let _ = tokio::fs::remove_file(&self.tmp).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_slices() {
        let src = MemorySource::new("a.bin", Bytes::from_static(b"0123456789"));
        assert_eq!(src.size(), 10);
        assert_eq!(&src.read_at(3, 4).await.unwrap()[..], b"3456");
        assert!(src.read_at(8, 4).await.is_err());
    }

    #[tokio::test]
    async fn memory_sink_accumulates_and_aborts() {
        let (mut sink, handle) = MemorySink::new();
        sink.write(Bytes::from_static(b"ab")).await.unwrap();
        sink.write(Bytes::from_static(b"cd")).await.unwrap();
        assert_eq!(handle.contents(), b"abcd");

        sink.abort().await.unwrap();
        assert!(handle.is_empty());
    }

    #[tokio::test]
    async fn file_sink_renames_on_close_and_cleans_on_abort() {
        let dir = std::env::temp_dir().join(format!("sharefile-sink-{}", std::process::id()));
        let dest = dir.join("out.bin");

        let mut sink = FileSink::create(&dest).await.unwrap();
        sink.write(Bytes::from_static(b"hello")).await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");

        let dest2 = dir.join("gone.bin");
        let mut sink = FileSink::create(&dest2).await.unwrap();
        sink.write(Bytes::from_static(b"junk")).await.unwrap();
        sink.abort().await.unwrap();
        assert!(!dest2.exists());
        assert!(!dest2.with_extension("partial").exists());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn fs_source_reads_ranges() {
        let dir = std::env::temp_dir().join(format!("sharefile-src-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("in.bin");
        tokio::fs::write(&path, b"abcdefgh").await.unwrap();

        let src = FsSource::open(&path).await.unwrap();
        assert_eq!(src.size(), 8);
        assert_eq!(src.name(), "in.bin");
        assert_eq!(&src.read_at(2, 3).await.unwrap()[..], b"cde");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
