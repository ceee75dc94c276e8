//! # File Sources
//!
//! An outgoing transfer reads its payload through a [`FileSource`]: a
//! random-access byte source of known size. The transfer engine never holds
//! file bytes beyond the chunk it is currently framing, so multi-gigabyte
//! assets stream through a bounded window.
//!
//! Two implementations are provided: [`BytesSource`] wraps an in-memory
//! buffer (pasted images, exported snapshots), and [`FsSource`] reads from
//! disk via `tokio::fs` on native platforms.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A readable, random-access byte source for an outgoing transfer.
///
/// `read` may suspend (disk, OPFS, network-backed blobs); it is the only
/// suspension point on the outgoing path besides the timers.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Read the half-open range `[start, end)`.
    ///
    /// Callers only request ranges inside `[0, size())`; implementations
    /// should clamp rather than panic if handed more.
    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>>;
}

/// Metadata describing a completed (or in-flight) file, surfaced alongside
/// the assembled bytes when an incoming transfer finalizes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileMetadata {
    /// The transfer id the file arrived under.
    pub id: String,
    /// Display name from the sender.
    pub name: String,
    /// MIME type, if the sender knew one. Consumers fall back to
    /// `application/octet-stream`.
    pub mime: Option<String>,
    /// Total size in bytes.
    pub size: u64,
}

impl FileMetadata {
    /// MIME type with the octet-stream fallback applied.
    pub fn mime_or_default(&self) -> &str {
        self.mime.as_deref().unwrap_or("application/octet-stream")
    }
}

// ============================================================================
// IN-MEMORY SOURCE
// ============================================================================

/// A [`FileSource`] over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    /// Wrap a byte buffer.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl FileSource for BytesSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let len = self.data.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        Ok(self.data[start..end.max(start)].to_vec())
    }
}

// ============================================================================
// FILESYSTEM SOURCE (native)
// ============================================================================

/// A [`FileSource`] backed by a file on disk.
///
/// Each `read` opens the file and seeks; transfers read at most
/// `MAX_IN_FLIGHT_CHUNKS` slices between ACKs, so the open cost is noise
/// next to the network round-trips and keeps the source shareable without
/// interior mutability.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone)]
pub struct FsSource {
    path: std::path::PathBuf,
    size: u64,
}

#[cfg(not(target_arch = "wasm32"))]
impl FsSource {
    /// Open a file and capture its current size.
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        Ok(Self {
            size: meta.len(),
            path,
        })
    }

    /// The path this source reads from.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl FileSource for FsSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let start = start.min(self.size);
        let end = end.clamp(start, self.size);

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bytes_source_reads_ranges() {
        let source = BytesSource::new(b"0123456789".to_vec());
        assert_eq!(source.size(), 10);
        assert_eq!(source.read(0, 4).await.unwrap(), b"0123");
        assert_eq!(source.read(4, 10).await.unwrap(), b"456789");
        assert_eq!(source.read(8, 20).await.unwrap(), b"89");
        assert!(source.read(12, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bytes_source_empty() {
        let source = BytesSource::new(Vec::new());
        assert_eq!(source.size(), 0);
        assert!(source.read(0, 1).await.unwrap().is_empty());
    }

    #[test]
    fn test_metadata_mime_fallback() {
        let meta = FileMetadata {
            id: "t-1".into(),
            name: "board.png".into(),
            mime: None,
            size: 3,
        };
        assert_eq!(meta.mime_or_default(), "application/octet-stream");

        let meta = FileMetadata {
            mime: Some("image/png".into()),
            ..meta
        };
        assert_eq!(meta.mime_or_default(), "image/png");
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_fs_source_round_trip() {
        use std::io::Write as _;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello from disk").unwrap();
        tmp.flush().unwrap();

        let source = FsSource::open(tmp.path()).await.unwrap();
        assert_eq!(source.size(), 15);
        assert_eq!(source.read(0, 5).await.unwrap(), b"hello");
        assert_eq!(source.read(6, 15).await.unwrap(), b"from disk");
    }
}
