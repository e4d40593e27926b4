//! # File Sink / File Source
//!
//! The two external collaborators the protocol core delegates to instead of
//! touching a filesystem directly: where completed transfers are written,
//! and where outgoing transfers read their bytes from. See SPEC_FULL.md §6.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Persists a reassembled file. The protocol core does not choose a
/// directory or resolve name collisions; that is entirely up to the
/// implementation (default policy: the user's Downloads folder, numeric
/// suffix on collision).
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Persist `bytes` under `filename`. Returns `Error::SinkError` on any
    /// failure; the receiver session treats this as terminal for the
    /// transfer.
    async fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<()>;
}

/// Reads the bytes of a file a user has chosen to send.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Read `path`, returning its basename and full contents.
    async fn read(&self, path: &str) -> Result<(String, Vec<u8>)>;
}

/// An in-memory [`FileSink`] for tests: records every delivered file rather
/// than touching a filesystem.
#[derive(Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every file delivered so far, in delivery order.
    pub fn delivered(&self) -> Vec<(String, Vec<u8>)> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl FileSink for MemorySink {
    async fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        self.delivered.lock().push((filename.to_string(), bytes.to_vec()));
        Ok(())
    }
}

/// Persists completed transfers under a fixed directory, appending a
/// numeric suffix on a filename collision rather than overwriting.
///
/// The protocol core never resolves a directory itself (per SPEC_FULL.md
/// §6, that choice belongs to the sink); this is the concrete
/// implementation a real application wires up, with the default directory
/// left to the caller rather than guessed via platform-specific APIs.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Deliver files under `dir`, creating it if it doesn't exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Pick a non-colliding path for `filename` inside `dir`: the bare name
    /// if free, else `name (1).ext`, `name (2).ext`, ...
    fn available_path(&self, filename: &str) -> PathBuf {
        let candidate = self.dir.join(filename);
        if !candidate.exists() {
            return candidate;
        }

        let path = Path::new(filename);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
        let ext = path.extension().and_then(|s| s.to_str());

        for n in 1u32.. {
            let name = match ext {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            let candidate = self.dir.join(&name);
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!("u32 suffix space exhausted")
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::SinkError(e.to_string()))?;
        let path = self.available_path(filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Error::SinkError(e.to_string()))
    }
}

/// Reads a file from disk by path, for a sender offering a local file.
pub struct PathFileSource;

#[async_trait]
impl FileSource for PathFileSource {
    async fn read(&self, path: &str) -> Result<(String, Vec<u8>)> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::SourceError(e.to_string()))?;
        let filename = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::SourceError(format!("path {path} has no filename component")))?
            .to_string();
        Ok((filename, bytes))
    }
}

/// An in-memory [`FileSource`] for tests: serves fixed bytes regardless of
/// the requested path.
pub struct MemorySource {
    filename: String,
    bytes: Vec<u8>,
}

impl MemorySource {
    /// Create a source that always returns `(filename, bytes)`.
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { filename: filename.into(), bytes }
    }
}

#[async_trait]
impl FileSource for MemorySource {
    async fn read(&self, _path: &str) -> Result<(String, Vec<u8>)> {
        Ok((self.filename.clone(), self.bytes.clone()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_delivery() {
        let sink = MemorySink::new();
        sink.deliver("report.pdf", b"hello").await.unwrap();
        assert_eq!(sink.delivered(), vec![("report.pdf".to_string(), b"hello".to_vec())]);
    }

    #[tokio::test]
    async fn test_memory_source_returns_fixed_bytes() {
        let source = MemorySource::new("report.pdf", b"hello".to_vec());
        let (name, bytes) = source.read("/any/path").await.unwrap();
        assert_eq!(name, "report.pdf");
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_directory_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        sink.deliver("report.pdf", b"hello mesh").await.unwrap();

        let bytes = tokio::fs::read(dir.path().join("report.pdf")).await.unwrap();
        assert_eq!(bytes, b"hello mesh");
    }

    #[tokio::test]
    async fn test_directory_sink_appends_numeric_suffix_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        sink.deliver("report.pdf", b"first").await.unwrap();
        sink.deliver("report.pdf", b"second").await.unwrap();

        assert_eq!(tokio::fs::read(dir.path().join("report.pdf")).await.unwrap(), b"first");
        assert_eq!(tokio::fs::read(dir.path().join("report (1).pdf")).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_path_file_source_reads_basename_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"contents").await.unwrap();

        let source = PathFileSource;
        let (name, bytes) = source.read(path.to_str().unwrap()).await.unwrap();
        assert_eq!(name, "notes.txt");
        assert_eq!(bytes, b"contents");
    }
}
