//! Archive sinks for DLQ entries removed from the stream.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::domain::{DeliveryError, DlqEntry};

/// Destination for archived DLQ entries.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Persist `entries`, returning how many were written.
    async fn store(&self, entries: &[DlqEntry]) -> Result<usize, DeliveryError>;

    /// Where entries go, for logs and API responses.
    fn location(&self) -> String;
}

/// Appends entries as JSON lines, one file per UTC day.
#[derive(Debug, Clone)]
pub struct JsonLinesArchive {
    dir: PathBuf,
}

impl JsonLinesArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File receiving today's entries.
    #[must_use]
    pub fn current_file(&self) -> PathBuf {
        self.dir
            .join(format!("dlq-archive-{}.jsonl", Utc::now().format("%Y-%m-%d")))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ArchiveSink for JsonLinesArchive {
    async fn store(&self, entries: &[DlqEntry]) -> Result<usize, DeliveryError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut buffer = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry)
                .map_err(|e| DeliveryError::Archive(e.to_string()))?;
            buffer.push(b'\n');
        }

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DeliveryError::Archive(format!("{}: {e}", self.dir.display())))?;
        let path = self.current_file();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| DeliveryError::Archive(format!("{}: {e}", path.display())))?;
        file.write_all(&buffer)
            .await
            .map_err(|e| DeliveryError::Archive(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| DeliveryError::Archive(e.to_string()))?;

        info!(path = %path.display(), count = entries.len(), "DLQ entries archived");
        Ok(entries.len())
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Keeps archived entries in memory.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    entries: Mutex<Vec<DlqEntry>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<DlqEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchive {
    async fn store(&self, entries: &[DlqEntry]) -> Result<usize, DeliveryError> {
        self.entries.lock().extend_from_slice(entries);
        Ok(entries.len())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
