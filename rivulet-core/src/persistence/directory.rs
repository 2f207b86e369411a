//! Directory chunk sink
//!
//! Writes each chunk as `<root>/<category>/<start>-<end>.<ext>` with a JSON
//! sidecar `<start>-<end>.json` holding its span, key frames and expiration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChunkSink, PersistedChunk, SinkError, validate_category};

/// Sidecar describing one stored chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIndexEntry {
    pub session_id: Uuid,
    pub category: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub expires_at_ms: i64,
    pub key_frames: Vec<i64>,
    pub previous_chunk_last_ms: Option<i64>,
    pub size: u64,
}

impl ChunkIndexEntry {
    fn stem(&self) -> String {
        chunk_stem(self.start_ms, self.end_ms)
    }
}

fn chunk_stem(start_ms: i64, end_ms: i64) -> String {
    format!("{start_ms}-{end_ms}")
}

/// Chunk sink backed by a directory tree
#[derive(Debug, Clone)]
pub struct DirectoryChunkSink {
    root: PathBuf,
    extension: String,
}

impl DirectoryChunkSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "chunk".to_string(),
        }
    }

    /// File extension of chunk payloads, e.g. "ts" or "mp4"
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_path(&self, category: &str, start_ms: i64, end_ms: i64) -> PathBuf {
        self.root
            .join(category)
            .join(format!("{}.{}", chunk_stem(start_ms, end_ms), self.extension))
    }

    fn index_path(&self, category: &str, start_ms: i64, end_ms: i64) -> PathBuf {
        self.root
            .join(category)
            .join(format!("{}.json", chunk_stem(start_ms, end_ms)))
    }

    /// Index entries stored for `category`, ordered by start time
    ///
    /// # Errors
    /// - `SinkError::Io` - the category directory could not be read
    /// - `SinkError::Index` - a sidecar is not valid JSON
    pub async fn list(&self, category: &str) -> Result<Vec<ChunkIndexEntry>, SinkError> {
        validate_category(category)?;
        let dir = self.root.join(category);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            let entry: ChunkIndexEntry =
                serde_json::from_slice(&raw).map_err(|e| SinkError::Index {
                    reason: format!("{}: {e}", path.display()),
                })?;
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.start_ms);
        Ok(entries)
    }

    /// Deletes chunks of `category` that expired by `now_ms`, returning how
    /// many were removed
    ///
    /// # Errors
    /// - Errors from [`list`](Self::list) and file removal
    pub async fn purge_expired(&self, category: &str, now_ms: i64) -> Result<usize, SinkError> {
        let mut removed = 0;
        for entry in self.list(category).await? {
            if now_ms < entry.expires_at_ms {
                continue;
            }
            let payload = self.chunk_path(category, entry.start_ms, entry.end_ms);
            if let Err(e) = tokio::fs::remove_file(&payload).await {
                warn!("Could not remove expired chunk {}: {}", payload.display(), e);
            }
            tokio::fs::remove_file(self.index_path(category, entry.start_ms, entry.end_ms)).await?;
            debug!("Purged expired chunk {}/{}", category, entry.stem());
            removed += 1;
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl ChunkSink for DirectoryChunkSink {
    async fn deposit(&self, chunk: PersistedChunk) -> Result<(), SinkError> {
        validate_category(&chunk.category)?;
        let dir = self.root.join(&chunk.category);
        tokio::fs::create_dir_all(&dir).await?;

        let payload = self.chunk_path(&chunk.category, chunk.start_ms, chunk.end_ms);
        tokio::fs::write(&payload, &chunk.data).await?;

        let entry = chunk.index_entry();
        let json = serde_json::to_vec_pretty(&entry).map_err(|e| SinkError::Index {
            reason: e.to_string(),
        })?;
        // Sidecar last: a chunk is listed only once its payload is complete
        tokio::fs::write(
            self.index_path(&chunk.category, chunk.start_ms, chunk.end_ms),
            json,
        )
        .await?;

        debug!(
            "Stored chunk {} ({} bytes)",
            payload.display(),
            entry.size
        );
        Ok(())
    }
}
