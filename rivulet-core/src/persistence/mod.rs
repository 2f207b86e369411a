//! Persistence of finished chunks
//!
//! The orchestrator wraps every chunk into a [`PersistedChunk`] carrying its
//! expiration time and deposits it into a [`ChunkSink`]. Two sinks ship with
//! the crate: an in-memory LRU store and a directory writer.

pub mod directory;
pub mod expiration;
pub mod memory;

use bytes::Bytes;
use uuid::Uuid;

pub use directory::{ChunkIndexEntry, DirectoryChunkSink};
pub use expiration::ExpirationPolicy;
pub use memory::{ChunkKey, MemoryChunkSink, MemorySinkConfig, MemorySinkStats};

/// Errors raised by chunk sinks
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Chunk too large: {size} bytes exceeds limit {limit}")]
    ChunkTooLarge { size: u64, limit: u64 },

    #[error("Invalid chunk category: {category:?}")]
    InvalidCategory { category: String },

    #[error("Failed to write chunk index: {reason}")]
    Index { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A chunk ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedChunk {
    pub session_id: Uuid,
    pub category: String,
    pub start_ms: i64,
    pub end_ms: i64,
    /// Epoch milliseconds after which the chunk may be dropped
    pub expires_at_ms: i64,
    pub key_frames: Vec<i64>,
    pub data: Bytes,
    /// Set only on the final chunk of a stream
    pub previous_chunk_last_ms: Option<i64>,
}

impl PersistedChunk {
    pub fn is_last(&self) -> bool {
        self.previous_chunk_last_ms.is_some()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Everything but the payload
    pub fn index_entry(&self) -> ChunkIndexEntry {
        ChunkIndexEntry {
            session_id: self.session_id,
            category: self.category.clone(),
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            expires_at_ms: self.expires_at_ms,
            key_frames: self.key_frames.clone(),
            previous_chunk_last_ms: self.previous_chunk_last_ms,
            size: self.size(),
        }
    }
}

/// Destination of persisted chunks
#[async_trait::async_trait]
pub trait ChunkSink: Send + Sync {
    /// Stores one chunk, keyed by its category and span
    ///
    /// # Errors
    /// - `SinkError` - the chunk could not be stored
    async fn deposit(&self, chunk: PersistedChunk) -> Result<(), SinkError>;
}

/// Chunk categories become path components and cache keys
pub(crate) fn validate_category(category: &str) -> Result<(), SinkError> {
    let invalid = category.is_empty()
        || category == "."
        || category == ".."
        || category.contains(['/', '\\', '\0']);
    if invalid {
        return Err(SinkError::InvalidCategory {
            category: category.to_string(),
        });
    }
    Ok(())
}

/// Wall clock in epoch milliseconds
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_category() {
        assert!(validate_category("camera-1").is_ok());
        assert!(validate_category("").is_err());
        assert!(validate_category("..").is_err());
        assert!(validate_category("a/b").is_err());
        assert!(validate_category("a\\b").is_err());
    }

    #[test]
    fn test_index_entry_drops_payload() {
        let chunk = test_support::chunk("cam", 0, 5000, 64);
        let entry = chunk.index_entry();
        assert_eq!(entry.size, 64);
        assert_eq!(entry.start_ms, 0);
        assert!(!chunk.is_last());
        assert!(!chunk.is_expired(0));
    }
}
