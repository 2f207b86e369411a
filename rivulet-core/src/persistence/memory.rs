//! In-memory chunk sink
//!
//! Keeps chunks in an LRU map bounded by entry count and total payload
//! bytes, and sweeps expired chunks on an interval.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ChunkSink, PersistedChunk, SinkError, now_millis, validate_category};
use crate::config::PersistenceConfig;

/// Identity of a stored chunk
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub category: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl ChunkKey {
    pub fn new(category: impl Into<String>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            category: category.into(),
            start_ms,
            end_ms,
        }
    }

    fn of(chunk: &PersistedChunk) -> Self {
        Self::new(chunk.category.clone(), chunk.start_ms, chunk.end_ms)
    }
}

/// Configuration for [`MemoryChunkSink`]
#[derive(Debug, Clone)]
pub struct MemorySinkConfig {
    pub max_chunks: usize,
    pub max_total_bytes: u64,
    /// Sweep expired chunks in the background
    pub enable_sweep: bool,
    pub sweep_interval: Duration,
}

impl Default for MemorySinkConfig {
    fn default() -> Self {
        Self::from(&PersistenceConfig::default())
    }
}

impl From<&PersistenceConfig> for MemorySinkConfig {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            max_chunks: config.memory_max_chunks,
            max_total_bytes: config.memory_max_bytes,
            enable_sweep: true,
            sweep_interval: config.sweep_interval,
        }
    }
}

/// Sink statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySinkStats {
    pub chunk_count: usize,
    pub total_bytes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Chunks dropped to stay within the count or byte limit
    pub eviction_count: u64,
    /// Chunks dropped because they expired
    pub expired_count: u64,
}

struct SinkState {
    cache: RwLock<LruCache<ChunkKey, PersistedChunk>>,
    total_bytes: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    eviction_count: AtomicU64,
    expired_count: AtomicU64,
}

impl SinkState {
    async fn sweep_expired(&self, now_ms: i64) -> usize {
        let mut cache = self.cache.write().await;
        let expired: Vec<ChunkKey> = cache
            .iter()
            .filter(|(_, chunk)| chunk.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(chunk) = cache.pop(key) {
                self.total_bytes.fetch_sub(chunk.size(), Ordering::SeqCst);
            }
        }
        if !expired.is_empty() {
            self.expired_count
                .fetch_add(expired.len() as u64, Ordering::SeqCst);
            debug!("Swept {} expired chunks", expired.len());
        }
        expired.len()
    }
}

/// LRU chunk store held in memory
pub struct MemoryChunkSink {
    state: Arc<SinkState>,
    config: MemorySinkConfig,
    sweep_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryChunkSink {
    /// Creates the sink. With sweeping enabled this must run inside a tokio
    /// runtime.
    pub fn new(config: MemorySinkConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_chunks).unwrap_or(NonZeroUsize::MIN);
        let state = Arc::new(SinkState {
            cache: RwLock::new(LruCache::new(capacity)),
            total_bytes: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        });

        let sweep_handle = config.enable_sweep.then(|| {
            let state = Arc::clone(&state);
            let interval = config.sweep_interval.max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    state.sweep_expired(now_millis()).await;
                }
            })
        });

        Self {
            state,
            config,
            sweep_handle,
        }
    }

    /// Sink without the background sweep
    pub fn unswept(config: MemorySinkConfig) -> Self {
        Self::new(MemorySinkConfig {
            enable_sweep: false,
            ..config
        })
    }

    pub async fn get(&self, key: &ChunkKey) -> Option<PersistedChunk> {
        let mut cache = self.state.cache.write().await;
        match cache.get(key) {
            Some(chunk) => {
                self.state.hit_count.fetch_add(1, Ordering::SeqCst);
                Some(chunk.clone())
            }
            None => {
                self.state.miss_count.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    /// Chunks of `category` ordered by start time
    pub async fn chunks_for(&self, category: &str) -> Vec<PersistedChunk> {
        let cache = self.state.cache.read().await;
        let mut chunks: Vec<PersistedChunk> = cache
            .iter()
            .filter(|(key, _)| key.category == category)
            .map(|(_, chunk)| chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.start_ms);
        chunks
    }

    /// Drops chunks that expired by `now_ms`, returning how many
    pub async fn sweep_expired(&self, now_ms: i64) -> usize {
        self.state.sweep_expired(now_ms).await
    }

    pub async fn len(&self) -> usize {
        self.state.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.cache.read().await.is_empty()
    }

    pub async fn stats(&self) -> MemorySinkStats {
        let chunk_count = self.state.cache.read().await.len();
        MemorySinkStats {
            chunk_count,
            total_bytes: self.state.total_bytes.load(Ordering::SeqCst),
            hit_count: self.state.hit_count.load(Ordering::SeqCst),
            miss_count: self.state.miss_count.load(Ordering::SeqCst),
            eviction_count: self.state.eviction_count.load(Ordering::SeqCst),
            expired_count: self.state.expired_count.load(Ordering::SeqCst),
        }
    }
}

#[async_trait::async_trait]
impl ChunkSink for MemoryChunkSink {
    async fn deposit(&self, chunk: PersistedChunk) -> Result<(), SinkError> {
        validate_category(&chunk.category)?;
        let size = chunk.size();
        if size > self.config.max_total_bytes {
            return Err(SinkError::ChunkTooLarge {
                size,
                limit: self.config.max_total_bytes,
            });
        }

        let state = &self.state;
        let key = ChunkKey::of(&chunk);
        let mut cache = state.cache.write().await;

        if let Some(replaced) = cache.pop(&key) {
            state.total_bytes.fetch_sub(replaced.size(), Ordering::SeqCst);
        }
        while state.total_bytes.load(Ordering::SeqCst) + size > self.config.max_total_bytes {
            let Some((evicted_key, evicted)) = cache.pop_lru() else {
                break;
            };
            state.total_bytes.fetch_sub(evicted.size(), Ordering::SeqCst);
            state.eviction_count.fetch_add(1, Ordering::SeqCst);
            debug!("Evicted chunk {:?} to stay within byte limit", evicted_key);
        }

        if let Some((evicted_key, evicted)) = cache.push(key, chunk) {
            state.total_bytes.fetch_sub(evicted.size(), Ordering::SeqCst);
            state.eviction_count.fetch_add(1, Ordering::SeqCst);
            debug!("Evicted chunk {:?} to stay within count limit", evicted_key);
        }
        state.total_bytes.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryChunkSink {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_support::chunk;

    fn config(max_chunks: usize, max_total_bytes: u64) -> MemorySinkConfig {
        MemorySinkConfig {
            max_chunks,
            max_total_bytes,
            enable_sweep: false,
            sweep_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_deposit_and_get() {
        let sink = MemoryChunkSink::new(config(10, 1024));
        sink.deposit(chunk("cam", 0, 5000, 100)).await.unwrap();
        sink.deposit(chunk("cam", 5000, 10_000, 100)).await.unwrap();
        sink.deposit(chunk("other", 0, 5000, 10)).await.unwrap();

        let found = sink.get(&ChunkKey::new("cam", 5000, 10_000)).await.unwrap();
        assert_eq!(found.start_ms, 5000);
        assert!(sink.get(&ChunkKey::new("cam", 1, 2)).await.is_none());

        let cam: Vec<i64> = sink
            .chunks_for("cam")
            .await
            .iter()
            .map(|c| c.start_ms)
            .collect();
        assert_eq!(cam, vec![0, 5000]);

        let stats = sink.stats().await;
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.total_bytes, 210);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[tokio::test]
    async fn test_byte_limit_evicts_oldest() {
        let sink = MemoryChunkSink::new(config(10, 250));
        for i in 0..3 {
            sink.deposit(chunk("cam", i * 1000, (i + 1) * 1000, 100))
                .await
                .unwrap();
        }
        let stats = sink.stats().await;
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.total_bytes, 200);
        assert_eq!(stats.eviction_count, 1);
        assert!(sink.get(&ChunkKey::new("cam", 0, 1000)).await.is_none());
    }

    #[tokio::test]
    async fn test_count_limit_evicts_oldest() {
        let sink = MemoryChunkSink::new(config(2, 1024));
        for i in 0..3 {
            sink.deposit(chunk("cam", i * 1000, (i + 1) * 1000, 10))
                .await
                .unwrap();
        }
        let stats = sink.stats().await;
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.total_bytes, 20);
        assert_eq!(stats.eviction_count, 1);
    }

    #[tokio::test]
    async fn test_replacing_a_chunk_keeps_byte_count() {
        let sink = MemoryChunkSink::new(config(10, 1024));
        sink.deposit(chunk("cam", 0, 1000, 100)).await.unwrap();
        sink.deposit(chunk("cam", 0, 1000, 40)).await.unwrap();
        let stats = sink.stats().await;
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.total_bytes, 40);
    }

    #[tokio::test]
    async fn test_rejects_oversized_and_bad_category() {
        let sink = MemoryChunkSink::new(config(10, 50));
        assert!(matches!(
            sink.deposit(chunk("cam", 0, 1000, 100)).await,
            Err(SinkError::ChunkTooLarge { size: 100, limit: 50 })
        ));
        assert!(matches!(
            sink.deposit(chunk("a/b", 0, 1000, 1)).await,
            Err(SinkError::InvalidCategory { .. })
        ));
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let sink = MemoryChunkSink::new(config(10, 1024));
        let mut old = chunk("cam", 0, 1000, 10);
        old.expires_at_ms = 5000;
        sink.deposit(old).await.unwrap();
        sink.deposit(chunk("cam", 1000, 2000, 10)).await.unwrap();

        assert_eq!(sink.sweep_expired(4999).await, 0);
        assert_eq!(sink.sweep_expired(5000).await, 1);
        let stats = sink.stats().await;
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.total_bytes, 10);
    }

    #[tokio::test]
    async fn test_background_sweep_runs() {
        let sink = MemoryChunkSink::new(MemorySinkConfig {
            enable_sweep: true,
            sweep_interval: Duration::from_millis(10),
            ..config(10, 1024)
        });
        let mut expired = chunk("cam", 0, 1000, 10);
        expired.expires_at_ms = 0;
        sink.deposit(expired).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.is_empty().await);
    }
}
