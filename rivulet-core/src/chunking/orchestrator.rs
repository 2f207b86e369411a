//! End-to-end chunking of one stream into a persistence sink
//!
//! Chunking is blocking work and runs on a `spawn_blocking` worker. Finished
//! chunks travel over a bounded channel to the async side, which stamps
//! nothing further and deposits them in the sink in order. A repackaging run
//! that fails with a write error is continued once by a transcoding provider
//! over the same opened input.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::factory::ChunkProviderFactory;
use super::{ChunkError, ChunkProvider, ProviderKind, ProviderRun, VideoChunkConsumer};
use crate::config::PersistenceConfig;
use crate::decode::{DiscardMetadata, MetadataContentHandler};
use crate::input::{InputHandle, InputStream};
use crate::persistence::{ChunkSink, ExpirationPolicy, PersistedChunk, SinkError, now_millis};

/// Errors ending a chunking run
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Chunking failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Chunk sink failed: {0}")]
    Sink(#[from] SinkError),

    #[error("Chunking worker stopped unexpectedly: {reason}")]
    Worker { reason: String },
}

/// One stream to chunk
pub struct ChunkingRequest {
    pub category: String,
    pub stream: InputStream,
    /// Epoch milliseconds the first chunk starts at
    pub stream_start_ms: i64,
    /// Known epoch end of the stream, if any
    pub stream_end_ms: Option<i64>,
    /// Drop the partial final chunk when the stream is cancelled
    pub discard_partial_on_cancel: bool,
    pub metadata: Arc<dyn MetadataContentHandler>,
}

impl ChunkingRequest {
    pub fn new(category: impl Into<String>, stream: InputStream, stream_start_ms: i64) -> Self {
        Self {
            category: category.into(),
            stream,
            stream_start_ms,
            stream_end_ms: None,
            discard_partial_on_cancel: false,
            metadata: Arc::new(DiscardMetadata),
        }
    }

    pub fn with_stream_end(mut self, stream_end_ms: i64) -> Self {
        self.stream_end_ms = Some(stream_end_ms);
        self
    }

    pub fn discard_partial_on_cancel(mut self) -> Self {
        self.discard_partial_on_cancel = true;
        self
    }

    pub fn with_metadata_handler(mut self, handler: Arc<dyn MetadataContentHandler>) -> Self {
        self.metadata = handler;
        self
    }
}

/// Outcome of a successful chunking run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingReport {
    pub session_id: Uuid,
    /// Provider that finished the stream
    pub provider: ProviderKind,
    pub failover_used: bool,
    pub chunks_persisted: usize,
    pub last_chunk_persisted: bool,
    pub cancelled: bool,
    pub bytes_read: u64,
}

/// Runs chunking sessions against a shared factory and sink
pub struct StreamChunkOrchestrator {
    factory: Arc<ChunkProviderFactory>,
    sink: Arc<dyn ChunkSink>,
    expiration: Arc<Mutex<ExpirationPolicy>>,
    channel_capacity: usize,
}

impl StreamChunkOrchestrator {
    pub fn new(
        factory: Arc<ChunkProviderFactory>,
        sink: Arc<dyn ChunkSink>,
        config: &PersistenceConfig,
    ) -> Self {
        Self {
            factory,
            sink,
            expiration: Arc::new(Mutex::new(ExpirationPolicy::from_config(config))),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    pub fn factory(&self) -> &Arc<ChunkProviderFactory> {
        &self.factory
    }

    /// Chunks `request.stream` to its end and persists every chunk.
    ///
    /// A sink failure cancels the stream; the error is returned once the
    /// worker has stopped.
    ///
    /// # Errors
    /// - `OrchestratorError::Chunk` - setup failed, or the stream failed in a
    ///   way failover could not recover
    /// - `OrchestratorError::Sink` - a chunk could not be persisted
    /// - `OrchestratorError::Worker` - the chunking worker panicked
    pub async fn run(&self, request: ChunkingRequest) -> Result<ChunkingReport, OrchestratorError> {
        let session_id = Uuid::new_v4();
        let ChunkingRequest {
            category,
            stream,
            stream_start_ms,
            stream_end_ms,
            discard_partial_on_cancel,
            metadata,
        } = request;
        let handle = stream.handle();
        info!(
            "Chunking session {} started for {} ({})",
            session_id,
            handle.label(),
            category
        );

        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let forwarder = ChunkForwarder {
            session_id,
            category,
            tx,
            expiration: Arc::clone(&self.expiration),
            handle: handle.clone(),
            stream_end_ms,
            discard_partial_on_cancel,
            last_delivered: false,
        };
        let factory = Arc::clone(&self.factory);
        let worker = tokio::task::spawn_blocking(move || {
            run_providers(&factory, stream, stream_start_ms, forwarder, metadata)
        });

        let mut persisted = 0;
        let mut last_persisted = false;
        let mut sink_error = None;
        while let Some(chunk) = rx.recv().await {
            if sink_error.is_some() {
                continue;
            }
            let is_last = chunk.is_last();
            match self.sink.deposit(chunk).await {
                Ok(()) => {
                    persisted += 1;
                    last_persisted |= is_last;
                }
                Err(e) => {
                    error!("Session {} could not persist chunk: {}", session_id, e);
                    handle.cancel();
                    sink_error = Some(e);
                }
            }
        }

        let outcome = worker.await.map_err(|e| OrchestratorError::Worker {
            reason: e.to_string(),
        })?;
        if let Some(e) = sink_error {
            return Err(e.into());
        }
        let outcome = outcome.inspect_err(|e| {
            error!("Chunking session {} failed: {}", session_id, e);
        })?;

        let report = ChunkingReport {
            session_id,
            provider: outcome.run.kind,
            failover_used: outcome.failover_used,
            chunks_persisted: persisted,
            last_chunk_persisted: last_persisted,
            cancelled: outcome.run.cancelled,
            bytes_read: handle.bytes_read(),
        };
        info!(
            "Chunking session {} finished: {} chunks via {}{}",
            session_id,
            report.chunks_persisted,
            report.provider,
            if report.failover_used {
                " after failover"
            } else {
                ""
            }
        );
        Ok(report)
    }
}

struct WorkerOutcome {
    run: ProviderRun,
    failover_used: bool,
}

fn run_providers(
    factory: &ChunkProviderFactory,
    stream: InputStream,
    stream_start_ms: i64,
    mut forwarder: ChunkForwarder,
    metadata: Arc<dyn MetadataContentHandler>,
) -> Result<WorkerOutcome, ChunkError> {
    let mut provider = factory.create_provider(stream, stream_start_ms)?;
    let first = provider.provide_chunks(&mut forwarder, Arc::clone(&metadata));

    match first {
        Ok(run) => Ok(WorkerOutcome {
            run,
            failover_used: false,
        }),
        Err(e) if e.is_recoverable() => {
            warn!("{} provider failed, trying failover: {}", provider.kind(), e);
            let Some(mut failover) = factory.create_failover_provider(provider)? else {
                return Err(e);
            };
            let run = failover.provide_chunks(&mut forwarder, metadata)?;
            Ok(WorkerOutcome {
                run,
                failover_used: true,
            })
        }
        Err(e) => Err(e),
    }
}

/// Wraps chunks for persistence and sends them to the async side
struct ChunkForwarder {
    session_id: Uuid,
    category: String,
    tx: mpsc::Sender<PersistedChunk>,
    expiration: Arc<Mutex<ExpirationPolicy>>,
    handle: InputHandle,
    stream_end_ms: Option<i64>,
    discard_partial_on_cancel: bool,
    last_delivered: bool,
}

impl ChunkForwarder {
    fn send(
        &mut self,
        start_ms: i64,
        end_ms: i64,
        data: Bytes,
        key_frames: Vec<i64>,
        previous_chunk_last_ms: Option<i64>,
    ) {
        let expires_at_ms = self.expiration.lock().expiration_ms(now_millis());
        let chunk = PersistedChunk {
            session_id: self.session_id,
            category: self.category.clone(),
            start_ms,
            end_ms,
            expires_at_ms,
            key_frames,
            data,
            previous_chunk_last_ms,
        };
        if self.tx.blocking_send(chunk).is_err() {
            warn!("Chunk receiver is gone, cancelling {}", self.handle.label());
            self.handle.cancel();
        }
    }
}

impl VideoChunkConsumer for ChunkForwarder {
    fn consume_video_chunk(&mut self, start_ms: i64, end_ms: i64, data: Bytes, key_frames: Vec<i64>) {
        self.send(start_ms, end_ms, data, key_frames, None);
    }

    fn consume_last_chunk(
        &mut self,
        start_ms: i64,
        end_ms: i64,
        previous_chunk_last_ms: i64,
        data: Bytes,
        key_frames: Vec<i64>,
    ) {
        if self.last_delivered {
            debug!("Ignoring repeated final chunk at {}", start_ms);
            return;
        }
        self.last_delivered = true;

        let cancelled = self.handle.is_cancelled();
        if cancelled && self.discard_partial_on_cancel {
            info!(
                "Discarding partial final chunk [{}, {}) of cancelled stream",
                start_ms, end_ms
            );
            return;
        }

        let end_ms = match self.stream_end_ms {
            Some(known_end) if !cancelled && end_ms > known_end => {
                debug!("Clamping final chunk end {} to stream end {}", end_ms, known_end);
                known_end.max(start_ms + 1)
            }
            _ => end_ms,
        };
        self.send(
            start_ms,
            end_ms,
            data,
            key_frames,
            Some(previous_chunk_last_ms),
        );
    }
}
