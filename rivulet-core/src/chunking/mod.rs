//! Splitting a stream into independently playable chunks
//!
//! Two providers produce chunks from an inspected stream. The repackaging
//! provider copies compressed packets into fresh containers and is used for
//! codecs whose fragments decode on their own. The transcoding provider
//! decodes every frame and re-encodes it, and is the fallback for everything
//! else, including a repackaging run whose output container rejected a write.
//! The [`factory`] picks between them and the [`orchestrator`] drives a run
//! end to end into a persistence sink.

pub mod factory;
pub mod orchestrator;
pub mod repackaging;
pub mod timeline;
pub mod transcoding;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::ChunkingConfig;
use crate::decode::{CoderPack, DecodeError, MetadataContentHandler};
use crate::engine::MediaEngine;

pub use factory::{ChunkProviderFactory, ContainerPolicy, SelectedProvider, select_provider_kind};
pub use orchestrator::{
    ChunkingReport, ChunkingRequest, OrchestratorError, StreamChunkOrchestrator,
};
pub use repackaging::RepackagingChunkProvider;
pub use timeline::{ChunkSpan, ChunkTimeline, CutReason, FinalSpan};
pub use transcoding::TranscodingChunkProvider;

/// Errors raised while producing chunks
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// Inspection or decoder setup failed before any chunk was produced
    #[error("Chunking setup failed: {0}")]
    Setup(DecodeError),

    #[error("Output container write failed: {reason}")]
    Write { reason: String },

    #[error("Frame encoding failed: {reason}")]
    Encode { reason: String },

    #[error("Source read failed: {reason}")]
    Read { reason: String },

    #[error("Decoding failed: {0}")]
    Decode(#[from] DecodeError),
}

impl ChunkError {
    /// True when a transcoding provider can take over the same input
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Write { .. })
    }
}

/// One finished chunk
#[derive(Debug, Clone, PartialEq)]
pub struct VideoChunk {
    pub start_ms: i64,
    pub end_ms: i64,
    pub data: Bytes,
    pub key_frames: Vec<i64>,
    /// Set only on the final chunk of a stream
    pub previous_chunk_last_ms: Option<i64>,
}

impl VideoChunk {
    pub fn is_last(&self) -> bool {
        self.previous_chunk_last_ms.is_some()
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// Receives chunks in stream order
pub trait VideoChunkConsumer: Send {
    /// An interior chunk covering `[start_ms, end_ms)`
    fn consume_video_chunk(&mut self, start_ms: i64, end_ms: i64, data: Bytes, key_frames: Vec<i64>);

    /// The final chunk of the stream. Called at most once, and only when
    /// `end_ms` is after `start_ms`. `end_ms` is the best known end of the
    /// stream.
    fn consume_last_chunk(
        &mut self,
        start_ms: i64,
        end_ms: i64,
        previous_chunk_last_ms: i64,
        data: Bytes,
        key_frames: Vec<i64>,
    );
}

/// Consumer that keeps every chunk it receives in memory.
///
/// Meant for short streams: the bench, the simulation engine scenarios and
/// embedders checking chunk boundaries. Clones share the same list, so one
/// clone can be handed to a provider while another is inspected. Long-running
/// sessions should deliver chunks through the orchestrator to a
/// [`crate::persistence::ChunkSink`] instead.
///
/// ```
/// use bytes::Bytes;
/// use rivulet_core::chunking::{ChunkRecorder, VideoChunkConsumer};
///
/// let recorder = ChunkRecorder::new();
/// let mut consumer = recorder.clone();
/// consumer.consume_video_chunk(0, 5000, Bytes::from_static(b"chunk"), vec![0]);
/// consumer.consume_last_chunk(5000, 7000, 5000, Bytes::new(), Vec::new());
///
/// assert_eq!(recorder.spans(), vec![(0, 5000), (5000, 7000)]);
/// assert!(recorder.chunks()[1].is_last());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChunkRecorder {
    chunks: Arc<Mutex<Vec<VideoChunk>>>,
}

impl ChunkRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<VideoChunk> {
        self.chunks.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// `(start_ms, end_ms)` of every chunk in arrival order
    pub fn spans(&self) -> Vec<(i64, i64)> {
        self.chunks
            .lock()
            .iter()
            .map(|c| (c.start_ms, c.end_ms))
            .collect()
    }
}

impl VideoChunkConsumer for ChunkRecorder {
    fn consume_video_chunk(&mut self, start_ms: i64, end_ms: i64, data: Bytes, key_frames: Vec<i64>) {
        self.chunks.lock().push(VideoChunk {
            start_ms,
            end_ms,
            data,
            key_frames,
            previous_chunk_last_ms: None,
        });
    }

    fn consume_last_chunk(
        &mut self,
        start_ms: i64,
        end_ms: i64,
        previous_chunk_last_ms: i64,
        data: Bytes,
        key_frames: Vec<i64>,
    ) {
        self.chunks.lock().push(VideoChunk {
            start_ms,
            end_ms,
            data,
            key_frames,
            previous_chunk_last_ms: Some(previous_chunk_last_ms),
        });
    }
}

/// Chunking strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Repackaging,
    Transcoding,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Repackaging => write!(f, "repackaging"),
            ProviderKind::Transcoding => write!(f, "transcoding"),
        }
    }
}

/// Summary of one provider run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRun {
    pub kind: ProviderKind,
    /// Chunks handed to the consumer, the final chunk included
    pub chunks_emitted: usize,
    /// Packets copied or frames encoded
    pub units_processed: u64,
    /// The source was cancelled before it ended
    pub cancelled: bool,
}

/// Produces chunks from one stream
pub trait ChunkProvider: Send {
    fn kind(&self) -> ProviderKind;

    /// Reads the stream to its end (or until cancelled), handing finished
    /// chunks to `consumer` and metadata packets to `metadata`. A final
    /// chunk is flushed when the stream ends, is cancelled, or fails to
    /// read.
    ///
    /// # Errors
    /// - `ChunkError::Write` - output container rejected a packet; the run
    ///   can be continued by a transcoding provider
    /// - `ChunkError::Encode` - encoder could not be opened or failed
    /// - `ChunkError::Read` - source failed mid-stream
    /// - `ChunkError::Decode` - decoding failed beyond a single packet
    fn provide_chunks(
        &mut self,
        consumer: &mut dyn VideoChunkConsumer,
        metadata: Arc<dyn MetadataContentHandler>,
    ) -> Result<ProviderRun, ChunkError>;
}

/// Everything a provider owns about the stream it is chunking. Moved from a
/// failed repackaging provider to its transcoding replacement.
pub struct ProviderSession {
    pub(crate) engine: Arc<dyn MediaEngine>,
    pub(crate) pack: CoderPack,
    pub(crate) timeline: ChunkTimeline,
    pub(crate) config: ChunkingConfig,
}

impl ProviderSession {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        pack: CoderPack,
        stream_start_ms: i64,
        config: ChunkingConfig,
    ) -> Self {
        let timeline =
            ChunkTimeline::new(stream_start_ms, config.target_duration, config.overflow_factor);
        Self {
            engine,
            pack,
            timeline,
            config,
        }
    }

    pub fn pack(&self) -> &CoderPack {
        &self.pack
    }

    pub fn timeline(&self) -> &ChunkTimeline {
        &self.timeline
    }
}

impl std::fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSession")
            .field("engine", &self.engine.name())
            .field("pack", &self.pack)
            .field("timeline", &self.timeline)
            .finish()
    }
}
