//! Rivulet Core - Keyframe-aligned chunking of live video streams
//!
//! This crate turns an incoming video stream into a sequence of short,
//! independently playable chunks: codec inspection, packet decoding with a
//! bounded frame pool, repackaging or transcoding chunk providers, and the
//! orchestration that persists finished chunks with an expiration time.

pub mod chunking;
pub mod config;
pub mod decode;
pub mod engine;
pub mod input;
pub mod persistence;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use chunking::{
    ChunkError, ChunkProvider, ChunkProviderFactory, ChunkingReport, ChunkingRequest,
    OrchestratorError, StreamChunkOrchestrator, VideoChunk, VideoChunkConsumer,
};
pub use config::RivuletConfig;
pub use decode::{CoderPack, DecodeError, FramePool, StreamDecoder, StreamReadError};
pub use engine::{EngineError, MediaEngine};
pub use input::{InputHandle, InputStream};
pub use persistence::{ChunkSink, DirectoryChunkSink, MemoryChunkSink, SinkError};

/// Core errors that can bubble up from any Rivulet subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum RivuletError {
    #[error("Chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Persistence error: {0}")]
    Sink(#[from] SinkError),

    #[error("Orchestration error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RivuletError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            RivuletError::Chunk(e) | RivuletError::Orchestrator(OrchestratorError::Chunk(e)) => {
                match e {
                    ChunkError::Setup(DecodeError::NoVideoTrack) => {
                        "The stream has no video track".to_string()
                    }
                    ChunkError::Setup(DecodeError::ContainerOpen { reason }) => {
                        format!("Unrecognized stream format: {reason}")
                    }
                    ChunkError::Setup(DecodeError::CoderOpen { codec, .. }) => {
                        format!("Codec {codec} is not supported")
                    }
                    ChunkError::Read { .. } => "The stream could not be read".to_string(),
                    _ => "Chunking failed".to_string(),
                }
            }
            RivuletError::Decode(_) => "Decoding failed".to_string(),
            RivuletError::Engine(_) => "Media engine error occurred".to_string(),
            RivuletError::Sink(_) | RivuletError::Orchestrator(OrchestratorError::Sink(_)) => {
                "Could not store chunks".to_string()
            }
            RivuletError::Orchestrator(OrchestratorError::Worker { .. }) => {
                "Chunking stopped unexpectedly".to_string()
            }
            RivuletError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            RivuletError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            RivuletError::Configuration { .. }
                | RivuletError::Sink(SinkError::InvalidCategory { .. })
                | RivuletError::Orchestrator(OrchestratorError::Sink(
                    SinkError::InvalidCategory { .. }
                ))
        )
    }
}

pub type Result<T> = std::result::Result<T, RivuletError>;
