//! Stream decoding: container inspection, frame buffer pooling, packet
//! decoding and the decoder state machine.

pub mod frame_pool;
pub mod inspector;
pub mod metadata;
pub mod packet_decoder;
pub mod stream_decoder;

pub use frame_pool::{FramePool, PoolError, PoolStats, PooledBuffer, ReclaimerHandle, SuspendToken};
pub use inspector::{CoderPack, PacketClass};
pub use metadata::{DiscardMetadata, MetadataContentHandler, MetadataRecorder};
pub use packet_decoder::{DecodedFrame, FrameConsumer, PacketDecoder, PacketOutcome};
pub use stream_decoder::{DecoderControl, DecoderEvent, DecoderState, DecoderStats, StreamDecoder};

/// Why reading from the source stopped
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamReadError {
    #[error("End of stream reached")]
    EndOfStream,

    #[error("Failed to read from stream: {reason}")]
    Read { reason: String },
}

/// Errors that can occur while inspecting or decoding a stream
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Failed to open container: {reason}")]
    ContainerOpen { reason: String },

    #[error("Container has no video track")]
    NoVideoTrack,

    #[error("Failed to open decoder for {codec}: {reason}")]
    CoderOpen { codec: String, reason: String },

    #[error("Packet decode failed after {attempts} attempts: {reason}")]
    PacketDecode { attempts: u32, reason: String },

    #[error(transparent)]
    StreamRead(#[from] StreamReadError),

    #[error("Frame conversion failed: {reason}")]
    Resample { reason: String },

    #[error("Frame pool unavailable: {0}")]
    Pool(#[from] PoolError),

    #[error("Invalid decoder transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: DecoderState,
        event: DecoderEvent,
    },
}

impl DecodeError {
    /// True when the error ended the stream rather than a single packet
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::StreamRead(StreamReadError::EndOfStream))
    }
}
