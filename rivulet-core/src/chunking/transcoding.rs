//! Transcoding chunk provider
//!
//! Decodes every frame through a [`StreamDecoder`] and re-encodes it with
//! the configured codec. Each chunk gets its own encoder and output container,
//! so every chunk opens on a key frame. Chunks are cut on the first frame at
//! or past the target duration.

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::timeline::ChunkTimeline;
use super::{
    ChunkError, ChunkProvider, ProviderKind, ProviderRun, ProviderSession, VideoChunkConsumer,
};
use crate::config::{ChunkingConfig, DecodeConfig};
use crate::decode::{
    DecodeError, DecodedFrame, FrameConsumer, FramePool, MetadataContentHandler, StreamDecoder,
    StreamReadError,
};
use crate::engine::{
    EncodedPacket, EncoderSpec, FrameSpec, MediaEngine, OutputContainer, PixelFormat,
    VideoEncoder,
};

/// Chunk provider that decodes and re-encodes every frame
pub struct TranscodingChunkProvider {
    engine: Arc<dyn MediaEngine>,
    decoder: StreamDecoder,
    timeline: ChunkTimeline,
    config: ChunkingConfig,
    label: String,
}

impl TranscodingChunkProvider {
    /// Takes over `session`, attaching its coder pack to a new stream
    /// decoder. An open chunk in the session is continued.
    ///
    /// # Errors
    /// - `ChunkError::Setup` - the decoder refused the coder pack
    pub fn new(
        session: ProviderSession,
        pool: Arc<FramePool>,
        decode: &DecodeConfig,
    ) -> Result<Self, ChunkError> {
        let ProviderSession {
            engine,
            pack,
            timeline,
            config,
        } = session;

        let label = pack.input_handle().label().to_string();
        let output_frame = pack
            .video_track()
            .frame_spec()
            .map(|spec| FrameSpec::new(PixelFormat::Yuv420p, spec.width, spec.height));

        let mut decoder = StreamDecoder::new(Arc::clone(&engine), pool, decode);
        decoder.set_output_frame(output_frame);
        decoder.attach_pack(pack).map_err(ChunkError::Setup)?;

        Ok(Self {
            engine,
            decoder,
            timeline,
            config,
            label,
        })
    }

    pub fn timeline(&self) -> &ChunkTimeline {
        &self.timeline
    }

    pub fn decoder(&self) -> &StreamDecoder {
        &self.decoder
    }
}

impl ChunkProvider for TranscodingChunkProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Transcoding
    }

    fn provide_chunks(
        &mut self,
        consumer: &mut dyn VideoChunkConsumer,
        metadata: Arc<dyn MetadataContentHandler>,
    ) -> Result<ProviderRun, ChunkError> {
        info!(
            "Transcoding {} to {} in {}",
            self.label, self.config.transcode_codec, self.config.transcode_container
        );
        self.decoder.add_metadata_handler(metadata);

        let mut sink = ChunkEncoder {
            engine: self.engine.as_ref(),
            config: &self.config,
            timeline: &mut self.timeline,
            consumer,
            encoder: None,
            output: None,
            frame_duration_ms: None,
            frames_encoded: 0,
            chunks_emitted: 0,
            error: None,
        };

        let mut read_failure = None;
        loop {
            match self.decoder.decode(&mut sink) {
                Ok(true) => {
                    if let Some(err) = sink.error.take() {
                        return Err(err);
                    }
                    // Cancelled or suspended; nothing resumes a chunking run
                    break;
                }
                Ok(false) => break,
                Err(e) if e.is_end_of_stream() => break,
                Err(DecodeError::StreamRead(StreamReadError::Read { reason })) => {
                    read_failure = Some(reason);
                    break;
                }
                Err(e) => return Err(ChunkError::Decode(e)),
            }
        }

        let cancelled = self.decoder.is_cancelled();
        sink.flush_last()?;

        let run = ProviderRun {
            kind: ProviderKind::Transcoding,
            chunks_emitted: sink.chunks_emitted,
            units_processed: sink.frames_encoded,
            cancelled,
        };

        if let Some(reason) = read_failure {
            warn!("Transcoding read failed: {}", reason);
            return Err(ChunkError::Read { reason });
        }

        let stats = self.decoder.stats();
        info!(
            "Transcoding finished: {} chunks from {} frames ({} bad packets){}",
            run.chunks_emitted,
            run.units_processed,
            stats.bad_packets,
            if cancelled { " (cancelled)" } else { "" }
        );
        Ok(run)
    }
}

/// Frame consumer that encodes frames into chunks
struct ChunkEncoder<'a> {
    engine: &'a dyn MediaEngine,
    config: &'a ChunkingConfig,
    timeline: &'a mut ChunkTimeline,
    consumer: &'a mut dyn VideoChunkConsumer,
    encoder: Option<Box<dyn VideoEncoder>>,
    output: Option<Box<dyn OutputContainer>>,
    frame_duration_ms: Option<i64>,
    frames_encoded: u64,
    chunks_emitted: usize,
    /// Error that stopped decoding, reported once the decode loop returns
    error: Option<ChunkError>,
}

impl ChunkEncoder<'_> {
    fn accept(&mut self, frame: DecodedFrame, ts: i64) -> Result<(), ChunkError> {
        self.timeline.observe(ts);
        if let Some(gap) = self.timeline.last_gap_ms() {
            self.frame_duration_ms = Some(gap);
        }

        // A chunk inherited from a failed provider has no output until the
        // first frame lands in it
        if self.output.is_some() && self.timeline.should_cut_transcoded(ts).is_some() {
            self.flush_chunk(ts)?;
        }
        if !self.timeline.is_open() {
            self.timeline.open(ts);
        }
        if self.encoder.is_none() {
            self.open_encoder(frame.spec())?;
        }

        let packets = match self.encoder.as_mut() {
            Some(encoder) => encoder
                .encode(frame.as_frame_ref(), ts)
                .map_err(|e| ChunkError::Encode {
                    reason: e.to_string(),
                })?,
            None => Vec::new(),
        };
        self.write(packets)?;
        self.frames_encoded += 1;
        Ok(())
    }

    fn open_encoder(&mut self, frame: FrameSpec) -> Result<(), ChunkError> {
        let spec = EncoderSpec {
            codec_name: self.config.transcode_codec.clone(),
            frame,
            gop: self.config.transcode_gop,
        };
        let encoder = self
            .engine
            .open_encoder(&spec)
            .map_err(|e| ChunkError::Encode {
                reason: e.to_string(),
            })?;
        let output = encoder
            .open_output(&self.config.transcode_container)
            .map_err(|e| ChunkError::Write {
                reason: format!(
                    "could not open {} output: {e}",
                    self.config.transcode_container
                ),
            })?;
        debug!("Opened {} encoder for {}", spec.codec_name, frame);
        self.encoder = Some(encoder);
        self.output = Some(output);
        Ok(())
    }

    fn write(&mut self, packets: Vec<EncodedPacket>) -> Result<(), ChunkError> {
        if packets.is_empty() {
            return Ok(());
        }
        let anchor = self.timeline.anchor_ms().unwrap_or_default();
        let Some(output) = self.output.as_mut() else {
            return Err(ChunkError::Write {
                reason: "no output container open".to_string(),
            });
        };
        for packet in packets {
            output
                .write_packet(&packet.to_packet(anchor, self.frame_duration_ms))
                .map_err(|e| ChunkError::Write {
                    reason: e.to_string(),
                })?;
            if packet.is_key {
                self.timeline.record_key_frame(packet.pts);
            }
        }
        Ok(())
    }

    /// Drains the encoder and closes the output container
    fn finish_output(&mut self) -> Result<Option<Bytes>, ChunkError> {
        if let Some(mut encoder) = self.encoder.take() {
            let packets = encoder.flush().map_err(|e| ChunkError::Encode {
                reason: e.to_string(),
            })?;
            self.write(packets)?;
        }
        match self.output.take() {
            Some(output) => output
                .finish()
                .map(Some)
                .map_err(|e| ChunkError::Write {
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn flush_chunk(&mut self, ts: i64) -> Result<(), ChunkError> {
        let data = self.finish_output()?.unwrap_or_default();
        if let Some(span) = self.timeline.close_at(ts) {
            debug!(
                "Transcoded chunk [{}, {}), {} bytes",
                span.start_ms,
                span.end_ms,
                data.len()
            );
            self.consumer
                .consume_video_chunk(span.start_ms, span.end_ms, data, span.key_frames);
            self.chunks_emitted += 1;
        }
        Ok(())
    }

    fn flush_last(&mut self) -> Result<(), ChunkError> {
        if !self.timeline.is_open() {
            return Ok(());
        }
        let Some(data) = self.finish_output()? else {
            debug!("No frames encoded into the final chunk, nothing to flush");
            return Ok(());
        };
        if let Some(span) = self.timeline.close_final(self.frame_duration_ms) {
            debug!(
                "Transcoded final chunk [{}, {}), {} bytes",
                span.start_ms,
                span.end_ms,
                data.len()
            );
            self.consumer.consume_last_chunk(
                span.start_ms,
                span.end_ms,
                span.previous_end_ms,
                data,
                span.key_frames,
            );
            self.chunks_emitted += 1;
        }
        Ok(())
    }
}

impl FrameConsumer for ChunkEncoder<'_> {
    fn consume_frame(&mut self, frame: DecodedFrame, decode_timestamp_ms: i64) -> ControlFlow<()> {
        match self.accept(frame, decode_timestamp_ms) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                self.error = Some(e);
                ControlFlow::Break(())
            }
        }
    }
}
