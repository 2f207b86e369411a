//! Repackaging chunk provider
//!
//! Copies compressed video packets, undecoded, into a fresh output container
//! per chunk. Chunks are cut on the first key frame past the target duration,
//! or on any packet once the chunk runs past the overflow limit.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::timeline::CutReason;
use super::{
    ChunkError, ChunkProvider, ProviderKind, ProviderRun, ProviderSession, VideoChunkConsumer,
};
use crate::decode::metadata::deinterleave;
use crate::decode::{MetadataContentHandler, PacketClass};
use crate::engine::{ContainerFormat, OutputContainer, Packet};

/// Chunk provider that copies packets without decoding them
pub struct RepackagingChunkProvider {
    session: ProviderSession,
    format: ContainerFormat,
    output: Option<Box<dyn OutputContainer>>,
    last_duration_ms: Option<i64>,
    packets_copied: u64,
    chunks_emitted: usize,
}

impl RepackagingChunkProvider {
    /// Creates a provider writing chunks in `format`
    pub fn new(session: ProviderSession, format: ContainerFormat) -> Self {
        Self {
            session,
            format,
            output: None,
            last_duration_ms: None,
            packets_copied: 0,
            chunks_emitted: 0,
        }
    }

    pub fn format(&self) -> &ContainerFormat {
        &self.format
    }

    pub fn session(&self) -> &ProviderSession {
        &self.session
    }

    /// Gives up the stream, dropping any partially written output
    pub fn into_session(self) -> ProviderSession {
        self.session
    }

    fn copy_packet(
        &mut self,
        packet: Packet,
        consumer: &mut dyn VideoChunkConsumer,
    ) -> Result<(), ChunkError> {
        let Some(ts) = packet.decode_millis() else {
            debug!("Dropping video packet without timestamps");
            return Ok(());
        };

        self.session.timeline.observe(ts);
        if let Some(reason) = self
            .session
            .timeline
            .should_cut_repackaged(ts, packet.is_key)
        {
            self.flush_chunk(ts, reason, consumer)?;
        }
        if !self.session.timeline.is_open() {
            self.session.timeline.open(ts);
        }

        if self.output.is_none() {
            let video_index = self.session.pack.video_track().index;
            let output = self
                .session
                .pack
                .input()
                .open_copy_output(video_index, &self.format)
                .map_err(|e| ChunkError::Write {
                    reason: format!("could not open {} output: {e}", self.format),
                })?;
            self.output = Some(output);
        }

        let anchor = self.session.timeline.anchor_ms().unwrap_or(ts);
        if let Some(output) = self.output.as_mut() {
            output
                .write_packet(&packet.rebased(anchor))
                .map_err(|e| ChunkError::Write {
                    reason: e.to_string(),
                })?;
        }

        if packet.is_key {
            self.session.timeline.record_key_frame(ts);
        }
        self.last_duration_ms = packet.duration_millis();
        self.packets_copied += 1;
        Ok(())
    }

    fn finish_output(&mut self) -> Result<Bytes, ChunkError> {
        match self.output.take() {
            Some(output) => output.finish().map_err(|e| ChunkError::Write {
                reason: e.to_string(),
            }),
            None => Ok(Bytes::new()),
        }
    }

    fn flush_chunk(
        &mut self,
        ts: i64,
        reason: CutReason,
        consumer: &mut dyn VideoChunkConsumer,
    ) -> Result<(), ChunkError> {
        let data = self.finish_output()?;
        if let Some(span) = self.session.timeline.close_at(ts) {
            debug!(
                "Repackaged chunk [{}, {}) cut on {:?}, {} bytes",
                span.start_ms,
                span.end_ms,
                reason,
                data.len()
            );
            consumer.consume_video_chunk(span.start_ms, span.end_ms, data, span.key_frames);
            self.chunks_emitted += 1;
        }
        Ok(())
    }

    fn flush_last(&mut self, consumer: &mut dyn VideoChunkConsumer) -> Result<(), ChunkError> {
        if !self.session.timeline.is_open() {
            return Ok(());
        }
        let data = self.finish_output()?;
        if let Some(span) = self.session.timeline.close_final(self.last_duration_ms) {
            debug!(
                "Repackaged final chunk [{}, {}), {} bytes",
                span.start_ms,
                span.end_ms,
                data.len()
            );
            consumer.consume_last_chunk(
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

    fn run(&self, cancelled: bool) -> ProviderRun {
        ProviderRun {
            kind: ProviderKind::Repackaging,
            chunks_emitted: self.chunks_emitted,
            units_processed: self.packets_copied,
            cancelled,
        }
    }
}

impl ChunkProvider for RepackagingChunkProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Repackaging
    }

    fn provide_chunks(
        &mut self,
        consumer: &mut dyn VideoChunkConsumer,
        metadata: Arc<dyn MetadataContentHandler>,
    ) -> Result<ProviderRun, ChunkError> {
        info!(
            "Repackaging {} ({}) into {}",
            self.session.pack.input_handle().label(),
            self.session.pack.codec_name(),
            self.format
        );

        loop {
            if self.session.pack.is_cancelled() {
                break;
            }
            let packet = match self.session.pack.input_mut().read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    self.session.pack.invalidate();
                    if self.session.pack.is_cancelled() {
                        break;
                    }
                    warn!("Repackaging read failed: {}", e);
                    self.flush_last(consumer)?;
                    return Err(ChunkError::Read {
                        reason: e.to_string(),
                    });
                }
            };

            match self.session.pack.classify(&packet) {
                PacketClass::Video => self.copy_packet(packet, consumer)?,
                PacketClass::Metadata => {
                    let ts = packet.decode_millis().unwrap_or_default();
                    metadata.handle_content(deinterleave(&packet.data), ts);
                }
                PacketClass::Other => {}
            }
        }

        self.session.pack.invalidate();
        let cancelled = self.session.pack.is_cancelled();
        self.flush_last(consumer)?;

        let run = self.run(cancelled);
        info!(
            "Repackaging finished: {} chunks from {} packets{}",
            run.chunks_emitted,
            run.units_processed,
            if cancelled { " (cancelled)" } else { "" }
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkRecorder;
    use crate::config::ChunkingConfig;
    use crate::decode::{CoderPack, DiscardMetadata, MetadataRecorder};
    use crate::engine::MediaEngine;
    use crate::engine::simulation::SimulationEngine;
    use crate::engine::simulation::container;
    use crate::engine::simulation::fixture::SyntheticStream;
    use crate::input::InputStream;

    fn provider(engine: Arc<dyn MediaEngine>, stream: &SyntheticStream) -> RepackagingChunkProvider {
        let pack =
            CoderPack::inspect(engine.as_ref(), InputStream::from_bytes(stream.to_bytes())).unwrap();
        let session = ProviderSession::new(engine, pack, 0, ChunkingConfig::default());
        RepackagingChunkProvider::new(session, ContainerFormat::Mp4)
    }

    #[test]
    fn test_cuts_on_first_key_frame_after_target() {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let stream = SyntheticStream::new(12_000).with_keyframes_at(&[0, 4000, 8000]);
        let mut provider = provider(engine, &stream);
        let mut chunks = ChunkRecorder::new();

        let run = provider
            .provide_chunks(&mut chunks, Arc::new(DiscardMetadata))
            .unwrap();

        assert_eq!(chunks.spans(), vec![(0, 8000), (8000, 12_000)]);
        assert_eq!(run.chunks_emitted, 2);
        assert_eq!(run.units_processed, 300);
        assert!(!run.cancelled);

        let recorded = chunks.chunks();
        assert_eq!(recorded[0].key_frames, vec![0, 4000]);
        assert!(!recorded[0].is_last());
        assert_eq!(recorded[1].key_frames, vec![8000]);
        assert_eq!(recorded[1].previous_chunk_last_ms, Some(8000));
    }

    #[test]
    fn test_chunks_are_standalone_containers() {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let stream = SyntheticStream::new(6000).with_keyframe_interval(2000);
        let mut provider = provider(engine, &stream);
        let mut chunks = ChunkRecorder::new();
        provider
            .provide_chunks(&mut chunks, Arc::new(DiscardMetadata))
            .unwrap();

        let recorded = chunks.chunks();
        assert_eq!(chunks.spans(), vec![(0, 6000)]);
        let (header, packets) = container::parse(&recorded[0].data).unwrap();
        assert_eq!(header.format_name, "mp4");
        assert_eq!(packets.len(), 150);
        // Timestamps restart at zero within each chunk
        assert_eq!(packets[0].decode_millis(), Some(0));
        assert!(packets[0].is_key);
    }

    #[test]
    fn test_overflow_cut_without_key_frames() {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let stream = SyntheticStream::new(20_000).with_single_keyframe();
        let mut provider = provider(engine, &stream);
        let mut chunks = ChunkRecorder::new();
        provider
            .provide_chunks(&mut chunks, Arc::new(DiscardMetadata))
            .unwrap();

        assert_eq!(chunks.spans(), vec![(0, 15_040), (15_040, 20_000)]);
        let recorded = chunks.chunks();
        assert!(recorded[1].key_frames.is_empty());
    }

    #[test]
    fn test_metadata_forwarded_without_affecting_boundaries() {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let stream = SyntheticStream::new(12_000)
            .with_keyframes_at(&[0, 4000, 8000])
            .with_metadata_every(1000)
            .with_interleaved_metadata();
        let mut provider = provider(engine, &stream);
        let mut chunks = ChunkRecorder::new();
        let metadata = Arc::new(MetadataRecorder::new());

        provider.provide_chunks(&mut chunks, metadata.clone()).unwrap();

        assert_eq!(chunks.spans(), vec![(0, 8000), (8000, 12_000)]);
        let entries = metadata.entries();
        assert_eq!(entries.len(), 12);
        assert_eq!(entries[3].0, 3000);
        assert_eq!(
            entries[3].1,
            Bytes::from(SyntheticStream::metadata_content(3000))
        );
    }

    #[test]
    fn test_write_failure_keeps_open_chunk() {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::with_write_failure_at(10));
        let stream = SyntheticStream::new(4000);
        let mut provider = provider(engine, &stream);
        let mut chunks = ChunkRecorder::new();

        let err = provider
            .provide_chunks(&mut chunks, Arc::new(DiscardMetadata))
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(chunks.is_empty());

        let session = provider.into_session();
        assert!(session.timeline().is_open());
        assert!(session.pack().is_valid());
    }

    #[test]
    fn test_cancel_before_first_packet_emits_nothing() {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let stream = SyntheticStream::new(12_000).with_keyframes_at(&[0, 4000, 8000]);
        let input = InputStream::from_bytes(stream.to_bytes());
        let handle = input.handle();
        let pack = CoderPack::inspect(engine.as_ref(), input).unwrap();
        let session = ProviderSession::new(engine, pack, 0, ChunkingConfig::default());
        let mut provider = RepackagingChunkProvider::new(session, ContainerFormat::Mp4);

        handle.cancel();
        let mut chunks = ChunkRecorder::new();
        let run = provider
            .provide_chunks(&mut chunks, Arc::new(DiscardMetadata))
            .unwrap();
        assert!(run.cancelled);
        assert!(chunks.is_empty());
    }

    /// Cancels the input once the first interior chunk arrives
    struct CancelAfterFirstChunk {
        inner: ChunkRecorder,
        handle: crate::input::InputHandle,
        last_calls: usize,
    }

    impl VideoChunkConsumer for CancelAfterFirstChunk {
        fn consume_video_chunk(&mut self, start: i64, end: i64, data: Bytes, keys: Vec<i64>) {
            self.inner.consume_video_chunk(start, end, data, keys);
            self.handle.cancel();
        }

        fn consume_last_chunk(
            &mut self,
            start: i64,
            end: i64,
            previous: i64,
            data: Bytes,
            keys: Vec<i64>,
        ) {
            self.last_calls += 1;
            self.inner.consume_last_chunk(start, end, previous, data, keys);
        }
    }

    #[test]
    fn test_cancel_mid_chunk_flushes_partial_once() {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let stream =
            SyntheticStream::new(20_000).with_keyframes_at(&[0, 4000, 8000, 12_000, 16_000]);
        let input = InputStream::from_bytes(stream.to_bytes());
        let handle = input.handle();
        let pack = CoderPack::inspect(engine.as_ref(), input).unwrap();
        let session = ProviderSession::new(engine, pack, 0, ChunkingConfig::default());
        let mut provider = RepackagingChunkProvider::new(session, ContainerFormat::Mp4);

        let mut consumer = CancelAfterFirstChunk {
            inner: ChunkRecorder::new(),
            handle,
            last_calls: 0,
        };
        let run = provider
            .provide_chunks(&mut consumer, Arc::new(DiscardMetadata))
            .unwrap();

        assert!(run.cancelled);
        assert_eq!(consumer.last_calls, 1);
        let recorded = consumer.inner.chunks();
        assert_eq!(recorded.len(), 2);
        assert_eq!((recorded[0].start_ms, recorded[0].end_ms), (0, 8000));

        // Only the key frame that triggered the cut made it into the partial
        let partial = &recorded[1];
        assert!(partial.is_last());
        assert_eq!((partial.start_ms, partial.end_ms), (8000, 8040));
        assert_eq!(partial.previous_chunk_last_ms, Some(8000));
        assert_eq!(partial.key_frames, vec![8000]);
        assert!(!partial.data.is_empty());
    }

    #[test]
    fn test_timestamp_jump_adds_no_time() {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());

        // Twelve second jump, below the overflow limit
        let stream = SyntheticStream::new(12_000)
            .with_single_keyframe()
            .with_timestamp_jump(6000, 12_000);
        let mut repackager = provider(engine.clone(), &stream);
        let mut chunks = ChunkRecorder::new();
        repackager
            .provide_chunks(&mut chunks, Arc::new(DiscardMetadata))
            .unwrap();
        assert_eq!(chunks.spans(), vec![(0, 12_000)]);

        // Ten minute jump with regular key frames
        let stream = SyntheticStream::new(12_000).with_timestamp_jump(6000, 600_000);
        let mut repackager = provider(engine, &stream);
        let mut chunks = ChunkRecorder::new();
        repackager
            .provide_chunks(&mut chunks, Arc::new(DiscardMetadata))
            .unwrap();
        assert_eq!(chunks.spans(), vec![(0, 6000), (6000, 12_000)]);
        assert_eq!(chunks.chunks()[1].key_frames, vec![6000, 8000, 10_000]);
    }
}
