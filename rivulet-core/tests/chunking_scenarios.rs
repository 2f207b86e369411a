//! End-to-end chunking scenarios.
//!
//! These tests drive synthetic streams through the public factory and
//! orchestrator APIs with the simulation engine, covering chunk boundaries,
//! timestamp discontinuities, cancellation, failover and persistence.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use rivulet_core::chunking::{
    ChunkProvider, ChunkRecorder, ChunkingRequest, ProviderKind, VideoChunkConsumer,
};
use rivulet_core::config::RivuletConfig;
use rivulet_core::decode::{DiscardMetadata, MetadataContentHandler, MetadataRecorder};
use rivulet_core::engine::MediaEngine;
use rivulet_core::engine::simulation::SimulationEngine;
use rivulet_core::engine::simulation::fixture::SyntheticStream;
use rivulet_core::input::InputHandle;
use rivulet_core::persistence::{DirectoryChunkSink, MemoryChunkSink, MemorySinkConfig};
use rivulet_core::{ChunkProviderFactory, FramePool, InputStream, StreamChunkOrchestrator};

/// Wires a simulation engine, factory and sink the way a service would.
struct ScenarioFixture {
    engine: Arc<SimulationEngine>,
    factory: Arc<ChunkProviderFactory>,
    config: RivuletConfig,
}

impl ScenarioFixture {
    fn new() -> Self {
        Self::with_engine(SimulationEngine::new())
    }

    fn with_engine(engine: SimulationEngine) -> Self {
        let config = RivuletConfig::for_testing().with_target(Duration::from_secs(5));
        let engine = Arc::new(engine);
        let dyn_engine: Arc<dyn MediaEngine> = engine.clone();
        let pool = FramePool::new(config.frame_pool.clone());
        let factory = Arc::new(ChunkProviderFactory::from_config(dyn_engine, pool, &config));
        Self {
            engine,
            factory,
            config,
        }
    }

    fn memory_sink(&self) -> Arc<MemoryChunkSink> {
        Arc::new(MemoryChunkSink::unswept(MemorySinkConfig::from(
            &self.config.persistence,
        )))
    }

    /// Runs one provider to completion without the orchestrator
    fn chunk_directly(&self, stream: &SyntheticStream, consumer: &mut dyn VideoChunkConsumer) {
        let mut provider = self
            .factory
            .create_provider(InputStream::from_bytes(stream.to_bytes()), 0)
            .unwrap();
        let metadata: Arc<dyn MetadataContentHandler> = Arc::new(DiscardMetadata);
        provider.provide_chunks(consumer, metadata).unwrap();
    }
}

/// Consumer that cancels its input as soon as the first interior chunk
/// arrives
struct CancelAfterFirstChunk {
    inner: ChunkRecorder,
    handle: InputHandle,
    last_calls: usize,
}

impl VideoChunkConsumer for CancelAfterFirstChunk {
    fn consume_video_chunk(&mut self, start_ms: i64, end_ms: i64, data: Bytes, key_frames: Vec<i64>) {
        self.inner
            .consume_video_chunk(start_ms, end_ms, data, key_frames);
        self.handle.cancel();
    }

    fn consume_last_chunk(
        &mut self,
        start_ms: i64,
        end_ms: i64,
        previous_chunk_last_ms: i64,
        data: Bytes,
        key_frames: Vec<i64>,
    ) {
        self.last_calls += 1;
        self.inner
            .consume_last_chunk(start_ms, end_ms, previous_chunk_last_ms, data, key_frames);
    }
}

#[tokio::test]
async fn test_keyframe_aligned_boundaries() {
    let fixture = ScenarioFixture::new();
    let sink = fixture.memory_sink();
    let orchestrator = StreamChunkOrchestrator::new(
        fixture.factory.clone(),
        sink.clone(),
        &fixture.config.persistence,
    );

    let stream = SyntheticStream::new(12_000).with_keyframes_at(&[0, 4000, 8000]);
    let request = ChunkingRequest::new("camera-1", InputStream::from_bytes(stream.to_bytes()), 0);
    let report = orchestrator.run(request).await.unwrap();

    assert_eq!(report.provider, ProviderKind::Repackaging);
    assert_eq!(report.chunks_persisted, 2);

    let chunks = sink.chunks_for("camera-1").await;
    let spans: Vec<_> = chunks.iter().map(|c| (c.start_ms, c.end_ms)).collect();
    assert_eq!(spans, vec![(0, 8000), (8000, 12_000)]);
    assert_eq!(chunks[0].key_frames, vec![0, 4000]);
    assert_eq!(chunks[1].key_frames, vec![8000]);
    assert_eq!(chunks[1].previous_chunk_last_ms, Some(8000));
}

fn total_span(recorder: &ChunkRecorder) -> i64 {
    let spans = recorder.spans();
    match (spans.first(), spans.last()) {
        (Some(first), Some(last)) => last.1 - first.0,
        _ => 0,
    }
}

#[test]
fn test_repackaged_timestamp_jump_adds_no_time() {
    let fixture = ScenarioFixture::new();
    for jump_ms in [12_000, 600_000] {
        let stream = SyntheticStream::new(12_000).with_timestamp_jump(6000, jump_ms);
        let mut recorder = ChunkRecorder::new();
        fixture.chunk_directly(&stream, &mut recorder);

        // Cut on the 6 s key frame right after the jump, not ten minutes later
        assert_eq!(
            recorder.spans(),
            vec![(0, 6000), (6000, 12_000)],
            "jump of {jump_ms} ms"
        );
        assert_eq!(total_span(&recorder), stream.duration_ms());
    }
}

#[test]
fn test_repackaged_jump_without_key_frames() {
    let fixture = ScenarioFixture::new();
    let stream = SyntheticStream::new(12_000)
        .with_single_keyframe()
        .with_timestamp_jump(6000, 12_000);
    let mut recorder = ChunkRecorder::new();
    fixture.chunk_directly(&stream, &mut recorder);

    assert_eq!(recorder.spans(), vec![(0, 12_000)]);
}

#[test]
fn test_transcoded_timestamp_jump_is_clamped_to_target() {
    let fixture = ScenarioFixture::new();
    for jump_ms in [12_000, 600_000] {
        let stream = SyntheticStream::new(12_000)
            .with_codec("vp6f")
            .with_timestamp_jump(6000, jump_ms);
        let mut recorder = ChunkRecorder::new();
        fixture.chunk_directly(&stream, &mut recorder);

        let spans = recorder.spans();
        assert_eq!(spans[1], (5000, 10_000), "jump of {jump_ms} ms");
        assert_eq!(spans, vec![(0, 5000), (5000, 10_000), (10_000, 12_000)]);
        assert_eq!(total_span(&recorder), stream.duration_ms());
    }
}

#[test]
fn test_cancel_mid_chunk_flushes_partial_once() {
    let fixture = ScenarioFixture::new();
    let stream = SyntheticStream::new(20_000).with_keyframes_at(&[0, 4000, 8000, 12_000, 16_000]);
    let input = InputStream::from_bytes(stream.to_bytes());
    let mut consumer = CancelAfterFirstChunk {
        inner: ChunkRecorder::new(),
        handle: input.handle(),
        last_calls: 0,
    };

    let mut provider = fixture.factory.create_provider(input, 0).unwrap();
    let run = provider
        .provide_chunks(&mut consumer, Arc::new(DiscardMetadata))
        .unwrap();

    assert!(run.cancelled);
    assert_eq!(consumer.last_calls, 1);
    let chunks = consumer.inner.chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!((chunks[0].start_ms, chunks[0].end_ms), (0, 8000));

    let last = &chunks[1];
    assert!(last.is_last());
    assert_eq!(last.start_ms, 8000);
    assert_eq!(last.previous_chunk_last_ms, Some(8000));
    assert!(last.end_ms < 20_000);
    assert!(!last.data.is_empty());
}

#[tokio::test]
async fn test_failover_resumes_same_input() {
    let fixture = ScenarioFixture::with_engine(SimulationEngine::with_write_failure_at(100));
    let sink = fixture.memory_sink();
    let orchestrator = StreamChunkOrchestrator::new(
        fixture.factory.clone(),
        sink.clone(),
        &fixture.config.persistence,
    );

    let stream = SyntheticStream::new(12_000).with_metadata_every(1000);
    let bytes = stream.to_bytes();
    let total = bytes.len() as u64;
    let metadata = Arc::new(MetadataRecorder::new());
    let request = ChunkingRequest::new("camera-1", InputStream::from_bytes(bytes), 0)
        .with_metadata_handler(metadata.clone());

    let report = orchestrator.run(request).await.unwrap();
    assert!(report.failover_used);
    assert_eq!(report.provider, ProviderKind::Transcoding);
    assert_eq!(fixture.factory.failovers_created(), 1);
    assert_eq!(fixture.engine.inputs_opened(), 1);
    assert_eq!(report.bytes_read, total);

    // Every metadata packet is seen exactly once across both providers
    let times: Vec<i64> = metadata.entries().iter().map(|(t, _)| *t).collect();
    assert_eq!(times, (0..12).map(|s| s * 1000).collect::<Vec<_>>());

    let chunks = sink.chunks_for("camera-1").await;
    assert_eq!(chunks.first().map(|c| c.start_ms), Some(0));
    assert_eq!(chunks.last().map(|c| c.end_ms), Some(12_000));
}

#[tokio::test]
async fn test_directory_sink_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = ScenarioFixture::new();
    let sink = Arc::new(DirectoryChunkSink::new(dir.path()).with_extension("rsim"));
    let orchestrator =
        StreamChunkOrchestrator::new(fixture.factory.clone(), sink.clone(), &fixture.config.persistence);

    let start = 1_700_000_000_000;
    let stream = SyntheticStream::new(15_000);
    let request = ChunkingRequest::new("lobby", InputStream::from_bytes(stream.to_bytes()), start)
        .with_stream_end(start + 14_000);
    let report = orchestrator.run(request).await.unwrap();
    assert!(report.last_chunk_persisted);

    let entries = sink.list("lobby").await.unwrap();
    assert_eq!(entries.len(), report.chunks_persisted);
    assert_eq!(entries.first().map(|e| e.start_ms), Some(start));
    // Final chunk clamped to the known end
    assert_eq!(entries.last().map(|e| e.end_ms), Some(start + 14_000));
    for entry in &entries {
        let payload = sink.chunk_path("lobby", entry.start_ms, entry.end_ms);
        assert_eq!(std::fs::metadata(payload).unwrap().len(), entry.size);
        assert!(entry.expires_at_ms > chrono::Utc::now().timestamp_millis());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_repackaged_chunks_tile_the_stream(
        frames in 1i64..600,
        keys in proptest::collection::btree_set(0i64..600, 0..20),
        target_secs in 1u64..6,
    ) {
        let config = RivuletConfig::for_testing().with_target(Duration::from_secs(target_secs));
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let pool = FramePool::new(config.frame_pool.clone());
        let factory = ChunkProviderFactory::from_config(engine, pool, &config);

        let duration = frames * 40;
        let key_times: Vec<i64> = keys.into_iter().filter(|k| *k < frames).map(|k| k * 40).collect();
        let stream = SyntheticStream::new(duration).with_keyframes_at(&key_times);

        let start = 5_000_000;
        let mut recorder = ChunkRecorder::new();
        let mut provider = factory
            .create_provider(InputStream::from_bytes(stream.to_bytes()), start)
            .unwrap();
        provider.provide_chunks(&mut recorder, Arc::new(DiscardMetadata)).unwrap();

        let chunks = recorder.chunks();
        prop_assert!(!chunks.is_empty());
        prop_assert_eq!(chunks[0].start_ms, start);
        prop_assert_eq!(chunks[chunks.len() - 1].end_ms, start + duration);
        prop_assert_eq!(chunks.iter().filter(|c| c.is_last()).count(), 1);
        prop_assert!(chunks[chunks.len() - 1].is_last());

        let limit = (target_secs as i64) * 1000 * 4;
        for pair in chunks.windows(2) {
            prop_assert_eq!(pair[0].end_ms, pair[1].start_ms);
        }
        for chunk in &chunks {
            prop_assert!(chunk.end_ms > chunk.start_ms);
            prop_assert!(chunk.duration_ms() <= limit);
            prop_assert!(chunk.key_frames.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(chunk.key_frames.iter().all(|k| *k >= chunk.start_ms && *k < chunk.end_ms));
        }
    }
}
