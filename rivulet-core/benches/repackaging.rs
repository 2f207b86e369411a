use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use rivulet_core::chunking::{ChunkProvider, ChunkRecorder, ChunkTimeline};
use rivulet_core::config::RivuletConfig;
use rivulet_core::decode::DiscardMetadata;
use rivulet_core::engine::MediaEngine;
use rivulet_core::engine::simulation::SimulationEngine;
use rivulet_core::engine::simulation::fixture::SyntheticStream;
use rivulet_core::{ChunkProviderFactory, FramePool, InputStream};

fn bench_repackaging(c: &mut Criterion) {
    let config = RivuletConfig::for_testing();
    let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
    let pool = FramePool::new(config.frame_pool.clone());
    let factory = ChunkProviderFactory::from_config(engine, pool, &config);
    let stream = SyntheticStream::new(60_000).to_bytes();

    c.bench_function("repackage_one_minute", |b| {
        b.iter(|| {
            let mut recorder = ChunkRecorder::new();
            let mut provider = factory
                .create_provider(InputStream::from_bytes(stream.clone()), 0)
                .unwrap();
            provider
                .provide_chunks(&mut recorder, Arc::new(DiscardMetadata))
                .unwrap();
            black_box(recorder.len())
        });
    });
}

fn bench_timeline(c: &mut Criterion) {
    let target = RivuletConfig::default().chunking.target_duration;

    c.bench_function("timeline_cut_decisions", |b| {
        b.iter(|| {
            let mut timeline = ChunkTimeline::new(0, target, 3);
            let mut cuts = 0;
            for i in 0..10_000i64 {
                let ts = i * 40;
                let is_key = i % 50 == 0;
                timeline.observe(ts);
                if timeline.should_cut_repackaged(ts, is_key).is_some() {
                    timeline.close_at(ts);
                    cuts += 1;
                }
                if !timeline.is_open() {
                    timeline.open(ts);
                }
                if is_key {
                    timeline.record_key_frame(ts);
                }
            }
            black_box(cuts)
        });
    });
}

criterion_group!(benches, bench_repackaging, bench_timeline);
criterion_main!(benches);
