//! Deterministic in-process codec engine
//!
//! Reads and writes the RSIM container (see [`container`]) and decodes the
//! simulated bitstream from [`codec`]. Used by the test suite, the benchmark
//! and the CLI `simulate` command, and able to inject muxer write failures
//! so failover paths can be exercised without a real codec library.

pub mod codec;
pub mod container;
pub mod fixture;

use std::io::BufReader;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tracing::debug;

use self::codec::{SimDecoder, SimEncoder, SimResampler};
use self::container::RsimHeader;
use crate::engine::{
    ContainerFormat, DemuxedInput, EncoderSpec, EngineError, EngineResult, FrameResampler,
    FrameSpec, MediaEngine, OutputContainer, Packet, PixelFormat, TrackInfo, TrackKind,
    VideoDecoder, VideoEncoder,
};
use crate::input::InputStream;

/// Frame shape assumed when a video track does not declare one
const FALLBACK_FRAME: FrameSpec = FrameSpec::new(PixelFormat::Yuv420p, 16, 16);

/// Failures to inject into the simulated muxer
#[derive(Debug, Default)]
struct FaultPlan {
    /// 1-based index of the packet write (across all outputs) that fails
    fail_write_at: Option<usize>,
    fail_encoder_open: bool,
    writes: AtomicUsize,
}

impl FaultPlan {
    fn on_write(&self) -> EngineResult<()> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_write_at == Some(write) {
            return Err(EngineError::Write {
                reason: format!("injected failure on write {write}"),
            });
        }
        Ok(())
    }
}

/// Creates outputs sharing the engine's fault plan
#[derive(Debug, Clone)]
pub(crate) struct OutputFactory {
    faults: Arc<FaultPlan>,
}

impl OutputFactory {
    pub(crate) fn open(
        &self,
        format: &ContainerFormat,
        mut track: TrackInfo,
    ) -> EngineResult<Box<dyn OutputContainer>> {
        track.index = 0;
        let header = RsimHeader {
            format_name: format.muxer_name().to_string(),
            tracks: vec![track],
        };
        let mut buffer = Vec::new();
        container::write_header(&mut buffer, &header)?;
        Ok(Box::new(SimOutput {
            buffer,
            packets: 0,
            faults: Arc::clone(&self.faults),
        }))
    }
}

/// Simulation engine for tests and offline runs
#[derive(Debug, Default)]
pub struct SimulationEngine {
    faults: Arc<FaultPlan>,
    inputs_opened: AtomicUsize,
    encoders_opened: AtomicUsize,
}

impl SimulationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `write`-th packet write (1-based, counted across every
    /// output this engine opens) fail with `EngineError::Write`.
    pub fn with_write_failure_at(write: usize) -> Self {
        Self {
            faults: Arc::new(FaultPlan {
                fail_write_at: Some(write),
                ..FaultPlan::default()
            }),
            ..Self::default()
        }
    }

    /// Makes every encoder open fail
    pub fn with_encoder_failure() -> Self {
        Self {
            faults: Arc::new(FaultPlan {
                fail_encoder_open: true,
                ..FaultPlan::default()
            }),
            ..Self::default()
        }
    }

    /// Number of containers opened so far
    pub fn inputs_opened(&self) -> usize {
        self.inputs_opened.load(Ordering::SeqCst)
    }

    pub fn encoders_opened(&self) -> usize {
        self.encoders_opened.load(Ordering::SeqCst)
    }

    /// Packet writes attempted across all outputs
    pub fn packet_writes(&self) -> usize {
        self.faults.writes.load(Ordering::SeqCst)
    }

    fn outputs(&self) -> OutputFactory {
        OutputFactory {
            faults: Arc::clone(&self.faults),
        }
    }
}

impl MediaEngine for SimulationEngine {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn open_input(&self, stream: InputStream) -> EngineResult<Box<dyn DemuxedInput>> {
        let mut reader = BufReader::new(stream);
        let header = container::read_header(&mut reader)?;
        self.inputs_opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Opened simulated container '{}' with {} tracks",
            header.format_name,
            header.tracks.len()
        );
        Ok(Box::new(SimInput {
            reader,
            header,
            outputs: self.outputs(),
        }))
    }

    fn open_encoder(&self, spec: &EncoderSpec) -> EngineResult<Box<dyn VideoEncoder>> {
        if self.faults.fail_encoder_open {
            return Err(EngineError::Encode {
                reason: format!("injected failure opening {} encoder", spec.codec_name),
            });
        }
        self.encoders_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimEncoder::new(spec.clone(), self.outputs())))
    }

    fn create_resampler(
        &self,
        from: FrameSpec,
        to: FrameSpec,
    ) -> EngineResult<Box<dyn FrameResampler>> {
        Ok(Box::new(SimResampler::new(from, to)))
    }
}

struct SimInput {
    reader: BufReader<InputStream>,
    header: RsimHeader,
    outputs: OutputFactory,
}

impl SimInput {
    fn track(&self, index: usize) -> EngineResult<&TrackInfo> {
        self.header
            .tracks
            .get(index)
            .ok_or_else(|| EngineError::Unsupported {
                what: format!("track {index} does not exist"),
            })
    }
}

impl DemuxedInput for SimInput {
    fn format_name(&self) -> &str {
        &self.header.format_name
    }

    fn tracks(&self) -> &[TrackInfo] {
        &self.header.tracks
    }

    fn read_packet(&mut self) -> EngineResult<Option<Packet>> {
        container::read_packet(&mut self.reader, &self.header.tracks)
    }

    fn open_decoder(&self, track_index: usize) -> EngineResult<Box<dyn VideoDecoder>> {
        let track = self.track(track_index)?;
        if track.kind != TrackKind::Video {
            return Err(EngineError::Unsupported {
                what: format!("decoding {:?} track {track_index}", track.kind),
            });
        }
        let spec = track.frame_spec().unwrap_or(FALLBACK_FRAME);
        Ok(Box::new(SimDecoder::new(spec)))
    }

    fn open_copy_output(
        &self,
        track_index: usize,
        format: &ContainerFormat,
    ) -> EngineResult<Box<dyn OutputContainer>> {
        let track = self.track(track_index)?.clone();
        self.outputs.open(format, track)
    }
}

struct SimOutput {
    buffer: Vec<u8>,
    packets: usize,
    faults: Arc<FaultPlan>,
}

impl OutputContainer for SimOutput {
    fn write_packet(&mut self, packet: &Packet) -> EngineResult<()> {
        self.faults.on_write()?;
        let packet = Packet {
            stream_index: 0,
            ..packet.clone()
        };
        container::write_packet(&mut self.buffer, &packet).map_err(|e| EngineError::Write {
            reason: e.to_string(),
        })?;
        self.packets += 1;
        Ok(())
    }

    fn packets_written(&self) -> usize {
        self.packets
    }

    fn finish(mut self: Box<Self>) -> EngineResult<Bytes> {
        container::write_trailer(&mut self.buffer)?;
        Ok(Bytes::from(self.buffer))
    }
}
