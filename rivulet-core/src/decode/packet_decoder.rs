//! Decodes single packets into pooled frames
//!
//! A packet may hold several frames, and decoders may consume it in pieces.
//! The decoder is called repeatedly from the last consumed offset until the
//! packet is exhausted. A run of consecutive failed calls (errors or calls
//! that made no progress) gives up on the packet.

use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, trace};

use super::frame_pool::{FramePool, PoolError, PooledBuffer, SuspendToken};
use super::DecodeError;
use crate::config::DecodeConfig;
use crate::engine::{FrameRef, FrameResampler, FrameSpec, MediaEngine, Packet, RawFrame, VideoDecoder};

/// Decoded frame backed by a pooled buffer. Dropping it returns the buffer.
#[derive(Debug)]
pub struct DecodedFrame {
    spec: FrameSpec,
    buffer: PooledBuffer,
}

impl DecodedFrame {
    pub fn spec(&self) -> FrameSpec {
        self.spec
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_frame_ref(&self) -> FrameRef<'_> {
        FrameRef {
            spec: self.spec,
            data: &self.buffer,
        }
    }
}

/// Receives decoded frames in decode order
pub trait FrameConsumer {
    /// `decode_timestamp_ms` is the packet's decode time in stream
    /// milliseconds. Returning `Break` stops decoding after this frame.
    fn consume_frame(&mut self, frame: DecodedFrame, decode_timestamp_ms: i64) -> ControlFlow<()>;
}

impl<F> FrameConsumer for F
where
    F: FnMut(DecodedFrame, i64) -> ControlFlow<()>,
{
    fn consume_frame(&mut self, frame: DecodedFrame, decode_timestamp_ms: i64) -> ControlFlow<()> {
        self(frame, decode_timestamp_ms)
    }
}

/// How decoding of one packet ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Packet fully consumed
    Decoded { frames: usize },
    /// Suspension was requested mid-packet
    Suspended,
    /// The frame consumer asked to stop
    Stopped,
}

enum Delivery {
    Delivered,
    Suspended,
    Stopped,
}

/// Per-stream packet decoder
pub struct PacketDecoder {
    engine: Arc<dyn MediaEngine>,
    pool: Arc<FramePool>,
    output: Option<FrameSpec>,
    resampler: Option<Box<dyn FrameResampler>>,
    max_attempts: u32,
    suspend: SuspendToken,
    last_timestamp_ms: i64,
    frames_decoded: u64,
}

impl PacketDecoder {
    pub fn new(engine: Arc<dyn MediaEngine>, pool: Arc<FramePool>, config: &DecodeConfig) -> Self {
        Self::with_suspend_token(engine, pool, config, SuspendToken::new())
    }

    pub(crate) fn with_suspend_token(
        engine: Arc<dyn MediaEngine>,
        pool: Arc<FramePool>,
        config: &DecodeConfig,
        suspend: SuspendToken,
    ) -> Self {
        Self {
            engine,
            pool,
            output: config.output_frame,
            resampler: None,
            max_attempts: config.max_decode_attempts.max(1),
            suspend,
            last_timestamp_ms: 0,
            frames_decoded: 0,
        }
    }

    /// Raises or clears suspension. Raising it also wakes any wait on the
    /// frame pool.
    pub fn suspend(&self, suspended: bool) {
        self.suspend.set(suspended);
        if suspended {
            self.pool.interrupt_waiters();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend.is_suspended()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Frame shape delivered to consumers, or `None` to pass decoder output
    /// through unchanged
    pub fn set_output_frame(&mut self, output: Option<FrameSpec>) {
        self.output = output;
    }

    /// Decodes every frame in `packet`, handing each to `consumer`.
    ///
    /// # Errors
    /// - `DecodeError::PacketDecode` - the configured number of consecutive
    ///   decode calls failed
    /// - `DecodeError::Resample` - frame conversion failed
    /// - `DecodeError::Pool` - frame pool was shut down
    pub fn decode_packet(
        &mut self,
        decoder: &mut dyn VideoDecoder,
        packet: &Packet,
        consumer: &mut dyn FrameConsumer,
    ) -> Result<PacketOutcome, DecodeError> {
        let timestamp = packet.decode_millis().unwrap_or(self.last_timestamp_ms);
        self.last_timestamp_ms = timestamp;

        let mut offset = 0;
        let mut failures = 0u32;
        let mut frames = 0;

        while offset < packet.len() {
            if self.suspend.is_suspended() {
                return Ok(PacketOutcome::Suspended);
            }

            let failure = match decoder.decode(packet, offset) {
                Ok(step) if step.consumed == 0 && step.frame.is_none() => {
                    "decoder made no progress".to_string()
                }
                Ok(step) => {
                    failures = 0;
                    offset += step.consumed;
                    if let Some(frame) = step.frame {
                        match self.deliver(frame, timestamp, consumer)? {
                            Delivery::Delivered => frames += 1,
                            Delivery::Suspended => return Ok(PacketOutcome::Suspended),
                            Delivery::Stopped => return Ok(PacketOutcome::Stopped),
                        }
                    }
                    continue;
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            trace!(
                "Decode attempt {} at offset {} failed: {}",
                failures, offset, failure
            );
            if failures >= self.max_attempts {
                return Err(DecodeError::PacketDecode {
                    attempts: failures,
                    reason: failure,
                });
            }
        }

        loop {
            let pending = decoder
                .receive_pending()
                .map_err(|e| DecodeError::PacketDecode {
                    attempts: 1,
                    reason: e.to_string(),
                })?;
            let Some(frame) = pending else { break };
            match self.deliver(frame, timestamp, consumer)? {
                Delivery::Delivered => frames += 1,
                Delivery::Suspended => return Ok(PacketOutcome::Suspended),
                Delivery::Stopped => return Ok(PacketOutcome::Stopped),
            }
        }

        Ok(PacketOutcome::Decoded { frames })
    }

    fn deliver(
        &mut self,
        frame: RawFrame,
        timestamp: i64,
        consumer: &mut dyn FrameConsumer,
    ) -> Result<Delivery, DecodeError> {
        let frame = self.convert(frame)?;

        let mut buffer = match self.pool.acquire(frame.data.len(), &self.suspend) {
            Ok(buffer) => buffer,
            Err(PoolError::Interrupted) => return Ok(Delivery::Suspended),
            Err(e @ PoolError::ShutDown) => return Err(e.into()),
        };
        buffer.copy_from_slice(&frame.data);
        self.frames_decoded += 1;

        let decoded = DecodedFrame {
            spec: frame.spec,
            buffer,
        };
        match consumer.consume_frame(decoded, timestamp) {
            ControlFlow::Continue(()) => Ok(Delivery::Delivered),
            ControlFlow::Break(()) => Ok(Delivery::Stopped),
        }
    }

    fn convert(&mut self, frame: RawFrame) -> Result<RawFrame, DecodeError> {
        let Some(target) = self.output else {
            return Ok(frame);
        };
        if frame.spec == target {
            return Ok(frame);
        }

        let stale = self
            .resampler
            .as_ref()
            .is_some_and(|r| r.input_spec() != frame.spec || r.output_spec() != target);
        if self.resampler.is_none() || stale {
            debug!("Allocating frame converter {} -> {}", frame.spec, target);
            let resampler = self
                .engine
                .create_resampler(frame.spec, target)
                .map_err(|e| DecodeError::Resample {
                    reason: e.to_string(),
                })?;
            self.resampler = Some(resampler);
        }

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(frame);
        };
        resampler
            .resample(frame.as_frame_ref())
            .map_err(|e| DecodeError::Resample {
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramePoolConfig;
    use crate::engine::simulation::SimulationEngine;
    use crate::engine::simulation::codec::{
        SimDecoder, corrupt_unit, flaky_unit, frame_unit, stall_unit,
    };
    use crate::engine::{PixelFormat, TimeBase};
    use bytes::Bytes;

    const SPEC: FrameSpec = FrameSpec::new(PixelFormat::Gray8, 2, 2);

    fn decoder_with(config: DecodeConfig) -> (PacketDecoder, Arc<FramePool>) {
        let pool = FramePool::new(FramePoolConfig::for_testing());
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        (PacketDecoder::new(engine, Arc::clone(&pool), &config), pool)
    }

    fn packet(units: Vec<Vec<u8>>, dts_ms: i64) -> Packet {
        Packet {
            stream_index: 0,
            pts: Some(dts_ms + 80),
            dts: Some(dts_ms),
            duration: Some(40),
            time_base: TimeBase::MILLIS,
            is_key: false,
            data: Bytes::from(units.concat()),
        }
    }

    fn ignore_frames() -> impl FnMut(DecodedFrame, i64) -> ControlFlow<()> {
        |_: DecodedFrame, _: i64| ControlFlow::Continue(())
    }

    #[test]
    fn test_multi_frame_packet_delivers_every_frame_with_dts() {
        let (mut decoder, pool) = decoder_with(DecodeConfig::default());
        let mut sim = SimDecoder::new(SPEC);
        let mut seen = Vec::new();
        let mut consumer = |frame: DecodedFrame, ts: i64| {
            seen.push((frame.data().to_vec(), ts));
            ControlFlow::Continue(())
        };

        let outcome = decoder
            .decode_packet(&mut sim, &packet(vec![frame_unit(&[1]), frame_unit(&[2])], 400), &mut consumer)
            .unwrap();

        assert_eq!(outcome, PacketOutcome::Decoded { frames: 2 });
        assert_eq!(seen, vec![(vec![1; 4], 400), (vec![2; 4], 400)]);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[test]
    fn test_gives_up_after_consecutive_failures() {
        let (mut decoder, pool) = decoder_with(DecodeConfig::default());
        let mut sim = SimDecoder::new(SPEC);
        let mut consumer = ignore_frames();

        let result = decoder.decode_packet(&mut sim, &packet(vec![corrupt_unit()], 0), &mut consumer);
        assert!(matches!(
            result,
            Err(DecodeError::PacketDecode { attempts: 3, .. })
        ));
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[test]
    fn test_no_progress_counts_as_failure() {
        let (mut decoder, _pool) = decoder_with(DecodeConfig::default());
        let mut sim = SimDecoder::new(SPEC);
        let mut consumer = ignore_frames();

        let result = decoder.decode_packet(&mut sim, &packet(vec![stall_unit()], 0), &mut consumer);
        assert!(matches!(result, Err(DecodeError::PacketDecode { .. })));
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let (mut decoder, _pool) = decoder_with(DecodeConfig::default());
        let mut sim = SimDecoder::new(SPEC);
        let mut consumer = ignore_frames();

        let outcome = decoder
            .decode_packet(&mut sim, &packet(vec![flaky_unit(&[5])], 0), &mut consumer)
            .unwrap();
        assert_eq!(outcome, PacketOutcome::Decoded { frames: 1 });
    }

    #[test]
    fn test_single_attempt_config_fails_fast() {
        let config = DecodeConfig {
            max_decode_attempts: 1,
            ..DecodeConfig::default()
        };
        let (mut decoder, _pool) = decoder_with(config);
        let mut sim = SimDecoder::new(SPEC);
        let mut consumer = ignore_frames();

        let result = decoder.decode_packet(&mut sim, &packet(vec![flaky_unit(&[5])], 0), &mut consumer);
        assert!(matches!(
            result,
            Err(DecodeError::PacketDecode { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_frames_converted_to_output_shape() {
        let target = FrameSpec::new(PixelFormat::Yuv420p, 4, 4);
        let config = DecodeConfig {
            output_frame: Some(target),
            ..DecodeConfig::default()
        };
        let (mut decoder, _pool) = decoder_with(config);
        let mut sim = SimDecoder::new(SPEC);
        let mut specs = Vec::new();
        let mut consumer = |frame: DecodedFrame, _: i64| {
            specs.push((frame.spec(), frame.data().len()));
            ControlFlow::Continue(())
        };

        decoder
            .decode_packet(&mut sim, &packet(vec![frame_unit(&[1]), frame_unit(&[2])], 0), &mut consumer)
            .unwrap();
        assert_eq!(specs, vec![(target, 24), (target, 24)]);
    }

    #[test]
    fn test_consumer_break_stops_mid_packet() {
        let (mut decoder, _pool) = decoder_with(DecodeConfig::default());
        let mut sim = SimDecoder::new(SPEC);
        let mut calls = 0;
        let mut consumer = |_: DecodedFrame, _: i64| {
            calls += 1;
            ControlFlow::Break(())
        };

        let outcome = decoder
            .decode_packet(&mut sim, &packet(vec![frame_unit(&[1]), frame_unit(&[2])], 0), &mut consumer)
            .unwrap();
        assert_eq!(outcome, PacketOutcome::Stopped);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_suspension_returns_without_decoding() {
        let (mut decoder, _pool) = decoder_with(DecodeConfig::default());
        let mut sim = SimDecoder::new(SPEC);
        let mut consumer = ignore_frames();

        decoder.suspend(true);
        let outcome = decoder
            .decode_packet(&mut sim, &packet(vec![frame_unit(&[1])], 0), &mut consumer)
            .unwrap();
        assert_eq!(outcome, PacketOutcome::Suspended);
        assert_eq!(decoder.frames_decoded(), 0);
    }

    #[test]
    fn test_exhausted_pool_with_suspension_interrupts() {
        let pool = FramePool::new(FramePoolConfig {
            capacity: 1,
            ..FramePoolConfig::for_testing()
        });
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let mut decoder = PacketDecoder::new(engine, Arc::clone(&pool), &DecodeConfig::default());
        let mut sim = SimDecoder::new(SPEC);

        // The consumer keeps the only buffer and raises suspension
        let token = decoder.suspend.clone();
        let mut held = Vec::new();
        let mut consumer = |frame: DecodedFrame, _: i64| {
            held.push(frame);
            token.set(true);
            ControlFlow::Continue(())
        };

        let outcome = decoder
            .decode_packet(&mut sim, &packet(vec![frame_unit(&[1]), frame_unit(&[2])], 0), &mut consumer)
            .unwrap();
        assert_eq!(outcome, PacketOutcome::Suspended);
        drop(consumer);
        assert_eq!(held.len(), 1);
    }
}
