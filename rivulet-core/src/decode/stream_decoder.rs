//! Stream decoder state machine
//!
//! Pulls packets from an attached [`CoderPack`], routes video packets to the
//! [`PacketDecoder`] and metadata packets to every registered metadata
//! handler, and ignores everything else.
//!
//! ```text
//! Idle --attach--> Attached --decode--> Decoding --suspend--> Suspended
//!                     ^                    |                      |
//!                     +---- yield/finish --+                      |
//!                     +------------------- resume ----------------+
//! any --close--> Closed --attach--> Attached
//! ```
//!
//! The decode loop runs on the caller's thread. Suspension and closing may be
//! requested from any thread through a [`DecoderControl`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::frame_pool::{FramePool, SuspendToken};
use super::inspector::{CoderPack, PacketClass};
use super::metadata::{MetadataBroadcast, MetadataContentHandler};
use super::packet_decoder::{FrameConsumer, PacketDecoder, PacketOutcome};
use super::{DecodeError, StreamReadError};
use crate::config::DecodeConfig;
use crate::engine::{FrameSpec, MediaEngine};
use crate::input::InputStream;

/// Lifecycle state of a [`StreamDecoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// No coder pack attached
    Idle,
    Attached,
    Decoding,
    Suspended,
    Closed,
}

/// Inputs to the decoder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderEvent {
    Attach,
    Decode,
    Suspend,
    Resume,
    /// Decode loop returned with the source still readable
    Yield,
    /// Decode loop returned because the source ended or failed
    Finish,
    Close,
}

impl DecoderState {
    /// Applies `event`, rejecting transitions the lifecycle does not allow
    ///
    /// # Errors
    /// - `DecodeError::InvalidTransition` - event not valid in this state
    pub fn transition(self, event: DecoderEvent) -> Result<DecoderState, DecodeError> {
        use DecoderEvent as E;
        use DecoderState as S;

        let next = match (self, event) {
            (_, E::Close) => S::Closed,
            (S::Idle | S::Closed | S::Attached, E::Attach) => S::Attached,
            (S::Attached, E::Decode) => S::Decoding,
            (S::Attached | S::Decoding | S::Suspended, E::Suspend) => S::Suspended,
            (S::Suspended | S::Attached, E::Resume) => S::Attached,
            (S::Decoding, E::Yield | E::Finish) => S::Attached,
            (from, event) => return Err(DecodeError::InvalidTransition { from, event }),
        };
        Ok(next)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Counters kept by a [`StreamDecoder`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub packets_read: u64,
    pub video_packets: u64,
    pub metadata_packets: u64,
    pub ignored_packets: u64,
    pub bad_packets: u64,
    pub frames_decoded: u64,
}

struct DecoderShared {
    state: Mutex<DecoderState>,
    suspend: SuspendToken,
    closed: AtomicBool,
    pool: Arc<FramePool>,
}

impl DecoderShared {
    fn apply(&self, event: DecoderEvent) -> Result<DecoderState, DecodeError> {
        let mut state = self.state.lock();
        let next = state.transition(event)?;
        if *state != next {
            debug!("Decoder {:?} -> {:?} on {:?}", *state, next, event);
        }
        *state = next;
        Ok(next)
    }
}

/// Thread-safe handle for suspending or closing a running decoder
#[derive(Clone)]
pub struct DecoderControl {
    shared: Arc<DecoderShared>,
}

impl DecoderControl {
    /// Raises or clears suspension. A decode loop in progress stops at the
    /// next packet or frame boundary; a blocked frame buffer wait is
    /// interrupted.
    pub fn suspend(&self, suspended: bool) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        shared.suspend.set(suspended);
        if suspended {
            shared.pool.interrupt_waiters();
            let mut state = shared.state.lock();
            if *state == DecoderState::Attached {
                *state = DecoderState::Suspended;
            }
        } else {
            let mut state = shared.state.lock();
            if *state == DecoderState::Suspended {
                *state = DecoderState::Attached;
            }
        }
    }

    /// Closes the decoder. The owner releases the coder pack on its next
    /// call. Closing twice is a no-op.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Interrupts any pool wait; the flag is meaningless once closed
        shared.suspend.set(true);
        shared.pool.interrupt_waiters();
        *shared.state.lock() = DecoderState::Closed;
    }

    pub fn state(&self) -> DecoderState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Decodes one attached stream, delivering frames and metadata
pub struct StreamDecoder {
    engine: Arc<dyn MediaEngine>,
    shared: Arc<DecoderShared>,
    pack: Option<CoderPack>,
    packets: PacketDecoder,
    metadata: MetadataBroadcast,
    bad_packet_logged: bool,
    stats: DecoderStats,
}

impl StreamDecoder {
    pub fn new(engine: Arc<dyn MediaEngine>, pool: Arc<FramePool>, config: &DecodeConfig) -> Self {
        let suspend = SuspendToken::new();
        let packets = PacketDecoder::with_suspend_token(
            Arc::clone(&engine),
            Arc::clone(&pool),
            config,
            suspend.clone(),
        );
        Self {
            engine,
            shared: Arc::new(DecoderShared {
                state: Mutex::new(DecoderState::Idle),
                suspend,
                closed: AtomicBool::new(false),
                pool,
            }),
            pack: None,
            packets,
            metadata: MetadataBroadcast::default(),
            bad_packet_logged: false,
            stats: DecoderStats::default(),
        }
    }

    pub fn control(&self) -> DecoderControl {
        DecoderControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> DecoderState {
        *self.shared.state.lock()
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.packets.frames_decoded(),
            ..self.stats.clone()
        }
    }

    /// Registers a handler for metadata packets. Handlers are called in
    /// registration order.
    pub fn add_metadata_handler(&mut self, handler: Arc<dyn MetadataContentHandler>) {
        self.metadata.add(handler);
    }

    /// Overrides the shape frames are converted to before delivery
    pub fn set_output_frame(&mut self, output: Option<FrameSpec>) {
        self.packets.set_output_frame(output);
    }

    /// Inspects `stream` and attaches the result
    ///
    /// # Errors
    /// - Inspection errors from [`CoderPack::inspect`]
    /// - `DecodeError::InvalidTransition` - decoder is mid-decode
    pub fn attach(&mut self, stream: InputStream) -> Result<(), DecodeError> {
        let pack = CoderPack::inspect(self.engine.as_ref(), stream)?;
        self.attach_pack(pack)
    }

    /// Attaches an already inspected coder pack
    ///
    /// # Errors
    /// - `DecodeError::InvalidTransition` - decoder is mid-decode or suspended
    pub fn attach_pack(&mut self, pack: CoderPack) -> Result<(), DecodeError> {
        self.shared.apply(DecoderEvent::Attach)?;
        self.shared.closed.store(false, Ordering::SeqCst);
        self.shared.suspend.set(false);
        info!(
            "Decoder attached to {} ({})",
            pack.input_handle().label(),
            pack.codec_name()
        );
        self.pack = Some(pack);
        Ok(())
    }

    /// Resumes decoding from a replacement byte source after the previous one
    /// broke. Track selection and the open decoder are kept.
    ///
    /// # Errors
    /// - `DecodeError::InvalidTransition` - nothing attached or decoder closed
    /// - `DecodeError::ContainerOpen` - replacement could not be opened
    pub fn resume_with(&mut self, stream: InputStream) -> Result<(), DecodeError> {
        let state = self.state();
        let Some(pack) = self.pack.as_mut() else {
            return Err(DecodeError::InvalidTransition {
                from: state,
                event: DecoderEvent::Attach,
            });
        };
        if state.is_closed() || state == DecoderState::Decoding {
            return Err(DecodeError::InvalidTransition {
                from: state,
                event: DecoderEvent::Attach,
            });
        }
        pack.replace_input(self.engine.as_ref(), stream)?;
        self.shared.suspend.set(false);
        self.shared.apply(DecoderEvent::Resume)?;
        Ok(())
    }

    /// Raises or clears suspension from the owning thread
    pub fn suspend(&self, suspended: bool) {
        self.control().suspend(suspended);
    }

    /// True when the attached source was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.pack.as_ref().is_some_and(CoderPack::is_cancelled)
    }

    /// Runs the decode loop until the stream ends, suspension is requested,
    /// the frame consumer stops, or the decoder is closed.
    ///
    /// Returns `Ok(false)` when there is nothing to decode: no coder pack, an
    /// exhausted pack, or a closed decoder. Returns `Ok(true)` when the loop
    /// ran and stopped for suspension, a consumer stop, or cancellation of
    /// the source.
    ///
    /// Individual packets that fail to decode are skipped. The first such
    /// failure is logged as a warning, later ones at debug level.
    ///
    /// # Errors
    /// - `DecodeError::StreamRead` - source reached its end or failed, and was
    ///   not cancelled
    /// - `DecodeError::Pool` - frame pool shut down
    /// - `DecodeError::Resample` - frame conversion failed
    pub fn decode(&mut self, frames: &mut dyn FrameConsumer) -> Result<bool, DecodeError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            self.release();
            return Ok(false);
        }
        if !self.pack.as_ref().is_some_and(CoderPack::is_valid) {
            return Ok(false);
        }
        if self.shared.suspend.is_suspended() {
            self.shared.apply(DecoderEvent::Suspend)?;
            return Ok(true);
        }
        self.shared.apply(DecoderEvent::Decode)?;

        let result = self.run_loop(frames);

        if self.shared.closed.load(Ordering::SeqCst) {
            self.release();
            return Ok(false);
        }
        result
    }

    fn run_loop(&mut self, frames: &mut dyn FrameConsumer) -> Result<bool, DecodeError> {
        let Some(pack) = self.pack.as_mut() else {
            return Ok(false);
        };

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(false);
            }
            if self.shared.suspend.is_suspended() {
                self.shared.apply(DecoderEvent::Suspend)?;
                return Ok(true);
            }
            if pack.is_cancelled() {
                debug!("Source cancelled, ending decode quietly");
                pack.invalidate();
                self.shared.apply(DecoderEvent::Finish)?;
                return Ok(true);
            }

            let packet = match pack.input_mut().read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    pack.invalidate();
                    self.shared.apply(DecoderEvent::Finish)?;
                    if pack.is_cancelled() {
                        return Ok(true);
                    }
                    info!("Decoder reached end of stream");
                    return Err(StreamReadError::EndOfStream.into());
                }
                Err(e) => {
                    pack.invalidate();
                    self.shared.apply(DecoderEvent::Finish)?;
                    if pack.is_cancelled() {
                        return Ok(true);
                    }
                    warn!("Decoder read failed: {}", e);
                    return Err(StreamReadError::Read {
                        reason: e.to_string(),
                    }
                    .into());
                }
            };
            self.stats.packets_read += 1;

            match pack.classify(&packet) {
                PacketClass::Video => {
                    self.stats.video_packets += 1;
                    match self.packets.decode_packet(pack.decoder_mut(), &packet, frames) {
                        Ok(PacketOutcome::Decoded { .. }) => {}
                        Ok(PacketOutcome::Suspended) => {
                            if self.shared.closed.load(Ordering::SeqCst) {
                                return Ok(false);
                            }
                            self.shared.apply(DecoderEvent::Suspend)?;
                            return Ok(true);
                        }
                        Ok(PacketOutcome::Stopped) => {
                            self.shared.apply(DecoderEvent::Yield)?;
                            return Ok(true);
                        }
                        Err(e @ DecodeError::PacketDecode { .. }) => {
                            self.stats.bad_packets += 1;
                            if self.bad_packet_logged {
                                debug!("Skipping undecodable packet: {}", e);
                            } else {
                                warn!("Skipping undecodable packet: {}", e);
                                self.bad_packet_logged = true;
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                PacketClass::Metadata => {
                    self.stats.metadata_packets += 1;
                    let timestamp = packet.decode_millis().unwrap_or_default();
                    self.metadata.broadcast(&packet.data, timestamp);
                }
                PacketClass::Other => self.stats.ignored_packets += 1,
            }
        }
    }

    /// Releases the coder pack and moves to `Closed`. Safe to call more than
    /// once.
    pub fn close(&mut self) {
        self.control().close();
        self.release();
    }

    fn release(&mut self) {
        if let Some(pack) = self.pack.take() {
            debug!(
                "Released decoder for {} after {} packets ({} metadata handlers)",
                pack.input_handle().label(),
                self.stats.packets_read,
                self.metadata.len()
            );
        }
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramePoolConfig;
    use crate::decode::metadata::MetadataRecorder;
    use crate::decode::packet_decoder::DecodedFrame;
    use crate::engine::simulation::SimulationEngine;
    use crate::engine::simulation::fixture::SyntheticStream;
    use bytes::Bytes;
    use std::ops::ControlFlow;

    fn decoder() -> StreamDecoder {
        let engine: Arc<dyn MediaEngine> = Arc::new(SimulationEngine::new());
        let pool = FramePool::new(FramePoolConfig::for_testing());
        StreamDecoder::new(engine, pool, &DecodeConfig::default())
    }

    fn ignore_frames() -> impl FnMut(DecodedFrame, i64) -> ControlFlow<()> {
        |_: DecodedFrame, _: i64| ControlFlow::Continue(())
    }

    #[test]
    fn test_state_transitions() {
        use DecoderEvent as E;
        use DecoderState as S;

        assert_eq!(S::Idle.transition(E::Attach).unwrap(), S::Attached);
        assert_eq!(S::Attached.transition(E::Decode).unwrap(), S::Decoding);
        assert_eq!(S::Decoding.transition(E::Suspend).unwrap(), S::Suspended);
        assert_eq!(S::Suspended.transition(E::Resume).unwrap(), S::Attached);
        assert_eq!(S::Decoding.transition(E::Finish).unwrap(), S::Attached);
        assert_eq!(S::Decoding.transition(E::Close).unwrap(), S::Closed);
        assert_eq!(S::Closed.transition(E::Close).unwrap(), S::Closed);
        assert_eq!(S::Closed.transition(E::Attach).unwrap(), S::Attached);

        assert!(S::Idle.transition(E::Decode).is_err());
        assert!(S::Suspended.transition(E::Decode).is_err());
        assert!(S::Decoding.transition(E::Attach).is_err());
        assert!(S::Idle.transition(E::Yield).is_err());
    }

    #[test]
    fn test_decode_without_pack_returns_false() {
        let mut decoder = decoder();
        let mut frames = ignore_frames();
        assert!(!decoder.decode(&mut frames).unwrap());
        assert_eq!(decoder.state(), DecoderState::Idle);
    }

    #[test]
    fn test_end_of_stream_raises_after_all_frames() {
        let stream = SyntheticStream::new(1000).with_reordered_presentation();
        let mut decoder = decoder();
        decoder
            .attach(InputStream::from_bytes(stream.to_bytes()))
            .unwrap();

        let mut seen = Vec::new();
        let mut frames = |_: DecodedFrame, ts: i64| {
            seen.push(ts);
            ControlFlow::Continue(())
        };
        let err = decoder.decode(&mut frames).unwrap_err();
        assert!(err.is_end_of_stream());

        // Decode order, never presentation order
        let expected: Vec<i64> = stream.frame_times().collect();
        assert_eq!(seen, expected);
        assert_eq!(decoder.state(), DecoderState::Attached);

        // Exhausted pack has nothing more to give
        let mut frames = ignore_frames();
        assert!(!decoder.decode(&mut frames).unwrap());
    }

    #[test]
    fn test_bad_packets_are_skipped() {
        let stream = SyntheticStream::new(400)
            .with_corrupt_packet_at(80)
            .with_corrupt_packet_at(200);
        let mut decoder = decoder();
        decoder
            .attach(InputStream::from_bytes(stream.to_bytes()))
            .unwrap();

        let mut count = 0;
        let mut frames = |_: DecodedFrame, _: i64| {
            count += 1;
            ControlFlow::Continue(())
        };
        assert!(decoder.decode(&mut frames).unwrap_err().is_end_of_stream());
        assert_eq!(count, 8);
        let stats = decoder.stats();
        assert_eq!(stats.bad_packets, 2);
        assert_eq!(stats.frames_decoded, 8);
    }

    #[test]
    fn test_metadata_broadcast_in_order() {
        let stream = SyntheticStream::new(400)
            .with_audio()
            .with_metadata_every(120)
            .with_interleaved_metadata();
        let first = Arc::new(MetadataRecorder::new());
        let second = Arc::new(MetadataRecorder::new());

        let mut decoder = decoder();
        decoder.add_metadata_handler(first.clone());
        decoder.add_metadata_handler(second.clone());
        decoder
            .attach(InputStream::from_bytes(stream.to_bytes()))
            .unwrap();
        let mut frames = ignore_frames();
        let _ = decoder.decode(&mut frames);

        let expected: Vec<(i64, Bytes)> = [0, 120, 240, 360]
            .into_iter()
            .map(|t| (t, Bytes::from(SyntheticStream::metadata_content(t))))
            .collect();
        assert_eq!(first.entries(), expected);
        assert_eq!(second.entries(), expected);
        assert_eq!(decoder.stats().ignored_packets, 10);
    }

    #[test]
    fn test_cancelled_source_ends_quietly() {
        let stream = SyntheticStream::new(2000);
        let input = InputStream::from_bytes(stream.to_bytes());
        let handle = input.handle();
        let mut decoder = decoder();
        decoder.attach(input).unwrap();

        let mut count = 0;
        let mut frames = |_: DecodedFrame, _: i64| {
            count += 1;
            if count == 5 {
                handle.cancel();
            }
            ControlFlow::Continue(())
        };
        assert!(decoder.decode(&mut frames).unwrap());
        assert_eq!(count, 5);
    }

    #[test]
    fn test_suspend_and_resume() {
        let stream = SyntheticStream::new(400);
        let mut decoder = decoder();
        decoder
            .attach(InputStream::from_bytes(stream.to_bytes()))
            .unwrap();
        let control = decoder.control();

        let mut count = 0;
        let mut frames = |_: DecodedFrame, _: i64| {
            count += 1;
            if count == 3 {
                control.suspend(true);
            }
            ControlFlow::Continue(())
        };
        assert!(decoder.decode(&mut frames).unwrap());
        assert_eq!(decoder.state(), DecoderState::Suspended);

        // Still suspended: returns immediately
        assert!(decoder.decode(&mut frames).unwrap());

        decoder.suspend(false);
        assert_eq!(decoder.state(), DecoderState::Attached);
        assert!(decoder.decode(&mut frames).unwrap_err().is_end_of_stream());
        drop(frames);
        assert_eq!(count, 10);
    }

    #[test]
    fn test_close_is_idempotent_and_releases() {
        let stream = SyntheticStream::new(400);
        let mut decoder = decoder();
        decoder
            .attach(InputStream::from_bytes(stream.to_bytes()))
            .unwrap();
        let control = decoder.control();

        control.close();
        control.close();
        assert_eq!(decoder.state(), DecoderState::Closed);

        let mut frames = ignore_frames();
        assert!(!decoder.decode(&mut frames).unwrap());
        decoder.close();
        assert_eq!(decoder.state(), DecoderState::Closed);
    }

    #[test]
    fn test_resume_with_replacement_source() {
        let stream = SyntheticStream::new(200);
        let mut decoder = decoder();
        decoder
            .attach(InputStream::from_bytes(stream.to_bytes()))
            .unwrap();

        let mut count = 0;
        let mut frames = |_: DecodedFrame, _: i64| {
            count += 1;
            ControlFlow::Continue(())
        };
        assert!(decoder.decode(&mut frames).is_err());

        let replacement = SyntheticStream::new(200);
        decoder
            .resume_with(InputStream::from_bytes(replacement.to_bytes()))
            .unwrap();
        assert!(decoder.decode(&mut frames).is_err());
        drop(frames);
        assert_eq!(count, 10);
    }
}
