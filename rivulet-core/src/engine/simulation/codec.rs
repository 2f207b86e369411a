//! Simulated video bitstream, decoder, encoder and frame converter
//!
//! A simulated video packet is a run of units, each `tag u8 | len u16 | body`.
//! Frame units decode to one frame whose pixels repeat the unit body. The
//! other unit kinds exist to exercise the decoder's error handling.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use super::OutputFactory;
use crate::engine::{
    ContainerFormat, DecodeStep, EncodedPacket, EncoderSpec, EngineError, EngineResult, FrameRef,
    FrameResampler, FrameSpec, OutputContainer, Packet, RawFrame, TimeBase, TrackInfo, TrackKind,
    VideoDecoder, VideoEncoder,
};

/// Unit that decodes to a frame
pub const UNIT_FRAME: u8 = 0xF0;
/// Unit that fails every decode attempt
pub const UNIT_CORRUPT: u8 = 0xEE;
/// Unit that fails its first decode attempt and succeeds when retried
pub const UNIT_FLAKY: u8 = 0xE1;
/// Unit on which the decoder makes no progress
pub const UNIT_STALL: u8 = 0xE0;

const UNIT_HEADER: usize = 3;

fn unit(tag: u8, body: &[u8]) -> Vec<u8> {
    let len = body.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(UNIT_HEADER + len);
    out.push(tag);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&body[..len]);
    out
}

pub fn frame_unit(seed: &[u8]) -> Vec<u8> {
    unit(UNIT_FRAME, seed)
}

pub fn corrupt_unit() -> Vec<u8> {
    unit(UNIT_CORRUPT, b"corrupt")
}

pub fn flaky_unit(seed: &[u8]) -> Vec<u8> {
    unit(UNIT_FLAKY, seed)
}

pub fn stall_unit() -> Vec<u8> {
    unit(UNIT_STALL, &[])
}

/// Fills `len` bytes by repeating `seed`
fn expand(seed: &[u8], len: usize) -> Vec<u8> {
    if seed.is_empty() {
        return vec![0u8; len];
    }
    seed.iter().copied().cycle().take(len).collect()
}

/// Decoder for simulated video tracks
pub struct SimDecoder {
    spec: FrameSpec,
    retrying_flaky: bool,
}

impl SimDecoder {
    pub fn new(spec: FrameSpec) -> Self {
        Self {
            spec,
            retrying_flaky: false,
        }
    }

    fn frame(&self, seed: &[u8]) -> RawFrame {
        RawFrame {
            spec: self.spec,
            data: expand(seed, self.spec.buffer_len()),
        }
    }
}

impl VideoDecoder for SimDecoder {
    fn decode(&mut self, packet: &Packet, offset: usize) -> EngineResult<DecodeStep> {
        let data = packet.data.get(offset..).unwrap_or_default();
        if data.len() < UNIT_HEADER {
            return Err(EngineError::Decode {
                reason: format!("truncated unit header at offset {offset}"),
            });
        }
        let tag = data[0];
        let len = BigEndian::read_u16(&data[1..UNIT_HEADER]) as usize;
        let end = UNIT_HEADER + len;
        if end > data.len() {
            return Err(EngineError::Decode {
                reason: format!("unit at offset {offset} overruns packet"),
            });
        }
        let body = &data[UNIT_HEADER..end];

        match tag {
            UNIT_FRAME => Ok(DecodeStep {
                consumed: end,
                frame: Some(self.frame(body)),
            }),
            UNIT_FLAKY if !self.retrying_flaky => {
                self.retrying_flaky = true;
                Err(EngineError::Decode {
                    reason: "transient decode failure".to_string(),
                })
            }
            UNIT_FLAKY => {
                self.retrying_flaky = false;
                Ok(DecodeStep {
                    consumed: end,
                    frame: Some(self.frame(body)),
                })
            }
            UNIT_STALL => Ok(DecodeStep {
                consumed: 0,
                frame: None,
            }),
            UNIT_CORRUPT => Err(EngineError::Decode {
                reason: "corrupt unit".to_string(),
            }),
            other => Err(EngineError::Decode {
                reason: format!("unknown unit tag 0x{other:02x}"),
            }),
        }
    }

    fn receive_pending(&mut self) -> EngineResult<Option<RawFrame>> {
        Ok(None)
    }
}

/// Encoder producing one frame unit per input frame
pub struct SimEncoder {
    spec: EncoderSpec,
    frames: u64,
    output: OutputFactory,
}

impl SimEncoder {
    pub(super) fn new(spec: EncoderSpec, output: OutputFactory) -> Self {
        Self {
            spec,
            frames: 0,
            output,
        }
    }
}

impl VideoEncoder for SimEncoder {
    fn encode(&mut self, frame: FrameRef<'_>, pts_ms: i64) -> EngineResult<Vec<EncodedPacket>> {
        if frame.spec != self.spec.frame {
            return Err(EngineError::Encode {
                reason: format!(
                    "frame {} does not match encoder input {}",
                    frame.spec, self.spec.frame
                ),
            });
        }

        let gop = u64::from(self.spec.gop.max(1));
        let is_key = self.frames % gop == 0;
        self.frames += 1;

        let checksum = frame
            .data
            .iter()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(*b)));
        let mut seed = BytesMut::with_capacity(8);
        seed.put_u32(checksum);
        seed.put_u16(frame.spec.width as u16);
        seed.put_u16(frame.spec.height as u16);

        Ok(vec![EncodedPacket {
            pts: pts_ms,
            dts: pts_ms,
            is_key,
            data: Bytes::from(frame_unit(&seed)),
        }])
    }

    fn flush(&mut self) -> EngineResult<Vec<EncodedPacket>> {
        Ok(Vec::new())
    }

    fn open_output(&self, format: &ContainerFormat) -> EngineResult<Box<dyn OutputContainer>> {
        let track = TrackInfo {
            index: 0,
            kind: TrackKind::Video,
            codec_name: self.spec.codec_name.clone(),
            time_base: TimeBase::MILLIS,
            width: self.spec.frame.width,
            height: self.spec.frame.height,
            pixel_format: Some(self.spec.frame.format),
        };
        self.output.open(format, track)
    }
}

/// Converter that reshapes frames by repeating source bytes
pub struct SimResampler {
    from: FrameSpec,
    to: FrameSpec,
}

impl SimResampler {
    pub fn new(from: FrameSpec, to: FrameSpec) -> Self {
        Self { from, to }
    }
}

impl FrameResampler for SimResampler {
    fn input_spec(&self) -> FrameSpec {
        self.from
    }

    fn output_spec(&self) -> FrameSpec {
        self.to
    }

    fn resample(&mut self, frame: FrameRef<'_>) -> EngineResult<RawFrame> {
        if frame.spec != self.from {
            return Err(EngineError::Resample {
                reason: format!("expected {} input, got {}", self.from, frame.spec),
            });
        }
        Ok(RawFrame {
            spec: self.to,
            data: expand(frame.data, self.to.buffer_len()),
        })
    }
}
