//! Codec engine abstraction for both production and simulation modes
//!
//! The decode and chunking layers never touch container or bitstream internals
//! directly. Everything they need from a media library goes through the traits
//! in this module: open a demuxed input, pull packets, decode packet bytes into
//! raw frames, convert pixel formats, encode frames, and mux packets into an
//! in-memory output container.
//!
//! Two engines implement the seam: [`simulation::SimulationEngine`], a
//! deterministic in-process engine used by tests and the CLI `simulate`
//! command, and `ffmpeg::FfmpegEngine` (behind the `ffmpeg` feature) which
//! binds the traits to libavformat/libavcodec through `ffmpeg-next`.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod simulation;

use std::fmt;

use bytes::Bytes;

use crate::input::InputStream;

/// Errors surfaced by codec engines
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to open container: {reason}")]
    Open { reason: String },

    #[error("Failed to read packet: {reason}")]
    Read { reason: String },

    #[error("Failed to decode packet data: {reason}")]
    Decode { reason: String },

    #[error("Failed to encode frame: {reason}")]
    Encode { reason: String },

    #[error("Output container rejected write: {reason}")]
    Write { reason: String },

    #[error("Pixel format conversion failed: {reason}")]
    Resample { reason: String },

    #[error("Unsupported by engine: {what}")]
    Unsupported { what: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Rational time base of a track, expressed as seconds per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    /// One tick per millisecond
    pub const MILLIS: TimeBase = TimeBase { num: 1, den: 1000 };

    /// 90 kHz clock used by MPEG transport streams and RTP video
    pub const MPEG: TimeBase = TimeBase { num: 1, den: 90_000 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Converts ticks in this time base to milliseconds, rounding toward
    /// negative infinity.
    pub fn to_millis(self, ticks: i64) -> i64 {
        if self.den == 0 || self.num == 0 {
            return ticks;
        }
        let scaled = i128::from(ticks) * i128::from(self.num) * 1000;
        scaled.div_euclid(i128::from(self.den)) as i64
    }

    /// Converts milliseconds to ticks in this time base.
    pub fn from_millis(self, millis: i64) -> i64 {
        if self.den == 0 || self.num == 0 {
            return millis;
        }
        let scaled = i128::from(millis) * i128::from(self.den);
        scaled.div_euclid(i128::from(self.num) * 1000) as i64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::MILLIS
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Broad classification of a demuxed track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
    /// Data track of unknown or opaque codec type. The first such track in a
    /// container is treated as the metadata channel.
    Opaque,
}

impl TrackKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
            Self::Opaque => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Video),
            1 => Some(Self::Audio),
            2 => Some(Self::Opaque),
            _ => None,
        }
    }
}

/// Raw pixel layouts the pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, the layout every encoder in the pipeline accepts
    Yuv420p,
    /// Semi-planar YUV 4:2:0 (Y plane followed by interleaved UV)
    Nv12,
    Rgb24,
    Rgba,
    Gray8,
}

impl PixelFormat {
    /// Row width in bytes and row count for every plane, in storage order.
    pub fn plane_layout(self, width: u32, height: u32) -> Vec<(usize, usize)> {
        let w = width as usize;
        let h = height as usize;
        let chroma_w = w.div_ceil(2);
        let chroma_h = h.div_ceil(2);
        match self {
            Self::Yuv420p => vec![(w, h), (chroma_w, chroma_h), (chroma_w, chroma_h)],
            Self::Nv12 => vec![(w, h), (chroma_w * 2, chroma_h)],
            Self::Rgb24 => vec![(w * 3, h)],
            Self::Rgba => vec![(w * 4, h)],
            Self::Gray8 => vec![(w, h)],
        }
    }

    /// Total tightly-packed size of one frame
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        self.plane_layout(width, height)
            .iter()
            .map(|(row, rows)| row * rows)
            .sum()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::Rgb24 => "rgb24",
            Self::Rgba => "rgba",
            Self::Gray8 => "gray",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Yuv420p => 0,
            Self::Nv12 => 1,
            Self::Rgb24 => 2,
            Self::Rgba => 3,
            Self::Gray8 => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Yuv420p),
            1 => Some(Self::Nv12),
            2 => Some(Self::Rgb24),
            3 => Some(Self::Rgba),
            4 => Some(Self::Gray8),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of a raw video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSpec {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl FrameSpec {
    pub const fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    /// Bytes needed to hold one tightly packed frame of this shape
    pub fn buffer_len(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

impl fmt::Display for FrameSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

/// Description of one demuxed track
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub index: usize,
    pub kind: TrackKind,
    /// Codec short name, e.g. "h264", "mpeg2video", "flv1"
    pub codec_name: String,
    pub time_base: TimeBase,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<PixelFormat>,
}

impl TrackInfo {
    /// Frame shape produced by decoding this track, when it is a video track
    /// with known dimensions.
    pub fn frame_spec(&self) -> Option<FrameSpec> {
        if self.kind != TrackKind::Video || self.width == 0 || self.height == 0 {
            return None;
        }
        Some(FrameSpec::new(
            self.pixel_format.unwrap_or(PixelFormat::Yuv420p),
            self.width,
            self.height,
        ))
    }
}

/// One compressed packet read from an input container
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    pub time_base: TimeBase,
    pub is_key: bool,
    pub data: Bytes,
}

impl Packet {
    /// Decode timestamp in milliseconds, falling back to the presentation
    /// timestamp when the container did not provide one.
    pub fn decode_millis(&self) -> Option<i64> {
        self.dts.or(self.pts).map(|ts| self.time_base.to_millis(ts))
    }

    pub fn presentation_millis(&self) -> Option<i64> {
        self.pts.or(self.dts).map(|ts| self.time_base.to_millis(ts))
    }

    pub fn duration_millis(&self) -> Option<i64> {
        self.duration
            .filter(|d| *d > 0)
            .map(|d| self.time_base.to_millis(d))
    }

    /// Copy of this packet with timestamps shifted so that `origin_ms` becomes
    /// zero.
    pub fn rebased(&self, origin_ms: i64) -> Packet {
        let origin = self.time_base.from_millis(origin_ms);
        Packet {
            pts: self.pts.map(|ts| ts - origin),
            dts: self.dts.map(|ts| ts - origin),
            ..self.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Tightly packed raw frame owned by the engine that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub spec: FrameSpec,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn as_frame_ref(&self) -> FrameRef<'_> {
        FrameRef {
            spec: self.spec,
            data: &self.data,
        }
    }
}

/// Borrowed view of a raw frame
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    pub spec: FrameSpec,
    pub data: &'a [u8],
}

/// Outcome of one decode call against a packet
#[derive(Debug)]
pub struct DecodeStep {
    /// Bytes of the packet consumed by this call
    pub consumed: usize,
    /// Frame completed by this call, if any
    pub frame: Option<RawFrame>,
}

/// Packet produced by an encoder. Timestamps are in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    pub pts: i64,
    pub dts: i64,
    pub is_key: bool,
    pub data: Bytes,
}

impl EncodedPacket {
    /// Converts to a container packet on track 0, shifted so `origin_ms` is
    /// zero.
    pub fn to_packet(&self, origin_ms: i64, frame_duration_ms: Option<i64>) -> Packet {
        Packet {
            stream_index: 0,
            pts: Some(self.pts - origin_ms),
            dts: Some(self.dts - origin_ms),
            duration: frame_duration_ms,
            time_base: TimeBase::MILLIS,
            is_key: self.is_key,
            data: self.data.clone(),
        }
    }
}

/// Container formats the chunkers know how to emit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    Mp4,
    Matroska,
    WebM,
    Flv,
    MpegTs,
    /// In-process container of the simulation engine
    Simulation,
    /// Any other muxer, by its short name
    Named(String),
}

impl ContainerFormat {
    /// Short muxer name as understood by libavformat
    pub fn muxer_name(&self) -> &str {
        match self {
            Self::Mp4 => "mp4",
            Self::Matroska => "matroska",
            Self::WebM => "webm",
            Self::Flv => "flv",
            Self::MpegTs => "mpegts",
            Self::Simulation => "rsim",
            Self::Named(name) => name,
        }
    }

    /// Maps a demuxer name (which may be a comma separated alias list) to the
    /// matching output format.
    pub fn from_demuxer_name(name: &str) -> Self {
        let aliases: Vec<&str> = name.split(',').map(str::trim).collect();
        let has = |alias: &str| aliases.iter().any(|a| a.eq_ignore_ascii_case(alias));

        if has("mp4") || has("mov") {
            Self::Mp4
        } else if has("webm") && !has("matroska") {
            Self::WebM
        } else if has("matroska") {
            Self::Matroska
        } else if has("flv") || has("live_flv") {
            Self::Flv
        } else if has("mpegts") {
            Self::MpegTs
        } else if has("rsim") {
            Self::Simulation
        } else {
            Self::Named(aliases.first().copied().unwrap_or(name).to_string())
        }
    }

    /// Parses a user-facing format name
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "mp4" => Self::Mp4,
            "mkv" | "matroska" => Self::Matroska,
            "webm" => Self::WebM,
            "flv" => Self::Flv,
            "ts" | "mpegts" => Self::MpegTs,
            "rsim" | "sim" | "simulation" => Self::Simulation,
            other => Self::Named(other.to_string()),
        }
    }

    /// File extension used when chunks are written to disk
    pub fn extension(&self) -> &str {
        match self {
            Self::Mp4 => "mp4",
            Self::Matroska => "mkv",
            Self::WebM => "webm",
            Self::Flv => "flv",
            Self::MpegTs => "ts",
            Self::Simulation => "rsim",
            Self::Named(name) => name,
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.muxer_name())
    }
}

/// Encoder settings for one transcoded chunk
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSpec {
    pub codec_name: String,
    pub frame: FrameSpec,
    /// Frames between forced key frames
    pub gop: u32,
}

/// Entry point of a codec engine
pub trait MediaEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &'static str;

    /// Opens a container over a byte stream and probes its tracks
    ///
    /// # Errors
    /// - `EngineError::Open` - stream is not a readable container
    fn open_input(&self, stream: InputStream) -> EngineResult<Box<dyn DemuxedInput>>;

    /// Opens an encoder producing packets with millisecond timestamps
    ///
    /// # Errors
    /// - `EngineError::Encode` - codec unavailable or rejected the settings
    fn open_encoder(&self, spec: &EncoderSpec) -> EngineResult<Box<dyn VideoEncoder>>;

    /// Creates a converter between two frame shapes
    ///
    /// # Errors
    /// - `EngineError::Resample` - conversion not supported
    fn create_resampler(
        &self,
        from: FrameSpec,
        to: FrameSpec,
    ) -> EngineResult<Box<dyn FrameResampler>>;
}

/// An opened input container
pub trait DemuxedInput: Send {
    /// Demuxer name, possibly a comma separated alias list
    fn format_name(&self) -> &str;

    fn tracks(&self) -> &[TrackInfo];

    /// Next packet in container order, or `None` at end of stream
    ///
    /// # Errors
    /// - `EngineError::Read` - stream ended mid-packet or is corrupt
    fn read_packet(&mut self) -> EngineResult<Option<Packet>>;

    /// Opens a decoder for one of this container's tracks
    fn open_decoder(&self, track_index: usize) -> EngineResult<Box<dyn VideoDecoder>>;

    /// Opens an output container holding a stream-copied version of a track
    fn open_copy_output(
        &self,
        track_index: usize,
        format: &ContainerFormat,
    ) -> EngineResult<Box<dyn OutputContainer>>;
}

/// Decodes compressed packet bytes into raw frames
pub trait VideoDecoder: Send {
    /// Decodes from `offset` within `packet.data`. A call may consume part of
    /// the packet and may or may not complete a frame.
    fn decode(&mut self, packet: &Packet, offset: usize) -> EngineResult<DecodeStep>;

    /// Frames still buffered inside the decoder after a packet was fully
    /// consumed
    fn receive_pending(&mut self) -> EngineResult<Option<RawFrame>>;
}

/// Encodes raw frames
pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: FrameRef<'_>, pts_ms: i64) -> EngineResult<Vec<EncodedPacket>>;

    /// Drains packets buffered inside the encoder
    fn flush(&mut self) -> EngineResult<Vec<EncodedPacket>>;

    /// Opens an output container whose single track carries this encoder's
    /// packets
    fn open_output(&self, format: &ContainerFormat) -> EngineResult<Box<dyn OutputContainer>>;
}

/// In-memory muxer for one chunk
pub trait OutputContainer: Send {
    /// Writes one packet. Timestamps are relative to the chunk start.
    ///
    /// # Errors
    /// - `EngineError::Write` - muxer rejected the packet
    fn write_packet(&mut self, packet: &Packet) -> EngineResult<()>;

    fn packets_written(&self) -> usize;

    /// Writes the trailer and returns the finished container bytes
    fn finish(self: Box<Self>) -> EngineResult<Bytes>;
}

/// Pixel format and size converter
pub trait FrameResampler: Send {
    fn input_spec(&self) -> FrameSpec;

    fn output_spec(&self) -> FrameSpec;

    fn resample(&mut self, frame: FrameRef<'_>) -> EngineResult<RawFrame>;
}
