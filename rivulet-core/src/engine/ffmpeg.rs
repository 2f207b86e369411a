//! libav-backed engine
//!
//! Inputs are read through a custom AVIO context pulling from an
//! [`InputStream`], so live sockets and pipes work the same as files. Chunk
//! containers are muxed into dynamic memory buffers; MP4 output is written
//! fragmented because a memory buffer cannot be seeked back into for the
//! `moov` atom.

use std::ffi::{CString, c_int, c_void};
use std::io::{ErrorKind, Read};
use std::ptr;
use std::sync::OnceLock;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use ffmpeg::{Rational, codec, format, frame};
use tracing::{debug, warn};

use super::{
    ContainerFormat, DecodeStep, DemuxedInput, EncodedPacket, EncoderSpec, EngineError,
    EngineResult, FrameRef, FrameResampler, FrameSpec, MediaEngine, OutputContainer, Packet,
    PixelFormat, RawFrame, TimeBase, TrackInfo, TrackKind, VideoDecoder, VideoEncoder,
};
use crate::input::InputStream;

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Encoder time base; packets come back with millisecond timestamps
const ENCODER_TIME_BASE: Rational = Rational(1, 1000);

fn ensure_initialized() -> EngineResult<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| ffmpeg::init().map_err(|e| e.to_string()))
        .clone()
        .map_err(|reason| EngineError::Open {
            reason: format!("libav initialization failed: {reason}"),
        })
}

/// Engine backed by the system libav libraries
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    preset: String,
}

impl FfmpegEngine {
    /// # Errors
    /// - `EngineError::Open` - libav could not be initialized
    pub fn new() -> EngineResult<Self> {
        ensure_initialized()?;
        Ok(Self {
            preset: "veryfast".to_string(),
        })
    }

    /// x264/x265 preset used for transcoded chunks
    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }
}

impl MediaEngine for FfmpegEngine {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open_input(&self, stream: InputStream) -> EngineResult<Box<dyn DemuxedInput>> {
        let label = stream.label().to_string();
        let (input, io) = open_custom_input(stream)?;
        let tracks = describe_tracks(&input);
        let format_name = input.format().name().to_string();
        debug!(
            "Opened {} as {} with {} tracks",
            label,
            format_name,
            tracks.len()
        );
        Ok(Box::new(FfmpegInput {
            input,
            _io: io,
            format_name,
            tracks,
        }))
    }

    fn open_encoder(&self, spec: &EncoderSpec) -> EngineResult<Box<dyn VideoEncoder>> {
        let encoder = FfmpegEncoder::open(spec, &self.preset)?;
        Ok(Box::new(encoder))
    }

    fn create_resampler(
        &self,
        from: FrameSpec,
        to: FrameSpec,
    ) -> EngineResult<Box<dyn FrameResampler>> {
        Ok(Box::new(FfmpegResampler::new(from, to)?))
    }
}

/// AVIO context reading from a boxed [`InputStream`]
struct CustomIo {
    avio: *mut ffi::AVIOContext,
    stream: *mut InputStream,
}

// The context and stream are only touched by the thread owning the input
unsafe impl Send for CustomIo {}

impl Drop for CustomIo {
    fn drop(&mut self) {
        unsafe {
            if !self.avio.is_null() {
                ffi::av_freep(ptr::addr_of_mut!((*self.avio).buffer).cast::<c_void>());
                ffi::avio_context_free(&mut self.avio);
            }
            if !self.stream.is_null() {
                drop(Box::from_raw(self.stream));
            }
        }
    }
}

unsafe extern "C" fn read_stream(opaque: *mut c_void, buf: *mut u8, size: c_int) -> c_int {
    let stream = unsafe { &mut *opaque.cast::<InputStream>() };
    let Ok(len) = usize::try_from(size) else {
        return ffi::AVERROR_EOF;
    };
    let out = unsafe { std::slice::from_raw_parts_mut(buf, len) };
    loop {
        match stream.read(out) {
            Ok(0) => return ffi::AVERROR_EOF,
            Ok(n) => return c_int::try_from(n).unwrap_or(size),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Read from {} failed: {}", stream.label(), e);
                return ffi::AVERROR_EXTERNAL;
            }
        }
    }
}

fn open_custom_input(stream: InputStream) -> EngineResult<(format::context::Input, CustomIo)> {
    let open_error = |what: &str, code: c_int| EngineError::Open {
        reason: format!("{what}: {}", ffmpeg::Error::from(code)),
    };

    unsafe {
        let buffer = ffi::av_malloc(IO_BUFFER_SIZE).cast::<u8>();
        if buffer.is_null() {
            return Err(EngineError::Open {
                reason: "could not allocate I/O buffer".to_string(),
            });
        }
        let stream = Box::into_raw(Box::new(stream));
        let avio = ffi::avio_alloc_context(
            buffer,
            IO_BUFFER_SIZE as c_int,
            0,
            stream.cast::<c_void>(),
            Some(read_stream),
            None,
            None,
        );
        if avio.is_null() {
            ffi::av_free(buffer.cast::<c_void>());
            drop(Box::from_raw(stream));
            return Err(EngineError::Open {
                reason: "could not allocate I/O context".to_string(),
            });
        }
        let io = CustomIo { avio, stream };

        let mut ctx = ffi::avformat_alloc_context();
        if ctx.is_null() {
            return Err(EngineError::Open {
                reason: "could not allocate format context".to_string(),
            });
        }
        (*ctx).pb = avio;
        (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

        // Frees the context on failure
        let ret = ffi::avformat_open_input(&mut ctx, ptr::null(), ptr::null(), ptr::null_mut());
        if ret < 0 {
            return Err(open_error("container not recognized", ret));
        }
        let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
        if ret < 0 {
            ffi::avformat_close_input(&mut ctx);
            return Err(open_error("could not probe tracks", ret));
        }
        Ok((format::context::Input::wrap(ctx), io))
    }
}

fn describe_tracks(input: &format::context::Input) -> Vec<TrackInfo> {
    input
        .streams()
        .map(|stream| {
            let params = stream.parameters();
            let kind = match params.medium() {
                ffmpeg::media::Type::Video => TrackKind::Video,
                ffmpeg::media::Type::Audio => TrackKind::Audio,
                _ => TrackKind::Opaque,
            };
            let (width, height) = unsafe {
                let raw = params.as_ptr();
                ((*raw).width.max(0) as u32, (*raw).height.max(0) as u32)
            };
            let tb = stream.time_base();
            TrackInfo {
                index: stream.index(),
                kind,
                codec_name: params.id().name().to_string(),
                time_base: TimeBase::new(tb.numerator(), tb.denominator()),
                width,
                height,
                pixel_format: None,
            }
        })
        .collect()
}

/// Opened input container
struct FfmpegInput {
    // Closed before the I/O context it reads from
    input: format::context::Input,
    _io: CustomIo,
    format_name: String,
    tracks: Vec<TrackInfo>,
}

impl DemuxedInput for FfmpegInput {
    fn format_name(&self) -> &str {
        &self.format_name
    }

    fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    fn read_packet(&mut self) -> EngineResult<Option<Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(e) => {
                return Err(EngineError::Read {
                    reason: e.to_string(),
                });
            }
        }
        let index = packet.stream();
        let time_base = self
            .tracks
            .get(index)
            .map(|t| t.time_base)
            .unwrap_or_default();
        Ok(Some(Packet {
            stream_index: index,
            pts: packet.pts(),
            dts: packet.dts(),
            duration: Some(packet.duration()).filter(|d| *d > 0),
            time_base,
            is_key: packet.is_key(),
            data: Bytes::copy_from_slice(packet.data().unwrap_or_default()),
        }))
    }

    fn open_decoder(&self, track_index: usize) -> EngineResult<Box<dyn VideoDecoder>> {
        let stream = self
            .input
            .stream(track_index)
            .ok_or_else(|| EngineError::Decode {
                reason: format!("no track {track_index}"),
            })?;
        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| EngineError::Decode {
                reason: e.to_string(),
            })?;
        Ok(Box::new(FfmpegDecoder {
            decoder,
            converter: None,
        }))
    }

    fn open_copy_output(
        &self,
        track_index: usize,
        format: &ContainerFormat,
    ) -> EngineResult<Box<dyn OutputContainer>> {
        let stream = self
            .input
            .stream(track_index)
            .ok_or_else(|| EngineError::Write {
                reason: format!("no track {track_index}"),
            })?;
        let mut output = MemoryOutput::new(format)?;
        {
            let mut ost = output
                .output
                .add_stream(ffmpeg::encoder::find(codec::Id::None))
                .map_err(write_error)?;
            ost.set_parameters(stream.parameters());
            // Codec tags of the source container may be invalid in the target
            unsafe {
                (*(*ost.as_mut_ptr()).codecpar).codec_tag = 0;
            }
            ost.set_time_base(stream.time_base());
        }
        output.write_header(format)?;
        Ok(Box::new(output))
    }
}

fn write_error(e: ffmpeg::Error) -> EngineError {
    EngineError::Write {
        reason: e.to_string(),
    }
}

/// Muxer writing into a dynamic memory buffer
struct MemoryOutput {
    output: format::context::Output,
    buffer_open: bool,
    stream_time_base: Rational,
    packets_written: usize,
}

impl MemoryOutput {
    fn new(format: &ContainerFormat) -> EngineResult<Self> {
        let name = CString::new(format.muxer_name()).map_err(|_| EngineError::Unsupported {
            what: format!("muxer name {:?}", format.muxer_name()),
        })?;
        unsafe {
            let mut ctx = ptr::null_mut();
            let ret =
                ffi::avformat_alloc_output_context2(&mut ctx, ptr::null(), name.as_ptr(), ptr::null());
            if ret < 0 || ctx.is_null() {
                return Err(EngineError::Write {
                    reason: format!("no muxer {format}: {}", ffmpeg::Error::from(ret)),
                });
            }
            let ret = ffi::avio_open_dyn_buf(&mut (*ctx).pb);
            if ret < 0 {
                ffi::avformat_free_context(ctx);
                return Err(EngineError::Write {
                    reason: format!("could not open memory buffer: {}", ffmpeg::Error::from(ret)),
                });
            }
            Ok(Self {
                output: format::context::Output::wrap(ctx),
                buffer_open: true,
                stream_time_base: Rational(1, 1000),
                packets_written: 0,
            })
        }
    }

    fn write_header(&mut self, format: &ContainerFormat) -> EngineResult<()> {
        if *format == ContainerFormat::Mp4 {
            let mut options = ffmpeg::Dictionary::new();
            options.set("movflags", "frag_keyframe+empty_moov+default_base_moof");
            self.output.write_header_with(options).map_err(write_error)?;
        } else {
            self.output.write_header().map_err(write_error)?;
        }
        if let Some(stream) = self.output.stream(0) {
            self.stream_time_base = stream.time_base();
        }
        Ok(())
    }

    fn close_buffer(&mut self) -> Bytes {
        if !self.buffer_open {
            return Bytes::new();
        }
        self.buffer_open = false;
        unsafe {
            let ctx = self.output.as_mut_ptr();
            let mut buf: *mut u8 = ptr::null_mut();
            let size = ffi::avio_close_dyn_buf((*ctx).pb, &mut buf);
            (*ctx).pb = ptr::null_mut();
            let data = match usize::try_from(size) {
                Ok(len) if len > 0 && !buf.is_null() => {
                    Bytes::copy_from_slice(std::slice::from_raw_parts(buf, len))
                }
                _ => Bytes::new(),
            };
            ffi::av_free(buf.cast::<c_void>());
            data
        }
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        // The dynamic buffer is not an AVIO the format context may close
        self.close_buffer();
    }
}

impl OutputContainer for MemoryOutput {
    fn write_packet(&mut self, packet: &Packet) -> EngineResult<()> {
        let mut out = ffmpeg::Packet::copy(&packet.data);
        out.set_stream(0);
        out.set_pts(packet.pts);
        out.set_dts(packet.dts);
        out.set_duration(packet.duration.unwrap_or(0));
        if packet.is_key {
            out.set_flags(ffmpeg::packet::Flags::KEY);
        }
        out.rescale_ts(
            Rational(packet.time_base.num, packet.time_base.den),
            self.stream_time_base,
        );
        out.write_interleaved(&mut self.output).map_err(write_error)?;
        self.packets_written += 1;
        Ok(())
    }

    fn packets_written(&self) -> usize {
        self.packets_written
    }

    fn finish(mut self: Box<Self>) -> EngineResult<Bytes> {
        self.output.write_trailer().map_err(write_error)?;
        Ok(self.close_buffer())
    }
}

fn to_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Gray8 => Pixel::GRAY8,
    }
}

fn from_pixel(pixel: Pixel) -> Option<PixelFormat> {
    match pixel {
        Pixel::YUV420P | Pixel::YUVJ420P => Some(PixelFormat::Yuv420p),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        Pixel::RGB24 => Some(PixelFormat::Rgb24),
        Pixel::RGBA => Some(PixelFormat::Rgba),
        Pixel::GRAY8 => Some(PixelFormat::Gray8),
        _ => None,
    }
}

/// Copies the planes of `frame` into one tightly packed buffer
fn pack_planes(frame: &frame::Video, spec: FrameSpec) -> Vec<u8> {
    let mut data = Vec::with_capacity(spec.buffer_len());
    let layout = spec.format.plane_layout(spec.width, spec.height);
    for (plane, (row_bytes, rows)) in layout.into_iter().enumerate() {
        let stride = frame.stride(plane);
        let src = frame.data(plane);
        for row in 0..rows {
            let start = row * stride;
            data.extend_from_slice(&src[start..start + row_bytes]);
        }
    }
    data
}

/// Inverse of [`pack_planes`]
fn unpack_planes(data: &[u8], frame: &mut frame::Video, spec: FrameSpec) -> EngineResult<()> {
    if data.len() < spec.buffer_len() {
        return Err(EngineError::Resample {
            reason: format!("{} byte frame is too short for {spec}", data.len()),
        });
    }
    let mut offset = 0;
    let layout = spec.format.plane_layout(spec.width, spec.height);
    for (plane, (row_bytes, rows)) in layout.into_iter().enumerate() {
        let stride = frame.stride(plane);
        let dst = frame.data_mut(plane);
        for row in 0..rows {
            let start = row * stride;
            dst[start..start + row_bytes].copy_from_slice(&data[offset..offset + row_bytes]);
            offset += row_bytes;
        }
    }
    Ok(())
}

/// Scaling context that may move between threads with its owner
struct Scaler {
    context: scaling::Context,
    from: FrameSpec,
}

unsafe impl Send for Scaler {}

impl Scaler {
    fn new(from: (Pixel, FrameSpec), to: FrameSpec) -> EngineResult<Self> {
        let (pixel, spec) = from;
        let context = scaling::Context::get(
            pixel,
            spec.width,
            spec.height,
            to_pixel(to.format),
            to.width,
            to.height,
            scaling::Flags::BILINEAR,
        )
        .map_err(|e| EngineError::Resample {
            reason: e.to_string(),
        })?;
        Ok(Self { context, from: spec })
    }

    fn run(&mut self, input: &frame::Video, output: &mut frame::Video) -> EngineResult<()> {
        self.context
            .run(input, output)
            .map_err(|e| EngineError::Resample {
                reason: e.to_string(),
            })
    }
}

/// True for the codec replies meaning "no output until more input" or
/// "fully flushed"
fn is_drained(err: &ffmpeg::Error) -> bool {
    matches!(
        err,
        ffmpeg::Error::Eof | ffmpeg::Error::Other { errno: ffmpeg::util::error::EAGAIN }
    )
}

struct FfmpegDecoder {
    decoder: ffmpeg::decoder::Video,
    /// Converts pixel layouts the pipeline does not know to yuv420p
    converter: Option<Scaler>,
}

impl FfmpegDecoder {
    fn receive(&mut self) -> EngineResult<Option<RawFrame>> {
        let mut decoded = frame::Video::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => self.to_raw(&decoded).map(Some),
            Err(e) if is_drained(&e) => Ok(None),
            Err(e) => Err(EngineError::Decode {
                reason: e.to_string(),
            }),
        }
    }

    fn to_raw(&mut self, decoded: &frame::Video) -> EngineResult<RawFrame> {
        if let Some(format) = from_pixel(decoded.format()) {
            let spec = FrameSpec::new(format, decoded.width(), decoded.height());
            return Ok(RawFrame {
                spec,
                data: pack_planes(decoded, spec),
            });
        }

        let native = FrameSpec::new(PixelFormat::Yuv420p, decoded.width(), decoded.height());
        let stale = self.converter.as_ref().is_none_or(|c| c.from != native);
        if stale {
            debug!(
                "Converting decoder output {:?} to {}",
                decoded.format(),
                native
            );
            self.converter = Some(Scaler::new((decoded.format(), native), native)?);
        }
        let mut converted = frame::Video::empty();
        if let Some(converter) = self.converter.as_mut() {
            converter.run(decoded, &mut converted)?;
        }
        Ok(RawFrame {
            spec: native,
            data: pack_planes(&converted, native),
        })
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn decode(&mut self, packet: &Packet, offset: usize) -> EngineResult<DecodeStep> {
        let data = packet.data.get(offset..).unwrap_or_default();
        let mut input = ffmpeg::Packet::copy(data);
        input.set_pts(packet.pts);
        input.set_dts(packet.dts);
        if packet.is_key {
            input.set_flags(ffmpeg::packet::Flags::KEY);
        }

        if let Err(e) = self.decoder.send_packet(&input) {
            // A full output queue rejects input until a frame is drained
            return match self.receive()? {
                Some(frame) => Ok(DecodeStep {
                    consumed: 0,
                    frame: Some(frame),
                }),
                None => Err(EngineError::Decode {
                    reason: e.to_string(),
                }),
            };
        }
        Ok(DecodeStep {
            consumed: data.len(),
            frame: self.receive()?,
        })
    }

    fn receive_pending(&mut self) -> EngineResult<Option<RawFrame>> {
        self.receive()
    }
}

struct FfmpegResampler {
    scaler: Scaler,
    to: FrameSpec,
    input: frame::Video,
    output: frame::Video,
}

impl FfmpegResampler {
    fn new(from: FrameSpec, to: FrameSpec) -> EngineResult<Self> {
        let scaler = Scaler::new((to_pixel(from.format), from), to)?;
        Ok(Self {
            scaler,
            to,
            input: frame::Video::new(to_pixel(from.format), from.width, from.height),
            output: frame::Video::new(to_pixel(to.format), to.width, to.height),
        })
    }
}

impl FrameResampler for FfmpegResampler {
    fn input_spec(&self) -> FrameSpec {
        self.scaler.from
    }

    fn output_spec(&self) -> FrameSpec {
        self.to
    }

    fn resample(&mut self, frame: FrameRef<'_>) -> EngineResult<RawFrame> {
        if frame.spec != self.scaler.from {
            return Err(EngineError::Resample {
                reason: format!("expected {}, got {}", self.scaler.from, frame.spec),
            });
        }
        unpack_planes(frame.data, &mut self.input, frame.spec)?;
        self.scaler.run(&self.input, &mut self.output)?;
        Ok(RawFrame {
            spec: self.to,
            data: pack_planes(&self.output, self.to),
        })
    }
}

/// Finds an encoder by implementation name ("libx264") or codec name ("h264")
fn find_encoder(name: &str) -> Option<ffmpeg::Codec> {
    ffmpeg::encoder::find_by_name(name).or_else(|| {
        let name = CString::new(name).ok()?;
        let descriptor = unsafe { ffi::avcodec_descriptor_get_by_name(name.as_ptr()) };
        if descriptor.is_null() {
            return None;
        }
        ffmpeg::encoder::find(codec::Id::from(unsafe { (*descriptor).id }))
    })
}

struct FfmpegEncoder {
    encoder: ffmpeg::encoder::video::Encoder,
    spec: EncoderSpec,
    frame: frame::Video,
}

impl FfmpegEncoder {
    fn open(spec: &EncoderSpec, preset: &str) -> EngineResult<Self> {
        let encode_error = |e: ffmpeg::Error| EngineError::Encode {
            reason: format!("{}: {e}", spec.codec_name),
        };
        if spec.frame.format != PixelFormat::Yuv420p {
            return Err(EngineError::Unsupported {
                what: format!("encoding {} frames", spec.frame.format),
            });
        }
        let codec = find_encoder(&spec.codec_name).ok_or_else(|| EngineError::Encode {
            reason: format!("no encoder for {}", spec.codec_name),
        })?;

        let mut setup = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(encode_error)?;
        setup.set_width(spec.frame.width);
        setup.set_height(spec.frame.height);
        setup.set_format(Pixel::YUV420P);
        setup.set_time_base(ENCODER_TIME_BASE);
        setup.set_gop(spec.gop);
        // Decode order equals presentation order, key frames land on frame times
        setup.set_max_b_frames(0);

        let mut options = ffmpeg::Dictionary::new();
        if codec.name().contains("264") || codec.name().contains("265") {
            options.set("preset", preset);
        }
        let encoder = setup.open_with(options).map_err(encode_error)?;
        debug!("Opened encoder {} for {}", codec.name(), spec.frame);

        Ok(Self {
            encoder,
            spec: spec.clone(),
            frame: frame::Video::new(Pixel::YUV420P, spec.frame.width, spec.frame.height),
        })
    }

    fn drain(&mut self) -> EngineResult<Vec<EncodedPacket>> {
        let mut packets = Vec::new();
        let mut packet = ffmpeg::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {}
                Err(e) if is_drained(&e) => break,
                Err(e) => {
                    return Err(EngineError::Encode {
                        reason: e.to_string(),
                    });
                }
            }
            let pts = packet.pts().or(packet.dts()).unwrap_or_default();
            packets.push(EncodedPacket {
                pts,
                dts: packet.dts().unwrap_or(pts),
                is_key: packet.is_key(),
                data: Bytes::copy_from_slice(packet.data().unwrap_or_default()),
            });
        }
        Ok(packets)
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode(&mut self, frame: FrameRef<'_>, pts_ms: i64) -> EngineResult<Vec<EncodedPacket>> {
        if frame.spec != self.spec.frame {
            return Err(EngineError::Encode {
                reason: format!("encoder expects {}, got {}", self.spec.frame, frame.spec),
            });
        }
        unpack_planes(frame.data, &mut self.frame, frame.spec)?;
        self.frame.set_pts(Some(pts_ms));
        self.encoder
            .send_frame(&self.frame)
            .map_err(|e| EngineError::Encode {
                reason: e.to_string(),
            })?;
        self.drain()
    }

    fn flush(&mut self) -> EngineResult<Vec<EncodedPacket>> {
        self.encoder.send_eof().map_err(|e| EngineError::Encode {
            reason: e.to_string(),
        })?;
        self.drain()
    }

    fn open_output(&self, format: &ContainerFormat) -> EngineResult<Box<dyn OutputContainer>> {
        let mut output = MemoryOutput::new(format)?;
        {
            let mut ost = output
                .output
                .add_stream(ffmpeg::encoder::find(self.encoder.id()))
                .map_err(write_error)?;
            ost.set_parameters(&self.encoder);
            ost.set_time_base(ENCODER_TIME_BASE);
        }
        output.write_header(format)?;
        Ok(Box::new(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_mapping() {
        for format in [
            PixelFormat::Yuv420p,
            PixelFormat::Nv12,
            PixelFormat::Rgb24,
            PixelFormat::Rgba,
            PixelFormat::Gray8,
        ] {
            assert_eq!(from_pixel(to_pixel(format)), Some(format));
        }
        assert_eq!(from_pixel(Pixel::YUVJ420P), Some(PixelFormat::Yuv420p));
        assert_eq!(from_pixel(Pixel::YUV444P), None);
    }

    #[test]
    fn test_planes_survive_strided_frames() {
        let spec = FrameSpec::new(PixelFormat::Yuv420p, 6, 4);
        let data: Vec<u8> = (0..spec.buffer_len()).map(|i| i as u8).collect();
        let mut frame = frame::Video::new(Pixel::YUV420P, 6, 4);
        unpack_planes(&data, &mut frame, spec).unwrap();
        assert_eq!(pack_planes(&frame, spec), data);
    }

    #[test]
    fn test_only_again_and_eof_end_a_drain() {
        assert!(is_drained(&ffmpeg::Error::Eof));
        assert!(is_drained(&ffmpeg::Error::Other {
            errno: ffmpeg::util::error::EAGAIN
        }));
        assert!(!is_drained(&ffmpeg::Error::InvalidData));
        assert!(!is_drained(&ffmpeg::Error::Other {
            errno: ffmpeg::util::error::ENOMEM
        }));
    }
}
