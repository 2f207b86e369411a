//! Builder for synthetic RSIM streams
//!
//! Produces complete containers with a configurable key-frame cadence,
//! metadata track, timestamp discontinuities and damaged packets. Used
//! throughout the tests and by the CLI `simulate` command.

use bytes::Bytes;

use super::codec;
use super::container::{self, RsimHeader};
use crate::decode::metadata;
use crate::engine::{FrameSpec, Packet, PixelFormat, TimeBase, TrackInfo, TrackKind};

/// Where key frames fall, in stream milliseconds
#[derive(Debug, Clone, PartialEq)]
pub enum KeyframeSchedule {
    Every(i64),
    At(Vec<i64>),
    /// Only the first frame is a key frame
    FirstOnly,
}

impl KeyframeSchedule {
    fn is_key(&self, t: i64) -> bool {
        match self {
            Self::Every(interval) => *interval > 0 && t % interval == 0,
            Self::At(times) => times.contains(&t),
            Self::FirstOnly => t == 0,
        }
    }
}

/// Synthetic stream description
#[derive(Debug, Clone)]
pub struct SyntheticStream {
    duration_ms: i64,
    frame_interval_ms: i64,
    codec_name: String,
    format_name: String,
    frame: FrameSpec,
    time_base: TimeBase,
    keyframes: KeyframeSchedule,
    metadata_every_ms: Option<i64>,
    interleave_metadata: bool,
    audio: bool,
    units_per_packet: usize,
    corrupt_at: Vec<i64>,
    flaky_at: Vec<i64>,
    jump: Option<(i64, i64)>,
    reorder_presentation: bool,
}

impl SyntheticStream {
    /// 25 fps h264-labelled stream of `duration_ms` with a key frame every
    /// two seconds
    pub fn new(duration_ms: i64) -> Self {
        Self {
            duration_ms,
            frame_interval_ms: 40,
            codec_name: "h264".to_string(),
            format_name: "rsim".to_string(),
            frame: FrameSpec::new(PixelFormat::Yuv420p, 8, 8),
            time_base: TimeBase::MPEG,
            keyframes: KeyframeSchedule::Every(2000),
            metadata_every_ms: None,
            interleave_metadata: false,
            audio: false,
            units_per_packet: 1,
            corrupt_at: Vec::new(),
            flaky_at: Vec::new(),
            jump: None,
            reorder_presentation: false,
        }
    }

    pub fn with_codec(mut self, codec_name: &str) -> Self {
        self.codec_name = codec_name.to_string();
        self
    }

    /// Demuxer name the container reports, e.g. "flv" or "mpegts"
    pub fn with_format_name(mut self, format_name: &str) -> Self {
        self.format_name = format_name.to_string();
        self
    }

    pub fn with_frame(mut self, frame: FrameSpec) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_frame_interval(mut self, interval_ms: i64) -> Self {
        self.frame_interval_ms = interval_ms.max(1);
        self
    }

    pub fn with_time_base(mut self, time_base: TimeBase) -> Self {
        self.time_base = time_base;
        self
    }

    pub fn with_keyframe_interval(mut self, interval_ms: i64) -> Self {
        self.keyframes = KeyframeSchedule::Every(interval_ms);
        self
    }

    pub fn with_keyframes_at(mut self, times_ms: &[i64]) -> Self {
        self.keyframes = KeyframeSchedule::At(times_ms.to_vec());
        self
    }

    pub fn with_single_keyframe(mut self) -> Self {
        self.keyframes = KeyframeSchedule::FirstOnly;
        self
    }

    /// Adds a metadata track carrying `meta@<t>` every `interval_ms`
    pub fn with_metadata_every(mut self, interval_ms: i64) -> Self {
        self.metadata_every_ms = Some(interval_ms.max(1));
        self
    }

    /// Metadata payloads use the zero-byte interleave convention
    pub fn with_interleaved_metadata(mut self) -> Self {
        self.interleave_metadata = true;
        self
    }

    /// Adds an audio track ahead of the video track
    pub fn with_audio(mut self) -> Self {
        self.audio = true;
        self
    }

    /// Packs several frame units into each video packet
    pub fn with_units_per_packet(mut self, units: usize) -> Self {
        self.units_per_packet = units.max(1);
        self
    }

    /// Replaces the video packet at `t_ms` with one that never decodes
    pub fn with_corrupt_packet_at(mut self, t_ms: i64) -> Self {
        self.corrupt_at.push(t_ms);
        self
    }

    /// Replaces the video packet at `t_ms` with one that decodes on retry
    pub fn with_flaky_packet_at(mut self, t_ms: i64) -> Self {
        self.flaky_at.push(t_ms);
        self
    }

    /// From `at_ms` on, timestamps jump forward by `jump_ms`
    pub fn with_timestamp_jump(mut self, at_ms: i64, jump_ms: i64) -> Self {
        self.jump = Some((at_ms, jump_ms));
        self
    }

    /// Presentation order differs from decode order, as with B-frames
    pub fn with_reordered_presentation(mut self) -> Self {
        self.reorder_presentation = true;
        self
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    pub fn frame_interval_ms(&self) -> i64 {
        self.frame_interval_ms
    }

    pub fn video_packet_count(&self) -> usize {
        self.frame_times().count()
    }

    pub fn metadata_packet_count(&self) -> usize {
        match self.metadata_every_ms {
            Some(every) => self.frame_times().filter(|t| t % every == 0).count(),
            None => 0,
        }
    }

    /// Stream time of every frame, before any discontinuity
    pub fn frame_times(&self) -> impl Iterator<Item = i64> + '_ {
        (0..)
            .map(move |i| i * self.frame_interval_ms)
            .take_while(move |t| *t < self.duration_ms)
    }

    /// Metadata content emitted at `t_ms`, before interleaving
    pub fn metadata_content(t_ms: i64) -> Vec<u8> {
        format!("meta@{t_ms}").into_bytes()
    }

    fn tracks(&self) -> (Vec<TrackInfo>, Option<usize>, usize, Option<usize>) {
        let mut tracks = Vec::new();
        let audio = self.audio.then(|| {
            tracks.push(TrackInfo {
                index: tracks.len(),
                kind: TrackKind::Audio,
                codec_name: "aac".to_string(),
                time_base: self.time_base,
                width: 0,
                height: 0,
                pixel_format: None,
            });
            tracks.len() - 1
        });
        tracks.push(TrackInfo {
            index: tracks.len(),
            kind: TrackKind::Video,
            codec_name: self.codec_name.clone(),
            time_base: self.time_base,
            width: self.frame.width,
            height: self.frame.height,
            pixel_format: Some(self.frame.format),
        });
        let video = tracks.len() - 1;
        let metadata = self.metadata_every_ms.map(|_| {
            tracks.push(TrackInfo {
                index: tracks.len(),
                kind: TrackKind::Opaque,
                codec_name: "data".to_string(),
                time_base: self.time_base,
                width: 0,
                height: 0,
                pixel_format: None,
            });
            tracks.len() - 1
        });
        (tracks, audio, video, metadata)
    }

    fn video_payload(&self, t: i64, frame_index: i64) -> Vec<u8> {
        if self.corrupt_at.contains(&t) {
            return codec::corrupt_unit();
        }
        let seed = [(frame_index % 251) as u8, (t / 1000 % 251) as u8];
        if self.flaky_at.contains(&t) {
            return codec::flaky_unit(&seed);
        }
        (0..self.units_per_packet)
            .flat_map(|_| codec::frame_unit(&seed))
            .collect()
    }

    /// Serializes the stream as an RSIM container
    pub fn to_bytes(&self) -> Vec<u8> {
        let (tracks, audio, video, metadata) = self.tracks();
        let tb = self.time_base;
        let interval = self.frame_interval_ms;

        let mut out = Vec::new();
        let header = RsimHeader {
            format_name: self.format_name.clone(),
            tracks,
        };
        // Writes into a Vec cannot fail
        let _ = container::write_header(&mut out, &header);

        for (frame_index, t) in self.frame_times().enumerate() {
            let frame_index = frame_index as i64;
            let reported = match self.jump {
                Some((at, jump)) if t >= at => t + jump,
                _ => t,
            };
            let dts = tb.from_millis(reported);
            let pts = if self.reorder_presentation && frame_index % 2 == 1 {
                tb.from_millis(reported + 2 * interval)
            } else {
                dts
            };

            if let Some(index) = audio {
                let _ = container::write_packet(
                    &mut out,
                    &Packet {
                        stream_index: index,
                        pts: Some(dts),
                        dts: Some(dts),
                        duration: Some(tb.from_millis(interval)),
                        time_base: tb,
                        is_key: true,
                        data: Bytes::from_static(b"aac-frame"),
                    },
                );
            }

            let _ = container::write_packet(
                &mut out,
                &Packet {
                    stream_index: video,
                    pts: Some(pts),
                    dts: Some(dts),
                    duration: Some(tb.from_millis(interval)),
                    time_base: tb,
                    is_key: self.keyframes.is_key(t),
                    data: Bytes::from(self.video_payload(t, frame_index)),
                },
            );

            if let (Some(index), Some(every)) = (metadata, self.metadata_every_ms)
                && t % every == 0
            {
                let content = Self::metadata_content(t);
                let payload = if self.interleave_metadata {
                    metadata::interleave(&content)
                } else {
                    content
                };
                let _ = container::write_packet(
                    &mut out,
                    &Packet {
                        stream_index: index,
                        pts: Some(dts),
                        dts: Some(dts),
                        duration: None,
                        time_base: tb,
                        is_key: true,
                        data: Bytes::from(payload),
                    },
                );
            }
        }

        let _ = container::write_trailer(&mut out);
        out
    }
}
