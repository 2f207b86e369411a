//! Container inspection
//!
//! Opens a stream, locates the video and metadata tracks and opens a decoder
//! for the video track. The result, a [`CoderPack`], is owned by whichever
//! decoder or chunk provider is consuming the stream, and is handed over
//! intact when a repackaging run fails over to transcoding.

use tracing::{debug, info};

use super::DecodeError;
use crate::engine::{DemuxedInput, MediaEngine, Packet, TrackInfo, TrackKind, VideoDecoder};
use crate::input::{InputHandle, InputStream};

/// How a packet relates to the inspected tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Video,
    Metadata,
    Other,
}

/// Opened container, selected tracks and the video decoder
pub struct CoderPack {
    input: Box<dyn DemuxedInput>,
    handle: InputHandle,
    video: TrackInfo,
    metadata: Option<TrackInfo>,
    decoder: Box<dyn VideoDecoder>,
    valid: bool,
}

impl CoderPack {
    /// Inspects `stream`, selecting the first video track and the first
    /// opaque data track.
    ///
    /// # Errors
    /// - `DecodeError::ContainerOpen` - the stream is not a readable container
    /// - `DecodeError::NoVideoTrack` - no video track present
    /// - `DecodeError::CoderOpen` - the video decoder could not be opened
    pub fn inspect(engine: &dyn MediaEngine, stream: InputStream) -> Result<Self, DecodeError> {
        let handle = stream.handle();
        let input = engine
            .open_input(stream)
            .map_err(|e| DecodeError::ContainerOpen {
                reason: e.to_string(),
            })?;

        let (video, metadata) = select_tracks(input.tracks())?;
        let decoder = input
            .open_decoder(video.index)
            .map_err(|e| DecodeError::CoderOpen {
                codec: video.codec_name.clone(),
                reason: e.to_string(),
            })?;

        info!(
            "Inspected {} via {}: video track {} ({}), metadata track {}",
            handle.label(),
            engine.name(),
            video.index,
            video.codec_name,
            metadata
                .as_ref()
                .map_or_else(|| "none".to_string(), |t| t.index.to_string())
        );

        Ok(Self {
            input,
            handle,
            video,
            metadata,
            decoder,
            valid: true,
        })
    }

    /// Swaps in a new byte source, keeping the selected track indices and the
    /// open decoder. Used to resume after a dropped connection; the new
    /// container is assumed to have the same layout and is not revalidated.
    ///
    /// # Errors
    /// - `DecodeError::ContainerOpen` - the replacement could not be opened
    pub fn replace_input(
        &mut self,
        engine: &dyn MediaEngine,
        stream: InputStream,
    ) -> Result<(), DecodeError> {
        let handle = stream.handle();
        let input = engine
            .open_input(stream)
            .map_err(|e| DecodeError::ContainerOpen {
                reason: e.to_string(),
            })?;
        debug!(
            "Replaced input {} with {}, keeping video track {}",
            self.handle.label(),
            handle.label(),
            self.video.index
        );
        self.input = input;
        self.handle = handle;
        self.valid = true;
        Ok(())
    }

    pub fn classify(&self, packet: &Packet) -> PacketClass {
        if packet.stream_index == self.video.index {
            PacketClass::Video
        } else if self
            .metadata
            .as_ref()
            .is_some_and(|t| t.index == packet.stream_index)
        {
            PacketClass::Metadata
        } else {
            PacketClass::Other
        }
    }

    pub fn video_track(&self) -> &TrackInfo {
        &self.video
    }

    pub fn metadata_track(&self) -> Option<&TrackInfo> {
        self.metadata.as_ref()
    }

    pub fn codec_name(&self) -> &str {
        &self.video.codec_name
    }

    pub fn format_name(&self) -> &str {
        self.input.format_name()
    }

    pub fn input(&self) -> &dyn DemuxedInput {
        self.input.as_ref()
    }

    pub fn input_mut(&mut self) -> &mut dyn DemuxedInput {
        self.input.as_mut()
    }

    pub fn decoder_mut(&mut self) -> &mut dyn VideoDecoder {
        self.decoder.as_mut()
    }

    pub fn input_handle(&self) -> &InputHandle {
        &self.handle
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn bytes_read(&self) -> u64 {
        self.handle.bytes_read()
    }

    /// False once the source has ended or failed
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

impl std::fmt::Debug for CoderPack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoderPack")
            .field("format", &self.input.format_name())
            .field("video", &self.video)
            .field("metadata", &self.metadata)
            .field("valid", &self.valid)
            .finish()
    }
}

fn select_tracks(tracks: &[TrackInfo]) -> Result<(TrackInfo, Option<TrackInfo>), DecodeError> {
    let video = tracks
        .iter()
        .find(|t| t.kind == TrackKind::Video)
        .cloned()
        .ok_or(DecodeError::NoVideoTrack)?;
    let metadata = tracks.iter().find(|t| t.kind == TrackKind::Opaque).cloned();
    Ok((video, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::simulation::SimulationEngine;
    use crate::engine::simulation::container::{self, RsimHeader};
    use crate::engine::simulation::fixture::SyntheticStream;
    use crate::engine::TimeBase;

    #[test]
    fn test_selects_first_video_and_opaque_tracks() {
        let engine = SimulationEngine::new();
        let stream = SyntheticStream::new(400).with_audio().with_metadata_every(200);
        let pack = CoderPack::inspect(&engine, InputStream::from_bytes(stream.to_bytes())).unwrap();

        assert_eq!(pack.video_track().index, 1);
        assert_eq!(pack.metadata_track().map(|t| t.index), Some(2));
        assert_eq!(pack.codec_name(), "h264");
        assert!(pack.is_valid());
    }

    #[test]
    fn test_audio_only_container_has_no_video() {
        let header = RsimHeader {
            format_name: "rsim".to_string(),
            tracks: vec![TrackInfo {
                index: 0,
                kind: TrackKind::Audio,
                codec_name: "aac".to_string(),
                time_base: TimeBase::MPEG,
                width: 0,
                height: 0,
                pixel_format: None,
            }],
        };
        let mut bytes = Vec::new();
        container::write_header(&mut bytes, &header).unwrap();

        let engine = SimulationEngine::new();
        let result = CoderPack::inspect(&engine, InputStream::from_bytes(bytes));
        assert!(matches!(result, Err(DecodeError::NoVideoTrack)));
    }

    #[test]
    fn test_unreadable_stream_fails_to_open() {
        let engine = SimulationEngine::new();
        let result = CoderPack::inspect(&engine, InputStream::from_bytes(b"not a container".to_vec()));
        assert!(matches!(result, Err(DecodeError::ContainerOpen { .. })));
    }

    #[test]
    fn test_classify_packets() {
        let engine = SimulationEngine::new();
        let stream = SyntheticStream::new(40).with_audio().with_metadata_every(40);
        let mut pack =
            CoderPack::inspect(&engine, InputStream::from_bytes(stream.to_bytes())).unwrap();

        let mut classes = Vec::new();
        while let Some(packet) = pack.input_mut().read_packet().unwrap() {
            classes.push(pack.classify(&packet));
        }
        assert_eq!(
            classes,
            vec![PacketClass::Other, PacketClass::Video, PacketClass::Metadata]
        );
    }

    #[test]
    fn test_replace_input_keeps_tracks() {
        let engine = SimulationEngine::new();
        let stream = SyntheticStream::new(400).with_audio();
        let mut pack =
            CoderPack::inspect(&engine, InputStream::from_bytes(stream.to_bytes())).unwrap();
        pack.invalidate();

        let replacement = SyntheticStream::new(800).with_audio();
        pack.replace_input(&engine, InputStream::from_bytes(replacement.to_bytes()))
            .unwrap();

        assert!(pack.is_valid());
        assert_eq!(pack.video_track().index, 1);
        assert_eq!(engine.inputs_opened(), 2);
    }
}
