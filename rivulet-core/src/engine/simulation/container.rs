//! RSIM container layout
//!
//! ```text
//! header:  "RSIM" | version u8 | format name (u8 len + utf8) | track count u8
//! track:   kind u8 | codec (u8 len + utf8) | tb num i32 | tb den i32
//!          | width u16 | height u16 | pixel format u8 (0xFF = unknown)
//! record:  'P' | track u8 | flags u8 | pts i64 | dts i64 | duration i64
//!          | len u32 | payload
//! trailer: 'E'
//! ```
//!
//! All integers are big endian. A missing trailer is tolerated so live
//! captures cut at a record boundary still read cleanly.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use crate::engine::{EngineError, EngineResult, Packet, PixelFormat, TimeBase, TrackInfo, TrackKind};

pub const MAGIC: &[u8; 4] = b"RSIM";
pub const VERSION: u8 = 1;

const RECORD_PACKET: u8 = b'P';
const RECORD_END: u8 = b'E';

const FLAG_KEY: u8 = 0x01;
const FLAG_PTS: u8 = 0x02;
const FLAG_DTS: u8 = 0x04;
const FLAG_DURATION: u8 = 0x08;

const NO_PIXEL_FORMAT: u8 = 0xFF;

/// Largest payload accepted from a record
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Parsed container header
#[derive(Debug, Clone, PartialEq)]
pub struct RsimHeader {
    pub format_name: String,
    pub tracks: Vec<TrackInfo>,
}

fn write_short_str<W: Write>(out: &mut W, value: &str) -> io::Result<()> {
    let bytes = value.as_bytes();
    let len = u8::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name longer than 255 bytes"))?;
    out.write_u8(len)?;
    out.write_all(bytes)
}

fn read_short_str<R: Read>(input: &mut R) -> EngineResult<String> {
    let len = input.read_u8()? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| EngineError::Open {
        reason: "name is not valid utf-8".to_string(),
    })
}

/// Writes a header describing `tracks`
pub fn write_header<W: Write>(out: &mut W, header: &RsimHeader) -> io::Result<()> {
    out.write_all(MAGIC)?;
    out.write_u8(VERSION)?;
    write_short_str(out, &header.format_name)?;
    let count = u8::try_from(header.tracks.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many tracks"))?;
    out.write_u8(count)?;
    for track in &header.tracks {
        out.write_u8(track.kind.code())?;
        write_short_str(out, &track.codec_name)?;
        out.write_i32::<BigEndian>(track.time_base.num)?;
        out.write_i32::<BigEndian>(track.time_base.den)?;
        out.write_u16::<BigEndian>(track.width.min(u32::from(u16::MAX)) as u16)?;
        out.write_u16::<BigEndian>(track.height.min(u32::from(u16::MAX)) as u16)?;
        out.write_u8(track.pixel_format.map_or(NO_PIXEL_FORMAT, PixelFormat::code))?;
    }
    Ok(())
}

/// Reads and validates a header
///
/// # Errors
/// - `EngineError::Open` - bad magic, unknown version or malformed track table
pub fn read_header<R: Read>(input: &mut R) -> EngineResult<RsimHeader> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic).map_err(|e| EngineError::Open {
        reason: format!("stream too short for header: {e}"),
    })?;
    if &magic != MAGIC {
        return Err(EngineError::Open {
            reason: format!("unrecognized container signature {magic:02x?}"),
        });
    }
    let version = input.read_u8()?;
    if version != VERSION {
        return Err(EngineError::Open {
            reason: format!("unsupported container version {version}"),
        });
    }

    let format_name = read_short_str(input)?;
    let count = input.read_u8()? as usize;
    let mut tracks = Vec::with_capacity(count);
    for index in 0..count {
        let kind_code = input.read_u8()?;
        let kind = TrackKind::from_code(kind_code).ok_or_else(|| EngineError::Open {
            reason: format!("track {index} has unknown kind {kind_code}"),
        })?;
        let codec_name = read_short_str(input)?;
        let num = input.read_i32::<BigEndian>()?;
        let den = input.read_i32::<BigEndian>()?;
        let width = u32::from(input.read_u16::<BigEndian>()?);
        let height = u32::from(input.read_u16::<BigEndian>()?);
        let pixel_format = PixelFormat::from_code(input.read_u8()?);
        tracks.push(TrackInfo {
            index,
            kind,
            codec_name,
            time_base: TimeBase::new(num, den),
            width,
            height,
            pixel_format,
        });
    }

    Ok(RsimHeader {
        format_name,
        tracks,
    })
}

/// Writes one packet record
pub fn write_packet<W: Write>(out: &mut W, packet: &Packet) -> io::Result<()> {
    let track = u8::try_from(packet.stream_index)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "track index out of range"))?;
    let mut flags = 0u8;
    if packet.is_key {
        flags |= FLAG_KEY;
    }
    if packet.pts.is_some() {
        flags |= FLAG_PTS;
    }
    if packet.dts.is_some() {
        flags |= FLAG_DTS;
    }
    if packet.duration.is_some() {
        flags |= FLAG_DURATION;
    }

    out.write_u8(RECORD_PACKET)?;
    out.write_u8(track)?;
    out.write_u8(flags)?;
    out.write_i64::<BigEndian>(packet.pts.unwrap_or(0))?;
    out.write_i64::<BigEndian>(packet.dts.unwrap_or(0))?;
    out.write_i64::<BigEndian>(packet.duration.unwrap_or(0))?;
    let len = u32::try_from(packet.data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
    out.write_u32::<BigEndian>(len)?;
    out.write_all(&packet.data)
}

pub fn write_trailer<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_u8(RECORD_END)
}

/// Reads the next packet record. Time bases are taken from the header's
/// track table.
///
/// Returns `Ok(None)` on the trailer or a clean end of stream between
/// records.
///
/// # Errors
/// - `EngineError::Read` - stream ended inside a record or record is malformed
pub fn read_packet<R: Read>(input: &mut R, tracks: &[TrackInfo]) -> EngineResult<Option<Packet>> {
    let tag = match input.read_u8() {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match tag {
        RECORD_END => Ok(None),
        RECORD_PACKET => read_packet_body(input, tracks).map(Some).map_err(|e| match e {
            EngineError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof => EngineError::Read {
                reason: "stream ended inside a packet record".to_string(),
            },
            other => other,
        }),
        other => Err(EngineError::Read {
            reason: format!("unknown record tag 0x{other:02x}"),
        }),
    }
}

fn read_packet_body<R: Read>(input: &mut R, tracks: &[TrackInfo]) -> EngineResult<Packet> {
    let track = input.read_u8()? as usize;
    let flags = input.read_u8()?;
    let pts = input.read_i64::<BigEndian>()?;
    let dts = input.read_i64::<BigEndian>()?;
    let duration = input.read_i64::<BigEndian>()?;
    let len = input.read_u32::<BigEndian>()?;
    if len > MAX_PAYLOAD {
        return Err(EngineError::Read {
            reason: format!("packet payload of {len} bytes exceeds limit"),
        });
    }
    let mut data = vec![0u8; len as usize];
    input.read_exact(&mut data)?;

    let time_base = tracks
        .get(track)
        .map(|t| t.time_base)
        .ok_or_else(|| EngineError::Read {
            reason: format!("packet references unknown track {track}"),
        })?;

    Ok(Packet {
        stream_index: track,
        pts: (flags & FLAG_PTS != 0).then_some(pts),
        dts: (flags & FLAG_DTS != 0).then_some(dts),
        duration: (flags & FLAG_DURATION != 0).then_some(duration),
        time_base,
        is_key: flags & FLAG_KEY != 0,
        data: Bytes::from(data),
    })
}

/// Reads a complete in-memory container. Used by tests and the CLI to look
/// inside produced chunks.
///
/// # Errors
/// - `EngineError::Open` / `EngineError::Read` - malformed container
pub fn parse(data: &[u8]) -> EngineResult<(RsimHeader, Vec<Packet>)> {
    let mut cursor = io::Cursor::new(data);
    let header = read_header(&mut cursor)?;
    let mut packets = Vec::new();
    while let Some(packet) = read_packet(&mut cursor, &header.tracks)? {
        packets.push(packet);
    }
    Ok((header, packets))
}
