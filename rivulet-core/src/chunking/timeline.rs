//! Chunk boundary bookkeeping shared by both chunk providers
//!
//! Packet timestamps are stream-relative milliseconds. Reported chunk spans
//! are epoch milliseconds: the first chunk starts at the stream start passed
//! in by the caller and every later chunk starts exactly where the previous
//! one ended, so emitted spans tile the stream with no gaps or overlaps.
//! A packet's epoch time is the start of its chunk plus its distance from the
//! first packet of that chunk (the anchor).

use std::time::Duration;

use tracing::{debug, warn};

/// Why a chunk was cut
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutReason {
    /// Target duration passed and a key frame arrived
    KeyFrame,
    /// Chunk ran past the overflow limit without a key frame
    Overflow,
    /// Target duration reached (transcoded chunks cut on any frame)
    Target,
}

/// Span of a finished interior chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start_ms: i64,
    pub end_ms: i64,
    pub key_frames: Vec<i64>,
}

/// Span of the final chunk of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalSpan {
    pub start_ms: i64,
    pub end_ms: i64,
    /// End of the chunk before this one, or the stream start when this is
    /// the only chunk
    pub previous_end_ms: i64,
    pub key_frames: Vec<i64>,
}

#[derive(Debug, Clone)]
struct OpenChunk {
    start_ms: i64,
    anchor_ms: i64,
    key_frames: Vec<i64>,
}

/// Tracks where chunks start and end for one stream
#[derive(Debug, Clone)]
pub struct ChunkTimeline {
    target_ms: i64,
    overflow_factor: i64,
    stream_start_ms: i64,
    previous_end_ms: Option<i64>,
    open: Option<OpenChunk>,
    last_ts: Option<i64>,
    last_gap: Option<i64>,
    chunks_closed: usize,
}

impl ChunkTimeline {
    pub fn new(stream_start_ms: i64, target: Duration, overflow_factor: u32) -> Self {
        let target_ms = i64::try_from(target.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        Self {
            target_ms,
            overflow_factor: i64::from(overflow_factor.max(1)),
            stream_start_ms,
            previous_end_ms: None,
            open: None,
            last_ts: None,
            last_gap: None,
            chunks_closed: 0,
        }
    }

    pub fn target_ms(&self) -> i64 {
        self.target_ms
    }

    pub fn stream_start_ms(&self) -> i64 {
        self.stream_start_ms
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Interior chunks closed so far
    pub fn chunks_closed(&self) -> usize {
        self.chunks_closed
    }

    /// Stream timestamp the open chunk's relative timestamps are measured
    /// from
    pub fn anchor_ms(&self) -> Option<i64> {
        self.open.as_ref().map(|c| c.anchor_ms)
    }

    /// Start of the open chunk, or of the next chunk when none is open
    pub fn next_start_ms(&self) -> i64 {
        match &self.open {
            Some(chunk) => chunk.start_ms,
            None => self.previous_end_ms.unwrap_or(self.stream_start_ms),
        }
    }

    /// Records that a packet with stream timestamp `ts` arrived.
    ///
    /// A jump of more than one target duration in either direction is a
    /// timestamp discontinuity. It re-anchors the open chunk so elapsed time
    /// advances by one packet gap across the jump instead of by the jump.
    pub fn observe(&mut self, ts: i64) {
        if let Some(last) = self.last_ts {
            let gap = ts - last;
            if gap > 0 && gap <= self.target_ms {
                self.last_gap = Some(gap);
            }
            if gap.abs() > self.target_ms
                && let Some(chunk) = self.open.as_mut()
            {
                let step = self.last_gap.unwrap_or(0);
                chunk.anchor_ms += gap - step;
                warn!(
                    "Timestamps jumped {} ms, re-anchoring open chunk",
                    gap
                );
            }
        }
        self.last_ts = Some(ts);
    }

    /// Most recent gap between consecutive packets, discontinuities excluded
    pub fn last_gap_ms(&self) -> Option<i64> {
        self.last_gap
    }

    /// Milliseconds between the open chunk's anchor and `ts`
    pub fn time_in_chunk(&self, ts: i64) -> i64 {
        self.open.as_ref().map_or(0, |c| ts - c.anchor_ms)
    }

    /// Cut rule for copied packets: past the target on a key frame, or past
    /// the overflow limit on any packet
    pub fn should_cut_repackaged(&self, ts: i64, is_key: bool) -> Option<CutReason> {
        if !self.is_open() {
            return None;
        }
        let elapsed = self.time_in_chunk(ts);
        if elapsed > self.target_ms && is_key {
            Some(CutReason::KeyFrame)
        } else if elapsed > self.target_ms.saturating_mul(self.overflow_factor) {
            Some(CutReason::Overflow)
        } else {
            None
        }
    }

    /// Cut rule for encoded frames: target duration reached
    pub fn should_cut_transcoded(&self, ts: i64) -> Option<CutReason> {
        if self.is_open() && self.time_in_chunk(ts) >= self.target_ms {
            Some(CutReason::Target)
        } else {
            None
        }
    }

    /// Opens a chunk whose first packet has stream timestamp `ts`
    pub fn open(&mut self, ts: i64) {
        let start_ms = self.previous_end_ms.unwrap_or(self.stream_start_ms);
        self.open = Some(OpenChunk {
            start_ms,
            anchor_ms: ts,
            key_frames: Vec::new(),
        });
    }

    /// Epoch time of stream timestamp `ts` within the open chunk. Never
    /// earlier than the chunk start.
    pub fn epoch_of(&self, ts: i64) -> i64 {
        match &self.open {
            Some(chunk) => chunk.start_ms + (ts - chunk.anchor_ms).max(0),
            None => self.next_start_ms(),
        }
    }

    /// Adds a key frame at stream timestamp `ts` to the open chunk.
    /// Timestamps that do not advance the list are ignored.
    pub fn record_key_frame(&mut self, ts: i64) {
        let epoch = self.epoch_of(ts);
        if let Some(chunk) = self.open.as_mut()
            && chunk.key_frames.last().is_none_or(|last| *last < epoch)
        {
            chunk.key_frames.push(epoch);
        }
    }

    /// Closes the open chunk at stream timestamp `ts`, the first timestamp
    /// belonging to the next chunk.
    pub fn close_at(&mut self, ts: i64) -> Option<ChunkSpan> {
        let end = self.epoch_of(ts);
        let chunk = self.open.take()?;
        let (end_ms, key_frames) = self.clamp(chunk.start_ms, end, chunk.key_frames);
        self.previous_end_ms = Some(end_ms);
        self.chunks_closed += 1;
        debug!(
            "Closed chunk [{}, {}) with {} key frames",
            chunk.start_ms,
            end_ms,
            key_frames.len()
        );
        Some(ChunkSpan {
            start_ms: chunk.start_ms,
            end_ms,
            key_frames,
        })
    }

    /// Closes the final chunk at the end of its last packet. `unit_ms` is
    /// that packet's duration; the last observed packet gap is used when it
    /// is unknown.
    ///
    /// Returns `None` when no chunk is open or its end would not be after
    /// its start.
    pub fn close_final(&mut self, unit_ms: Option<i64>) -> Option<FinalSpan> {
        let last_ts = self.last_ts?;
        let unit = unit_ms.filter(|d| *d > 0).or(self.last_gap).unwrap_or(0);
        let end = self.epoch_of(last_ts + unit);
        let chunk = self.open.take()?;
        if end <= chunk.start_ms {
            debug!(
                "Final chunk at {} has no duration, not emitting it",
                chunk.start_ms
            );
            return None;
        }
        let (end_ms, key_frames) = self.clamp(chunk.start_ms, end, chunk.key_frames);
        let previous_end_ms = self.previous_end_ms.unwrap_or(self.stream_start_ms);
        self.previous_end_ms = Some(end_ms);
        Some(FinalSpan {
            start_ms: chunk.start_ms,
            end_ms,
            previous_end_ms,
            key_frames,
        })
    }

    /// Forgets the key frames of the open chunk but keeps its start and
    /// anchor, so content produced by a replacement provider covers the
    /// same span.
    pub fn discard_open_content(&mut self) {
        if let Some(chunk) = self.open.as_mut() {
            chunk.key_frames.clear();
        }
    }

    /// Limits a chunk that came out implausibly long (or not positive) to
    /// one target duration
    fn clamp(&self, start_ms: i64, end_ms: i64, mut key_frames: Vec<i64>) -> (i64, Vec<i64>) {
        let duration = end_ms - start_ms;
        let limit = self.target_ms.saturating_mul(self.overflow_factor + 1);
        if duration > 0 && duration <= limit {
            return (end_ms, key_frames);
        }
        warn!(
            "Chunk starting at {} measured {} ms, clamping to {} ms",
            start_ms, duration, self.target_ms
        );
        let end_ms = start_ms + self.target_ms;
        key_frames.retain(|k| *k < end_ms);
        (end_ms, key_frames)
    }
}
