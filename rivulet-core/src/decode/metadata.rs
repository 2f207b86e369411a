//! Metadata track payload handling
//!
//! Some encoders write metadata with a zero byte in front of every content
//! byte. A payload whose first byte is zero is treated as interleaved and
//! reduced to its odd-indexed bytes; any other payload is delivered as-is.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Receives metadata packets alongside decoded video
pub trait MetadataContentHandler: Send + Sync {
    /// Called once per metadata packet, in container order. The timestamp is
    /// the packet's decode time in stream milliseconds.
    fn handle_content(&self, content: Bytes, decode_timestamp_ms: i64);
}

/// Undoes the zero-byte interleave when the payload starts with zero
pub fn deinterleave(payload: &[u8]) -> Bytes {
    match payload.first() {
        Some(0) => payload.iter().skip(1).step_by(2).copied().collect(),
        _ => Bytes::copy_from_slice(payload),
    }
}

/// Places a zero byte before every content byte
pub fn interleave(content: &[u8]) -> Vec<u8> {
    content.iter().flat_map(|b| [0u8, *b]).collect()
}

/// Prepares content for a metadata track.
///
/// Content starting with a zero byte must be interleaved, otherwise readers
/// would mistake it for an interleaved payload.
pub fn encode_metadata(content: &[u8], force_interleave: bool) -> Vec<u8> {
    if force_interleave || content.first() == Some(&0) {
        interleave(content)
    } else {
        content.to_vec()
    }
}

/// Fans a metadata packet out to every registered handler
#[derive(Default, Clone)]
pub(crate) struct MetadataBroadcast {
    handlers: Vec<Arc<dyn MetadataContentHandler>>,
}

impl MetadataBroadcast {
    pub(crate) fn add(&mut self, handler: Arc<dyn MetadataContentHandler>) {
        self.handlers.push(handler);
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn broadcast(&self, payload: &[u8], decode_timestamp_ms: i64) {
        if self.handlers.is_empty() {
            return;
        }
        let content = deinterleave(payload);
        for handler in &self.handlers {
            handler.handle_content(content.clone(), decode_timestamp_ms);
        }
    }
}

/// Handler that keeps every payload it receives.
///
/// The CLI uses it to report how many metadata packets a session carried.
/// Memory grows with the stream, so services forwarding metadata should
/// implement [`MetadataContentHandler`] over their own channel.
#[derive(Debug, Default)]
pub struct MetadataRecorder {
    entries: Mutex<Vec<(i64, Bytes)>>,
}

impl MetadataRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded `(decode_timestamp_ms, content)` pairs in arrival order
    pub fn entries(&self) -> Vec<(i64, Bytes)> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl MetadataContentHandler for MetadataRecorder {
    fn handle_content(&self, content: Bytes, decode_timestamp_ms: i64) {
        self.entries.lock().push((decode_timestamp_ms, content));
    }
}

/// Handler that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardMetadata;

impl MetadataContentHandler for DiscardMetadata {
    fn handle_content(&self, _content: Bytes, _decode_timestamp_ms: i64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_deinterleave_zero_prefixed_payload() {
        let payload = [0x00, 0x41, 0x00, 0x42, 0x00, 0x43];
        assert_eq!(deinterleave(&payload), Bytes::from_static(b"ABC"));
    }

    #[test]
    fn test_plain_payload_passes_through() {
        let payload = [0x41, 0x00, 0x42];
        assert_eq!(deinterleave(&payload), Bytes::from_static(&[0x41, 0x00, 0x42]));
        assert!(deinterleave(&[]).is_empty());
    }

    #[test]
    fn test_odd_length_interleaved_payload_drops_trailing_byte() {
        assert_eq!(deinterleave(&[0x00, 0x41, 0x00]), Bytes::from_static(b"A"));
    }

    #[test]
    fn test_encode_interleaves_zero_leading_content() {
        assert_eq!(encode_metadata(&[0x00, 0x07], false), vec![0, 0, 0, 7]);
        assert_eq!(encode_metadata(b"hi", false), b"hi".to_vec());
        assert_eq!(encode_metadata(b"hi", true), vec![0, b'h', 0, b'i']);
    }

    #[test]
    fn test_broadcast_reaches_every_handler() {
        let first = Arc::new(MetadataRecorder::new());
        let second = Arc::new(MetadataRecorder::new());
        let mut broadcast = MetadataBroadcast::default();
        broadcast.add(first.clone());
        broadcast.add(second.clone());

        broadcast.broadcast(&interleave(b"klv"), 1200);

        for recorder in [&first, &second] {
            assert_eq!(
                recorder.entries(),
                vec![(1200, Bytes::from_static(b"klv"))]
            );
        }
    }

    proptest! {
        #[test]
        fn encoded_metadata_decodes_to_original(content in proptest::collection::vec(any::<u8>(), 0..256), force in any::<bool>()) {
            let encoded = encode_metadata(&content, force);
            prop_assert_eq!(deinterleave(&encoded).to_vec(), content);
        }
    }
}
