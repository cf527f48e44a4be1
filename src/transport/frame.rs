//! MLLP frame extraction
//!
//! Bytes arrive in arbitrary chunks. A frame is complete once the buffer
//! holds `0x0B payload 0x1C` followed by one more byte; that byte is the
//! trailer `0x0D` and is consumed with the frame.
//!
//! Incomplete data is kept until it completes, up to a size limit; the
//! connection owning the buffer is expected to give up past that limit.

use crate::codec::{END_BLOCK, START_BLOCK, TRAILER};
use bytes::{Buf, Bytes, BytesMut};

/// Default limit for buffered, still incomplete data
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Accumulates received bytes and yields complete frame payloads
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    max_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_len,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Buffered data grew past the limit without completing a frame
    pub fn is_over_limit(&self) -> bool {
        self.buffer.len() > self.max_len
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Buffered byte count
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete frame payload, without its markers
    ///
    /// Returns `None` while the buffered frame is still incomplete. Once a
    /// start marker is present, bytes in front of it are dropped.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        // Without a start marker nothing is complete yet; keep what we have
        let start = self.buffer.iter().position(|&b| b == START_BLOCK)?;
        if start > 0 {
            tracing::warn!(bytes = start, "Discarding data before frame start");
            self.buffer.advance(start);
        }

        let end = self.buffer[1..].iter().position(|&b| b == END_BLOCK)? + 1;
        // The trailer has not arrived yet
        if end + 1 >= self.buffer.len() {
            return None;
        }

        let frame = self.buffer.split_to(end + 1).freeze();
        if self.buffer[0] == TRAILER {
            self.buffer.advance(1);
        } else {
            tracing::warn!("Frame end not followed by carriage return");
        }

        Some(frame.slice(1..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::add_framing;
    use proptest::prelude::*;

    fn frames(buffer: &mut FrameBuffer) -> Vec<String> {
        std::iter::from_fn(|| buffer.next_frame())
            .map(|f| String::from_utf8_lossy(&f).into_owned())
            .collect()
    }

    #[test]
    fn test_partial_writes_wait_for_completion() {
        let wire = add_framing("MSH|^~\\&|A|B");
        let (head, tail) = wire.as_bytes().split_at(6);

        let mut buffer = FrameBuffer::new();
        buffer.extend(head);
        assert_eq!(buffer.next_frame(), None);
        assert_eq!(buffer.len(), head.len());

        buffer.extend(tail);
        assert_eq!(frames(&mut buffer), vec!["MSH|^~\\&|A|B"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_waits_for_trailer() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"\x0BMSH|1\x1C");
        assert_eq!(buffer.next_frame(), None);
        buffer.extend(b"\r");
        assert_eq!(frames(&mut buffer), vec!["MSH|1"]);
    }

    #[test]
    fn test_two_frames_in_one_write() {
        let wire = format!("{}{}", add_framing("MSH|first"), add_framing("MSH|second"));
        let mut buffer = FrameBuffer::new();
        buffer.extend(wire.as_bytes());
        assert_eq!(frames(&mut buffer), vec!["MSH|first", "MSH|second"]);
    }

    #[test]
    fn test_garbage_before_start_dropped() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"noise\x0BMSH|1\x1C\r");
        assert_eq!(frames(&mut buffer), vec!["MSH|1"]);

        buffer.extend(b"only noise");
        assert_eq!(buffer.next_frame(), None);
        assert_eq!(buffer.len(), 10);

        buffer.extend(b"\x0BMSH|2\x1C\r");
        assert_eq!(frames(&mut buffer), vec!["MSH|2"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_end_before_start_is_incomplete() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"\x1C\r");
        assert_eq!(buffer.next_frame(), None);
        buffer.extend(b"\x0BMSH|3");
        assert_eq!(buffer.next_frame(), None);
        buffer.extend(b"\x1C\r");
        assert_eq!(frames(&mut buffer), vec!["MSH|3"]);
    }

    #[test]
    fn test_over_limit_without_frame_end() {
        let mut buffer = FrameBuffer::with_max_len(8);
        buffer.extend(b"\x0BMSH|1");
        assert_eq!(buffer.next_frame(), None);
        assert!(!buffer.is_over_limit());

        buffer.extend(b"23456789");
        assert_eq!(buffer.next_frame(), None);
        assert!(buffer.is_over_limit());
        assert_eq!(FrameBuffer::new().max_len(), DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn test_missing_trailer_keeps_next_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"\x0BMSH|1\x1C\x0BMSH|2\x1C\r");
        assert_eq!(frames(&mut buffer), vec!["MSH|1", "MSH|2"]);
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_frames(
            payloads in prop::collection::vec("[A-Z|^]{1,20}", 1..5),
            split in 1usize..16,
        ) {
            let wire: String = payloads.iter().map(|p| add_framing(p)).collect();
            let mut buffer = FrameBuffer::new();
            let mut seen = Vec::new();
            for chunk in wire.as_bytes().chunks(split) {
                buffer.extend(chunk);
                seen.extend(frames(&mut buffer));
            }
            prop_assert_eq!(seen, payloads);
            prop_assert!(buffer.is_empty());
        }
    }
}
