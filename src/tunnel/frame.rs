//! Frame encoding/decoding for the multiplexer
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+
//! | Chan ID|   Length (2B)   |
//! +--------+--------+--------+
//! |     Segment (Length B)   |
//! +--------+--------+--------+
//! ```

use super::{ChannelId, MuxError};
use bytes::{BufMut, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 3;

/// Maximum segment size carried by one frame
pub const MAX_SEGMENT_SIZE: usize = u16::MAX as usize;

/// A decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Addressed virtual channel
    pub channel: ChannelId,
    /// Segment length following the header
    pub length: u16,
}

impl FrameHeader {
    pub fn new(channel: ChannelId, length: u16) -> Self {
        Self { channel, length }
    }

    /// Encode header to bytes
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let [hi, lo] = self.length.to_be_bytes();
        [self.channel, hi, lo]
    }

    /// Decode header from bytes
    pub fn decode(buf: [u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            channel: buf[0],
            length: u16::from_be_bytes([buf[1], buf[2]]),
        }
    }
}

/// Encode one complete frame
pub fn encode_frame(channel: ChannelId, segment: &[u8]) -> Result<BytesMut, MuxError> {
    if segment.len() > MAX_SEGMENT_SIZE {
        return Err(MuxError::FrameTooLarge(segment.len(), MAX_SEGMENT_SIZE));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + segment.len());
    buf.put_u8(channel);
    buf.put_u16(segment.len() as u16);
    buf.extend_from_slice(segment);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(7, 0x1234);
        assert_eq!(header.encode(), [7, 0x12, 0x34]);
        assert_eq!(FrameHeader::decode([7, 0x12, 0x34]), header);
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(3, b"abc").unwrap();
        assert_eq!(&frame[..], &[3, 0, 3, b'a', b'b', b'c']);

        let empty = encode_frame(0, &[]).unwrap();
        assert_eq!(&empty[..], &[0, 0, 0]);
    }

    #[test]
    fn test_frame_too_large() {
        let segment = vec![0u8; MAX_SEGMENT_SIZE + 1];
        assert!(matches!(
            encode_frame(1, &segment),
            Err(MuxError::FrameTooLarge(65536, 65535))
        ));
    }
}
