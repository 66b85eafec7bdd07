//! Binary file-channel framing.
//!
//! Wire layout: `[u32 seq BE][u32 len BE][len bytes payload]`. The seq is
//! a single monotonic counter per file, shared across all stripes, so the
//! receiver can resequence chunks no matter which channel carried them.
//! A header advertising more bytes than the message holds is clamped to
//! the trailing length.

use crate::core::config::FRAME_HEADER_BYTES;
use crate::core::error::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// One parsed file-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub payload: Bytes,
}

/// Encode a frame. A zero-length payload is legal: empty files are
/// carried as a single `(0, 0)` frame.
pub fn encode_frame(seq: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_BYTES + payload.len());
    buf.put_u32(seq);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Decode a frame, borrowing the payload from `data` without copying.
pub fn decode_frame(data: &Bytes) -> Result<Frame> {
    if data.len() < FRAME_HEADER_BYTES {
        return Err(EngineError::ProtocolViolation(format!(
            "frame shorter than header: {} bytes",
            data.len()
        )));
    }
    let seq = u32::from_be_bytes(data[0..4].try_into().expect("4-byte slice"));
    let declared = u32::from_be_bytes(data[4..8].try_into().expect("4-byte slice")) as usize;
    let trailing = data.len() - FRAME_HEADER_BYTES;
    let len = declared.min(trailing);
    Ok(Frame {
        seq,
        payload: data.slice(FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + len),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let encoded = encode_frame(7, b"payload bytes");
        let frame = decode_frame(&encoded).unwrap();
        assert_eq!(frame.seq, 7);
        assert_eq!(&frame.payload[..], b"payload bytes");
    }

    #[test]
    fn empty_payload_is_legal() {
        let encoded = encode_frame(0, b"");
        assert_eq!(encoded.len(), FRAME_HEADER_BYTES);
        let frame = decode_frame(&encoded).unwrap();
        assert_eq!(frame.seq, 0);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn oversized_length_clamps_to_trailing() {
        let mut raw = BytesMut::new();
        raw.put_u32(3);
        raw.put_u32(1_000_000);
        raw.extend_from_slice(b"abc");
        let frame = decode_frame(&raw.freeze()).unwrap();
        assert_eq!(frame.seq, 3);
        assert_eq!(&frame.payload[..], b"abc");
    }

    #[test]
    fn short_header_rejected() {
        let raw = Bytes::from_static(&[0, 0, 1]);
        assert!(matches!(
            decode_frame(&raw),
            Err(EngineError::ProtocolViolation(_))
        ));
    }
}
