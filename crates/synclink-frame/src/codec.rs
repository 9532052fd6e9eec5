use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: a single big-endian `u32` length.
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────┐
/// │ Length (4B)  │ Payload           │
/// │ u32 BE       │ (Length bytes)    │
/// └──────────────┴──────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], max_payload: usize, dst: &mut BytesMut) -> Result<()> {
    if payload.is_empty() {
        return Err(FrameError::EmptyFrame);
    }
    let max = max_payload.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// The length is validated as soon as the header is available, so an
/// oversized frame is rejected before its payload arrives.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let payload_len = check_length(&src[..HEADER_SIZE], max_payload)?;

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

/// Validate a 4-byte header and return the payload length it announces.
pub(crate) fn check_length(header: &[u8], max_payload: usize) -> Result<usize> {
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&header[..HEADER_SIZE]);
    let payload_len = u32::from_be_bytes(raw) as usize;

    if payload_len == 0 {
        return Err(FrameError::EmptyFrame);
    }
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    Ok(payload_len)
}

/// Configuration for frame readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 1 MiB.
    pub max_payload_size: usize,
    /// Per-frame read timeout. `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Per-frame write timeout. `None` waits indefinitely.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let payload = br#"{"type":"stop_record"}"#;

        encode_frame(payload, DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());
        assert_eq!(&buf[..HEADER_SIZE], &(payload.len() as u32).to_be_bytes());

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn test_decode_zero_length_rejected() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x00][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::EmptyFrame)));
    }

    #[test]
    fn test_decode_payload_too_large_before_payload_arrives() {
        let mut buf = BytesMut::new();
        buf.put_u32((DEFAULT_MAX_PAYLOAD + 1) as u32);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size, max })
                if size == DEFAULT_MAX_PAYLOAD + 1 && max == DEFAULT_MAX_PAYLOAD
        ));
    }

    #[test]
    fn test_high_bit_length_is_oversized_not_negative() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_exactly_max_payload_accepted() {
        let payload = vec![b'x'; 64];
        let mut buf = BytesMut::new();
        encode_frame(&payload, 64, &mut buf).unwrap();
        let frame = decode_frame(&mut buf, 64).unwrap().unwrap();
        assert_eq!(frame.len(), 64);
    }

    #[test]
    fn test_encode_rejects_empty_and_oversized() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_frame(b"", DEFAULT_MAX_PAYLOAD, &mut buf),
            Err(FrameError::EmptyFrame)
        ));
        assert!(matches!(
            encode_frame(b"12345", 4, &mut buf),
            Err(FrameError::PayloadTooLarge { size: 5, max: 4 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();
        encode_frame(b"second", DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(f1.as_ref(), b"first");
        assert_eq!(f2.as_ref(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_buffer() {
        let mut wire = BytesMut::new();
        for payload in [&b"one"[..], b"two-two", b"{\"type\":\"stop_record\"}"] {
            encode_frame(payload, DEFAULT_MAX_PAYLOAD, &mut wire).unwrap();
        }

        let mut whole = wire.clone();
        let mut expected = Vec::new();
        while let Some(frame) = decode_frame(&mut whole, DEFAULT_MAX_PAYLOAD).unwrap() {
            expected.push(frame);
        }

        let mut trickle = BytesMut::new();
        let mut got = Vec::new();
        for byte in wire.iter() {
            trickle.put_u8(*byte);
            while let Some(frame) = decode_frame(&mut trickle, DEFAULT_MAX_PAYLOAD).unwrap() {
                got.push(frame);
            }
        }

        assert_eq!(expected.len(), 3);
        assert_eq!(got, expected);
    }
}
