use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: a single big-endian `u32` payload length.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload the length prefix can describe.
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Configuration for frame reading and writing.
#[derive(Debug, Clone, Default)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. `None` leaves the limit to the
    /// application; only the 4-byte prefix bounds it.
    pub max_payload_size: Option<usize>,
}

impl FrameConfig {
    /// Effective limit after clamping to what the prefix can express.
    pub fn effective_max(&self) -> usize {
        self.max_payload_size
            .map_or(MAX_FRAME_LEN, |max| max.min(MAX_FRAME_LEN))
    }
}

/// Encode a payload into the wire format, appending to `dst`.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬──────────────────┐
/// │ Length (4B BE)   │ Payload          │
/// │                  │ (Length bytes)   │
/// └──────────────────┴──────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: MAX_FRAME_LEN,
    })?;
    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

/// Encode a payload into a fresh buffer.
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    encode_frame(payload, &mut dst)?;
    Ok(dst.freeze())
}

/// Decode the length prefix at the start of `src`.
///
/// Fails with [`FrameError::ShortLength`] if fewer than four bytes are available.
pub fn decode_length(src: &[u8]) -> Result<u32> {
    match src.get(..LENGTH_PREFIX_SIZE) {
        Some(&[a, b, c, d]) => Ok(u32::from_be_bytes([a, b, c, d])),
        _ => Err(FrameError::ShortLength { got: src.len() }),
    }
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None); // Need more data
    }

    let payload_len = decode_length(&src[..])? as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    if src.len() < LENGTH_PREFIX_SIZE + payload_len {
        return Ok(None); // Need more data
    }

    src.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout_is_big_endian() {
        let wire = encode(b"abc").unwrap();
        assert_eq!(wire.as_ref(), &[0, 0, 0, 3, b'a', b'b', b'c']);

        let wire = encode(&vec![7u8; 0x0102]).unwrap();
        assert_eq!(&wire[..LENGTH_PREFIX_SIZE], &[0, 0, 1, 2]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let payload = b"hello, tunnel!";

        encode_frame(payload, &mut buf).unwrap();
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE + payload.len());

        let frame = decode_frame(&mut buf, MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(frame.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_boundary_sizes() {
        for size in [0usize, 1, 255, 65_536, 10_000_000] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut buf = BytesMut::from(encode(&payload).unwrap().as_ref());

            let frame = decode_frame(&mut buf, MAX_FRAME_LEN).unwrap().unwrap();
            assert_eq!(frame.len(), size);
            assert!(frame.as_ref() == payload.as_slice());
        }
    }

    #[test]
    fn test_decode_length() {
        assert_eq!(decode_length(&[0, 0, 0, 0]).unwrap(), 0);
        assert_eq!(decode_length(&[0, 0x98, 0x96, 0x80]).unwrap(), 10_000_000);
        assert_eq!(decode_length(&[0xFF, 0xFF, 0xFF, 0xFF, 9]).unwrap(), u32::MAX);
    }

    #[test]
    fn test_decode_length_short_input() {
        let err = decode_length(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, FrameError::ShortLength { got: 3 }));
        assert!(matches!(
            decode_length(&[]),
            Err(FrameError::ShortLength { got: 0 })
        ));
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x01][..]);
        assert!(decode_frame(&mut buf, MAX_FRAME_LEN).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::from(encode(b"hello").unwrap().as_ref());
        buf.truncate(LENGTH_PREFIX_SIZE + 2);

        assert!(decode_frame(&mut buf, MAX_FRAME_LEN).unwrap().is_none());
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);

        let result = decode_frame(&mut buf, 16);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", &mut buf).unwrap();
        encode_frame(b"", &mut buf).unwrap();
        encode_frame(b"third", &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, MAX_FRAME_LEN).unwrap().unwrap();
        let f2 = decode_frame(&mut buf, MAX_FRAME_LEN).unwrap().unwrap();
        let f3 = decode_frame(&mut buf, MAX_FRAME_LEN).unwrap().unwrap();

        assert_eq!(f1.as_ref(), b"first");
        assert!(f2.is_empty());
        assert_eq!(f3.as_ref(), b"third");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_effective_max_clamps_to_prefix_range() {
        assert_eq!(FrameConfig::default().effective_max(), MAX_FRAME_LEN);
        let cfg = FrameConfig {
            max_payload_size: Some(usize::MAX),
        };
        assert_eq!(cfg.effective_max(), MAX_FRAME_LEN);
        let cfg = FrameConfig {
            max_payload_size: Some(64),
        };
        assert_eq!(cfg.effective_max(), 64);
    }
}
