//! Length-prefixed frame codec for the admin protocol.
//!
//! Each frame is a 4-byte big-endian length followed by the payload; the
//! payload's first byte is the message-type tag, the rest a protobuf
//! body. The length is validated before any allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};

const HEADER_LEN: usize = 4;

/// Frame codec used with [`tokio_util::codec::Framed`] on both the
/// daemon and CLI sides.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the protocol's default frame cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec with a smaller cap, for tests.
    #[must_use]
    pub const fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Bytes>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        // Validate before reserving anything.
        if length > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(length, self.max_frame_size));
        }
        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> ProtocolResult<()> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(
                item.len(),
                self.max_frame_size,
            ));
        }
        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by the cap above
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"\x01admin frame");
        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 12]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn oversized_frame_rejected_before_allocation() {
        let mut codec = FrameCodec::with_max_size(64);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 1024, max: 64 })
        ));
    }

    #[test]
    fn oversized_encode_rejected() {
        let mut codec = FrameCodec::with_max_size(8);
        let mut buf = BytesMut::new();
        let err = codec.encode(Bytes::from(vec![0u8; 16]), &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "one");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "two");
    }
}
