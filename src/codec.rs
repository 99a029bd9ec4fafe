//! Channel payload codec.
//!
//! Wire format of a published message:
//!
//! ```text
//! <id as ASCII decimal> ' ' <i32 LE length> <length bytes of payload>
//! ```
//!
//! The publish script receives only the frame (length + payload) and
//! prepends the id it allocated, so the same frame is what callers hand to
//! [`Message::frame`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest decimal rendering of a `u64`.
const MAX_ID_DIGITS: usize = 20;

/// Size of the frame length prefix.
const LENGTH_PREFIX: usize = 4;

/// Errors produced while decoding a channel payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("payload ended before the message id separator")]
    MissingSeparator,

    #[error("invalid message id '{0}'")]
    InvalidId(String),

    #[error("frame header truncated: need 4 bytes, have {0}")]
    TruncatedHeader(usize),

    #[error("negative frame length {0}")]
    NegativeLength(i32),

    #[error("frame truncated: expected {expected} bytes, have {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("payload of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),
}

/// A message delivered on the bus channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Monotonic id allocated by the publish script.
    pub id: u64,
    /// Application payload.
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Build the length-prefixed frame the publish script expects as its argument.
    pub fn frame(payload: &[u8]) -> Result<Bytes, CodecError> {
        let len = i32::try_from(payload.len())
            .map_err(|_| CodecError::FrameTooLarge(payload.len()))?;
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        buf.put_i32_le(len);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Encode the message exactly as it appears on the channel.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let frame = Self::frame(&self.payload)?;
        let id = self.id.to_string();
        let mut buf = BytesMut::with_capacity(id.len() + 1 + frame.len());
        buf.put_slice(id.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(&frame);
        Ok(buf.freeze())
    }

    /// Decode a channel payload.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let scan = &data[..data.len().min(MAX_ID_DIGITS + 1)];
        let separator = scan
            .iter()
            .position(|b| *b == b' ')
            .ok_or(CodecError::MissingSeparator)?;

        let id_text = &data[..separator];
        let id = std::str::from_utf8(id_text)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| CodecError::InvalidId(String::from_utf8_lossy(id_text).into_owned()))?;

        let mut rest = &data[separator + 1..];
        if rest.len() < LENGTH_PREFIX {
            return Err(CodecError::TruncatedHeader(rest.len()));
        }
        let len = rest.get_i32_le();
        let expected = usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))?;
        if rest.len() < expected {
            return Err(CodecError::TruncatedFrame {
                expected,
                actual: rest.len(),
            });
        }

        Ok(Self {
            id,
            payload: Bytes::copy_from_slice(&rest[..expected]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_published_payload() {
        let mut data = b"42 ".to_vec();
        data.extend_from_slice(&5i32.to_le_bytes());
        data.extend_from_slice(b"hello");

        let message = Message::decode(&data).unwrap();
        assert_eq!(message.id, 42);
        assert_eq!(message.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_encode_matches_script_layout() {
        let frame = Message::frame(b"abc").unwrap();
        let mut expected = b"7 ".to_vec();
        expected.extend_from_slice(&frame);

        let encoded = Message::new(7, Bytes::from_static(b"abc")).encode().unwrap();
        assert_eq!(encoded.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut data = Message::new(3, Bytes::from_static(b"xy")).encode().unwrap().to_vec();
        data.extend_from_slice(b"garbage");

        let message = Message::decode(&data).unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"xy"));
    }

    #[test]
    fn test_decode_empty_payload() {
        let message = Message::decode(&Message::new(0, Bytes::new()).encode().unwrap()).unwrap();
        assert_eq!(message.id, 0);
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_decode_missing_separator() {
        assert_eq!(Message::decode(b"12345"), Err(CodecError::MissingSeparator));
        assert_eq!(Message::decode(b""), Err(CodecError::MissingSeparator));
    }

    #[test]
    fn test_decode_separator_beyond_id_width() {
        let data = b"123456789012345678901234 \x00\x00\x00\x00";
        assert_eq!(Message::decode(data), Err(CodecError::MissingSeparator));
    }

    #[test]
    fn test_decode_invalid_id() {
        let data = b"4x2 \x00\x00\x00\x00";
        assert_eq!(
            Message::decode(data),
            Err(CodecError::InvalidId("4x2".to_string()))
        );
    }

    #[test]
    fn test_decode_truncated_header() {
        assert_eq!(
            Message::decode(b"1 \x01\x00"),
            Err(CodecError::TruncatedHeader(2))
        );
    }

    #[test]
    fn test_decode_negative_length() {
        let mut data = b"1 ".to_vec();
        data.extend_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(Message::decode(&data), Err(CodecError::NegativeLength(-1)));
    }

    #[test]
    fn test_decode_truncated_frame() {
        let mut data = b"1 ".to_vec();
        data.extend_from_slice(&10i32.to_le_bytes());
        data.extend_from_slice(b"short");
        assert_eq!(
            Message::decode(&data),
            Err(CodecError::TruncatedFrame {
                expected: 10,
                actual: 5
            })
        );
    }
}
