//! Slot announcement codec.
//!
//! The server's first bytes on every connection are the slot in ASCII
//! decimal followed by `\r\n`, e.g. slot 12 is `b"12\r\n"`. Nothing else is
//! framed: whatever follows the terminator belongs to the application.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::slot::Slot;

pub const TERMINATOR: &[u8; 2] = b"\r\n";

/// Digits in `u32::MAX`.
const MAX_DIGITS: usize = 10;
const MAX_LINE: usize = MAX_DIGITS + TERMINATOR.len();

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed slot announcement: {0:?}")]
    Malformed(String),
    #[error("slot announcement exceeds 12 bytes without a terminator")]
    TooLong,
    #[error("connection closed before slot announcement completed")]
    Truncated,
    #[error("I/O error reading slot announcement: {0}")]
    Io(#[from] io::Error),
}

/// Encodes and decodes a single slot announcement.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotCodec;

impl SlotCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode_into(&self, slot: Slot, dst: &mut BytesMut) {
        let digits = slot.get().to_string();
        dst.reserve(digits.len() + TERMINATOR.len());
        dst.put_slice(digits.as_bytes());
        dst.put_slice(TERMINATOR);
    }
}

/// Encoded announcement for `slot`.
pub fn announcement(slot: Slot) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAX_LINE);
    SlotCodec.encode_into(slot, &mut buf);
    buf.freeze()
}

fn parse_digits(digits: &[u8]) -> Result<Slot, WireError> {
    let malformed = || WireError::Malformed(String::from_utf8_lossy(digits).into_owned());

    if digits.is_empty() {
        return Err(malformed());
    }
    digits
        .iter()
        .try_fold(0u32, |acc, &b| {
            if !b.is_ascii_digit() {
                return None;
            }
            acc.checked_mul(10)?.checked_add(u32::from(b - b'0'))
        })
        .map(Slot::new)
        .ok_or_else(malformed)
}

impl Decoder for SlotCodec {
    type Item = Slot;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let window = &src[..src.len().min(MAX_LINE)];
        let Some(end) = window.windows(TERMINATOR.len()).position(|w| w == TERMINATOR) else {
            if src.len() >= MAX_LINE {
                return Err(WireError::TooLong);
            }
            return Ok(None);
        };

        let line = src.split_to(end + TERMINATOR.len());
        let slot = parse_digits(&line[..end])?;
        tracing::trace!(slot = %slot, "Decoded slot announcement");
        Ok(Some(slot))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(slot) => Ok(Some(slot)),
            None if src.is_empty() => Ok(None),
            None => Err(WireError::Truncated),
        }
    }
}

impl Encoder<Slot> for SlotCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Slot, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_into(item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Result<Option<Slot>, WireError>, BytesMut) {
        let mut buf = BytesMut::from(input);
        let result = SlotCodec::new().decode(&mut buf);
        (result, buf)
    }

    #[test]
    fn announcement_bytes() {
        insta::assert_debug_snapshot!(announcement(Slot::ZERO), @r#"b"0\r\n""#);
        assert_eq!(&announcement(Slot::new(4_294_967_295))[..], b"4294967295\r\n");
    }

    #[test]
    fn encoder_appends_to_existing_buffer() {
        let mut buf = BytesMut::from(&b"x"[..]);
        SlotCodec::new().encode(Slot::new(12), &mut buf).unwrap();
        assert_eq!(&buf[..], b"x12\r\n");
    }

    #[test]
    fn decodes_and_leaves_trailing_bytes() {
        let (result, rest) = decode_all(b"17\r\nhello");
        assert_eq!(result.unwrap(), Some(Slot::new(17)));
        assert_eq!(&rest[..], b"hello");
    }

    #[test]
    fn waits_for_terminator() {
        let mut codec = SlotCodec::new();
        let mut buf = BytesMut::from(&b"12"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"3\r");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Slot::new(123)));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_non_digits() {
        for input in [&b"-1\r\n"[..], b"+1\r\n", b" 1\r\n", b"1a\r\n", b"\r\n"] {
            let (result, _) = decode_all(input);
            assert!(
                matches!(result, Err(WireError::Malformed(_))),
                "{:?} should be malformed",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn rejects_overflow() {
        let (result, _) = decode_all(b"4294967296\r\n");
        assert!(matches!(result, Err(WireError::Malformed(s)) if s == "4294967296"));
    }

    #[test]
    fn rejects_unterminated_long_line() {
        let (result, _) = decode_all(b"000000000001\r\n");
        assert!(matches!(result, Err(WireError::TooLong)));

        let (result, _) = decode_all(b"0123456789ab");
        assert!(matches!(result, Err(WireError::TooLong)));
    }

    #[test]
    fn eof_mid_announcement_is_truncated() {
        let mut codec = SlotCodec::new();
        let mut partial = BytesMut::from(&b"4"[..]);
        assert!(matches!(codec.decode_eof(&mut partial), Err(WireError::Truncated)));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }
}
