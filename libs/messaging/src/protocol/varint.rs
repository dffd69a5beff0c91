//! Base-128 Variable-Length Integers
//!
//! Each byte carries 7 payload bits, least-significant group first; a set
//! MSB means more bytes follow. 32-bit values take up to 5 bytes, 64-bit
//! values up to 9 (the 9th byte, when present, holds the top 8 bits as-is
//! with no continuation bit).
//!
//! Decoding is resumable: a short buffer yields [`Decoded::NeedMoreData`]
//! and consumes nothing, so the caller can retry once more bytes arrive.

use crate::error::{MessagingError, Result};
use bytes::{BufMut, BytesMut};

/// Outcome of a decode attempt over a possibly-incomplete buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A full value was present; `usize` is the number of bytes it used
    Value(T, usize),
    /// The buffer ends mid-integer; nothing was consumed
    NeedMoreData,
}

const CONTINUE: u8 = 0x80;
const PAYLOAD: u8 = 0x7f;

/// Append a 32-bit varint (at most 5 bytes)
pub fn write_u32(buf: &mut BytesMut, mut value: u32) {
    let mut written = 0;
    while value & !u32::from(PAYLOAD) != 0 && written < 4 {
        buf.put_u8((value as u8 & PAYLOAD) | CONTINUE);
        value >>= 7;
        written += 1;
    }
    buf.put_u8(value as u8);
}

/// Append a 64-bit varint (at most 9 bytes)
pub fn write_u64(buf: &mut BytesMut, mut value: u64) {
    let mut written = 0;
    while value & !u64::from(PAYLOAD) != 0 && written < 8 {
        buf.put_u8((value as u8 & PAYLOAD) | CONTINUE);
        value >>= 7;
        written += 1;
    }
    buf.put_u8(value as u8);
}

/// Decode a 32-bit varint from the front of `buf`
pub fn read_u32(buf: &[u8]) -> Result<Decoded<u32>> {
    let mut value = 0u32;
    for i in 0..4 {
        let Some(&byte) = buf.get(i) else {
            return Ok(Decoded::NeedMoreData);
        };
        value |= u32::from(byte & PAYLOAD) << (7 * i);
        if byte & CONTINUE == 0 {
            return Ok(Decoded::Value(value, i + 1));
        }
    }
    // fifth byte carries the top 4 bits and must not continue
    let Some(&byte) = buf.get(4) else {
        return Ok(Decoded::NeedMoreData);
    };
    if byte & CONTINUE != 0 {
        return Err(MessagingError::protocol("malformed 32-bit varint"));
    }
    value |= u32::from(byte) << 28;
    Ok(Decoded::Value(value, 5))
}

/// Decode a 64-bit varint from the front of `buf`
pub fn read_u64(buf: &[u8]) -> Result<Decoded<u64>> {
    let mut value = 0u64;
    for i in 0..8 {
        let Some(&byte) = buf.get(i) else {
            return Ok(Decoded::NeedMoreData);
        };
        value |= u64::from(byte & PAYLOAD) << (7 * i);
        if byte & CONTINUE == 0 {
            return Ok(Decoded::Value(value, i + 1));
        }
    }
    // ninth byte is the full top byte, no continuation bit
    let Some(&byte) = buf.get(8) else {
        return Ok(Decoded::NeedMoreData);
    };
    value |= u64::from(byte) << 56;
    Ok(Decoded::Value(value, 9))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode32(value: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u32(&mut buf, value);
        buf.to_vec()
    }

    fn encode64(value: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_u64(&mut buf, value);
        buf.to_vec()
    }

    #[test]
    fn u32_boundaries() {
        for (value, len) in [
            (0u32, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            ((1 << 28) - 1, 4),
            (1 << 28, 5),
            (u32::MAX, 5),
        ] {
            let bytes = encode32(value);
            assert_eq!(bytes.len(), len, "encoded length of {value}");
            assert_eq!(read_u32(&bytes).unwrap(), Decoded::Value(value, len));
        }
    }

    #[test]
    fn u64_boundaries() {
        for (value, len) in [
            (0u64, 1),
            (127, 1),
            (128, 2),
            ((1 << 28) - 1, 4),
            (1 << 28, 5),
            ((1 << 56) - 1, 8),
            (1 << 56, 9),
            (u64::MAX, 9),
        ] {
            let bytes = encode64(value);
            assert_eq!(bytes.len(), len, "encoded length of {value}");
            assert_eq!(read_u64(&bytes).unwrap(), Decoded::Value(value, len));
        }
    }

    #[test]
    fn partial_buffers_signal_need_more_data() {
        let bytes = encode64(u64::MAX);
        for cut in 0..bytes.len() {
            assert_eq!(
                read_u64(&bytes[..cut]).unwrap(),
                Decoded::NeedMoreData,
                "truncated at {cut}"
            );
        }
        // and the full buffer still decodes after the bytes "arrive"
        assert_eq!(
            read_u64(&bytes).unwrap(),
            Decoded::Value(u64::MAX, bytes.len())
        );
    }

    #[test]
    fn overlong_u32_is_rejected() {
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(read_u32(&bytes).is_err());
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let mut bytes = encode32(300);
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(read_u32(&bytes).unwrap(), Decoded::Value(300, 2));
    }

    proptest! {
        #[test]
        fn u32_round_trip(value: u32) {
            let bytes = encode32(value);
            prop_assert_eq!(read_u32(&bytes).unwrap(), Decoded::Value(value, bytes.len()));
        }

        #[test]
        fn u64_round_trip(value: u64) {
            let bytes = encode64(value);
            prop_assert_eq!(read_u64(&bytes).unwrap(), Decoded::Value(value, bytes.len()));
        }
    }
}
