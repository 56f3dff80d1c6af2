//! Variable-length integer codec shared by every payload format.
//!
//! Unsigned LEB128: seven bits per byte, low bits first, high bit set on
//! every byte except the last.

#![allow(missing_docs)]

use crate::core::errors::{BrtError, Result};

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` to `out`.
pub fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    #[allow(clippy::cast_possible_truncation)]
    out.push(value as u8);
}

/// Number of bytes `put_uvarint` would write for `value`.
#[must_use]
pub fn uvarint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Cursor over a payload. Every read is bounds-checked and reports the
/// payload kind it was decoding.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            context,
        }
    }

    /// Current offset into the buffer.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read_uvarint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for (index, shift) in (0..MAX_VARINT_LEN).zip((0..).step_by(7)) {
            let Some(&byte) = self.buf.get(self.pos + index) else {
                return Err(BrtError::decode(
                    self.context,
                    format!("truncated varint at offset {}", self.pos),
                ));
            };
            if index == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(BrtError::decode(
                    self.context,
                    format!("varint overflow at offset {}", self.pos),
                ));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                self.pos += index + 1;
                return Ok(value);
            }
        }
        Err(BrtError::decode(
            self.context,
            format!("varint overflow at offset {}", self.pos),
        ))
    }

    /// Read a varint that must fit in a `u32` (principal ids).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.read_uvarint()?;
        u32::try_from(value).map_err(|_| {
            BrtError::decode(self.context, format!("value {value} does not fit in 32 bits"))
        })
    }

    /// Read a varint used as a length or count.
    pub fn read_len(&mut self) -> Result<usize> {
        let value = self.read_uvarint()?;
        let len = usize::try_from(value)
            .map_err(|_| BrtError::decode(self.context, format!("length {value} too large")))?;
        if len > self.buf.len() {
            return Err(BrtError::decode(
                self.context,
                format!("length {len} exceeds buffer of {} bytes", self.buf.len()),
            ));
        }
        Ok(len)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or_else(|| {
            BrtError::decode(self.context, format!("truncated byte at offset {}", self.pos))
        })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                BrtError::decode(
                    self.context,
                    format!("{len} bytes requested at offset {}, buffer ends at {}", self.pos, self.buf.len()),
                )
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for value in [0, 1, 127, 128, 300, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, value);
            assert_eq!(buf.len(), uvarint_len(value), "length of {value}");
            let mut reader = ByteReader::new(&buf, "test");
            assert_eq!(reader.read_uvarint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn single_byte_values_encode_as_themselves() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 5);
        put_uvarint(&mut buf, 300);
        assert_eq!(buf, vec![5, 0xac, 0x02]);
    }

    #[test]
    fn truncated_varint_is_decode_error() {
        let mut reader = ByteReader::new(&[0x80, 0x80], "test");
        let err = reader.read_uvarint().unwrap_err();
        assert_eq!(err.code(), "BRT-2301");
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let buf = [0xff; 11];
        let mut reader = ByteReader::new(&buf, "test");
        assert!(reader.read_uvarint().is_err());
    }

    #[test]
    fn read_bytes_checks_bounds() {
        let mut reader = ByteReader::new(b"abc", "test");
        assert_eq!(reader.read_bytes(2).unwrap(), b"ab");
        assert!(reader.read_bytes(2).is_err());
        assert_eq!(reader.read_u8().unwrap(), b'c');
        assert!(reader.read_u8().is_err());
    }
}
