//! Variable-length quantities.
//!
//! Each byte carries 7 data bits; the high bit marks continuation. Signed
//! values are zig-zag mapped first so small negatives stay short.

use crate::error::{BytecodeError, Result};

/// Append `value` as an unsigned VLQ.
pub fn encode_unsigned(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode an unsigned VLQ at `*pos`, advancing `pos` past it.
pub fn decode_unsigned(encoded: &[u8], pos: &mut usize) -> Result<u32> {
    let start = *pos;
    let mut result: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *encoded.get(*pos).ok_or(BytecodeError::UnexpectedEnd)?;
        *pos += 1;
        let bits = (byte & 0x7F) as u32;
        if shift == 28 && bits > 0x0F {
            return Err(BytecodeError::VlqOverflow(start));
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 28 {
            return Err(BytecodeError::VlqOverflow(start));
        }
    }
}

/// Zig-zag map a signed value onto the unsigned range.
#[inline]
pub const fn zigzag_encode(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Inverse of [`zigzag_encode`].
#[inline]
pub const fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Append `value` as a zig-zag VLQ.
pub fn encode_signed(value: i32, buf: &mut Vec<u8>) {
    encode_unsigned(zigzag_encode(value), buf);
}

/// Decode a zig-zag VLQ at `*pos`.
pub fn decode_signed(encoded: &[u8], pos: &mut usize) -> Result<i32> {
    decode_unsigned(encoded, pos).map(zigzag_decode)
}
