//! Variable-length integers (LEB128)
//!
//! Seven bits per byte, least significant group first, high bit set on every
//! byte except the last.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{AtlasError, Result};

pub fn write_var_u32(buf: &mut BytesMut, value: u32) {
    write_var_u64(buf, value as u64)
}

pub fn write_var_u64(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Number of bytes `value` takes when encoded
pub fn var_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn read_var_u32(buf: &mut impl Buf) -> Result<u32> {
    let value = read_var_u64(buf)?;
    u32::try_from(value).map_err(|_| AtlasError::corrupt(format!("varint {} overflows u32", value)))
}

pub fn read_var_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(AtlasError::corrupt("truncated varint"));
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(AtlasError::corrupt("overlong varint"));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(AtlasError::corrupt("overlong varint"));
        }
    }
}
