//! Bit-packed u64 arrays
//!
//! ```text
//! ┌───────────────┬───────────┬───────────────────────────────┐
//! │ varint(base)  │ width (u8)│ (value - base) × width bits   │
//! └───────────────┴───────────┴───────────────────────────────┘
//! ```
//! Bits are written little-endian into whole bytes. The element count is not
//! stored; the caller knows it (a page stores its key count up front).

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::varint::{read_var_u64, write_var_u64};
use crate::error::{AtlasError, Result};

pub fn pack(buf: &mut BytesMut, values: &[u64]) {
    let base = values.iter().copied().min().unwrap_or(0);
    let span = values.iter().map(|v| v - base).max().unwrap_or(0);
    let width = 64 - span.leading_zeros();
    write_var_u64(buf, base);
    buf.put_u8(width as u8);
    if width == 0 {
        return;
    }

    let mut acc: u128 = 0;
    let mut bits = 0u32;
    for &v in values {
        acc |= ((v - base) as u128) << bits;
        bits += width;
        while bits >= 8 {
            buf.put_u8(acc as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        buf.put_u8(acc as u8);
    }
}

pub fn unpack(buf: &mut impl Buf, count: usize) -> Result<Vec<u64>> {
    let base = read_var_u64(buf)?;
    if !buf.has_remaining() {
        return Err(AtlasError::corrupt("truncated bit-packed array"));
    }
    let width = buf.get_u8() as u32;
    if width > 64 {
        return Err(AtlasError::corrupt(format!("bad bit width {}", width)));
    }
    if width == 0 {
        return Ok(vec![base; count]);
    }

    let total_bytes = (count as u64 * width as u64 + 7) / 8;
    if (buf.remaining() as u64) < total_bytes {
        return Err(AtlasError::corrupt("truncated bit-packed array"));
    }
    let mask: u128 = (1u128 << width) - 1;
    let mut out = Vec::with_capacity(count);
    let mut acc: u128 = 0;
    let mut bits = 0u32;
    for _ in 0..count {
        while bits < width {
            acc |= (buf.get_u8() as u128) << bits;
            bits += 8;
        }
        out.push(base.wrapping_add((acc & mask) as u64));
        acc >>= width;
        bits -= width;
    }
    Ok(out)
}
