//! Key and value types
//!
//! A map is generic over a [`KeyType`] and a [`DataType`]. These are marker
//! types: they carry no state and only describe how items are sized, compared and
//! encoded, so all methods are associated functions.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::bitpack;
use crate::codec::varint::{read_var_u32, write_var_u32};
use crate::error::{AtlasError, Result};

/// Estimated memory of one array slot, added on top of the item estimate
pub(crate) const SLOT_MEMORY: usize = 8;

/// Value capability: sizing and encoding of one item type
pub trait DataType: Send + Sync + 'static {
    type Item: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Empty storage array for `capacity` items
    fn create_storage(capacity: usize) -> Vec<Self::Item> {
        Vec::with_capacity(capacity)
    }

    /// Estimated heap footprint of `item` in bytes
    fn memory(item: &Self::Item) -> usize;

    fn write(buf: &mut BytesMut, item: &Self::Item) -> Result<()>;

    fn read(buf: &mut &[u8]) -> Result<Self::Item>;

    fn write_all(buf: &mut BytesMut, items: &[Self::Item]) -> Result<()> {
        for item in items {
            Self::write(buf, item)?;
        }
        Ok(())
    }

    fn read_all(buf: &mut &[u8], count: usize) -> Result<Vec<Self::Item>> {
        let mut items = Self::create_storage(count);
        for _ in 0..count {
            items.push(Self::read(buf)?);
        }
        Ok(items)
    }
}

/// Key capability: a value type with a total order
pub trait KeyType: DataType {
    fn compare(a: &Self::Item, b: &Self::Item) -> Ordering;

    /// Binary search starting at `hint`
    ///
    /// `Ok(index)` if found, `Err(insertion_point)` otherwise.
    fn binary_search(keys: &[Self::Item], key: &Self::Item, hint: usize) -> std::result::Result<usize, usize> {
        if keys.is_empty() {
            return Err(0);
        }
        let mut low = 0isize;
        let mut high = keys.len() as isize - 1;
        let mut x = hint as isize - 1;
        if x < 0 || x > high {
            x = high >> 1;
        }
        while low <= high {
            match Self::compare(key, &keys[x as usize]) {
                Ordering::Greater => low = x + 1,
                Ordering::Less => high = x - 1,
                Ordering::Equal => return Ok(x as usize),
            }
            x = (low + high) >> 1;
        }
        Err(low as usize)
    }

    /// Strictly increasing
    fn is_sorted_unique(keys: &[Self::Item]) -> bool {
        keys.windows(2)
            .all(|w| Self::compare(&w[0], &w[1]) == Ordering::Less)
    }
}

// =============================================================================
// Provided Types
// =============================================================================

/// `u64` keys or values; arrays are bit-packed
#[derive(Debug, Clone, Copy, Default)]
pub struct LongType;

impl DataType for LongType {
    type Item = u64;

    fn memory(_item: &u64) -> usize {
        8
    }

    fn write(buf: &mut BytesMut, item: &u64) -> Result<()> {
        buf.put_u64(*item);
        Ok(())
    }

    fn read(buf: &mut &[u8]) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(AtlasError::corrupt("truncated long"));
        }
        Ok(buf.get_u64())
    }

    fn write_all(buf: &mut BytesMut, items: &[u64]) -> Result<()> {
        bitpack::pack(buf, items);
        Ok(())
    }

    fn read_all(buf: &mut &[u8], count: usize) -> Result<Vec<u64>> {
        bitpack::unpack(buf, count)
    }
}

impl KeyType for LongType {
    fn compare(a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }
}

/// Byte strings, ordered lexicographically
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesType;

impl DataType for BytesType {
    type Item = Vec<u8>;

    fn memory(item: &Vec<u8>) -> usize {
        24 + item.len()
    }

    fn write(buf: &mut BytesMut, item: &Vec<u8>) -> Result<()> {
        write_var_u32(buf, item.len() as u32);
        buf.put_slice(item);
        Ok(())
    }

    fn read(buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = read_var_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(AtlasError::corrupt("truncated byte string"));
        }
        let item = buf[..len].to_vec();
        buf.advance(len);
        Ok(item)
    }
}

impl KeyType for BytesType {
    fn compare(a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }
}

/// UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StringType;

impl DataType for StringType {
    type Item = String;

    fn memory(item: &String) -> usize {
        24 + item.len()
    }

    fn write(buf: &mut BytesMut, item: &String) -> Result<()> {
        write_var_u32(buf, item.len() as u32);
        buf.put_slice(item.as_bytes());
        Ok(())
    }

    fn read(buf: &mut &[u8]) -> Result<String> {
        let bytes = BytesType::read(buf)?;
        String::from_utf8(bytes).map_err(|_| AtlasError::corrupt("invalid UTF-8 in string"))
    }
}

impl KeyType for StringType {
    fn compare(a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }
}

/// Any serde value, bincode encoded
#[derive(Debug, Default)]
pub struct SerdeType<T>(PhantomData<fn() -> T>);

impl<T> DataType for SerdeType<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync + 'static,
{
    type Item = T;

    fn memory(item: &T) -> usize {
        24 + bincode::serialized_size(item).unwrap_or(0) as usize
    }

    fn write(buf: &mut BytesMut, item: &T) -> Result<()> {
        let bytes = bincode::serialize(item)?;
        write_var_u32(buf, bytes.len() as u32);
        buf.put_slice(&bytes);
        Ok(())
    }

    fn read(buf: &mut &[u8]) -> Result<T> {
        let bytes = BytesType::read(buf)?;
        bincode::deserialize(&bytes)
            .map_err(|e| AtlasError::corrupt(format!("invalid serialized value: {}", e)))
    }
}
