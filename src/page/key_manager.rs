//! Key Manager
//!
//! The ordered key array of one page. Every mutation returns a new manager; the
//! array of a published page is never changed in place.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;

use crate::error::Result;
use crate::types::{KeyType, SLOT_MEMORY};

pub struct KeyManager<K: KeyType> {
    keys: Vec<K::Item>,
    /// Index after the last search hit, used as the next starting guess
    hint: AtomicUsize,
}

impl<K: KeyType> Clone for KeyManager<K> {
    fn clone(&self) -> Self {
        Self::new(self.keys.clone())
    }
}

impl<K: KeyType> std::fmt::Debug for KeyManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keys.iter()).finish()
    }
}

impl<K: KeyType> KeyManager<K> {
    pub fn new(keys: Vec<K::Item>) -> Self {
        Self {
            keys,
            hint: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(K::create_storage(0))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> &K::Item {
        &self.keys[index]
    }

    pub fn as_slice(&self) -> &[K::Item] {
        &self.keys
    }

    pub fn binary_search(&self, key: &K::Item) -> std::result::Result<usize, usize> {
        let result = K::binary_search(&self.keys, key, self.hint.load(Ordering::Relaxed));
        let hit = match result {
            Ok(i) | Err(i) => i,
        };
        self.hint.store(hit + 1, Ordering::Relaxed);
        result
    }

    // -------------------------------------------------------------------------
    // Copy-on-Write Mutations
    // -------------------------------------------------------------------------

    pub fn insert(&self, index: usize, key: K::Item) -> Self {
        let mut keys = K::create_storage(self.keys.len() + 1);
        keys.extend_from_slice(&self.keys[..index]);
        keys.push(key);
        keys.extend_from_slice(&self.keys[index..]);
        Self::new(keys)
    }

    pub fn remove(&self, index: usize) -> Self {
        let mut keys = K::create_storage(self.keys.len().saturating_sub(1));
        keys.extend_from_slice(&self.keys[..index]);
        keys.extend_from_slice(&self.keys[index + 1..]);
        Self::new(keys)
    }

    pub fn replace(&self, index: usize, key: K::Item) -> Self {
        let mut keys = self.keys.clone();
        keys[index] = key;
        Self::new(keys)
    }

    /// `[..at]` and `[at..]`
    pub fn split_off(&self, at: usize) -> (Self, Self) {
        (
            Self::new(self.keys[..at].to_vec()),
            Self::new(self.keys[at..].to_vec()),
        )
    }

    /// Append a batch of keys
    pub fn expand(&self, extra: &[K::Item]) -> Self {
        let mut keys = K::create_storage(self.keys.len() + extra.len());
        keys.extend_from_slice(&self.keys);
        keys.extend_from_slice(extra);
        Self::new(keys)
    }

    // -------------------------------------------------------------------------
    // Size and Encoding
    // -------------------------------------------------------------------------

    /// Estimated memory of the key array
    pub fn memory(&self) -> usize {
        self.keys.iter().map(|k| K::memory(k) + SLOT_MEMORY).sum()
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<()> {
        K::write_all(buf, &self.keys)
    }

    pub fn read(buf: &mut &[u8], count: usize) -> Result<Self> {
        Ok(Self::new(K::read_all(buf, count)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LongType, StringType};

    fn keys(values: &[u64]) -> KeyManager<LongType> {
        KeyManager::new(values.to_vec())
    }

    #[test]
    fn test_mutations_leave_original_untouched() {
        let km = keys(&[1, 3, 5]);
        let inserted = km.insert(1, 2);
        assert_eq!(inserted.as_slice(), &[1, 2, 3, 5]);
        assert_eq!(km.as_slice(), &[1, 3, 5]);
        assert_eq!(km.remove(0).as_slice(), &[3, 5]);
        assert_eq!(km.replace(2, 6).as_slice(), &[1, 3, 6]);
        assert_eq!(km.expand(&[7, 9]).as_slice(), &[1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_split_off() {
        let (left, right) = keys(&[1, 2, 3, 4]).split_off(1);
        assert_eq!(left.as_slice(), &[1]);
        assert_eq!(right.as_slice(), &[2, 3, 4]);
    }

    #[test]
    fn test_search_updates_hint() {
        let km = keys(&[10, 20, 30]);
        assert_eq!(km.binary_search(&30), Ok(2));
        assert_eq!(km.hint.load(Ordering::Relaxed), 3);
        assert_eq!(km.binary_search(&15), Err(1));
        assert_eq!(km.binary_search(&10), Ok(0));
    }

    #[test]
    fn test_encoding() {
        let km: KeyManager<StringType> = KeyManager::new(vec!["a".into(), "bc".into()]);
        let mut buf = BytesMut::new();
        km.write(&mut buf).unwrap();
        let mut slice = &buf[..];
        let decoded = KeyManager::<StringType>::read(&mut slice, 2).unwrap();
        assert_eq!(decoded.as_slice(), km.as_slice());
        assert_eq!(km.memory(), (24 + 1 + 8) + (24 + 2 + 8));
    }
}
