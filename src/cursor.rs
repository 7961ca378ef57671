//! Cursor
//!
//! Ordered iteration over one root snapshot, plus the descent helpers shared
//! with the write path.
//!
//! ## Descent Path
//! ```text
//! path[0]  root   index = child taken
//! path[1]  node   index = child taken
//! path[n]  leaf   index = entry (or -(insertion point) - 1 when absent)
//! ```
//! The cursor keeps this stack and walks it like an explicit recursion: a
//! frame whose index ran past its page is popped and its parent advances.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::page::{Page, PageReader};
use crate::types::{DataType, KeyType};

/// Switch from repeated `next` to a counted re-descent at this distance
const SKIP_BY_INDEX_THRESHOLD: u64 = 10;

/// One frame of a descent path
pub struct CursorPos<K: KeyType, V: DataType> {
    pub page: Arc<Page<K, V>>,
    pub index: isize,
}

impl<K: KeyType, V: DataType> Clone for CursorPos<K, V> {
    fn clone(&self) -> Self {
        Self {
            page: self.page.clone(),
            index: self.index,
        }
    }
}

impl<K: KeyType, V: DataType> std::fmt::Debug for CursorPos<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorPos")
            .field("pos", &self.page.pos())
            .field("index", &self.index)
            .finish()
    }
}

// =============================================================================
// Descent Helpers
// =============================================================================

/// Path from `root` to the leaf where `key` is or would be
pub(crate) fn traverse_down<K: KeyType, V: DataType>(
    root: &Arc<Page<K, V>>,
    key: &K::Item,
    reader: &dyn PageReader<K, V>,
) -> Result<Vec<CursorPos<K, V>>> {
    let mut path = Vec::new();
    let mut page = root.clone();
    while !page.is_leaf() {
        let index = match page.search(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        let child = page.child_page(index, reader)?;
        path.push(CursorPos {
            page,
            index: index as isize,
        });
        page = child;
    }
    let index = match page.search(key) {
        Ok(i) => i as isize,
        Err(i) => -(i as isize) - 1,
    };
    path.push(CursorPos { page, index });
    Ok(path)
}

/// Path along the left or right spine
///
/// The leaf frame of the right spine carries `-(key_count) - 1`, the
/// insertion point just past the last entry.
pub(crate) fn spine<K: KeyType, V: DataType>(
    root: &Arc<Page<K, V>>,
    rightmost: bool,
    reader: &dyn PageReader<K, V>,
) -> Result<Vec<CursorPos<K, V>>> {
    let mut path = Vec::new();
    let mut page = root.clone();
    while !page.is_leaf() {
        let index = if rightmost { page.child_count() - 1 } else { 0 };
        let child = page.child_page(index, reader)?;
        path.push(CursorPos {
            page,
            index: index as isize,
        });
        page = child;
    }
    let index = if rightmost {
        -(page.key_count() as isize) - 1
    } else {
        -1
    };
    path.push(CursorPos { page, index });
    Ok(path)
}

/// Index of `key` in the whole tree, or `-(insertion point) - 1`
pub(crate) fn key_index<K: KeyType, V: DataType>(
    root: &Arc<Page<K, V>>,
    key: &K::Item,
    reader: &dyn PageReader<K, V>,
) -> Result<i64> {
    if root.total_count() == 0 {
        return Ok(-1);
    }
    let mut page = root.clone();
    let mut offset = 0i64;
    loop {
        let found = page.search(key);
        if page.is_leaf() {
            return Ok(match found {
                Ok(i) => offset + i as i64,
                Err(i) => -offset - i as i64 - 1,
            });
        }
        let child = match found {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        for i in 0..child {
            offset += page.child_entry_count(i) as i64;
        }
        page = page.child_page(child, reader)?;
    }
}

/// Key at position `index` in the whole tree
pub(crate) fn key_at<K: KeyType, V: DataType>(
    root: &Arc<Page<K, V>>,
    index: i64,
    reader: &dyn PageReader<K, V>,
) -> Result<Option<K::Item>> {
    if index < 0 || index as u64 >= root.total_count() {
        return Ok(None);
    }
    let mut index = index as u64;
    let mut page = root.clone();
    loop {
        if page.is_leaf() {
            return Ok(page.keys().as_slice().get(index as usize).cloned());
        }
        let mut child = 0;
        while child < page.child_count() {
            let count = page.child_entry_count(child);
            if index < count {
                break;
            }
            index -= count;
            child += 1;
        }
        if child == page.child_count() {
            return Ok(None);
        }
        page = page.child_page(child, reader)?;
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// Iterator over the entries of one map snapshot
///
/// Yields `(key, value)` pairs in key order (or reverse order), starting at the
/// first key at or after `from` (at or before, when reversed) and stopping
/// after `to`.
pub struct Cursor<K: KeyType, V: DataType> {
    root: Arc<Page<K, V>>,
    reader: Arc<dyn PageReader<K, V> + Send + Sync>,
    path: Vec<CursorPos<K, V>>,
    to: Option<K::Item>,
    reverse: bool,
    last: Option<(K::Item, V::Item)>,
    failed: bool,
}

impl<K: KeyType, V: DataType> Cursor<K, V> {
    pub(crate) fn new(
        root: Arc<Page<K, V>>,
        reader: Arc<dyn PageReader<K, V> + Send + Sync>,
        from: Option<&K::Item>,
        to: Option<K::Item>,
        reverse: bool,
    ) -> Result<Self> {
        let path = Self::position(&root, from, reverse, &*reader)?;
        Ok(Self {
            root,
            reader,
            path,
            to,
            reverse,
            last: None,
            failed: false,
        })
    }

    fn position(
        root: &Arc<Page<K, V>>,
        from: Option<&K::Item>,
        reverse: bool,
        reader: &dyn PageReader<K, V>,
    ) -> Result<Vec<CursorPos<K, V>>> {
        let mut path = match from {
            Some(key) => traverse_down(root, key, reader)?,
            None => spine(root, reverse, reader)?,
        };
        if let Some(tip) = path.last_mut() {
            if tip.index < 0 {
                tip.index = -tip.index - 1;
                if reverse {
                    tip.index -= 1;
                }
            }
        }
        Ok(path)
    }

    /// Key of the entry returned last
    pub fn key(&self) -> Option<&K::Item> {
        self.last.as_ref().map(|(k, _)| k)
    }

    /// Value of the entry returned last
    pub fn value(&self) -> Option<&V::Item> {
        self.last.as_ref().map(|(_, v)| v)
    }

    /// Skip `n` entries
    ///
    /// Short distances step through the leaves; longer ones re-descend from the
    /// root using the subtree counts.
    pub fn skip_entries(&mut self, n: u64) -> Result<()> {
        if n < SKIP_BY_INDEX_THRESHOLD {
            for _ in 0..n {
                if self.fetch()?.is_none() {
                    break;
                }
            }
            return Ok(());
        }
        let Some((key, _)) = self.fetch()? else {
            return Ok(());
        };
        let index = key_index(&self.root, &key, &*self.reader)?;
        let target = if self.reverse {
            index - n as i64
        } else {
            index + n as i64
        };
        match key_at(&self.root, target, &*self.reader)? {
            Some(target_key) => {
                self.path = Self::position(&self.root, Some(&target_key), self.reverse, &*self.reader)?;
            }
            None => self.path.clear(),
        }
        Ok(())
    }

    fn fetch(&mut self) -> Result<Option<(K::Item, V::Item)>> {
        let step: isize = if self.reverse { -1 } else { 1 };
        loop {
            let Some(top) = self.path.last_mut() else {
                return Ok(None);
            };
            let page = top.page.clone();
            let index = top.index;
            let upper = if page.is_leaf() {
                page.key_count()
            } else {
                page.child_count()
            } as isize;

            if (self.reverse && index < 0) || (!self.reverse && index >= upper) {
                self.path.pop();
                match self.path.last_mut() {
                    Some(parent) => parent.index += step,
                    None => return Ok(None),
                }
                continue;
            }

            if !page.is_leaf() {
                let child = page.child_page(index as usize, &*self.reader)?;
                let child_index = if self.reverse {
                    (if child.is_leaf() {
                        child.key_count()
                    } else {
                        child.child_count()
                    }) as isize
                        - 1
                } else {
                    0
                };
                self.path.push(CursorPos {
                    page: child,
                    index: child_index,
                });
                continue;
            }

            top.index += step;
            let key = page.key(index as usize).clone();
            if let Some(to) = &self.to {
                let beyond = if self.reverse {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                if K::compare(&key, to) == beyond {
                    self.path.clear();
                    return Ok(None);
                }
            }
            let value = page
                .value(index as usize)
                .cloned()
                .ok_or_else(|| crate::error::AtlasError::internal("Leaf without value"))?;
            return Ok(Some((key, value)));
        }
    }
}

impl<K: KeyType, V: DataType> Iterator for Cursor<K, V> {
    type Item = Result<(K::Item, V::Item)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.fetch() {
            Ok(Some(entry)) => {
                self.last = Some(entry.clone());
                Some(Ok(entry))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AtlasError;
    use crate::page::{KeyManager, PageReference};
    use crate::types::LongType;

    type P = Page<LongType, LongType>;

    struct NoReader;

    impl PageReader<LongType, LongType> for NoReader {
        fn read_page(&self, pos: u64) -> Result<Arc<P>> {
            Err(AtlasError::internal(format!("unexpected read of {}", pos)))
        }
    }

    fn leaf(keys: std::ops::Range<u64>) -> Arc<P> {
        let keys: Vec<u64> = keys.collect();
        let values = keys.iter().map(|k| k * 2).collect();
        Arc::new(P::create_leaf(5, KeyManager::new(keys), values))
    }

    /// Keys 0..30 in three leaves
    fn tree() -> Arc<P> {
        Arc::new(P::create_node(
            5,
            KeyManager::new(vec![10, 20]),
            vec![
                PageReference::new(leaf(0..10)),
                PageReference::new(leaf(10..20)),
                PageReference::new(leaf(20..30)),
            ],
        ))
    }

    fn cursor(from: Option<u64>, to: Option<u64>, reverse: bool) -> Cursor<LongType, LongType> {
        Cursor::new(tree(), Arc::new(NoReader), from.as_ref(), to, reverse).unwrap()
    }

    fn keys(c: Cursor<LongType, LongType>) -> Vec<u64> {
        c.map(|e| e.unwrap().0).collect()
    }

    #[test]
    fn test_forward_and_reverse() {
        assert_eq!(keys(cursor(None, None, false)), (0..30).collect::<Vec<_>>());
        assert_eq!(keys(cursor(None, None, true)), (0..30).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_bounds() {
        assert_eq!(keys(cursor(Some(8), Some(12), false)), vec![8, 9, 10, 11, 12]);
        assert_eq!(keys(cursor(Some(21), Some(18), true)), vec![21, 20, 19, 18]);
        assert_eq!(keys(cursor(Some(100), None, false)), Vec::<u64>::new());
    }

    #[test]
    fn test_value_of_last_entry() {
        let mut c = cursor(Some(4), None, false);
        assert!(c.key().is_none());
        c.next();
        assert_eq!(c.key(), Some(&4));
        assert_eq!(c.value(), Some(&8));
    }

    #[test]
    fn test_skip_matches_repeated_next() {
        for n in [0u64, 3, 9, 10, 15, 29, 40] {
            let mut skipped = cursor(None, None, false);
            skipped.skip_entries(n).unwrap();
            let mut stepped = cursor(None, None, false);
            for _ in 0..n {
                stepped.next();
            }
            assert_eq!(
                skipped.next().map(|e| e.unwrap().0),
                stepped.next().map(|e| e.unwrap().0),
                "skip({})",
                n
            );
        }
    }

    #[test]
    fn test_key_index_and_key_at() {
        let root = tree();
        assert_eq!(key_index(&root, &15, &NoReader).unwrap(), 15);
        assert_eq!(key_at(&root, 25, &NoReader).unwrap(), Some(25));
        assert_eq!(key_at(&root, 30, &NoReader).unwrap(), None);
        assert_eq!(key_index(&root, &100, &NoReader).unwrap(), -31);
    }
}
