//! Page Module
//!
//! Immutable B-tree pages with structural sharing.
//!
//! ## Responsibilities
//! - Leaf pages (keys + values) and non-leaf pages (keys + child references)
//! - Copy-on-write mutation: every operation returns a new page
//! - Memory estimation for the unsaved-memory budget
//! - Removal accounting when a page leaves the current tree
//!
//! ## Shape
//! ```text
//!                 ┌──────────────────────────┐
//!                 │ Node   k0 │ k1           │
//!                 │  c0  │  c1  │  c2        │
//!                 └──┬──────┬──────┬─────────┘
//!          ┌─────────┘      │      └─────────┐
//!     ┌────▼────┐      ┌────▼────┐      ┌────▼────┐
//!     │ Leaf    │      │ Leaf    │      │ Leaf    │
//!     │ < k0    │      │ k0..k1  │      │ >= k1   │
//!     └─────────┘      └─────────┘      └─────────┘
//! ```
//! A child reference holds either the loaded child or only its saved position;
//! saved children are released after a commit and re-read on demand.

pub mod key_manager;
pub(crate) mod serialize;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::codec::page_info::{self, REMOVED_UNSAVED, UNSAVED};
use crate::error::{AtlasError, Result};
use crate::types::{DataType, KeyType, SLOT_MEMORY};

pub use key_manager::KeyManager;
pub(crate) use serialize::ChunkWriter;

/// Fixed memory estimate of a page object
pub(crate) const PAGE_MEMORY: usize = 128;

/// Memory estimate of one child reference
pub(crate) const CHILD_MEMORY: usize = 32;

const NO_PAGE_NO: u32 = u32::MAX;

/// A page with its key and value types erased, as kept by the page cache
pub(crate) type ErasedPage = Arc<dyn Any + Send + Sync>;

/// Resolves saved child positions into pages
pub(crate) trait PageReader<K: KeyType, V: DataType> {
    fn read_page(&self, pos: u64) -> Result<Arc<Page<K, V>>>;
}

/// A saved page that left the current tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemovedPageInfo {
    pub pos: u64,
    /// Sequence number within the chunk, looked up in the ToC when unknown
    pub page_no: Option<u32>,
    /// Version at which the page stopped being part of the tree
    pub version: u64,
    pub pinned: bool,
}

// =============================================================================
// Page Reference
// =============================================================================

/// Child slot of a non-leaf page
pub struct PageReference<K: KeyType, V: DataType> {
    /// Loaded child, cleared once the child is saved and released
    page: ArcSwapOption<Page<K, V>>,
    /// Saved position, valid whenever `page` is empty
    pos: AtomicU64,
    /// Entries in the child subtree
    count: u64,
}

impl<K: KeyType, V: DataType> PageReference<K, V> {
    pub(crate) fn new(page: Arc<Page<K, V>>) -> Self {
        Self {
            pos: AtomicU64::new(page.pos()),
            count: page.total_count(),
            page: ArcSwapOption::new(Some(page)),
        }
    }

    pub(crate) fn saved(pos: u64, count: u64) -> Self {
        Self {
            page: ArcSwapOption::empty(),
            pos: AtomicU64::new(pos),
            count,
        }
    }

    /// Loaded child, if any
    pub fn page(&self) -> Option<Arc<Page<K, V>>> {
        self.page.load_full()
    }

    pub fn pos(&self) -> u64 {
        let guard = self.page.load();
        match &*guard {
            Some(page) if page.is_saved() => page.pos(),
            Some(_) => UNSAVED,
            None => self.pos.load(Ordering::Acquire),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Record the position the child was just written at
    pub(crate) fn set_written_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    /// Position as stored in the reference itself
    pub(crate) fn stored_pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    /// Drop the loaded child once it (and its subtree) is saved
    fn clear_page_reference(&self) {
        if let Some(page) = self.page.load_full() {
            page.release_saved_pages();
            if page.is_saved() {
                self.pos.store(page.pos(), Ordering::Release);
                self.page.store(None);
            }
        }
    }
}

impl<K: KeyType, V: DataType> Clone for PageReference<K, V> {
    fn clone(&self) -> Self {
        Self {
            page: ArcSwapOption::new(self.page.load_full()),
            pos: AtomicU64::new(self.pos.load(Ordering::Acquire)),
            count: self.count,
        }
    }
}

impl<K: KeyType, V: DataType> fmt::Debug for PageReference<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageReference")
            .field("pos", &self.pos())
            .field("count", &self.count)
            .field("loaded", &self.page.load().is_some())
            .finish()
    }
}

// =============================================================================
// Page
// =============================================================================

pub(crate) enum PageBody<K: KeyType, V: DataType> {
    Leaf {
        values: Vec<V::Item>,
    },
    Node {
        children: Vec<PageReference<K, V>>,
        total_count: u64,
    },
}

/// An immutable B-tree page
///
/// Only `pos` and `page_no` change after construction, exactly once, when the
/// page is written (or dropped from the tree before that).
pub struct Page<K: KeyType, V: DataType> {
    map_id: u32,
    keys: KeyManager<K>,
    body: PageBody<K, V>,
    /// Estimated heap footprint
    memory: usize,
    /// Page info: 0 unsaved, 1 removed while unsaved, otherwise saved position
    pos: AtomicU64,
    /// Sequence number within its chunk
    page_no: AtomicU32,
}

impl<K: KeyType, V: DataType> Page<K, V> {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    fn build(map_id: u32, keys: KeyManager<K>, body: PageBody<K, V>) -> Self {
        let memory = PAGE_MEMORY
            + keys.memory()
            + match &body {
                PageBody::Leaf { values } => values
                    .iter()
                    .map(|v| V::memory(v) + SLOT_MEMORY)
                    .sum::<usize>(),
                PageBody::Node { children, .. } => children.len() * CHILD_MEMORY,
            };
        Self {
            map_id,
            keys,
            body,
            memory,
            pos: AtomicU64::new(UNSAVED),
            page_no: AtomicU32::new(NO_PAGE_NO),
        }
    }

    pub(crate) fn create_empty_leaf(map_id: u32) -> Arc<Self> {
        Arc::new(Self::create_leaf(map_id, KeyManager::empty(), V::create_storage(0)))
    }

    pub(crate) fn create_leaf(map_id: u32, keys: KeyManager<K>, values: Vec<V::Item>) -> Self {
        Self::build(map_id, keys, PageBody::Leaf { values })
    }

    pub(crate) fn create_node(
        map_id: u32,
        keys: KeyManager<K>,
        children: Vec<PageReference<K, V>>,
    ) -> Self {
        let total_count = children.iter().map(|c| c.count).sum();
        Self::build(map_id, keys, PageBody::Node { children, total_count })
    }

    /// A fresh, unsaved copy with the same content
    pub(crate) fn copy(&self) -> Self {
        let body = match &self.body {
            PageBody::Leaf { values } => PageBody::Leaf {
                values: values.clone(),
            },
            PageBody::Node {
                children,
                total_count,
            } => PageBody::Node {
                children: children.clone(),
                total_count: *total_count,
            },
        };
        Self::build(self.map_id, self.keys.clone(), body)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, PageBody::Leaf { .. })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn key(&self, index: usize) -> &K::Item {
        self.keys.get(index)
    }

    pub fn keys(&self) -> &KeyManager<K> {
        &self.keys
    }

    /// Leaf values (empty for non-leaf pages)
    pub fn values(&self) -> &[V::Item] {
        match &self.body {
            PageBody::Leaf { values } => values,
            PageBody::Node { .. } => &[],
        }
    }

    pub fn value(&self, index: usize) -> Option<&V::Item> {
        self.values().get(index)
    }

    /// Child references (empty for leaves)
    pub fn children(&self) -> &[PageReference<K, V>] {
        match &self.body {
            PageBody::Leaf { .. } => &[],
            PageBody::Node { children, .. } => children,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    /// Entries in the subtree rooted here
    pub fn total_count(&self) -> u64 {
        match &self.body {
            PageBody::Leaf { .. } => self.keys.len() as u64,
            PageBody::Node { total_count, .. } => *total_count,
        }
    }

    /// Entries below child `index`
    pub fn child_entry_count(&self, index: usize) -> u64 {
        self.children()[index].count
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn is_saved(&self) -> bool {
        page_info::is_saved(self.pos())
    }

    pub fn page_no(&self) -> Option<u32> {
        match self.page_no.load(Ordering::Acquire) {
            NO_PAGE_NO => None,
            no => Some(no),
        }
    }

    /// `Ok(index)` if present, `Err(insertion_point)` otherwise
    pub fn search(&self, key: &K::Item) -> std::result::Result<usize, usize> {
        self.keys.binary_search(key)
    }

    /// Child `index`, loading it through `reader` if it was released
    pub(crate) fn child_page(
        &self,
        index: usize,
        reader: &dyn PageReader<K, V>,
    ) -> Result<Arc<Page<K, V>>> {
        let child = self.children().get(index).ok_or_else(|| {
            AtlasError::internal(format!(
                "Child {} out of range in page with {} children",
                index,
                self.child_count()
            ))
        })?;
        match child.page.load_full() {
            Some(page) => Ok(page),
            None => reader.read_page(child.pos.load(Ordering::Acquire)),
        }
    }

    // -------------------------------------------------------------------------
    // Copy-on-Write Operations
    // -------------------------------------------------------------------------

    pub(crate) fn set_value(&self, index: usize, value: V::Item) -> Self {
        let mut values = self.values().to_vec();
        values[index] = value;
        Self::create_leaf(self.map_id, self.keys.clone(), values)
    }

    pub(crate) fn set_key(&self, index: usize, key: K::Item) -> Self {
        let keys = self.keys.replace(index, key);
        match &self.body {
            PageBody::Leaf { values } => Self::create_leaf(self.map_id, keys, values.clone()),
            PageBody::Node { children, .. } => {
                Self::create_node(self.map_id, keys, children.clone())
            }
        }
    }

    pub(crate) fn insert_leaf(&self, index: usize, key: K::Item, value: V::Item) -> Self {
        let mut values = V::create_storage(self.key_count() + 1);
        values.extend_from_slice(&self.values()[..index]);
        values.push(value);
        values.extend_from_slice(&self.values()[index..]);
        Self::create_leaf(self.map_id, self.keys.insert(index, key), values)
    }

    /// Insert `key` at `index` with `child` as the child at `index`
    pub(crate) fn insert_node(&self, index: usize, key: K::Item, child: Arc<Page<K, V>>) -> Self {
        let mut children = self.children().to_vec();
        children.insert(index, PageReference::new(child));
        Self::create_node(self.map_id, self.keys.insert(index, key), children)
    }

    pub(crate) fn replace_child(&self, index: usize, child: Arc<Page<K, V>>) -> Self {
        let mut children = self.children().to_vec();
        children[index] = PageReference::new(child);
        Self::create_node(self.map_id, self.keys.clone(), children)
    }

    /// Replace child `index` by the two halves of its split around `key`
    pub(crate) fn replace_split_child(
        &self,
        index: usize,
        key: K::Item,
        left: Arc<Page<K, V>>,
        right: Arc<Page<K, V>>,
    ) -> Self {
        let mut children = self.children().to_vec();
        children[index] = PageReference::new(right);
        children.insert(index, PageReference::new(left));
        Self::create_node(self.map_id, self.keys.insert(index, key), children)
    }

    /// Remove entry `index` (leaf) or child `index` (non-leaf)
    pub(crate) fn remove(&self, index: usize) -> Self {
        match &self.body {
            PageBody::Leaf { values } => {
                let mut values = values.clone();
                values.remove(index);
                Self::create_leaf(self.map_id, self.keys.remove(index), values)
            }
            PageBody::Node { children, .. } => {
                let key_index = if index >= self.key_count() {
                    index - 1
                } else {
                    index
                };
                let mut children = children.clone();
                children.remove(index);
                Self::create_node(self.map_id, self.keys.remove(key_index), children)
            }
        }
    }

    /// Split around `at`: returns `(left, key, right)`
    ///
    /// For a leaf, `key` is the first key of `right`. For a non-leaf, `key` is
    /// removed from both halves and moves up to the parent.
    pub(crate) fn split(&self, at: usize) -> (Self, K::Item, Self) {
        let key = self.keys.get(at).clone();
        match &self.body {
            PageBody::Leaf { values } => {
                let (left_keys, right_keys) = self.keys.split_off(at);
                let left = Self::create_leaf(self.map_id, left_keys, values[..at].to_vec());
                let right = Self::create_leaf(self.map_id, right_keys, values[at..].to_vec());
                (left, key, right)
            }
            PageBody::Node { children, .. } => {
                let (left_keys, rest) = self.keys.split_off(at);
                let (_, right_keys) = rest.split_off(1);
                let left = Self::create_node(self.map_id, left_keys, children[..=at].to_vec());
                let right =
                    Self::create_node(self.map_id, right_keys, children[at + 1..].to_vec());
                (left, key, right)
            }
        }
    }

    /// Append a batch of entries to a leaf
    pub(crate) fn expand(&self, keys: &[K::Item], values: &[V::Item]) -> Self {
        let mut all = V::create_storage(self.key_count() + values.len());
        all.extend_from_slice(self.values());
        all.extend_from_slice(values);
        Self::create_leaf(self.map_id, self.keys.expand(keys), all)
    }

    // -------------------------------------------------------------------------
    // Removal Accounting
    // -------------------------------------------------------------------------

    /// Mark this page as no longer part of the current tree
    ///
    /// Returns the change in unsaved memory. A saved page is pushed to
    /// `removed` for chunk accounting instead.
    pub(crate) fn remove_page(
        &self,
        version: u64,
        pinned: bool,
        removed: &mut Vec<RemovedPageInfo>,
    ) -> i64 {
        if self.total_count() == 0 {
            return 0;
        }
        match self
            .pos
            .compare_exchange(UNSAVED, REMOVED_UNSAVED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => -(self.memory as i64),
            Err(pos) => {
                if page_info::is_saved(pos) {
                    removed.push(RemovedPageInfo {
                        pos,
                        page_no: self.page_no(),
                        version,
                        pinned,
                    });
                }
                0
            }
        }
    }

    /// Remove this page and its whole subtree
    pub(crate) fn remove_all_recursive(
        &self,
        version: u64,
        pinned: bool,
        reader: &dyn PageReader<K, V>,
        removed: &mut Vec<RemovedPageInfo>,
    ) -> Result<i64> {
        let mut unsaved = self.remove_page(version, pinned, removed);
        for child in self.children() {
            match child.page.load_full() {
                Some(page) => {
                    unsaved += page.remove_all_recursive(version, pinned, reader, removed)?;
                }
                None => {
                    let pos = child.pos.load(Ordering::Acquire);
                    if page_info::is_leaf(pos) {
                        removed.push(RemovedPageInfo {
                            pos,
                            page_no: None,
                            version,
                            pinned,
                        });
                    } else {
                        let page = reader.read_page(pos)?;
                        unsaved += page.remove_all_recursive(version, pinned, reader, removed)?;
                    }
                }
            }
        }
        Ok(unsaved)
    }

    /// Release loaded children that are saved, so they can be garbage collected
    pub(crate) fn release_saved_pages(&self) {
        for child in self.children() {
            child.clear_page_reference();
        }
    }

    pub(crate) fn set_saved(&self, pos: u64, page_no: u32) -> bool {
        self.page_no.store(page_no, Ordering::Release);
        self.pos
            .compare_exchange(UNSAVED, pos, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_loaded(&self, pos: u64, page_no: u32) {
        self.page_no.store(page_no, Ordering::Release);
        self.pos.store(pos, Ordering::Release);
    }

    pub(crate) fn body(&self) -> &PageBody<K, V> {
        &self.body
    }
}

impl<K: KeyType, V: DataType> fmt::Debug for Page<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct(if self.is_leaf() { "Leaf" } else { "Node" });
        d.field("map_id", &self.map_id)
            .field("pos", &self.pos())
            .field("keys", &self.keys);
        match &self.body {
            PageBody::Leaf { values } => d.field("values", values),
            PageBody::Node {
                children,
                total_count,
            } => d.field("children", children).field("total_count", total_count),
        };
        d.finish()
    }
}
