//! Map Module
//!
//! A persistent, multi-version sorted map over copy-on-write B-tree pages.
//!
//! ## Responsibilities
//! - Point reads, ordered queries and cursors on a root snapshot
//! - Writes through `operate`: descend, decide, rebuild the path, publish
//! - Single-writer append buffers
//! - Version bookkeeping for commit, rollback and old-version snapshots
//!
//! ## Write Path
//! ```text
//!   operate(key, value, decision)
//!        │
//!        ▼
//!   ┌──────────────┐  root changed   ┌───────────┐
//!   │ traverse_down│ ──────────────► │  retry    │
//!   └──────┬───────┘                 └───────────┘
//!          ▼
//!   ┌──────────────┐  Abort / Repeat
//!   │   decide     │ ──────────────► return / retry
//!   └──────┬───────┘
//!          ▼
//!   ┌──────────────┐
//!   │ copy leaf,   │  split upwards on PUT, collapse upwards on REMOVE
//!   │ rebuild path │
//!   └──────┬───────┘
//!          ▼
//!   ┌──────────────┐  CAS lost       ┌───────────┐
//!   │ publish root │ ──────────────► │  retry    │
//!   └──────┬───────┘                 └───────────┘
//!          ▼
//!   old path pages are accounted as removed
//! ```
//! The first attempts are optimistic compare-and-swaps. From the fourth
//! attempt on (or when another writer holds it) the root lock is taken.

pub mod decision;
pub mod root_reference;

use std::any::Any;
use std::cmp::Ordering as KeyOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::Config;
use crate::cursor::{self, Cursor, CursorPos};
use crate::error::{AtlasError, ErrorCode, Result};
use crate::page::{ChunkWriter, KeyManager, Page, PageReader, PageReference, RemovedPageInfo};
use crate::store::StoreCore;
use crate::types::{DataType, KeyType};

pub use decision::{
    Decision, DecisionMaker, DefaultDecision, Equals, IfAbsent, IfPresent, PutDecision,
    RemoveDecision,
};
pub(crate) use decision::Rewrite;
pub use root_reference::RootReference;

// =============================================================================
// Store-Facing Handles
// =============================================================================

/// A root page with its key and value types erased, ready to be written
pub(crate) trait TreeRoot: Send {
    fn map_id(&self) -> u32;
    fn total_count(&self) -> u64;
    fn is_saved(&self) -> bool;
    fn is_leaf(&self) -> bool;
    fn pos(&self) -> u64;
    /// Write the unsaved part of the tree, returning the root position
    fn write_unsaved(&self, writer: &mut ChunkWriter<'_>) -> Result<u64>;
    fn release_saved_pages(&self);
}

struct SavedRoot<K: KeyType, V: DataType> {
    page: Arc<Page<K, V>>,
    pinned: bool,
}

impl<K: KeyType, V: DataType> TreeRoot for SavedRoot<K, V> {
    fn map_id(&self) -> u32 {
        self.page.map_id()
    }

    fn total_count(&self) -> u64 {
        self.page.total_count()
    }

    fn is_saved(&self) -> bool {
        self.page.is_saved()
    }

    fn is_leaf(&self) -> bool {
        self.page.is_leaf()
    }

    fn pos(&self) -> u64 {
        self.page.pos()
    }

    fn write_unsaved(&self, writer: &mut ChunkWriter<'_>) -> Result<u64> {
        self.page.write_unsaved_recursive(writer, self.pinned)
    }

    fn release_saved_pages(&self) {
        self.page.release_saved_pages();
    }
}

/// What the store needs from a map, independent of its key and value types
pub(crate) trait MapHandle: Send + Sync {
    fn id(&self) -> u32;
    fn create_version(&self) -> u64;
    fn is_closed(&self) -> bool;
    fn close(&self);
    fn is_single_writer(&self) -> bool;
    fn is_root_locked_by_current_thread(&self) -> bool;
    fn total_count(&self) -> u64;
    fn has_changes_since(&self, version: u64) -> bool;
    /// Move to `version`; `None` once a closed map can be dropped for good
    fn set_write_version(&self, version: u64) -> Result<Option<Box<dyn TreeRoot>>>;
    fn rewrite_page(&self, pos: u64) -> Result<bool>;
    /// Remove every entry, accounting the old pages as removed
    fn clear_all(&self) -> Result<()>;
    fn rollback_root(&self, version: u64) -> Result<bool>;
    fn set_root_page_info(&self, pos: u64, version: u64) -> Result<()>;
    fn type_names(&self) -> (&'static str, &'static str);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// =============================================================================
// Map Core
// =============================================================================

/// Page shape limits, taken from the store configuration
#[derive(Debug, Clone, Copy)]
pub(crate) struct MapSettings {
    pub keys_per_page: usize,
    pub leaf_split_size: usize,
    pub non_leaf_split_size: usize,
}

impl MapSettings {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            keys_per_page: config.keys_per_page,
            leaf_split_size: config.leaf_split_size(),
            non_leaf_split_size: config.non_leaf_split_size(),
        }
    }
}

struct AppendBuffer<K: KeyType, V: DataType> {
    keys: Vec<K::Item>,
    values: Vec<V::Item>,
}

enum Step<T> {
    Retry,
    Done(T),
}

pub(crate) struct MapCore<K: KeyType, V: DataType> {
    id: u32,
    store: Weak<StoreCore>,
    root: ArcSwap<RootReference<K, V>>,
    create_version: u64,
    settings: MapSettings,
    single_writer: bool,
    read_only: bool,
    closed: AtomicBool,
    /// Valid up to the root's append counter; guarded by the root lock
    append_buffer: Mutex<AppendBuffer<K, V>>,
    notification_requested: AtomicBool,
    wait_lock: Mutex<()>,
    wait_signal: Condvar,
}

impl<K: KeyType, V: DataType> MapCore<K, V> {
    pub(crate) fn new(
        store: Weak<StoreCore>,
        id: u32,
        create_version: u64,
        settings: MapSettings,
        single_writer: bool,
        read_only: bool,
    ) -> Self {
        Self {
            id,
            store,
            root: ArcSwap::from_pointee(RootReference::new(
                Page::create_empty_leaf(id),
                create_version,
            )),
            create_version,
            settings,
            single_writer,
            read_only,
            closed: AtomicBool::new(false),
            append_buffer: Mutex::new(AppendBuffer {
                keys: Vec::new(),
                values: Vec::new(),
            }),
            notification_requested: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            wait_signal: Condvar::new(),
        }
    }

    /// Read-only view of `root`, labeled `version`
    fn snapshot(&self, root: Arc<Page<K, V>>, version: u64) -> Self {
        let map = Self::new(
            self.store.clone(),
            self.id,
            self.create_version,
            self.settings,
            false,
            true,
        );
        map.set_initial_root(root, version);
        map
    }

    pub(crate) fn store(&self) -> Result<Arc<StoreCore>> {
        self.store
            .upgrade()
            .ok_or_else(|| AtlasError::store(ErrorCode::Closed, "This store is closed"))
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn is_single_writer(&self) -> bool {
        self.single_writer
    }

    /// The published root reference, append buffer not flushed
    pub(crate) fn root_reference(&self) -> Arc<RootReference<K, V>> {
        self.root.load_full()
    }

    fn is_current(&self, root_ref: &Arc<RootReference<K, V>>) -> bool {
        Arc::ptr_eq(&*self.root.load(), root_ref)
    }

    pub(crate) fn flush_and_get_root(&self) -> Result<Arc<RootReference<K, V>>> {
        let root_ref = self.root.load_full();
        if self.single_writer && root_ref.append_counter() > 0 {
            return self.flush_append_buffer(root_ref, true);
        }
        Ok(root_ref)
    }

    pub(crate) fn root_page(&self) -> Result<Arc<Page<K, V>>> {
        Ok(self.flush_and_get_root()?.root.clone())
    }

    pub(crate) fn set_initial_root(&self, root: Arc<Page<K, V>>, version: u64) {
        self.root.store(Arc::new(RootReference::new(root, version)));
    }

    fn check_writable(&self) -> Result<Arc<StoreCore>> {
        let store = self.store()?;
        // a closed store reports CLOSED, whatever happened to the map
        store.check_open()?;
        if self.read_only {
            return Err(AtlasError::IllegalState("This map is read-only".into()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(AtlasError::IllegalState(format!("Map {} is closed", self.id)));
        }
        Ok(store)
    }

    fn needs_split(&self, page: &Page<K, V>) -> bool {
        let key_count = page.key_count();
        if key_count > self.settings.keys_per_page {
            return true;
        }
        if page.is_leaf() {
            key_count > 1 && page.memory() > self.settings.leaf_split_size
        } else {
            key_count > 2 && page.memory() > self.settings.non_leaf_split_size
        }
    }

    // -------------------------------------------------------------------------
    // Root Lock
    // -------------------------------------------------------------------------

    fn lock_root(&self, mut root_ref: Arc<RootReference<K, V>>, mut attempt: u32) -> Arc<RootReference<K, V>> {
        loop {
            if let Some(locked) = self.try_lock(&root_ref, attempt) {
                return locked;
            }
            attempt += 1;
            root_ref = self.root.load_full();
        }
    }

    /// One locking attempt, backing off according to the attempt number
    fn try_lock(&self, root_ref: &Arc<RootReference<K, V>>, attempt: u32) -> Option<Arc<RootReference<K, V>>> {
        if let Some(locked) = RootReference::try_lock(&self.root, root_ref, attempt) {
            return Some(locked);
        }
        let contention = match root_ref.previous() {
            Some(old) => {
                let attempts = root_ref
                    .update_attempt_counter()
                    .saturating_sub(old.update_attempt_counter());
                let updates = root_ref.update_counter().saturating_sub(old.update_counter());
                1 + (attempts + 1) / (updates + 1)
            }
            None => 1,
        };
        if attempt > 4 {
            if attempt <= 12 {
                thread::yield_now();
            } else if (attempt as i64) <= 70 - 2 * contention as i64 {
                thread::sleep(Duration::from_micros(contention));
            } else {
                let mut guard = self.wait_lock.lock();
                self.notification_requested.store(true, Ordering::Release);
                self.wait_signal.wait_for(&mut guard, Duration::from_millis(5));
            }
        }
        None
    }

    /// Release the root lock, optionally replacing the root page and the
    /// append counter
    fn unlock_root(
        &self,
        new_root: Option<Arc<Page<K, V>>>,
        append_counter: Option<usize>,
    ) -> Arc<RootReference<K, V>> {
        loop {
            let current = self.root.load_full();
            let page = new_root.clone().unwrap_or_else(|| current.root.clone());
            let counter = append_counter.unwrap_or(current.append_counter());
            if let Some(updated) =
                RootReference::update_page_and_locked_status(&self.root, &current, page, false, counter)
            {
                self.notify_waiters();
                return updated;
            }
        }
    }

    fn notify_waiters(&self) {
        if self.notification_requested.load(Ordering::Acquire) {
            let _guard = self.wait_lock.lock();
            self.notification_requested.store(false, Ordering::Release);
            self.wait_signal.notify_one();
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub(crate) fn get(&self, key: &K::Item) -> Result<Option<V::Item>> {
        let root = self.root_page()?;
        self.get_in(&root, key)
    }

    fn get_in(&self, root: &Arc<Page<K, V>>, key: &K::Item) -> Result<Option<V::Item>> {
        let mut page = root.clone();
        loop {
            let found = page.search(key);
            if page.is_leaf() {
                return Ok(found.ok().and_then(|i| page.value(i).cloned()));
            }
            let index = match found {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            page = page.child_page(index, self)?;
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.root.load().total_count()
    }

    pub(crate) fn first_last(&self, first: bool) -> Result<Option<K::Item>> {
        let root = self.root_page()?;
        self.first_last_in(&root, first)
    }

    fn first_last_in(&self, root: &Arc<Page<K, V>>, first: bool) -> Result<Option<K::Item>> {
        if root.total_count() == 0 {
            return Ok(None);
        }
        let mut page = root.clone();
        loop {
            if page.is_leaf() {
                if page.key_count() == 0 {
                    return Ok(None);
                }
                let index = if first { 0 } else { page.key_count() - 1 };
                return Ok(Some(page.key(index).clone()));
            }
            let index = if first { 0 } else { page.child_count() - 1 };
            page = page.child_page(index, self)?;
        }
    }

    /// Nearest key below (`min`) or above `key`, optionally excluding `key`
    pub(crate) fn min_max(&self, key: &K::Item, min: bool, excluding: bool) -> Result<Option<K::Item>> {
        let root = self.root_page()?;
        self.min_max_in(&root, key, min, excluding)
    }

    fn min_max_in(
        &self,
        page: &Arc<Page<K, V>>,
        key: &K::Item,
        min: bool,
        excluding: bool,
    ) -> Result<Option<K::Item>> {
        let found = page.search(key);
        if page.is_leaf() {
            let x = match found {
                Ok(i) if excluding => i as isize + if min { -1 } else { 1 },
                Ok(i) => i as isize,
                Err(i) => i as isize - if min { 1 } else { 0 },
            };
            if x < 0 || x as usize >= page.key_count() {
                return Ok(None);
            }
            return Ok(Some(page.key(x as usize).clone()));
        }
        let mut x = match found {
            Ok(i) => i as isize + 1,
            Err(i) => i as isize,
        };
        loop {
            if x < 0 || x as usize >= page.child_count() {
                return Ok(None);
            }
            let child = page.child_page(x as usize, self)?;
            if let Some(k) = self.min_max_in(&child, key, min, excluding)? {
                return Ok(Some(k));
            }
            x += if min { -1 } else { 1 };
        }
    }

    pub(crate) fn key_at(&self, index: i64) -> Result<Option<K::Item>> {
        let root = self.root_page()?;
        cursor::key_at(&root, index, self)
    }

    pub(crate) fn key_index(&self, key: &K::Item) -> Result<i64> {
        let root = self.root_page()?;
        cursor::key_index(&root, key, self)
    }

    // -------------------------------------------------------------------------
    // Operate
    // -------------------------------------------------------------------------

    /// Apply `decision_maker` to `key`, returning the value stored before
    pub(crate) fn operate(
        &self,
        key: K::Item,
        value: Option<V::Item>,
        decision_maker: &mut dyn DecisionMaker<K, V>,
    ) -> Result<Option<V::Item>> {
        let store = self.check_writable()?;
        let mut attempt: u32 = 0;
        loop {
            let mut root_ref = self.flush_and_get_root()?;
            let mut locked = root_ref.is_locked_by_current_thread();
            if !locked {
                if attempt == 0 {
                    store.before_write(self)?;
                }
                attempt += 1;
                if attempt > 3 || root_ref.is_locked() {
                    root_ref = self.lock_root(root_ref, attempt);
                    locked = true;
                }
            }

            let mut new_root = None;
            let outcome = self.operate_once(
                &store,
                &root_ref,
                locked,
                attempt,
                &key,
                &value,
                decision_maker,
                &mut new_root,
            );
            if locked {
                self.unlock_root(new_root, None);
            }
            match outcome? {
                Step::Retry => decision_maker.reset(),
                Step::Done(result) => return Ok(result),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn operate_once(
        &self,
        store: &StoreCore,
        root_ref: &Arc<RootReference<K, V>>,
        locked: bool,
        attempt: u32,
        key: &K::Item,
        value: &Option<V::Item>,
        decision_maker: &mut dyn DecisionMaker<K, V>,
        new_root: &mut Option<Arc<Page<K, V>>>,
    ) -> Result<Step<Option<V::Item>>> {
        let path = cursor::traverse_down(&root_ref.root, key, self)?;
        if !locked && !self.is_current(root_ref) {
            return Ok(Step::Retry);
        }
        let leaf_at = path.len() - 1;
        let tip = &path[leaf_at];
        let index = tip.index;
        let existing = if index < 0 {
            None
        } else {
            tip.page.value(index as usize).cloned()
        };

        let mut unsaved: i64 = 0;
        // frames above `depth` are the ancestors of `page`
        let mut depth = leaf_at;
        let page = match decision_maker.decide_on_path(existing.as_ref(), value.as_ref(), &path) {
            Decision::Repeat => return Ok(Step::Retry),
            Decision::Abort => {
                if !locked && !self.is_current(root_ref) {
                    return Ok(Step::Retry);
                }
                return Ok(Step::Done(existing));
            }
            Decision::Remove => {
                if index < 0 {
                    if !locked && !self.is_current(root_ref) {
                        return Ok(Step::Retry);
                    }
                    return Ok(Step::Done(None));
                }
                let mut page = tip.page.clone();
                let mut at = index as usize;
                let mut collapsed = None;
                if page.total_count() == 1 && depth > 0 {
                    let mut key_count;
                    loop {
                        depth -= 1;
                        page = path[depth].page.clone();
                        at = path[depth].index as usize;
                        key_count = page.key_count();
                        if key_count != 0 || depth == 0 {
                            break;
                        }
                    }
                    if key_count <= 1 {
                        collapsed = Some(if key_count == 1 {
                            page.child_page(1 - at, self)?
                        } else {
                            Page::create_empty_leaf(self.id)
                        });
                    }
                }
                match collapsed {
                    Some(sibling) => sibling,
                    None => Arc::new(page.remove(at)),
                }
            }
            Decision::Put => {
                let value = decision_maker
                    .select_value(existing.as_ref(), value.clone())
                    .ok_or_else(|| AtlasError::IllegalArgument("Put decision without a value".into()))?;
                if index >= 0 {
                    Arc::new(tip.page.set_value(index as usize, value))
                } else {
                    let mut page = Arc::new(tip.page.insert_leaf((-index - 1) as usize, key.clone(), value));
                    while self.needs_split(&page) {
                        let at = page.key_count() >> 1;
                        let (left, split_key, right) = page.split(at);
                        let (left, right) = (Arc::new(left), Arc::new(right));
                        unsaved += (left.memory() + right.memory()) as i64;
                        if depth == 0 {
                            page = Arc::new(Page::create_node(
                                self.id,
                                KeyManager::new(vec![split_key]),
                                vec![PageReference::new(left), PageReference::new(right)],
                            ));
                            break;
                        }
                        depth -= 1;
                        let parent = &path[depth];
                        page = Arc::new(parent.page.replace_split_child(
                            parent.index as usize,
                            split_key,
                            left,
                            right,
                        ));
                    }
                    page
                }
            }
        };

        let root_page = Self::replace_page(&path[..depth], page, &mut unsaved);
        if locked {
            *new_root = Some(root_page);
        } else if RootReference::update_root_page(&self.root, root_ref, root_page, attempt).is_none() {
            return Ok(Step::Retry);
        }
        let (released, removed) = self.process_removal_info(&path, root_ref.version);
        store.account_for_removed_pages(removed);
        store.register_unsaved_memory(unsaved + released);
        Ok(Step::Done(existing))
    }

    /// Rebuild the ancestors in `path` around `replacement`
    fn replace_page(
        path: &[CursorPos<K, V>],
        replacement: Arc<Page<K, V>>,
        unsaved: &mut i64,
    ) -> Arc<Page<K, V>> {
        let mut memory = if replacement.is_saved() {
            0
        } else {
            replacement.memory() as i64
        };
        let mut replacement = replacement;
        for frame in path.iter().rev() {
            // a node without keys has a single child and is dropped
            if frame.page.key_count() > 0 {
                replacement = Arc::new(frame.page.replace_child(frame.index as usize, replacement));
                memory += replacement.memory() as i64;
            }
        }
        *unsaved += memory;
        replacement
    }

    /// Account the pages of `path` as removed from the tree
    fn process_removal_info(&self, path: &[CursorPos<K, V>], version: u64) -> (i64, Vec<RemovedPageInfo>) {
        let mut removed = Vec::new();
        let mut memory = 0;
        for frame in path {
            memory += frame.page.remove_page(version, self.single_writer, &mut removed);
        }
        (memory, removed)
    }

    pub(crate) fn put(&self, key: K::Item, value: V::Item) -> Result<Option<V::Item>> {
        self.operate(key, Some(value), &mut PutDecision)
    }

    pub(crate) fn remove(&self, key: &K::Item) -> Result<Option<V::Item>> {
        self.operate(key.clone(), None, &mut RemoveDecision)
    }

    /// Remove every entry, returning the root reference as it was before
    pub(crate) fn clear(&self) -> Result<Arc<RootReference<K, V>>> {
        let store = self.check_writable()?;
        let empty = Page::create_empty_leaf(self.id);
        let mut attempt: u32 = 0;
        loop {
            let mut root_ref = self.flush_and_get_root()?;
            if root_ref.total_count() == 0 {
                return Ok(root_ref);
            }
            let mut locked = root_ref.is_locked_by_current_thread();
            if !locked {
                attempt += 1;
                if attempt == 1 {
                    store.before_write(self)?;
                } else if attempt > 3 || root_ref.is_locked() {
                    root_ref = self.lock_root(root_ref, attempt);
                    locked = true;
                }
            }
            if !locked
                && RootReference::update_root_page(&self.root, &root_ref, empty.clone(), attempt).is_none()
            {
                continue;
            }
            let mut removed = Vec::new();
            let released =
                root_ref
                    .root
                    .remove_all_recursive(root_ref.version, self.single_writer, self, &mut removed);
            if locked {
                let replacement = if released.is_ok() { Some(empty.clone()) } else { None };
                self.unlock_root(replacement, None);
            }
            store.account_for_removed_pages(removed);
            store.register_unsaved_memory(released?);
            return Ok(root_ref);
        }
    }

    // -------------------------------------------------------------------------
    // Append Buffer
    // -------------------------------------------------------------------------

    /// Append `key`, which must be above every key in the map
    pub(crate) fn append(&self, key: K::Item, value: V::Item) -> Result<()> {
        if !self.single_writer {
            self.put(key, value)?;
            return Ok(());
        }
        let store = self.check_writable()?;
        store.before_write(self)?;
        let root_ref = self.lock_root(self.root.load_full(), 1);
        match self.append_locked(root_ref, key, value) {
            Ok(counter) => {
                self.unlock_root(None, Some(counter));
                Ok(())
            }
            Err(e) => {
                self.unlock_root(None, None);
                Err(e)
            }
        }
    }

    fn append_locked(&self, mut root_ref: Arc<RootReference<K, V>>, key: K::Item, value: V::Item) -> Result<usize> {
        if root_ref.append_counter() >= self.settings.keys_per_page {
            root_ref = self.flush_append_buffer(root_ref, false)?;
        }
        let counter = root_ref.append_counter();
        let last = if counter > 0 {
            self.append_buffer.lock().keys.get(counter - 1).cloned()
        } else {
            self.first_last_in(&root_ref.root, false)?
        };
        if let Some(last) = last {
            if K::compare(&key, &last) != KeyOrdering::Greater {
                return Err(AtlasError::IllegalArgument(format!(
                    "Appended key {:?} is not above the last key {:?}",
                    key, last
                )));
            }
        }
        let mut buffer = self.append_buffer.lock();
        buffer.keys.truncate(counter);
        buffer.values.truncate(counter);
        buffer.keys.push(key);
        buffer.values.push(value);
        Ok(counter + 1)
    }

    /// Move buffered entries into the tree until at most the threshold remains
    fn flush_append_buffer(
        &self,
        mut root_ref: Arc<RootReference<K, V>>,
        full_flush: bool,
    ) -> Result<Arc<RootReference<K, V>>> {
        let pre_locked = root_ref.is_locked_by_current_thread();
        let mut locked = pre_locked;
        let threshold = if full_flush {
            0
        } else {
            self.settings.keys_per_page.saturating_sub(1)
        };
        let mut attempt = 0;
        let mut outcome = Ok(());
        while root_ref.append_counter() > threshold {
            if !locked {
                attempt += 1;
                match self.try_lock(&root_ref, attempt) {
                    Some(r) => {
                        root_ref = r;
                        locked = true;
                    }
                    None => {
                        root_ref = self.root.load_full();
                        continue;
                    }
                }
            }
            match self.flush_locked(&root_ref, full_flush) {
                Ok(Some(updated)) => {
                    root_ref = updated;
                    break;
                }
                Ok(None) => root_ref = self.root.load_full(),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        if locked && !pre_locked {
            root_ref = self.unlock_root(None, None);
        }
        outcome.map(|_| root_ref)
    }

    /// One flush step with the root lock held; `None` if the root moved
    fn flush_locked(
        &self,
        root_ref: &Arc<RootReference<K, V>>,
        full_flush: bool,
    ) -> Result<Option<Arc<RootReference<K, V>>>> {
        let store = self.store()?;
        let keys_per_page = self.settings.keys_per_page;
        let buffered = root_ref.append_counter();
        let (keys, values) = {
            let buffer = self.append_buffer.lock();
            if buffer.keys.len() < buffered || buffer.values.len() < buffered {
                return Err(AtlasError::internal(format!(
                    "Append buffer of map {} holds fewer than {} entries",
                    self.id, buffered
                )));
            }
            (buffer.keys[..buffered].to_vec(), buffer.values[..buffered].to_vec())
        };

        let path = cursor::spine(&root_ref.root, true, self)?;
        let leaf_at = path.len() - 1;
        let mut depth = leaf_at;
        let mut page = path[leaf_at].page.clone();
        // frames whose pages leave the tree: path[..removed_until]
        let mut removed_until = path.len();
        let mut remaining = 0;
        let mut consumed = buffered;
        let mut new_leaf: Option<Arc<Page<K, V>>> = None;

        let available = keys_per_page.saturating_sub(page.key_count());
        if available > 0 {
            if buffered <= available {
                page = Arc::new(page.expand(&keys, &values));
            } else {
                page = Arc::new(page.expand(&keys[..available], &values[..available]));
                if full_flush {
                    new_leaf = Some(Arc::new(Page::create_leaf(
                        self.id,
                        KeyManager::new(keys[available..].to_vec()),
                        values[available..].to_vec(),
                    )));
                } else {
                    consumed = available;
                    remaining = buffered - available;
                }
            }
        } else {
            // the full rightmost leaf stays as it is
            removed_until = leaf_at;
            new_leaf = Some(Arc::new(Page::create_leaf(
                self.id,
                KeyManager::new(keys),
                values,
            )));
        }

        let mut unsaved: i64 = 0;
        if let Some(mut right) = new_leaf {
            let mut key = right.key(0).clone();
            unsaved += right.memory() as i64;
            loop {
                if depth == 0 {
                    if page.key_count() == 0 {
                        page = right;
                    } else {
                        unsaved += page.memory() as i64;
                        page = Arc::new(Page::create_node(
                            self.id,
                            KeyManager::new(vec![key]),
                            vec![PageReference::new(page), PageReference::new(right)],
                        ));
                    }
                    break;
                }
                depth -= 1;
                let frame = &path[depth];
                page = Arc::new(frame.page.replace_split_child(frame.index as usize, key, page, right));
                let key_count = page.key_count();
                let at = key_count as isize - 2;
                if key_count <= keys_per_page
                    && (page.memory() < self.settings.non_leaf_split_size || at <= 0)
                {
                    break;
                }
                let (left, split_key, split_right) = page.split(at as usize);
                key = split_key;
                page = Arc::new(left);
                right = Arc::new(split_right);
                unsaved += (page.memory() + right.memory()) as i64;
            }
        }

        let root_page = Self::replace_page(&path[..depth], page, &mut unsaved);
        let Some(updated) = RootReference::update_page_and_locked_status(
            &self.root,
            root_ref,
            root_page,
            true,
            remaining,
        ) else {
            return Ok(None);
        };
        if remaining > 0 {
            let mut buffer = self.append_buffer.lock();
            buffer.keys.truncate(buffered);
            buffer.values.truncate(buffered);
            buffer.keys.drain(..consumed);
            buffer.values.drain(..consumed);
        }
        let (released, removed) = self.process_removal_info(&path[..removed_until], root_ref.version);
        store.account_for_removed_pages(removed);
        store.register_unsaved_memory(unsaved + released);
        debug!(map_id = self.id, flushed = consumed, remaining, "Flushed append buffer");
        Ok(Some(updated))
    }

    /// Remove the last entry, taking it from the append buffer if possible
    pub(crate) fn trim_last(&self) -> Result<()> {
        self.check_writable()?;
        let root_ref = self.root.load_full();
        let mut use_regular_remove = root_ref.append_counter() == 0;
        if !use_regular_remove {
            let locked = self.lock_root(root_ref, 1);
            let mut counter = locked.append_counter();
            use_regular_remove = counter == 0;
            if !use_regular_remove {
                counter -= 1;
            }
            self.unlock_root(None, Some(counter));
        }
        if use_regular_remove {
            let root = self.root.load_full().root.clone();
            if let Some(last) = self.first_last_in(&root, false)? {
                self.remove(&last)?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Versions
    // -------------------------------------------------------------------------

    /// Publish the current root under `version`
    ///
    /// Returns `None` when the map is closed and no longer in use, after
    /// dropping its root from the layout.
    pub(crate) fn set_write_version(&self, version: u64) -> Result<Option<Arc<RootReference<K, V>>>> {
        let store = self.store()?;
        let mut attempt: u32 = 0;
        loop {
            let mut root_ref = self.flush_and_get_root()?;
            if root_ref.version >= version {
                return Ok(Some(root_ref));
            }
            if self.closed.load(Ordering::Acquire)
                && root_ref.version + 1 < store.oldest_version_to_keep()
            {
                store.deregister_map_root(self.id)?;
                return Ok(None);
            }

            let mut locked = false;
            attempt += 1;
            if attempt > 3 || root_ref.is_locked() {
                self.lock_root(root_ref, attempt);
                locked = true;
                root_ref = match self.flush_and_get_root() {
                    Ok(r) => r,
                    Err(e) => {
                        self.unlock_root(None, None);
                        return Err(e);
                    }
                };
            }
            match RootReference::try_unlock_and_update_version(&self.root, &root_ref, version, attempt) {
                Some(updated) => {
                    if locked {
                        self.notify_waiters();
                    }
                    updated.remove_unused_old_versions(store.oldest_version_to_keep());
                    return Ok(Some(updated));
                }
                None => {
                    if locked {
                        self.unlock_root(None, None);
                    }
                }
            }
        }
    }

    /// Load the root stored at `pos` (0: empty) as the root of `version`
    pub(crate) fn set_root_page_info(&self, pos: u64, version: u64) -> Result<()> {
        let store = self.store()?;
        let root = if crate::codec::page_info::is_saved(pos) {
            store.read_page::<K, V>(self.id, pos)?
        } else {
            Page::create_empty_leaf(self.id)
        };
        self.set_initial_root(root, version);
        self.set_write_version(store.current_version())?;
        Ok(())
    }

    /// Drop the roots of `version` and newer
    ///
    /// Returns `false` if the chain ran out before reaching an older root.
    pub(crate) fn rollback_root(&self, version: u64) -> Result<bool> {
        let mut root_ref = self.flush_and_get_root()?;
        while root_ref.version >= version {
            let Some(previous) = root_ref.previous() else {
                break;
            };
            let seen = self.root.compare_and_swap(&root_ref, previous.clone());
            if Arc::ptr_eq(&*seen, &root_ref) {
                root_ref = previous;
                self.closed.store(false, Ordering::Release);
            } else {
                root_ref = self.root.load_full();
            }
        }
        self.set_write_version(version)?;
        Ok(root_ref.version < version)
    }

    /// Read-only view of the map as of `version`
    pub(crate) fn open_version(&self, version: u64) -> Result<MapCore<K, V>> {
        let store = self.store()?;
        if version < self.create_version {
            return Err(AtlasError::IllegalArgument(format!(
                "Unknown version {}; map {} was created at version {}",
                version, self.id, self.create_version
            )));
        }
        let oldest = store.oldest_version_to_keep();
        let head = self.flush_and_get_root()?;
        head.remove_unused_old_versions(oldest);
        let mut root_ref = head;
        while root_ref.version > version {
            match root_ref.previous() {
                Some(previous) => root_ref = previous,
                None => break,
            }
        }
        let root = if root_ref.version <= version {
            root_ref.root.clone()
        } else {
            if version < oldest {
                return Err(AtlasError::IllegalArgument(format!("Unknown version {}", version)));
            }
            match store.root_pos_at_version(self.id, version)? {
                Some(pos) => store.read_page::<K, V>(self.id, pos)?,
                None => Page::create_empty_leaf(self.id),
            }
        };
        Ok(self.snapshot(root, version))
    }

    /// Rewrite the entries of the page at `pos`, if still part of the tree
    ///
    /// Returns `false` only if the page could not be rewritten.
    pub(crate) fn rewrite_page(&self, pos: u64) -> Result<bool> {
        let store = self.store()?;
        let page = store.read_page::<K, V>(self.id, pos)?;
        if page.key_count() == 0 {
            return Ok(true);
        }
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let mut rewrite = Rewrite::new(page.pos());
        self.operate(page.key(0).clone(), None, &mut rewrite)?;
        Ok(rewrite.decision() != Some(Decision::Abort))
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Check ordering and subtree counts; returns the number of entries
    pub(crate) fn validate_tree(&self) -> Result<u64> {
        let root = self.root_page()?;
        self.validate_page(&root, None, None)
    }

    fn validate_page(
        &self,
        page: &Arc<Page<K, V>>,
        lower: Option<&K::Item>,
        upper: Option<&K::Item>,
    ) -> Result<u64> {
        let keys = page.keys().as_slice();
        let invalid = |what: String| AtlasError::internal(format!("Map {}: {}", self.id, what));
        if !K::is_sorted_unique(keys) {
            return Err(invalid(format!("keys out of order in page {}", page.pos())));
        }
        if let (Some(lower), Some(first)) = (lower, keys.first()) {
            if K::compare(first, lower) == KeyOrdering::Less {
                return Err(invalid(format!("key {:?} below its subtree bound", first)));
            }
        }
        if let (Some(upper), Some(last)) = (upper, keys.last()) {
            if K::compare(last, upper) != KeyOrdering::Less {
                return Err(invalid(format!("key {:?} above its subtree bound", last)));
            }
        }
        if page.is_leaf() {
            if page.values().len() != keys.len() {
                return Err(invalid("leaf with mismatched values".into()));
            }
            return Ok(keys.len() as u64);
        }
        if page.child_count() != keys.len() + 1 {
            return Err(invalid(format!(
                "node with {} keys and {} children",
                keys.len(),
                page.child_count()
            )));
        }
        let mut total = 0;
        for i in 0..page.child_count() {
            let child = page.child_page(i, self)?;
            let child_lower = if i == 0 { lower } else { keys.get(i - 1) };
            let child_upper = if i < keys.len() { keys.get(i) } else { upper };
            let count = self.validate_page(&child, child_lower, child_upper)?;
            if count != page.child_entry_count(i) {
                return Err(invalid(format!(
                    "child {} counts {} entries, its parent records {}",
                    i,
                    count,
                    page.child_entry_count(i)
                )));
            }
            total += count;
        }
        if total != page.total_count() {
            return Err(invalid("node total does not match its children".into()));
        }
        Ok(total)
    }
}

impl<K: KeyType, V: DataType> PageReader<K, V> for MapCore<K, V> {
    fn read_page(&self, pos: u64) -> Result<Arc<Page<K, V>>> {
        self.store()?.read_page(self.id, pos)
    }
}

impl<K: KeyType, V: DataType> MapHandle for MapCore<K, V> {
    fn id(&self) -> u32 {
        self.id
    }

    fn create_version(&self) -> u64 {
        self.create_version
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_single_writer(&self) -> bool {
        self.single_writer
    }

    fn is_root_locked_by_current_thread(&self) -> bool {
        self.root.load().is_locked_by_current_thread()
    }

    fn total_count(&self) -> u64 {
        self.size()
    }

    fn has_changes_since(&self, version: u64) -> bool {
        self.root.load().has_changes_since(version, true)
    }

    fn set_write_version(&self, version: u64) -> Result<Option<Box<dyn TreeRoot>>> {
        Ok(MapCore::set_write_version(self, version)?.map(|root_ref| {
            Box::new(SavedRoot {
                page: root_ref.root.clone(),
                pinned: self.single_writer,
            }) as Box<dyn TreeRoot>
        }))
    }

    fn rewrite_page(&self, pos: u64) -> Result<bool> {
        MapCore::rewrite_page(self, pos)
    }

    fn clear_all(&self) -> Result<()> {
        MapCore::clear(self).map(|_| ())
    }

    fn rollback_root(&self, version: u64) -> Result<bool> {
        MapCore::rollback_root(self, version)
    }

    fn set_root_page_info(&self, pos: u64, version: u64) -> Result<()> {
        MapCore::set_root_page_info(self, pos, version)
    }

    fn type_names(&self) -> (&'static str, &'static str) {
        (std::any::type_name::<K>(), std::any::type_name::<V>())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Public Map Handle
// =============================================================================

/// A sorted, persistent map
///
/// Cloning is cheap; all clones refer to the same map. Reads see the latest
/// published root and never block. Writes are serialized per map through
/// compare-and-swap on the root, falling back to the root lock under
/// contention.
pub struct MvMap<K: KeyType, V: DataType> {
    core: Arc<MapCore<K, V>>,
}

impl<K: KeyType, V: DataType> Clone for MvMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<K: KeyType, V: DataType> std::fmt::Debug for MvMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MvMap")
            .field("id", &self.core.id)
            .field("size", &self.core.size())
            .field("read_only", &self.core.read_only)
            .finish()
    }
}

impl<K: KeyType, V: DataType> MvMap<K, V> {
    pub(crate) fn from_core(core: Arc<MapCore<K, V>>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<MapCore<K, V>> {
        &self.core
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn get(&self, key: &K::Item) -> Result<Option<V::Item>> {
        self.core.get(key)
    }

    pub fn contains_key(&self, key: &K::Item) -> Result<bool> {
        Ok(self.core.get(key)?.is_some())
    }

    /// Number of entries (including buffered appends)
    pub fn size(&self) -> u64 {
        self.core.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn first_key(&self) -> Result<Option<K::Item>> {
        self.core.first_last(true)
    }

    pub fn last_key(&self) -> Result<Option<K::Item>> {
        self.core.first_last(false)
    }

    /// Key at position `index` in key order
    pub fn key_at(&self, index: i64) -> Result<Option<K::Item>> {
        self.core.key_at(index)
    }

    /// Position of `key`, or `-(insertion point) - 1` if absent
    pub fn key_index(&self, key: &K::Item) -> Result<i64> {
        self.core.key_index(key)
    }

    /// Smallest key strictly above `key`
    pub fn higher_key(&self, key: &K::Item) -> Result<Option<K::Item>> {
        self.core.min_max(key, false, true)
    }

    /// Smallest key at or above `key`
    pub fn ceiling_key(&self, key: &K::Item) -> Result<Option<K::Item>> {
        self.core.min_max(key, false, false)
    }

    /// Largest key at or below `key`
    pub fn floor_key(&self, key: &K::Item) -> Result<Option<K::Item>> {
        self.core.min_max(key, true, false)
    }

    /// Largest key strictly below `key`
    pub fn lower_key(&self, key: &K::Item) -> Result<Option<K::Item>> {
        self.core.min_max(key, true, true)
    }

    /// Iterate in key order from the first key at or above `from`
    pub fn cursor(&self, from: Option<&K::Item>) -> Result<Cursor<K, V>> {
        self.cursor_range(from, None, false)
    }

    /// Iterate from `from` to `to` (inclusive), optionally in reverse order
    pub fn cursor_range(
        &self,
        from: Option<&K::Item>,
        to: Option<K::Item>,
        reverse: bool,
    ) -> Result<Cursor<K, V>> {
        let root = self.core.root_page()?;
        Cursor::new(root, self.core.clone(), from, to, reverse)
    }

    pub fn keys(&self) -> Result<impl Iterator<Item = Result<K::Item>>> {
        Ok(self.cursor(None)?.map(|entry| entry.map(|(k, _)| k)))
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store `value` under `key`, returning the previous value
    pub fn put(&self, key: K::Item, value: V::Item) -> Result<Option<V::Item>> {
        self.core.put(key, value)
    }

    pub fn remove(&self, key: &K::Item) -> Result<Option<V::Item>> {
        self.core.remove(key)
    }

    /// Store `value` only if `key` is absent; returns the present value otherwise
    pub fn put_if_absent(&self, key: K::Item, value: V::Item) -> Result<Option<V::Item>> {
        self.core.operate(key, Some(value), &mut IfAbsent)
    }

    /// Store `value` only if `key` is present
    pub fn replace(&self, key: K::Item, value: V::Item) -> Result<Option<V::Item>> {
        self.core.operate(key, Some(value), &mut IfPresent)
    }

    /// Store `new_value` only if the current value equals `old_value`
    pub fn replace_if(&self, key: K::Item, old_value: V::Item, new_value: V::Item) -> Result<bool> {
        let mut equals = Equals::<V>::new(Some(old_value));
        self.core.operate(key, Some(new_value), &mut equals)?;
        Ok(equals.decision() != Some(Decision::Abort))
    }

    /// Remove `key` only if its value equals `value`
    pub fn remove_if(&self, key: K::Item, value: V::Item) -> Result<bool> {
        let mut equals = Equals::<V>::new(Some(value));
        self.core.operate(key, None, &mut equals)?;
        Ok(equals.decision() != Some(Decision::Abort))
    }

    /// Apply a custom decision to `key`, returning the value stored before
    pub fn operate(
        &self,
        key: K::Item,
        value: Option<V::Item>,
        decision_maker: &mut dyn DecisionMaker<K, V>,
    ) -> Result<Option<V::Item>> {
        self.core.operate(key, value, decision_maker)
    }

    /// Remove every entry, returning the root reference from before
    pub fn clear(&self) -> Result<Arc<RootReference<K, V>>> {
        self.core.clear()
    }

    /// Append an entry above every existing key (single-writer maps buffer it)
    pub fn append(&self, key: K::Item, value: V::Item) -> Result<()> {
        self.core.append(key, value)
    }

    /// Remove the last entry
    pub fn trim_last(&self) -> Result<()> {
        self.core.trim_last()
    }

    // -------------------------------------------------------------------------
    // Versions and Diagnostics
    // -------------------------------------------------------------------------

    /// Read-only snapshot of the map as of `version`
    pub fn open_version(&self, version: u64) -> Result<MvMap<K, V>> {
        Ok(MvMap::from_core(Arc::new(self.core.open_version(version)?)))
    }

    /// Check the tree structure; returns the number of entries
    pub fn validate_tree(&self) -> Result<u64> {
        self.core.validate_tree()
    }

    pub fn root_page(&self) -> Result<Arc<Page<K, V>>> {
        self.core.root_page()
    }

    pub fn root_reference(&self) -> Arc<RootReference<K, V>> {
        self.core.root_reference()
    }

    /// Version of the current root
    pub fn version(&self) -> u64 {
        self.core.root_reference().version
    }

    pub fn id(&self) -> u32 {
        self.core.id
    }

    pub fn name(&self) -> Option<String> {
        self.core.store().ok().and_then(|store| store.map_name(self.core.id))
    }

    pub fn is_closed(&self) -> bool {
        MapHandle::is_closed(&*self.core)
    }

    pub fn is_read_only(&self) -> bool {
        self.core.read_only
    }

    pub fn is_single_writer(&self) -> bool {
        self.core.single_writer
    }
}
