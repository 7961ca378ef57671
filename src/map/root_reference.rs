//! Root Reference
//!
//! The published state of one map: its root page, the version it belongs to,
//! the root lock and the chain of roots kept for older versions.
//!
//! ## Version Chain
//! ```text
//!  current ──► [v7 root R3] ──previous──► [v5 root R2] ──previous──► [v2 root R1]
//! ```
//! A root labeled `v` in the chain is the last root of version `v`. Roots of
//! the same version share one `previous` link, so only the roots seen at commit
//! time stay reachable. Pruning cuts the chain in place below the oldest version
//! still in use.
//!
//! Every transition builds a new reference and publishes it with a single
//! compare-and-swap against the reference last observed.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::page::Page;
use crate::types::{DataType, KeyType};

pub struct RootReference<K: KeyType, V: DataType> {
    pub root: Arc<Page<K, V>>,
    pub version: u64,
    hold_count: u8,
    owner: Option<ThreadId>,
    previous: ArcSwapOption<RootReference<K, V>>,
    update_counter: u64,
    update_attempt_counter: u64,
    /// Entries waiting in the append buffer of a single-writer map
    append_counter: usize,
}

impl<K: KeyType, V: DataType> RootReference<K, V> {
    pub(crate) fn new(root: Arc<Page<K, V>>, version: u64) -> Self {
        Self {
            root,
            version,
            hold_count: 0,
            owner: None,
            previous: ArcSwapOption::empty(),
            update_counter: 1,
            update_attempt_counter: 1,
            append_counter: 0,
        }
    }

    fn derived(&self, root: Arc<Page<K, V>>) -> Self {
        Self {
            root,
            version: self.version,
            hold_count: self.hold_count,
            owner: self.owner,
            previous: ArcSwapOption::new(self.previous.load_full()),
            update_counter: self.update_counter,
            update_attempt_counter: self.update_attempt_counter,
            append_counter: self.append_counter,
        }
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    pub fn is_locked(&self) -> bool {
        self.hold_count != 0
    }

    pub fn is_locked_by_current_thread(&self) -> bool {
        self.hold_count != 0 && self.owner == Some(thread::current().id())
    }

    fn is_free(&self) -> bool {
        self.hold_count == 0
    }

    fn can_update(&self) -> bool {
        self.is_free() || self.owner == Some(thread::current().id())
    }

    pub fn append_counter(&self) -> usize {
        self.append_counter
    }

    /// Entries in the tree plus the ones still buffered
    pub fn total_count(&self) -> u64 {
        self.root.total_count() + self.append_counter as u64
    }

    pub fn previous(&self) -> Option<Arc<RootReference<K, V>>> {
        self.previous.load_full()
    }

    pub(crate) fn update_counter(&self) -> u64 {
        self.update_counter
    }

    pub(crate) fn update_attempt_counter(&self) -> u64 {
        self.update_attempt_counter
    }

    /// Newest version in which the tree (or its buffer) changed
    pub fn last_modified_version(&self) -> u64 {
        let mut version = self.version;
        let mut current = self.previous();
        let mut root = self.root.clone();
        let append_counter = self.append_counter;
        while let Some(prev) = current {
            if !Arc::ptr_eq(&prev.root, &root) || prev.append_counter != append_counter {
                break;
            }
            version = prev.version;
            root = prev.root.clone();
            current = prev.previous();
        }
        version
    }

    pub fn has_changes_since(&self, version: u64, persistent: bool) -> bool {
        let pending = if persistent && self.root.is_saved() {
            self.append_counter > 0
        } else {
            self.total_count() > 0
        };
        pending || self.last_modified_version() > version
    }

    /// Cut the chain below `oldest_version_to_keep`
    ///
    /// The newest root of an older version is kept, since it is also the first
    /// root of the version after it.
    pub(crate) fn remove_unused_old_versions(&self, oldest_version_to_keep: u64) {
        if self.version < oldest_version_to_keep {
            self.previous.store(None);
        }
        let mut current = self.previous();
        while let Some(r) = current {
            if r.version < oldest_version_to_keep {
                r.previous.store(None);
                break;
            }
            current = r.previous();
        }
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn try_update(slot: &ArcSwap<Self>, current: &Arc<Self>, next: Self) -> Option<Arc<Self>> {
        let next = Arc::new(next);
        let previous = slot.compare_and_swap(current, next.clone());
        if Arc::ptr_eq(&*previous, current) {
            Some(next)
        } else {
            None
        }
    }

    /// Publish a new root page; only possible while unlocked
    pub(crate) fn update_root_page(
        slot: &ArcSwap<Self>,
        current: &Arc<Self>,
        root: Arc<Page<K, V>>,
        attempt: u32,
    ) -> Option<Arc<Self>> {
        if !current.is_free() {
            return None;
        }
        let mut next = current.derived(root);
        next.hold_count = 0;
        next.owner = None;
        next.update_counter += 1;
        next.update_attempt_counter += attempt as u64;
        Self::try_update(slot, current, next)
    }

    /// Take (or re-enter) the root lock
    pub(crate) fn try_lock(slot: &ArcSwap<Self>, current: &Arc<Self>, attempt: u32) -> Option<Arc<Self>> {
        if !current.can_update() {
            return None;
        }
        let mut next = current.derived(current.root.clone());
        next.hold_count = current.hold_count + 1;
        next.owner = Some(thread::current().id());
        next.update_counter += 1;
        next.update_attempt_counter += attempt as u64;
        Self::try_update(slot, current, next)
    }

    /// Replace the root page and release (or keep) one level of the lock
    pub(crate) fn update_page_and_locked_status(
        slot: &ArcSwap<Self>,
        current: &Arc<Self>,
        root: Arc<Page<K, V>>,
        keep_locked: bool,
        append_counter: usize,
    ) -> Option<Arc<Self>> {
        if !current.can_update() {
            return None;
        }
        let mut next = current.derived(root);
        next.hold_count = current.hold_count.saturating_sub(if keep_locked { 0 } else { 1 });
        if next.hold_count == 0 {
            next.owner = None;
        }
        next.append_counter = append_counter;
        Self::try_update(slot, current, next)
    }

    /// Move to `version`, releasing a lock held by the current thread
    pub(crate) fn try_unlock_and_update_version(
        slot: &ArcSwap<Self>,
        current: &Arc<Self>,
        version: u64,
        attempt: u32,
    ) -> Option<Arc<Self>> {
        if !current.can_update() {
            return None;
        }
        // the new previous is the oldest root of the run sharing this root page
        let mut previous = current.clone();
        while let Some(older) = previous.previous() {
            if !Arc::ptr_eq(&older.root, &current.root) {
                break;
            }
            previous = older;
        }
        let hold_count = current.hold_count.saturating_sub(1);
        let next = Self {
            root: current.root.clone(),
            version,
            hold_count,
            owner: if hold_count == 0 { None } else { current.owner },
            previous: ArcSwapOption::new(Some(previous)),
            update_counter: current.update_counter + 1,
            update_attempt_counter: current.update_attempt_counter + attempt as u64,
            append_counter: 0,
        };
        Self::try_update(slot, current, next)
    }
}

impl<K: KeyType, V: DataType> std::fmt::Debug for RootReference<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootReference")
            .field("version", &self.version)
            .field("root_pos", &self.root.pos())
            .field("hold_count", &self.hold_count)
            .field("append_counter", &self.append_counter)
            .field("update_counter", &self.update_counter)
            .field("update_attempt_counter", &self.update_attempt_counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::KeyManager;
    use crate::types::LongType;

    type R = RootReference<LongType, LongType>;

    fn leaf(keys: &[u64]) -> Arc<Page<LongType, LongType>> {
        Arc::new(Page::create_leaf(5, KeyManager::new(keys.to_vec()), keys.to_vec()))
    }

    fn slot(root: Arc<Page<LongType, LongType>>, version: u64) -> ArcSwap<R> {
        ArcSwap::from_pointee(R::new(root, version))
    }

    #[test]
    fn test_update_fails_on_stale_reference() {
        let slot = slot(leaf(&[]), 1);
        let stale = slot.load_full();
        let updated = R::update_root_page(&slot, &stale, leaf(&[1]), 1).unwrap();
        assert_eq!(updated.update_counter(), 2);
        assert!(R::update_root_page(&slot, &stale, leaf(&[2]), 1).is_none());
        assert_eq!(slot.load().root.key_count(), 1);
    }

    #[test]
    fn test_lock_blocks_plain_updates_and_is_reentrant() {
        let slot = slot(leaf(&[]), 1);
        let current = slot.load_full();
        let locked = R::try_lock(&slot, &current, 1).unwrap();
        assert!(locked.is_locked_by_current_thread());
        assert!(R::update_root_page(&slot, &locked, leaf(&[1]), 1).is_none());

        let twice = R::try_lock(&slot, &locked, 1).unwrap();
        let once = R::update_page_and_locked_status(&slot, &twice, leaf(&[1]), false, 0).unwrap();
        assert!(once.is_locked());
        let free = R::update_page_and_locked_status(&slot, &once, once.root.clone(), false, 3).unwrap();
        assert!(!free.is_locked());
        assert_eq!(free.append_counter(), 3);
        assert_eq!(free.total_count(), 4);
    }

    #[test]
    fn test_lock_held_by_other_thread() {
        let slot = Arc::new(slot(leaf(&[]), 1));
        let current = slot.load_full();
        R::try_lock(&slot, &current, 1).unwrap();
        let other = slot.clone();
        let got = std::thread::spawn(move || {
            let seen = other.load_full();
            R::try_lock(&other, &seen, 1).is_some()
        })
        .join()
        .unwrap();
        assert!(!got);
    }

    #[test]
    fn test_version_chain_and_last_modified() {
        let slot = slot(leaf(&[]), 1);
        let r = slot.load_full();
        let r = R::update_root_page(&slot, &r, leaf(&[1]), 1).unwrap();
        let r = R::try_unlock_and_update_version(&slot, &r, 2, 1).unwrap();
        // no change during version 2
        let r = R::try_unlock_and_update_version(&slot, &r, 3, 1).unwrap();
        assert_eq!(r.version, 3);
        assert_eq!(r.last_modified_version(), 1);
        // an unsaved, non-empty root always counts as a change
        assert!(r.has_changes_since(5, true));

        // the run of identical roots collapses into one link
        let prev = r.previous().unwrap();
        assert_eq!(prev.version, 1);

        let r = R::update_root_page(&slot, &r, leaf(&[1, 2]), 1).unwrap();
        assert_eq!(r.last_modified_version(), 3);
    }

    #[test]
    fn test_prune_old_versions() {
        let slot = slot(leaf(&[]), 1);
        let mut r = slot.load_full();
        for v in 2..6u64 {
            r = R::update_root_page(&slot, &r, leaf(&[v]), 1).unwrap();
            r = R::try_unlock_and_update_version(&slot, &r, v, 1).unwrap();
        }
        let mut depth = 0;
        let mut cur = r.previous();
        while let Some(p) = cur {
            depth += 1;
            cur = p.previous();
        }
        assert_eq!(depth, 4);

        r.remove_unused_old_versions(4);
        let mut versions = vec![];
        let mut cur = r.previous();
        while let Some(p) = cur {
            versions.push(p.version);
            cur = p.previous();
        }
        assert_eq!(versions, vec![4, 3]);
    }
}
