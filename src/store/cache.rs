//! Page Cache
//!
//! Recently read (and freshly written) pages keyed by their position. The store
//! keeps one cache for leaves and one for non-leaf pages, each bounded by the
//! summed memory estimate of its pages.
//!
//! Eviction is a clock sweep over insertion order: a page read since the hand
//! last passed it gets a second chance, otherwise it is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::codec::page_info;
use crate::page::ErasedPage;

struct CacheEntry {
    page: ErasedPage,
    weight: usize,
    /// Read since the clock hand last passed (second chance)
    accessed: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<u64, CacheEntry>,
    /// Clock order; may hold positions already removed from `entries`
    order: VecDeque<u64>,
    used: usize,
}

/// Weight-bounded page cache with clock eviction
pub(crate) struct PageCache {
    state: Mutex<CacheState>,
    max_weight: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageCache {
    pub(crate) fn new(max_weight: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_weight,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn get(&self, pos: u64) -> Option<ErasedPage> {
        let mut state = self.state.lock();
        match state.entries.get_mut(&pos) {
            Some(entry) => {
                entry.accessed = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.page.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub(crate) fn put(&self, pos: u64, page: ErasedPage, weight: usize) {
        if self.max_weight == 0 || weight > self.max_weight {
            return;
        }
        let mut state = self.state.lock();
        if let Some(old) = state.entries.insert(
            pos,
            CacheEntry {
                page,
                weight,
                accessed: false,
            },
        ) {
            state.used -= old.weight;
        } else {
            state.order.push_back(pos);
        }
        state.used += weight;
        Self::evict(&mut state, self.max_weight);
    }

    fn evict(state: &mut CacheState, max_weight: usize) {
        while state.used > max_weight {
            let Some(pos) = state.order.pop_front() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&pos) else {
                continue;
            };
            if entry.accessed {
                entry.accessed = false;
                state.order.push_back(pos);
                continue;
            }
            if let Some(entry) = state.entries.remove(&pos) {
                state.used -= entry.weight;
            }
        }
    }

    pub(crate) fn remove(&self, pos: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(&pos) {
            state.used -= entry.weight;
        }
    }

    /// Drop every page stored in chunk `chunk_id`
    pub(crate) fn invalidate_chunk(&self, chunk_id: u32) {
        let mut state = self.state.lock();
        let mut freed = 0;
        state.entries.retain(|pos, entry| {
            let keep = page_info::chunk_id(*pos) != chunk_id;
            if !keep {
                freed += entry.weight;
            }
            keep
        });
        state.used -= freed;
        let CacheState { entries, order, .. } = &mut *state;
        order.retain(|pos| entries.contains_key(pos));
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.used = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Summed weight of the cached pages
    pub(crate) fn used(&self) -> usize {
        self.state.lock().used
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
