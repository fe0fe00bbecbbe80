//! In-memory page cache.
//!
//! An ordered map from page number to cached page, bounded by a
//! configurable capacity. Each lookup stamps the entry with a monotonic
//! access counter; pruning walks the entries in least-recently-used order
//! and evicts only clean, unreferenced ones, stopping once the cache is
//! back within its bound. Dirty pages (pending commit) and pages pinned by
//! cursors or in-flight operations are never evicted, so the cache may
//! legitimately exceed its capacity while they exist.
//!
//! Entries also carry the transient per-descent state of a page: the
//! parent back-reference (page number and slot index within the parent)
//! and the page's effective key prefix. Both are recomputed whenever a
//! descent or sibling move enters the page and are only meaningful for the
//! duration of the current operation.

use std::collections::BTreeMap;

use tracing::trace;

use crate::btree::KeyBuf;

use super::{Page, Pgno};

pub(crate) struct CachedPage {
    pub page: Page,
    /// Back-reference to the parent page and this page's slot index in it.
    /// Valid only during the operation that set it.
    pub parent: Option<(Pgno, usize)>,
    /// Effective key prefix of this page, set during descent.
    pub prefix: KeyBuf,
    /// Pin count held by cursors and in-flight operations.
    pub refs: i32,
    /// Set while the page sits on a transaction's dirty queue.
    pub dirty: bool,
    stamp: u64,
}

impl CachedPage {
    pub fn new(page: Page) -> CachedPage {
        CachedPage {
            page,
            parent: None,
            prefix: KeyBuf::new(),
            refs: 0,
            dirty: false,
            stamp: 0,
        }
    }

    /// Copy of this entry for copy-on-write: same bytes, parent and
    /// prefix, but unreferenced and clean.
    pub fn duplicate(&self) -> CachedPage {
        CachedPage {
            page: self.page.clone(),
            parent: self.parent,
            prefix: self.prefix.clone(),
            refs: 0,
            dirty: false,
            stamp: 0,
        }
    }
}

pub(crate) struct PageCache {
    entries: BTreeMap<Pgno, CachedPage>,
    max_cache: usize,
    tick: u64,
}

impl PageCache {
    pub fn new(max_cache: usize) -> PageCache {
        PageCache {
            entries: BTreeMap::new(),
            max_cache,
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn set_capacity(&mut self, max_cache: usize) {
        self.max_cache = max_cache;
    }

    pub fn contains(&self, pgno: Pgno) -> bool {
        self.entries.contains_key(&pgno)
    }

    /// Looks up a page, bumping it to most-recently-used.
    pub fn get(&mut self, pgno: Pgno) -> Option<&CachedPage> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&pgno).map(|e| {
            e.stamp = tick;
            &*e
        })
    }

    pub fn get_mut(&mut self, pgno: Pgno) -> Option<&mut CachedPage> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&pgno).map(|e| {
            e.stamp = tick;
            e
        })
    }

    pub fn insert(&mut self, pgno: Pgno, mut entry: CachedPage) {
        self.tick += 1;
        entry.stamp = self.tick;
        self.entries.insert(pgno, entry);
    }

    pub fn remove(&mut self, pgno: Pgno) -> Option<CachedPage> {
        self.entries.remove(&pgno)
    }

    pub fn ref_inc(&mut self, pgno: Pgno) {
        if let Some(e) = self.entries.get_mut(&pgno) {
            e.refs += 1;
        }
    }

    pub fn ref_dec(&mut self, pgno: Pgno) {
        if let Some(e) = self.entries.get_mut(&pgno) {
            e.refs -= 1;
        }
    }

    /// Evicts least-recently-used clean, unreferenced entries until the
    /// cache is within its capacity.
    pub fn prune(&mut self) {
        if self.entries.len() <= self.max_cache {
            return;
        }
        let mut candidates: Vec<(u64, Pgno)> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.dirty && e.refs <= 0)
            .map(|(&pgno, e)| (e.stamp, pgno))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0usize;
        for (_, pgno) in candidates {
            if self.entries.len() <= self.max_cache {
                break;
            }
            self.entries.remove(&pgno);
            evicted += 1;
        }
        if evicted > 0 {
            trace!(evicted, remaining = self.entries.len(), "pruned page cache");
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{P_LEAF, Page};

    fn entry(pgno: Pgno) -> CachedPage {
        CachedPage::new(Page::new(512, pgno, P_LEAF))
    }

    fn cache_with(n: usize, cap: usize) -> PageCache {
        let mut cache = PageCache::new(cap);
        for i in 0..n {
            cache.insert(i as Pgno, entry(i as Pgno));
        }
        cache
    }

    #[test]
    fn prune_evicts_least_recently_used_first() {
        let mut cache = cache_with(4, 2);
        // Touch pages 0 and 1 so 2 and 3 become the LRU entries.
        cache.get(0);
        cache.get(1);

        cache.prune();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(0));
        assert!(cache.contains(1));
    }

    #[test]
    fn prune_skips_dirty_and_referenced_entries() {
        let mut cache = cache_with(4, 1);
        cache.get_mut(0).unwrap().dirty = true;
        cache.ref_inc(1);
        cache.ref_inc(2);

        cache.prune();

        assert!(cache.contains(0));
        assert!(cache.contains(1));
        assert!(cache.contains(2));
        assert!(!cache.contains(3));
        // Over capacity because pinned and dirty entries are not evictable.
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn prune_is_a_no_op_within_capacity() {
        let mut cache = cache_with(3, 8);
        cache.prune();
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn unref_makes_entry_evictable_again() {
        let mut cache = cache_with(2, 0);
        cache.ref_inc(0);
        cache.ref_inc(1);
        cache.prune();
        assert_eq!(cache.len(), 2);

        cache.ref_dec(0);
        cache.ref_dec(1);
        cache.prune();
        assert_eq!(cache.len(), 0);
    }
}
