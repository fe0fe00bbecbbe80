//! Transaction manager.
//!
//! A transaction snapshots the committed root at begin and, for writers,
//! holds the exclusive file lock until it finishes. All structural
//! changes go through copy-on-write: the first mutation of a clean page
//! allocates a fresh page number from the transaction's monotonic counter
//! and the new page joins the dirty queue. Commit appends the dirty pages
//! in batches, fsyncs, appends a new meta page anchoring the new root, and
//! fsyncs again; abort simply discards the dirty pages. Readers observe
//! the root their transaction snapshotted; nothing they can see is ever
//! overwritten.

use std::collections::VecDeque;

use tracing::debug;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::storage::{
    unix_now, CachedPage, Meta, Page, Pgno, COMMIT_BATCH, P_BRANCH, P_LEAF, P_META, P_OVERFLOW,
};

/// A read or write transaction on a [`Db`].
///
/// Holding a `Txn` mutably borrows the database handle, so at most one
/// transaction is live per handle; the exclusive file lock extends the
/// one-writer rule across processes. Dropping an uncommitted transaction
/// aborts it.
pub struct Txn<'db> {
    pub(crate) db: &'db mut Db,
    /// Root page this transaction operates on; updated in place by
    /// copy-on-write descents and splits.
    pub(crate) root: Pgno,
    /// Next unallocated page number, initialized to the file length in
    /// pages at begin.
    pub(crate) next_pgno: Pgno,
    /// FIFO of pages created or touched by this transaction, in
    /// allocation order.
    pub(crate) dirty: VecDeque<Pgno>,
    pub(crate) rdonly: bool,
    /// Set after a structural failure; all further operations and the
    /// commit fail fast until the transaction is aborted.
    pub(crate) poisoned: bool,
    locked: bool,
    finished: bool,
    snapshot: Meta,
}

impl Db {
    /// Begins a transaction. Writers take the exclusive file lock
    /// (non-blocking; [`Error::Busy`] when another writer holds it) and
    /// both kinds re-read the newest meta page.
    pub fn begin(&mut self, rdonly: bool) -> Result<Txn<'_>> {
        let mut locked = false;
        if !rdonly {
            if self.read_only {
                return Err(Error::ReadOnly);
            }
            self.file.lock_exclusive()?;
            locked = true;
        }

        let next_pgno = match self.read_meta() {
            Ok(n) => n,
            Err(e) => {
                if locked {
                    self.file.unlock();
                }
                return Err(e);
            }
        };

        let root = self.meta.root;
        let snapshot = self.meta;
        Ok(Txn {
            root,
            next_pgno,
            dirty: VecDeque::new(),
            rdonly,
            poisoned: false,
            locked,
            finished: false,
            snapshot,
            db: self,
        })
    }

    /// Runs `f` inside a read-only transaction.
    pub fn view<T>(&mut self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let mut txn = self.begin(true)?;
        f(&mut txn)
    }

    /// Runs `f` inside a writer transaction, committing on `Ok` and
    /// aborting on `Err`.
    pub fn update<T>(&mut self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let mut txn = self.begin(false)?;
        match f(&mut txn) {
            Ok(v) => {
                txn.commit()?;
                Ok(v)
            }
            Err(e) => Err(e),
        }
    }
}

impl<'db> Txn<'db> {
    pub fn is_read_only(&self) -> bool {
        self.rdonly
    }

    /// Commits the transaction: dirty pages in gathered batches, fsync, a
    /// new meta page, fsync. A transaction with no dirty pages commits
    /// without writing anything.
    pub fn commit(mut self) -> Result<()> {
        if self.rdonly {
            return Err(Error::ReadOnly);
        }
        if self.poisoned {
            return Err(Error::Invalid("transaction poisoned by earlier error"));
        }
        match self.commit_inner() {
            Ok(()) => {
                self.db.cache.prune();
                if self.locked {
                    self.db.file.unlock();
                    self.locked = false;
                }
                self.finished = true;
                Ok(())
            }
            // Drop runs the abort path.
            Err(e) => Err(e),
        }
    }

    /// Aborts the transaction, discarding all dirty pages.
    pub fn abort(self) {}

    fn commit_inner(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let psize = self.db.head.psize as usize;
        if self.db.fix_padding {
            let len = self.db.file.len()?;
            let aligned = len + (psize as u64 - len % psize as u64) % psize as u64;
            self.db.file.set_len(aligned)?;
            self.db.fix_padding = false;
        }

        if cfg!(debug_assertions) {
            let file_len = self.db.file.len()?;
            assert_eq!(
                self.dirty.front().map(|&p| p as u64 * psize as u64),
                Some(file_len),
                "dirty queue out of step with file length"
            );
        }

        let mut written = 0usize;
        while !self.dirty.is_empty() {
            let n = self.dirty.len().min(COMMIT_BATCH);
            let mut batch = Vec::with_capacity(n * psize);
            for &pgno in self.dirty.iter().take(n) {
                let entry = self
                    .db
                    .cache
                    .get(pgno)
                    .ok_or_else(|| Error::corrupted(format!("dirty page {pgno} not cached")))?;
                batch.extend_from_slice(entry.page.buf());
            }
            self.db.file.append(&batch)?;
            for _ in 0..n {
                let pgno = self.dirty.pop_front().ok_or_else(|| {
                    Error::corrupted("dirty queue drained while writing batch")
                })?;
                if let Some(e) = self.db.cache.get_mut(pgno) {
                    e.dirty = false;
                }
            }
            written += n;
        }

        self.db.sync()?;
        self.write_meta(self.root, 0)?;
        self.db.sync()?;

        debug!(
            pages = written,
            root = self.db.meta.root,
            revision = self.db.meta.revisions,
            entries = self.db.meta.entries,
            "committed transaction"
        );
        Ok(())
    }

    /// Appends a meta page anchoring `root`, stamping time, revision and
    /// hash.
    pub(crate) fn write_meta(&mut self, root: Pgno, flags: u32) -> Result<()> {
        let pgno = self.new_page(P_META)?;

        let m = &mut self.db.meta;
        m.prev_root = m.root;
        m.root = root;
        m.flags = flags;
        m.created_at = unix_now();
        m.revisions += 1;
        let snapshot = *m;

        let buf = {
            let entry = self
                .db
                .cache
                .get_mut(pgno)
                .ok_or_else(|| Error::corrupted("meta page vanished from cache"))?;
            snapshot.write_to(&mut entry.page);
            entry.page.buf().to_vec()
        };
        self.db.file.append(&buf)?;

        if let Some(pos) = self.dirty.iter().position(|&p| p == pgno) {
            self.dirty.remove(pos);
        }
        if let Some(e) = self.db.cache.get_mut(pgno) {
            e.dirty = false;
        }
        self.db.meta_pgno = pgno;
        self.db.size = self.db.file.len()?;
        Ok(())
    }

    /// Allocates a fresh page of the given type from the monotonic
    /// counter, marks it dirty and queues it for commit.
    pub(crate) fn new_page(&mut self, flags: u32) -> Result<Pgno> {
        if self.rdonly {
            return Err(Error::ReadOnly);
        }
        let pgno = self.next_pgno;
        self.next_pgno += 1;

        if flags & P_BRANCH != 0 {
            self.db.meta.branch_pages += 1;
        } else if flags & P_LEAF != 0 {
            self.db.meta.leaf_pages += 1;
        } else if flags & P_OVERFLOW != 0 {
            self.db.meta.overflow_pages += 1;
        }

        let page = Page::new(self.db.head.psize as usize, pgno, flags);
        let mut entry = CachedPage::new(page);
        entry.dirty = true;
        self.db.cache.insert(pgno, entry);
        self.dirty.push_back(pgno);
        Ok(pgno)
    }

    /// Copy-on-write touch: an already dirty page is returned unchanged;
    /// a clean page is re-keyed (or copied, if still referenced) under a
    /// freshly allocated page number, queued for commit, and its parent's
    /// child pointer is updated.
    pub(crate) fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        let (dirty, refs) = {
            let e = self
                .db
                .cache
                .get(pgno)
                .ok_or_else(|| Error::corrupted(format!("touch of uncached page {pgno}")))?;
            (e.dirty, e.refs)
        };
        if dirty {
            return Ok(pgno);
        }

        let new_pgno = self.next_pgno;
        self.next_pgno += 1;

        let mut entry = if refs <= 0 {
            self.db
                .cache
                .remove(pgno)
                .ok_or_else(|| Error::corrupted("touched page vanished from cache"))?
        } else {
            // Still referenced by a cursor or returned value: leave the
            // original in place for those readers and work on a copy.
            let e = self
                .db
                .cache
                .get(pgno)
                .ok_or_else(|| Error::corrupted("touched page vanished from cache"))?;
            e.duplicate()
        };
        entry.page.set_pgno(new_pgno);
        entry.dirty = true;
        let parent = entry.parent;
        self.db.cache.insert(new_pgno, entry);
        self.dirty.push_back(new_pgno);

        if let Some((ppgno, pindex)) = parent {
            let pe = self
                .db
                .cache
                .get_mut(ppgno)
                .ok_or_else(|| Error::corrupted("parent of touched page not cached"))?;
            debug_assert!(pe.dirty);
            pe.page.set_node_child(pindex, new_pgno);
        }
        Ok(new_pgno)
    }

    /// Makes sure `pgno` is resident in the cache, reading it from the
    /// file if needed.
    pub(crate) fn ensure_page(&mut self, pgno: Pgno) -> Result<()> {
        self.db.cache_page(pgno).map(|_| ())
    }

    pub(crate) fn page(&mut self, pgno: Pgno) -> Result<&CachedPage> {
        self.db.cache_page(pgno)
    }

    pub(crate) fn page_mut(&mut self, pgno: Pgno) -> Result<&mut CachedPage> {
        self.ensure_page(pgno)?;
        self.db
            .cache
            .get_mut(pgno)
            .ok_or_else(|| Error::corrupted(format!("page {pgno} vanished from cache")))
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.rdonly {
            while let Some(pgno) = self.dirty.pop_front() {
                self.db.cache.remove(pgno);
            }
            self.db.meta = self.snapshot;
            if self.locked {
                self.db.file.unlock();
            }
        }
        self.db.cache.prune();
    }
}
