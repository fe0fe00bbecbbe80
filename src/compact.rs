//! Offline compaction.
//!
//! An append-only file never reclaims space: superseded pages pile up
//! behind the newest meta. Compaction rewrites the live tree into a fresh
//! file, renumbering pages densely in traversal order, atomically renames
//! it over the original path, and appends a tombstone meta to the old
//! inode so handles still holding it learn to reopen by path.

use std::io::Write;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::storage::{unix_now, Head, Meta, Page, Pgno, PAGE_HDR_SIZE, P_HEAD, P_INVALID};

/// Destination file being built; pages are appended in renumbering order.
struct CompactDest {
    file: NamedTempFile,
    next_pgno: Pgno,
}

impl CompactDest {
    fn append(&mut self, page: &Page) -> Result<()> {
        self.file.as_file_mut().write_all(page.buf())?;
        Ok(())
    }

    fn alloc(&mut self) -> Pgno {
        let pgno = self.next_pgno;
        self.next_pgno += 1;
        pgno
    }
}

impl Db {
    /// Rewrites the live tree into a fresh file beside the original and
    /// swaps it in. The old inode is tombstoned, which invalidates every
    /// existing handle including this one, so the handle is consumed and
    /// a freshly opened one is returned.
    pub fn compact(mut self) -> Result<Db> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.file.lock_exclusive()?;
        let res = self.compact_inner();
        self.file.unlock();
        let path = self.path().to_path_buf();
        let opts = self.opts.clone();
        res?;
        drop(self);
        opts.open(path)
    }

    fn compact_inner(&mut self) -> Result<()> {
        self.read_meta()?;
        let psize = self.head.psize;

        let file_name = self
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("db");
        let dir = self.path().parent().unwrap_or_else(|| std::path::Path::new("."));
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{file_name}.compact."))
            .tempfile_in(dir)?;

        let mut dest = CompactDest {
            file: tmp,
            next_pgno: 1,
        };

        // Header page with the source's page size.
        let head = Head { flags: 0, psize };
        let mut page0 = Page::new(psize as usize, 0, P_HEAD);
        head.write_to(&mut page0);
        dest.append(&page0)?;

        if self.meta.root != P_INVALID {
            let root = self.compact_tree(self.meta.root, &mut dest)?;
            let src = self.meta;
            let meta_pgno = dest.alloc();
            let mut meta_page = Page::new(psize as usize, meta_pgno, crate::storage::P_META);
            Meta {
                flags: 0,
                root,
                prev_root: src.root,
                created_at: unix_now(),
                revisions: 1,
                ..src
            }
            .write_to(&mut meta_page);
            dest.append(&meta_page)?;
        }

        dest.file.as_file().sync_all()?;
        let pages = dest.next_pgno;
        dest.file
            .persist(self.path())
            .map_err(|e| Error::Io(e.error))?;

        // Mark the old inode superseded for every handle still holding it.
        self.write_tombstone()?;
        self.cache.prune();
        debug!(pages, "compacted database");
        Ok(())
    }

    /// Copies the subtree rooted at `pgno` into the destination,
    /// rewriting child page numbers to their renumbered values. Children
    /// are written before their parent, so every reference points
    /// backward in the new file.
    fn compact_tree(&mut self, pgno: Pgno, dest: &mut CompactDest) -> Result<Pgno> {
        let mut copy = self.cache_page(pgno)?.page.clone();

        if copy.is_branch() {
            for i in 0..copy.num_keys() {
                let child = self.compact_tree(copy.node_child(i), dest)?;
                copy.set_node_child(i, child);
            }
        } else if copy.is_leaf() {
            for i in 0..copy.num_keys() {
                if copy.node_is_bigdata(i) {
                    let head = self.compact_overflow(copy.node_overflow(i), dest)?;
                    copy.set_node_overflow(i, head);
                }
            }
        } else {
            return Err(Error::corrupted(format!(
                "unexpected page type {:#x} at page {} during compaction",
                copy.flags(),
                pgno
            )));
        }

        let new_pgno = dest.alloc();
        copy.set_pgno(new_pgno);
        dest.append(&copy)?;
        self.cache.prune();
        Ok(new_pgno)
    }

    /// Rewrites an overflow chain tail-first so each page knows its
    /// successor's new number.
    fn compact_overflow(&mut self, head: Pgno, dest: &mut CompactDest) -> Result<Pgno> {
        let mut chain = Vec::new();
        let mut pgno = head;
        let psize = self.head.psize as usize;
        while pgno != 0 {
            let entry = self.cache_page(pgno)?;
            if !entry.page.is_overflow() {
                return Err(Error::corrupted(format!(
                    "page {pgno} in overflow chain is not an overflow page"
                )));
            }
            // Chains are bounded by the value size limit; a cycle would
            // mean a corrupted link.
            if chain.len() > u32::MAX as usize / (psize - PAGE_HDR_SIZE) {
                return Err(Error::corrupted("overflow chain does not terminate"));
            }
            chain.push(pgno);
            pgno = entry.page.next_pgno();
        }

        let mut next_new = 0;
        for &pgno in chain.iter().rev() {
            let mut copy = self.cache_page(pgno)?.page.clone();
            copy.set_next_pgno(next_new);
            let new_pgno = dest.alloc();
            copy.set_pgno(new_pgno);
            dest.append(&copy)?;
            next_new = new_pgno;
        }
        self.cache.prune();
        Ok(next_new)
    }
}
