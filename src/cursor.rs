//! Ordered traversal cursors.
//!
//! A cursor keeps a stack of (page, index) frames from the root down to
//! its current leaf position. Moving past the end of a leaf pops frames
//! until an ancestor can advance, then descends the new path along slot 0.
//! Every page on the stack is pinned in the cache for the cursor's
//! lifetime.

use crate::btree::{validate_key, NodePos};
use crate::error::{Error, Result};
use crate::storage::Pgno;
use crate::txn::Txn;

/// One level of the cursor's descent: a page and the slot index the
/// cursor is positioned at on that page.
pub(crate) struct Frame {
    pub pgno: Pgno,
    pub ki: usize,
}

/// A cursor over the keys visible to one transaction, in sorted order.
///
/// Returned keys are reconstructed from the page prefix; keys and values
/// are handed out as owned buffers.
pub struct Cursor<'t, 'db> {
    txn: &'t mut Txn<'db>,
    stack: Vec<Frame>,
    initialized: bool,
    eof: bool,
}

impl<'db> Txn<'db> {
    /// Opens a cursor over this transaction's snapshot.
    pub fn cursor(&mut self) -> Cursor<'_, 'db> {
        Cursor {
            txn: self,
            stack: Vec::new(),
            initialized: false,
            eof: false,
        }
    }
}

impl Cursor<'_, '_> {
    /// Positions at the first key. `None` when the tree is empty.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.reset();
        let res = self.first_inner();
        self.txn.db.cache.prune();
        res
    }

    fn first_inner(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.txn.search_page(None, false, Some(&mut self.stack)) {
            Ok(_) => {}
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        }
        self.initialized = true;
        self.eof = false;
        self.current()
    }

    /// Advances to the next key in order. `None` once exhausted. On an
    /// unpositioned cursor this behaves like [`Cursor::first`].
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.initialized {
            return self.first();
        }
        let res = self.next_inner();
        self.txn.db.cache.prune();
        res
    }

    fn next_inner(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.eof {
            return Ok(None);
        }
        let top = self
            .stack
            .last()
            .ok_or(Error::Invalid("cursor not positioned"))?;
        let n = {
            let pgno = top.pgno;
            self.txn.page(pgno)?.page.num_keys()
        };

        if self.stack.last().map(|t| t.ki + 1 >= n) == Some(true) {
            match self.sibling(true) {
                Ok(()) => {}
                Err(Error::NotFound) => {
                    self.eof = true;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        } else if let Some(top) = self.stack.last_mut() {
            top.ki += 1;
        }

        self.current()
    }

    /// Positions at the smallest key greater than or equal to `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        validate_key(key)?;
        self.reset();
        let res = self.seek_inner(key, false);
        self.txn.db.cache.prune();
        res
    }

    /// Positions at `key` exactly, returning its value, or `None` when
    /// the key is absent.
    pub fn seek_exact(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        self.reset();
        let res = self.seek_inner(key, true);
        self.txn.db.cache.prune();
        res.map(|opt| opt.map(|(_, value)| value))
    }

    fn seek_inner(&mut self, key: &[u8], exact: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let leaf = match self.txn.search_page(Some(key), false, Some(&mut self.stack)) {
            Ok(pgno) => pgno,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        match self.txn.search_node(leaf, key)? {
            NodePos::Exact(i) => {
                if let Some(top) = self.stack.last_mut() {
                    top.ki = i;
                }
            }
            NodePos::Greater(i) => {
                if exact {
                    return Ok(None);
                }
                if let Some(top) = self.stack.last_mut() {
                    top.ki = i;
                }
            }
            NodePos::End => {
                if exact {
                    return Ok(None);
                }
                // Past the last entry of this leaf: the successor is the
                // first entry of the next one.
                match self.sibling(true) {
                    Ok(()) => {}
                    Err(Error::NotFound) => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
        }

        self.initialized = true;
        self.eof = false;
        self.current()
    }

    /// Moves to the adjacent leaf: pops until an ancestor can advance,
    /// then descends the new subtree along slot 0.
    fn sibling(&mut self, move_right: bool) -> Result<()> {
        if self.stack.len() < 2 {
            // The root has no siblings.
            return Err(Error::NotFound);
        }
        let top = self.stack.pop().ok_or(Error::NotFound)?;
        self.txn.db.cache.ref_dec(top.pgno);

        let advance_here = {
            let parent = self.stack.last().ok_or(Error::NotFound)?;
            let n = self.txn.page(parent.pgno)?.page.num_keys();
            if move_right {
                parent.ki + 1 < n
            } else {
                parent.ki > 0
            }
        };
        if advance_here {
            let parent = self.stack.last_mut().ok_or(Error::NotFound)?;
            if move_right {
                parent.ki += 1;
            } else {
                parent.ki -= 1;
            }
        } else {
            self.sibling(move_right)?;
        }

        let (ppgno, pki) = {
            let parent = self.stack.last().ok_or(Error::NotFound)?;
            (parent.pgno, parent.ki)
        };
        let child = self.txn.page(ppgno)?.page.node_child(pki);
        self.txn.ensure_page(child)?;
        self.txn.page_mut(child)?.parent = Some((ppgno, pki));
        self.txn.find_common_prefix(child)?;

        self.stack.push(Frame { pgno: child, ki: 0 });
        self.txn.db.cache.ref_inc(child);
        Ok(())
    }

    /// Materializes the key/value pair under the cursor.
    fn current(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let (pgno, ki) = {
            let top = self
                .stack
                .last()
                .ok_or(Error::Invalid("cursor not positioned"))?;
            (top.pgno, top.ki)
        };
        let key = self.txn.expand_prefix(pgno, ki)?.to_vec();
        let value = self.txn.read_data(pgno, ki)?;
        Ok(Some((key, value)))
    }

    fn reset(&mut self) {
        while let Some(frame) = self.stack.pop() {
            self.txn.db.cache.ref_dec(frame.pgno);
        }
        self.initialized = false;
        self.eof = false;
    }
}

impl Drop for Cursor<'_, '_> {
    fn drop(&mut self) {
        while let Some(frame) = self.stack.pop() {
            self.txn.db.cache.ref_dec(frame.pgno);
        }
    }
}
