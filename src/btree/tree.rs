//! Point lookups, insertion and page splitting.

use crate::error::{Error, Result};
use crate::storage::{
    NodeData, Pgno, MIN_KEYS, NODE_HDR_SIZE, PAGE_HDR_SIZE, P_BRANCH, P_LEAF, P_OVERFLOW,
};
use crate::txn::Txn;

use super::{reduce_separator, validate_key, KeyBuf, NodePos};

/// Bytes a leaf node for `(key, value)` will occupy, slot included. A
/// value at or above `psize / MIN_KEYS` is stored on an overflow chain, so
/// only its head page number counts against the page.
fn leaf_size(psize: usize, klen: usize, dlen: usize) -> usize {
    let body = if dlen >= psize / MIN_KEYS {
        std::mem::size_of::<Pgno>()
    } else {
        dlen
    };
    NODE_HDR_SIZE + klen + body + 2
}

fn branch_size(klen: usize) -> usize {
    NODE_HDR_SIZE + klen + 2
}

/// What the entry that caused a split carries.
#[derive(Clone, Copy)]
pub(crate) enum SplitItem<'a> {
    Leaf(&'a [u8]),
    Branch(Pgno),
}

/// Node payload copied out of a page so the borrow on the source page can
/// end before the destination page is mutated.
pub(crate) enum OwnedNodeData {
    Child(Pgno),
    Inline(Vec<u8>),
    Overflow { head: Pgno, size: u32 },
}

impl OwnedNodeData {
    pub fn as_node_data(&self) -> NodeData<'_> {
        match self {
            OwnedNodeData::Child(pgno) => NodeData::Child(*pgno),
            OwnedNodeData::Inline(v) => NodeData::Inline(v),
            OwnedNodeData::Overflow { head, size } => NodeData::Overflow {
                head: *head,
                size: *size,
            },
        }
    }
}

impl Txn<'_> {
    /// Looks up `key`, returning the value or `None` when absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let res = self.get_inner(key);
        self.db.cache.prune();
        res
    }

    fn get_inner(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf = match self.search_page(Some(key), false, None) {
            Ok(pgno) => pgno,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        match self.search_node(leaf, key)? {
            NodePos::Exact(i) => Ok(Some(self.read_data(leaf, i)?)),
            _ => Ok(None),
        }
    }

    /// Materializes the value of leaf node `(pgno, i)`, following the
    /// overflow chain for BIGDATA nodes.
    pub(crate) fn read_data(&mut self, pgno: Pgno, i: usize) -> Result<Vec<u8>> {
        let (size, mut next) = {
            let e = self.page(pgno)?;
            if !e.page.node_is_bigdata(i) {
                return Ok(e.page.node_value(i).to_vec());
            }
            (e.page.node_data_size(i), e.page.node_overflow(i))
        };

        let max = self.db.head.psize as usize - PAGE_HDR_SIZE;
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            if next == 0 {
                return Err(Error::corrupted(format!(
                    "overflow chain for page {pgno} ended {} bytes early",
                    size - out.len()
                )));
            }
            let e = self.page(next)?;
            if !e.page.is_overflow() {
                return Err(Error::corrupted(format!(
                    "page {next} in overflow chain is not an overflow page"
                )));
            }
            let take = (size - out.len()).min(max);
            out.extend_from_slice(&e.page.overflow_body()[..take]);
            next = e.page.next_pgno();
        }
        Ok(out)
    }

    /// Inserts `key -> value`, overwriting any existing binding.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.rdonly {
            return Err(Error::ReadOnly);
        }
        if self.poisoned {
            return Err(Error::Invalid("transaction poisoned by earlier error"));
        }
        validate_key(key)?;
        if value.len() >= u32::MAX as usize {
            return Err(Error::Invalid("value too large"));
        }
        // A page must always be able to hold three nodes, otherwise a
        // split has no key to promote. Only outsized keys (or large
        // values still under the overflow threshold) on small pages can
        // violate this.
        let psize = self.db.head.psize as usize;
        if leaf_size(psize, key.len(), value.len()) > (psize - PAGE_HDR_SIZE) / 3 {
            return Err(Error::Invalid("key/value pair too large for this page size"));
        }
        let res = self.put_inner(key, value);
        self.db.cache.prune();
        res
    }

    fn put_inner(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let (leaf, ki, existed) = match self.search_page(Some(key), true, None) {
            Ok(pgno) => match self.search_node(pgno, key)? {
                NodePos::Exact(i) => {
                    // Same semantics as an overwrite: drop the old node
                    // and insert the new one in its place.
                    self.page_mut(pgno)?.page.del_node(i);
                    (pgno, i, true)
                }
                NodePos::Greater(i) => (pgno, i, false),
                NodePos::End => {
                    let n = self.page(pgno)?.page.num_keys();
                    (pgno, n, false)
                }
            },
            Err(Error::NotFound) => {
                // Empty tree: the first leaf becomes the root.
                let pgno = self.new_page(P_LEAF)?;
                self.root = pgno;
                self.db.meta.depth += 1;
                (pgno, 0, false)
            }
            Err(e) => return Err(e),
        };

        let psize = self.db.head.psize as usize;
        let fits = self.page(leaf)?.page.size_left() >= leaf_size(psize, key.len(), value.len());

        let res = if fits {
            let prefix_len = self.page(leaf)?.prefix.len();
            debug_assert!(key.len() >= prefix_len);
            let data = if value.len() >= psize / MIN_KEYS {
                let head = self.write_overflow(value)?;
                NodeData::Overflow {
                    head,
                    size: value.len() as u32,
                }
            } else {
                NodeData::Inline(value)
            };
            self.page_mut(leaf)?
                .page
                .add_node(ki, &key[prefix_len..], data, 0)
        } else {
            self.split(leaf, ki, key, SplitItem::Leaf(value)).map(|_| ())
        };

        match res {
            Ok(()) => {
                if !existed {
                    self.db.meta.entries += 1;
                }
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Writes `value` across a fresh chain of overflow pages and returns
    /// the head page number.
    pub(crate) fn write_overflow(&mut self, value: &[u8]) -> Result<Pgno> {
        let max = self.db.head.psize as usize - PAGE_HDR_SIZE;
        let head = self.new_page(P_OVERFLOW)?;
        let mut pgno = head;
        let mut done = 0usize;
        loop {
            let take = (value.len() - done).min(max);
            let next = if value.len() - done > max {
                Some(self.new_page(P_OVERFLOW)?)
            } else {
                None
            };
            {
                let e = self.page_mut(pgno)?;
                e.page.overflow_body_mut()[..take].copy_from_slice(&value[done..done + take]);
                e.page.set_next_pgno(next.unwrap_or(0));
            }
            done += take;
            match next {
                Some(n) => pgno = n,
                None => break,
            }
        }
        Ok(head)
    }

    /// Splits page `mp` and inserts the new entry at logical index
    /// `newindx` (as if unsplit) into whichever sibling it falls in.
    /// `newkey` is the full (unstripped) key. Returns the page and slot
    /// the new entry landed at.
    ///
    /// Splitting the root first grows a new branch root above it;
    /// inserting the separator may recursively split the parent.
    pub(crate) fn split(
        &mut self,
        mp: Pgno,
        newindx: usize,
        newkey: &[u8],
        item: SplitItem<'_>,
    ) -> Result<(Pgno, usize)> {
        let psize = self.db.head.psize as usize;
        let orig_prefix: KeyBuf = self.page(mp)?.prefix.clone();

        // Grow a new root when splitting the current one.
        let (parent, mp_pindex) = match self.page(mp)?.parent {
            Some(p) => p,
            None => {
                let parent = self.new_page(P_BRANCH)?;
                self.root = parent;
                self.db.meta.depth += 1;
                self.page_mut(parent)?
                    .page
                    .add_node(0, b"", NodeData::Child(mp), 0)?;
                self.page_mut(mp)?.parent = Some((parent, 0));
                (parent, 0)
            }
        };

        let flags = self.page(mp)?.page.flags();
        let pright = self.new_page(flags)?;
        self.page_mut(pright)?.parent = Some((parent, mp_pindex + 1));

        // Scratch copy of the full page, then reset it for re-insertion.
        let copy = self.page(mp)?.page.clone();
        self.page_mut(mp)?.page.clear();

        let n = copy.num_keys();
        let split_indx = n / 2 + 1;

        // Separator between the siblings, in the old-prefix-stripped
        // space of `mp`.
        let mut sep: KeyBuf = if newindx == split_indx {
            KeyBuf::from_slice(&newkey[orig_prefix.len()..])
        } else {
            KeyBuf::from_slice(copy.node_key(split_indx))
        };
        if copy.is_leaf() {
            // Shortest separator still above the last left-hand key.
            let len = reduce_separator(copy.node_key(split_indx - 1), &sep);
            sep.truncate(len);
        }

        let mut full_sep: KeyBuf = orig_prefix.clone();
        full_sep.extend_from_slice(&sep);

        // Hand the separator to the parent, splitting it too if needed.
        let parent_fits = self.page(parent)?.page.size_left() >= branch_size(full_sep.len());
        if parent_fits {
            let pplen = self.page(parent)?.prefix.len();
            debug_assert!(full_sep.len() >= pplen);
            let stripped = KeyBuf::from_slice(&full_sep[pplen..]);
            self.page_mut(parent)?.page.add_node(
                mp_pindex + 1,
                &stripped,
                NodeData::Child(pright),
                0,
            )?;
        } else {
            let (rp, ri) = self.split(parent, mp_pindex + 1, &full_sep, SplitItem::Branch(pright))?;
            self.page_mut(pright)?.parent = Some((rp, ri));
            // The left page may have moved under the parent's new right
            // sibling as well.
            if rp != parent && mp_pindex >= self.page(parent)?.page.num_keys() {
                self.page_mut(mp)?.parent = Some((rp, ri - 1));
            }
        }

        // Prefixes of both siblings may have tightened now that the
        // separator bounds them.
        self.find_common_prefix(pright)?;
        let right_prefix: KeyBuf = self.page(pright)?.prefix.clone();
        self.find_common_prefix(mp)?;
        let left_prefix: KeyBuf = self.page(mp)?.prefix.clone();
        debug_assert!(left_prefix.len() >= orig_prefix.len());
        debug_assert!(right_prefix.len() >= orig_prefix.len());
        let left_diff = left_prefix.len() - orig_prefix.len();
        let right_diff = right_prefix.len() - orig_prefix.len();

        // Re-insert all entries, the new one at its logical position.
        let is_leaf = copy.is_leaf();
        let mut landing = None;
        let mut j_left = 0usize;
        let mut j_right = 0usize;
        for pos in 0..=n {
            let old_index = if pos == newindx {
                None
            } else if pos < newindx {
                Some(pos)
            } else {
                Some(pos - 1)
            };

            let goes_right = match old_index {
                Some(i) => i >= split_indx,
                None => newindx >= split_indx,
            };
            let (dst, pfx_diff, j) = if goes_right {
                (pright, right_diff, &mut j_right)
            } else {
                (mp, left_diff, &mut j_left)
            };

            match old_index {
                None => {
                    let side_prefix_len = if goes_right {
                        right_prefix.len()
                    } else {
                        left_prefix.len()
                    };
                    let stripped = &newkey[side_prefix_len..];
                    let key: &[u8] = if !is_leaf && *j == 0 { b"" } else { stripped };
                    let data = match item {
                        SplitItem::Leaf(value) => {
                            if value.len() >= psize / MIN_KEYS {
                                let head = self.write_overflow(value)?;
                                NodeData::Overflow {
                                    head,
                                    size: value.len() as u32,
                                }
                            } else {
                                NodeData::Inline(value)
                            }
                        }
                        SplitItem::Branch(pgno) => NodeData::Child(pgno),
                    };
                    self.page_mut(dst)?.page.add_node(*j, key, data, 0)?;
                    landing = Some((dst, *j));
                }
                Some(i) => {
                    let stored = copy.node_key(i);
                    debug_assert!(stored.len() >= pfx_diff || (!is_leaf && i == 0));
                    let key: &[u8] = if !is_leaf && *j == 0 {
                        b""
                    } else {
                        &stored[pfx_diff..]
                    };
                    let data = if is_leaf {
                        if copy.node_is_bigdata(i) {
                            NodeData::Overflow {
                                head: copy.node_overflow(i),
                                size: copy.node_data_size(i) as u32,
                            }
                        } else {
                            NodeData::Inline(copy.node_value(i))
                        }
                    } else {
                        NodeData::Child(copy.node_child(i))
                    };
                    self.page_mut(dst)?
                        .page
                        .add_node(*j, key, data, copy.node_flags(i))?;
                }
            }
            *j += 1;
        }

        landing.ok_or_else(|| Error::corrupted("split failed to place the new entry"))
    }
}
