//! In-page binary search and root-to-leaf descent.

use crate::cursor::Frame;
use crate::error::{Error, Result};
use crate::storage::{Pgno, P_INVALID};
use crate::txn::Txn;

use super::cmp_prefixed;

/// Result of an in-page binary search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodePos {
    /// Exact match at this slot.
    Exact(usize),
    /// Smallest slot whose key compares greater than the query.
    Greater(usize),
    /// Every key on the page compares less than the query.
    End,
}

impl Txn<'_> {
    /// Binary search within a page for the smallest node whose key is
    /// greater than or equal to the query. Branch pages skip slot 0, whose
    /// implicit key is minus infinity. The stored keys are compared with
    /// the page's effective prefix accounted for.
    pub(crate) fn search_node(&mut self, pgno: Pgno, key: &[u8]) -> Result<NodePos> {
        let e = self.page(pgno)?;
        let page = &e.page;
        let n = page.num_keys();

        let mut low: isize = if page.is_leaf() { 0 } else { 1 };
        let mut high = n as isize - 1;
        let mut i = 0usize;
        let mut last = None;
        while low <= high {
            let mid = ((low + high) >> 1) as usize;
            let ord = cmp_prefixed(key, &e.prefix, page.node_key(mid));
            i = mid;
            last = Some(ord);
            match ord {
                std::cmp::Ordering::Equal => break,
                std::cmp::Ordering::Greater => low = mid as isize + 1,
                std::cmp::Ordering::Less => high = mid as isize - 1,
            }
        }

        Ok(match last {
            Some(std::cmp::Ordering::Equal) => NodePos::Exact(i),
            Some(std::cmp::Ordering::Less) => NodePos::Greater(i),
            Some(std::cmp::Ordering::Greater) => {
                if i + 1 >= n {
                    NodePos::End
                } else {
                    NodePos::Greater(i + 1)
                }
            }
            // Nothing was compared: an empty leaf, or a branch holding
            // only the implicit slot.
            None => NodePos::End,
        })
    }

    /// Descends from the transaction's root to the leaf a key belongs in
    /// and returns the leaf's page number. With `key == None` the descent
    /// follows slot 0 to the leftmost leaf. Each entered page gets its
    /// parent back-reference and effective prefix recomputed; with
    /// `modify` every page on the path is touched copy-on-write. A cursor
    /// stack, when given, records the descent.
    pub(crate) fn search_page(
        &mut self,
        key: Option<&[u8]>,
        modify: bool,
        mut cursor: Option<&mut Vec<Frame>>,
    ) -> Result<Pgno> {
        debug_assert!(cursor.is_none() || !modify);
        if self.poisoned {
            return Err(Error::Invalid("transaction poisoned by earlier error"));
        }

        let mut pgno = self.root;
        if pgno == P_INVALID {
            return Err(Error::NotFound);
        }

        self.ensure_page(pgno)?;
        {
            let e = self.page_mut(pgno)?;
            e.parent = None;
            e.prefix.clear();
        }
        if modify {
            pgno = self.touch(pgno)?;
            self.root = pgno;
        }
        if let Some(stack) = cursor.as_mut() {
            stack.push(Frame { pgno, ki: 0 });
            self.db.cache.ref_inc(pgno);
        }

        loop {
            let (is_branch, n) = {
                let e = self.page(pgno)?;
                (e.page.is_branch(), e.page.num_keys())
            };
            if !is_branch {
                break;
            }

            let i = match key {
                None => 0,
                Some(k) => match self.search_node(pgno, k)? {
                    NodePos::Exact(i) => i,
                    NodePos::Greater(i) => i - 1,
                    NodePos::End => n - 1,
                },
            };

            if let Some(stack) = cursor.as_mut() {
                if let Some(top) = stack.last_mut() {
                    top.ki = i;
                }
            }

            let child = self.page(pgno)?.page.node_child(i);
            self.ensure_page(child)?;
            self.page_mut(child)?.parent = Some((pgno, i));
            self.find_common_prefix(child)?;

            let child = if modify { self.touch(child)? } else { child };
            if let Some(stack) = cursor.as_mut() {
                stack.push(Frame {
                    pgno: child,
                    ki: 0,
                });
                self.db.cache.ref_inc(child);
            }
            pgno = child;
        }

        if !self.page(pgno)?.page.is_leaf() {
            return Err(Error::corrupted(format!(
                "descent ended on non-leaf page {pgno}"
            )));
        }
        Ok(pgno)
    }

    /// Leftmost leaf of the subtree rooted at `pgno`, descending slot 0
    /// and refreshing parent/prefix state on the way down.
    pub(crate) fn leftmost_leaf(&mut self, mut pgno: Pgno) -> Result<Pgno> {
        loop {
            if self.page(pgno)?.page.is_leaf() {
                return Ok(pgno);
            }
            let child = self.page(pgno)?.page.node_child(0);
            self.ensure_page(child)?;
            self.page_mut(child)?.parent = Some((pgno, 0));
            self.find_common_prefix(child)?;
            pgno = child;
        }
    }
}
