//! Deletion, rebalancing, node moves and page merges.
//!
//! A page whose fill ratio drops below the threshold after a delete
//! either borrows one node from a well-filled sibling (move) or is merged
//! with a sibling, which may cascade the rebalance up to the root. The
//! root itself collapses instead: an empty root leaf empties the tree, a
//! single-child root branch is replaced by its child.

use tracing::trace;

use crate::error::{Error, Result};
use crate::storage::{Pgno, FILL_THRESHOLD, P_INVALID};
use crate::txn::Txn;

use super::{common_prefix_len, validate_key, KeyBuf, NodePos};
use super::tree::OwnedNodeData;

impl Txn<'_> {
    /// Deletes `key`, returning its value. Fails with
    /// [`Error::NotFound`] when the key is absent.
    pub fn del(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        if self.rdonly {
            return Err(Error::ReadOnly);
        }
        if self.poisoned {
            return Err(Error::Invalid("transaction poisoned by earlier error"));
        }
        validate_key(key)?;
        let res = self.del_inner(key);
        self.db.cache.prune();
        res
    }

    fn del_inner(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let leaf = self.search_page(Some(key), true, None)?;
        let i = match self.search_node(leaf, key)? {
            NodePos::Exact(i) => i,
            _ => return Err(Error::NotFound),
        };

        let value = self.read_data(leaf, i)?;
        self.page_mut(leaf)?.page.del_node(i);
        self.db.meta.entries -= 1;
        if let Err(e) = self.rebalance(leaf) {
            self.poisoned = true;
            return Err(e);
        }
        Ok(value)
    }

    /// Restores the fill invariant for `pgno` after a deletion.
    pub(crate) fn rebalance(&mut self, pgno: Pgno) -> Result<()> {
        let (fill, n, is_leaf, parent) = {
            let e = self.page(pgno)?;
            (e.page.fill(), e.page.num_keys(), e.page.is_leaf(), e.parent)
        };
        if fill >= FILL_THRESHOLD {
            return Ok(());
        }
        trace!(pgno, fill, "rebalancing underfull page");

        let (parent, pindex) = match parent {
            Some(p) => p,
            None => {
                // Root page.
                if n == 0 {
                    self.root = P_INVALID;
                    self.db.meta.depth -= 1;
                    if is_leaf {
                        self.db.meta.leaf_pages -= 1;
                    } else {
                        self.db.meta.branch_pages -= 1;
                    }
                } else if !is_leaf && n == 1 {
                    // A branch root with a single child collapses.
                    let child = self.page(pgno)?.page.node_child(0);
                    self.root = child;
                    self.ensure_page(child)?;
                    {
                        let e = self.page_mut(child)?;
                        e.parent = None;
                        e.prefix.clear();
                    }
                    self.db.meta.depth -= 1;
                    self.db.meta.branch_pages -= 1;
                }
                return Ok(());
            }
        };

        // Pick a neighbor: the right sibling when leftmost, the left one
        // otherwise.
        let (neighbor, src, srcindx, dst, dstindx, merge_into_self) = if pindex == 0 {
            let npgno = self.page(parent)?.page.node_child(pindex + 1);
            self.ensure_page(npgno)?;
            self.page_mut(npgno)?.parent = Some((parent, pindex + 1));
            let di = self.page(pgno)?.page.num_keys();
            (npgno, npgno, 0, pgno, di, true)
        } else {
            let npgno = self.page(parent)?.page.node_child(pindex - 1);
            self.ensure_page(npgno)?;
            self.page_mut(npgno)?.parent = Some((parent, pindex - 1));
            let si = self.page(npgno)?.page.num_keys() - 1;
            (npgno, npgno, si, pgno, 0, false)
        };

        let (nfill, nkeys) = {
            let e = self.page(neighbor)?;
            (e.page.fill(), e.page.num_keys())
        };
        if nfill >= FILL_THRESHOLD && nkeys >= 2 {
            self.move_node(src, srcindx, dst, dstindx)
        } else if merge_into_self {
            self.merge(neighbor, pgno)
        } else {
            self.merge(pgno, neighbor)
        }
    }

    /// Full key of the node at `(pgno, indx)`; for the implicit slot 0 of
    /// a branch this is the smallest key in its subtree.
    fn true_key(&mut self, pgno: Pgno, indx: usize) -> Result<KeyBuf> {
        let is_branch = self.page(pgno)?.page.is_branch();
        if is_branch && indx == 0 {
            let low = self.leftmost_leaf(pgno)?;
            self.expand_prefix(low, 0)
        } else {
            self.expand_prefix(pgno, indx)
        }
    }

    fn owned_node_data(&mut self, pgno: Pgno, indx: usize) -> Result<(OwnedNodeData, u8)> {
        let e = self.page(pgno)?;
        let flags = e.page.node_flags(indx);
        let data = if e.page.is_branch() {
            OwnedNodeData::Child(e.page.node_child(indx))
        } else if e.page.node_is_bigdata(indx) {
            OwnedNodeData::Overflow {
                head: e.page.node_overflow(indx),
                size: e.page.node_data_size(indx) as u32,
            }
        } else {
            OwnedNodeData::Inline(e.page.node_value(indx).to_vec())
        };
        Ok((data, flags))
    }

    /// Moves one node from `src` to `dst` (siblings under the same
    /// parent), keeping prefixes, parent separators and the moved child's
    /// own prefix consistent.
    pub(crate) fn move_node(
        &mut self,
        src: Pgno,
        srcindx: usize,
        dst: Pgno,
        dstindx: usize,
    ) -> Result<()> {
        self.find_common_prefix(src)?;
        let src_is_branch = self.page(src)?.page.is_branch();

        // A moved branch node drags a child whose prefix may change.
        let moved_child = if src_is_branch {
            let child = self.page(src)?.page.node_child(srcindx);
            self.ensure_page(child)?;
            self.page_mut(child)?.parent = Some((src, srcindx));
            self.find_common_prefix(child)?;
            Some((child, self.page(child)?.prefix.clone()))
        } else {
            None
        };

        let src = self.touch(src)?;
        let dst = self.touch(dst)?;

        // The moving key's true bytes, reconstructed with the source
        // prefix.
        let full_key = self.true_key(src, srcindx)?;

        // Shrink the destination prefix if the incoming key does not
        // share all of it.
        self.find_common_prefix(dst)?;
        let dst_prefix: KeyBuf = self.page(dst)?.prefix.clone();
        let shared = common_prefix_len(&full_key, &dst_prefix);
        if shared != dst_prefix.len() {
            self.adjust_prefix(dst, &dst_prefix, shared as isize - dst_prefix.len() as isize)?;
            self.page_mut(dst)?.prefix.truncate(shared);
        }

        let (data, flags) = self.owned_node_data(src, srcindx)?;
        let dst_is_branch = self.page(dst)?.page.is_branch();
        let (dst_parent, dst_pindex) = self
            .page(dst)?
            .parent
            .ok_or_else(|| Error::corrupted("move destination has no parent"))?;

        // Inserting in front of a branch page displaces its implicit
        // low node to slot 1, which then needs its real separator: the
        // page's old lower bound from the parent.
        if dstindx == 0 && dst_is_branch {
            let old_bound = self.expand_prefix(dst_parent, dst_pindex)?;
            let plen = self.page(dst)?.prefix.len();
            let stripped = KeyBuf::from_slice(&old_bound[plen..]);
            self.page_mut(dst)?.page.update_key(0, &stripped)?;
        }

        {
            let plen = self.page(dst)?.prefix.len();
            debug_assert!(full_key.len() >= plen);
            let stripped = KeyBuf::from_slice(&full_key[plen..]);
            self.page_mut(dst)?
                .page
                .add_node(dstindx, &stripped, data.as_node_data(), flags)?;
        }

        self.page_mut(src)?.page.del_node(srcindx);

        let (src_parent, src_pindex) = self
            .page(src)?
            .parent
            .ok_or_else(|| Error::corrupted("move source has no parent"))?;

        // Removing the first node changes the page's lower bound; push
        // the new one up as the parent separator. The new slot 0 still
        // holds its real key bytes here, blanking comes after.
        if srcindx == 0 && src_pindex != 0 {
            let new_bound = self.expand_prefix(src, 0)?;
            let plen = self.page(src_parent)?.prefix.len();
            let stripped = KeyBuf::from_slice(&new_bound[plen..]);
            self.page_mut(src_parent)?
                .page
                .update_key(src_pindex, &stripped)?;
        }
        if srcindx == 0 && src_is_branch {
            self.page_mut(src)?.page.update_key(0, b"")?;
        }

        if dstindx == 0 && dst_pindex != 0 {
            let new_bound = self.expand_prefix(dst, 0)?;
            let plen = self.page(dst_parent)?.prefix.len();
            let stripped = KeyBuf::from_slice(&new_bound[plen..]);
            self.page_mut(dst_parent)?
                .page
                .update_key(dst_pindex, &stripped)?;
        }
        if dstindx == 0 && dst_is_branch {
            self.page_mut(dst)?.page.update_key(0, b"")?;
        }

        // Both pages may have a new effective prefix now.
        for pgno in [src, dst] {
            let former: KeyBuf = self.page(pgno)?.prefix.clone();
            self.find_common_prefix(pgno)?;
            let new_len = self.page(pgno)?.prefix.len();
            if new_len != former.len() {
                self.adjust_prefix(pgno, &former, new_len as isize - former.len() as isize)?;
            }
        }

        // The moved child sits under a new separator; fix its prefix.
        if let Some((child, former)) = moved_child {
            if dst_is_branch {
                self.page_mut(child)?.parent = Some((dst, dstindx));
                self.find_common_prefix(child)?;
                let new_len = self.page(child)?.prefix.len();
                if new_len != former.len() {
                    let child = self.touch(child)?;
                    self.adjust_prefix(child, &former, new_len as isize - former.len() as isize)?;
                }
            }
        }

        Ok(())
    }

    /// Merges every node of `src` into `dst`, unlinks `src` from its
    /// parent and rebalances the parent.
    pub(crate) fn merge(&mut self, src: Pgno, dst: Pgno) -> Result<()> {
        let src = self.touch(src)?;
        let dst = self.touch(dst)?;

        self.find_common_prefix(src)?;
        self.find_common_prefix(dst)?;

        // The destination prefix must cover the incoming keys.
        let src_prefix: KeyBuf = self.page(src)?.prefix.clone();
        let dst_prefix: KeyBuf = self.page(dst)?.prefix.clone();
        let shared = common_prefix_len(&src_prefix, &dst_prefix);
        if shared != dst_prefix.len() {
            self.adjust_prefix(dst, &dst_prefix, shared as isize - dst_prefix.len() as isize)?;
            self.page_mut(dst)?.prefix.truncate(shared);
        }

        let n = self.page(src)?.page.num_keys();
        for i in 0..n {
            let full_key = self.true_key(src, i)?;
            let (data, flags) = self.owned_node_data(src, i)?;
            let at = self.page(dst)?.page.num_keys();
            let plen = self.page(dst)?.prefix.len();
            debug_assert!(full_key.len() >= plen);
            let stripped = KeyBuf::from_slice(&full_key[plen..]);
            self.page_mut(dst)?
                .page
                .add_node(at, &stripped, data.as_node_data(), flags)?;
        }

        let (src_parent, src_pindex) = self
            .page(src)?
            .parent
            .ok_or_else(|| Error::corrupted("merge source has no parent"))?;
        let src_is_leaf = self.page(src)?.page.is_leaf();

        self.page_mut(src_parent)?.page.del_node(src_pindex);
        if src_pindex == 0 {
            self.page_mut(src_parent)?.page.update_key(0, b"")?;
        }

        if src_is_leaf {
            self.db.meta.leaf_pages -= 1;
        } else {
            self.db.meta.branch_pages -= 1;
        }
        trace!(src, dst, "merged sibling pages");

        self.rebalance(src_parent)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Db;

    fn small_page_db(dir: &tempfile::TempDir) -> Db {
        Db::options()
            .page_size(512)
            .open(dir.path().join("rebalance.db"))
            .unwrap()
    }

    fn fill(db: &mut Db, n: u32) {
        db.update(|txn| {
            for i in 0..n {
                txn.put(format!("node:{:06}", i).as_bytes(), &[b'p'; 16])?;
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn draining_a_deep_tree_collapses_it_level_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = small_page_db(&dir);
        fill(&mut db, 400);
        assert!(db.stat().depth >= 3);

        db.update(|txn| {
            for i in 0..400u32 {
                txn.del(format!("node:{:06}", i).as_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        let stat = db.stat();
        assert_eq!(stat.entries, 0);
        assert_eq!(stat.depth, 0);
    }

    #[test]
    fn deleting_from_the_front_keeps_the_rest_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = small_page_db(&dir);
        fill(&mut db, 300);

        db.update(|txn| {
            for i in 0..250u32 {
                txn.del(format!("node:{:06}", i).as_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(db.stat().entries, 50);
        db.view(|txn| {
            for i in 250..300u32 {
                assert!(
                    txn.get(format!("node:{:06}", i).as_bytes())?.is_some(),
                    "lost node:{:06}",
                    i
                );
            }
            assert!(txn.get(b"node:000249")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn deleting_from_the_back_exercises_left_merges() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = small_page_db(&dir);
        fill(&mut db, 300);

        db.update(|txn| {
            for i in (50..300u32).rev() {
                txn.del(format!("node:{:06}", i).as_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(db.stat().entries, 50);
        db.view(|txn| {
            let mut cur = txn.cursor();
            let mut expect = 0u32;
            while let Some((key, _)) = cur.next()? {
                assert_eq!(key, format!("node:{:06}", expect).into_bytes());
                expect += 1;
            }
            assert_eq!(expect, 50);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn scattered_deletes_keep_order_and_counters_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = small_page_db(&dir);
        fill(&mut db, 360);

        db.update(|txn| {
            for i in 0..360u32 {
                if i % 4 != 3 {
                    txn.del(format!("node:{:06}", i).as_bytes())?;
                }
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(db.stat().entries, 90);
        db.view(|txn| {
            let mut cur = txn.cursor();
            let mut expected = (3..360u32).step_by(4);
            while let Some((key, _)) = cur.next()? {
                let want = expected.next().unwrap();
                assert_eq!(key, format!("node:{:06}", want).into_bytes());
            }
            assert!(expected.next().is_none());
            Ok(())
        })
        .unwrap();
    }
}
