//! Prefix engine.
//!
//! Every branch/leaf page has an effective key prefix: the longest common
//! byte prefix of the two ancestor separators bounding the page's key
//! range. Keys are stored with that prefix removed and reconstructed on
//! read (Bayer/Unterauer prefix B-trees). The prefix is not persisted; it
//! is recomputed from the separators whenever a descent or sibling move
//! enters the page.

use crate::error::{Error, Result};
use crate::storage::Pgno;
use crate::txn::Txn;

use super::KeyBuf;

/// Length of the longest common prefix of `a` and `b`.
pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Shortest length to which `sep` can be truncated while still comparing
/// greater than `min`. `min` must sort strictly below `sep`.
pub(crate) fn reduce_separator(min: &[u8], sep: &[u8]) -> usize {
    debug_assert!(min < sep);
    let n = common_prefix_len(min, sep);
    debug_assert!(n < sep.len());
    (n + 1).min(sep.len())
}

impl Txn<'_> {
    /// Full key of node `indx` on `pgno`: the page's prefix concatenated
    /// with the stored key bytes.
    pub(crate) fn expand_prefix(&mut self, pgno: Pgno, indx: usize) -> Result<KeyBuf> {
        let e = self.page(pgno)?;
        let mut key = e.prefix.clone();
        key.extend_from_slice(e.page.node_key(indx));
        Ok(key)
    }

    /// Recomputes the effective prefix of `pgno` from its bounding
    /// ancestor separators and stores it on the cache entry.
    ///
    /// The lower bound is the nearest non-leftmost ancestor separator on
    /// the left, the upper bound the nearest non-rightmost one on the
    /// right. With both bounds present the prefix is their longest common
    /// prefix; with only one, the parent's prefix is inherited; a page
    /// with no parent has no prefix.
    pub(crate) fn find_common_prefix(&mut self, pgno: Pgno) -> Result<()> {
        let mut lbound = None;
        let mut lp = pgno;
        while let Some((parent, indx)) = self.page(lp)?.parent {
            if indx > 0 {
                lbound = Some((parent, indx));
                break;
            }
            lp = parent;
        }

        let mut ubound = None;
        let mut up = pgno;
        while let Some((parent, indx)) = self.page(up)?.parent {
            if indx + 1 < self.page(parent)?.page.num_keys() {
                ubound = Some((parent, indx + 1));
                break;
            }
            up = parent;
        }

        let prefix = match (lbound, ubound) {
            (Some((lpg, li)), Some((upg, ui))) => {
                let lkey = self.expand_prefix(lpg, li)?;
                let ukey = self.expand_prefix(upg, ui)?;
                let n = common_prefix_len(&lkey, &ukey);
                KeyBuf::from_slice(&ukey[..n])
            }
            _ => match self.page(pgno)?.parent {
                Some((parent, _)) => self.page(parent)?.prefix.clone(),
                None => KeyBuf::new(),
            },
        };

        self.page_mut(pgno)?.prefix = prefix;
        Ok(())
    }

    /// Rewrites every key on `pgno` after the page's prefix changed by
    /// `delta` bytes. For a grown prefix the leading `delta` bytes are
    /// stripped from each stored key; for a shrunk one the bytes that
    /// fell out of `former` (the previous prefix) are prepended.
    ///
    /// On branch pages slot 0 is skipped: its implicit low key has no
    /// bytes to adjust.
    pub(crate) fn adjust_prefix(&mut self, pgno: Pgno, former: &[u8], delta: isize) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let (n, first) = {
            let e = self.page(pgno)?;
            (e.page.num_keys(), if e.page.is_branch() { 1 } else { 0 })
        };
        for i in first..n {
            let key: KeyBuf = {
                let e = self.page(pgno)?;
                let stored = e.page.node_key(i);
                if delta > 0 {
                    KeyBuf::from_slice(&stored[delta as usize..])
                } else {
                    let fell_out = &former[former.len() - (-delta) as usize..];
                    let mut k = KeyBuf::from_slice(fell_out);
                    k.extend_from_slice(stored);
                    k
                }
            };
            self.page_mut(pgno)?
                .page
                .update_key(i, &key)
                .map_err(|_| Error::corrupted(format!("prefix adjust overflowed page {pgno}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_prefix_of_disjoint_keys_is_empty() {
        assert_eq!(common_prefix_len(b"abc", b"xyz"), 0);
        assert_eq!(common_prefix_len(b"", b"xyz"), 0);
        assert_eq!(common_prefix_len(b"abc", b""), 0);
    }

    #[test]
    fn common_prefix_stops_at_first_difference() {
        assert_eq!(common_prefix_len(b"keyA", b"keyB"), 3);
        assert_eq!(common_prefix_len(b"key", b"keyB"), 3);
        assert_eq!(common_prefix_len(b"same", b"same"), 4);
    }

    #[test]
    fn reduce_separator_keeps_one_distinguishing_byte() {
        assert_eq!(reduce_separator(b"apple", b"banana"), 1);
        assert_eq!(reduce_separator(b"keyA", b"keyB"), 4);
        assert_eq!(reduce_separator(b"key", b"keyB"), 4);
    }
}
