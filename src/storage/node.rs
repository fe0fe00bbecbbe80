//! Node codec for branch and leaf pages.
//!
//! A node is a variable-length record addressed through the page's slot
//! array. Its 7-byte header holds either the child page number (branch) or
//! the value size (leaf), followed by the key size and a flags byte:
//!
//! ```text
//! Offset  Size  Field    Description
//! ------  ----  -------  -------------------------------------------
//! 0       4     payload  Child pgno (branch) or value size (leaf)
//! 4       2     ksize    Stored key length (prefix already stripped)
//! 6       1     flags    BIGDATA: value lives on an overflow chain
//! 7       ...   key      Key bytes
//! 7+k     ...   value    Value bytes, or 4-byte overflow head pgno
//! ```
//!
//! Keys are stored with the page's common prefix removed; callers strip
//! before insertion and reconstruct on read.

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

use super::{Page, Pgno};

pub(crate) const NODE_HDR_SIZE: usize = 7;

/// Leaf-node flag: the value is stored on an overflow chain and the node
/// payload holds the chain's head page number.
pub(crate) const F_BIGDATA: u8 = 0x01;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    payload: U32,
    ksize: U16,
    flags: u8,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HDR_SIZE);

/// What a new node carries besides its key.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NodeData<'a> {
    /// Branch node: a child page number, no value.
    Child(Pgno),
    /// Leaf node with the value stored inline.
    Inline(&'a [u8]),
    /// Leaf node whose value of `size` bytes lives on the overflow chain
    /// starting at `head`.
    Overflow { head: Pgno, size: u32 },
}

impl Page {
    fn node_hdr(&self, i: usize) -> &NodeHeader {
        let at = self.slot(i);
        NodeHeader::ref_from_bytes(&self.buf()[at..at + NODE_HDR_SIZE]).expect("7-byte node header")
    }

    fn node_hdr_mut(&mut self, i: usize) -> &mut NodeHeader {
        let at = self.slot(i);
        NodeHeader::mut_from_bytes(&mut self.buf_mut()[at..at + NODE_HDR_SIZE])
            .expect("7-byte node header")
    }

    pub fn node_ksize(&self, i: usize) -> usize {
        self.node_hdr(i).ksize.get() as usize
    }

    pub fn node_flags(&self, i: usize) -> u8 {
        self.node_hdr(i).flags
    }

    pub fn node_is_bigdata(&self, i: usize) -> bool {
        self.node_flags(i) & F_BIGDATA != 0
    }

    /// Stored (prefix-stripped) key bytes of node `i`.
    pub fn node_key(&self, i: usize) -> &[u8] {
        let at = self.slot(i) + NODE_HDR_SIZE;
        &self.buf()[at..at + self.node_ksize(i)]
    }

    /// Child page number of branch node `i`.
    pub fn node_child(&self, i: usize) -> Pgno {
        debug_assert!(self.is_branch());
        self.node_hdr(i).payload.get()
    }

    pub fn set_node_child(&mut self, i: usize, pgno: Pgno) {
        debug_assert!(self.is_branch());
        self.node_hdr_mut(i).payload = U32::new(pgno);
    }

    /// True value size of leaf node `i` (inline or on-chain).
    pub fn node_data_size(&self, i: usize) -> usize {
        debug_assert!(self.is_leaf());
        self.node_hdr(i).payload.get() as usize
    }

    /// Inline value bytes of leaf node `i`; for BIGDATA nodes this is the
    /// 4-byte overflow head pgno.
    pub fn node_value(&self, i: usize) -> &[u8] {
        debug_assert!(self.is_leaf());
        let at = self.slot(i) + NODE_HDR_SIZE + self.node_ksize(i);
        let len = if self.node_is_bigdata(i) {
            std::mem::size_of::<Pgno>()
        } else {
            self.node_data_size(i)
        };
        &self.buf()[at..at + len]
    }

    /// Overflow chain head of a BIGDATA leaf node.
    pub fn node_overflow(&self, i: usize) -> Pgno {
        debug_assert!(self.node_is_bigdata(i));
        let v = self.node_value(i);
        Pgno::from_le_bytes([v[0], v[1], v[2], v[3]])
    }

    pub fn set_node_overflow(&mut self, i: usize, head: Pgno) {
        debug_assert!(self.node_is_bigdata(i));
        let at = self.slot(i) + NODE_HDR_SIZE + self.node_ksize(i);
        self.buf_mut()[at..at + 4].copy_from_slice(&head.to_le_bytes());
    }

    /// Bytes occupied by node `i`, header included.
    fn node_size(&self, i: usize) -> usize {
        let mut sz = NODE_HDR_SIZE + self.node_ksize(i);
        if self.is_leaf() {
            sz += if self.node_is_bigdata(i) {
                std::mem::size_of::<Pgno>()
            } else {
                self.node_data_size(i)
            };
        }
        sz
    }

    /// Inserts a node at slot `indx`, shifting higher slots up. The key
    /// must already be stripped of the page's prefix. Fails when the node
    /// does not fit; callers check free space and split beforehand.
    pub fn add_node(
        &mut self,
        indx: usize,
        key: &[u8],
        data: NodeData<'_>,
        flags: u8,
    ) -> Result<()> {
        let body_len = match data {
            NodeData::Child(_) => 0,
            NodeData::Inline(v) => v.len(),
            NodeData::Overflow { .. } => std::mem::size_of::<Pgno>(),
        };
        let node_size = NODE_HDR_SIZE + key.len() + body_len;

        if node_size + 2 > self.size_left() {
            return Err(Error::corrupted(format!(
                "node of {} bytes does not fit page {} ({} free)",
                node_size,
                self.pgno(),
                self.size_left()
            )));
        }

        // Move higher slots up by one.
        let n = self.num_keys();
        debug_assert!(indx <= n);
        for i in (indx + 1..=n).rev() {
            let v = self.slot(i - 1);
            self.set_slot(i, v);
        }

        let ofs = self.upper() - node_size;
        self.set_slot(indx, ofs);
        self.set_upper(ofs);
        self.set_lower(self.lower() + 2);

        let (payload, flags) = match data {
            NodeData::Child(pgno) => (pgno, flags),
            NodeData::Inline(v) => (v.len() as u32, flags),
            NodeData::Overflow { size, .. } => (size, flags | F_BIGDATA),
        };
        {
            let hdr = self.node_hdr_mut(indx);
            hdr.payload = U32::new(payload);
            hdr.ksize = U16::new(key.len() as u16);
            hdr.flags = flags;
        }

        let key_at = ofs + NODE_HDR_SIZE;
        self.buf_mut()[key_at..key_at + key.len()].copy_from_slice(key);
        let body_at = key_at + key.len();
        match data {
            NodeData::Child(_) => {}
            NodeData::Inline(v) => {
                self.buf_mut()[body_at..body_at + v.len()].copy_from_slice(v);
            }
            NodeData::Overflow { head, .. } => {
                self.buf_mut()[body_at..body_at + 4].copy_from_slice(&head.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Removes node `indx`, compacting the payload region and re-pointing
    /// every surviving slot that sat below the removed node.
    pub fn del_node(&mut self, indx: usize) {
        let sz = self.node_size(indx);
        let ptr = self.slot(indx);
        let n = self.num_keys();

        let mut j = 0;
        for i in 0..n {
            if i == indx {
                continue;
            }
            let mut off = self.slot(i);
            if off < ptr {
                off += sz;
            }
            self.set_slot(j, off);
            j += 1;
        }

        let upper = self.upper();
        self.buf_mut().copy_within(upper..ptr, upper + sz);
        self.set_lower(self.lower() - 2);
        self.set_upper(upper + sz);
    }

    /// Replaces the key of node `indx`, shifting payloads when the size
    /// changes.
    pub fn update_key(&mut self, indx: usize, key: &[u8]) -> Result<()> {
        let ptr = self.slot(indx);
        let old = self.node_ksize(indx);

        if key.len() != old {
            let delta = key.len() as isize - old as isize;
            if delta > 0 && (self.size_left() as isize) < delta {
                return Err(Error::corrupted(format!(
                    "no room to grow key on page {}",
                    self.pgno()
                )));
            }

            let n = self.num_keys();
            for i in 0..n {
                let off = self.slot(i);
                if off <= ptr {
                    self.set_slot(i, (off as isize - delta) as usize);
                }
            }

            // Shift everything from the payload floor up to and including
            // this node's header; the key area resizes in place.
            let upper = self.upper();
            let end = ptr + NODE_HDR_SIZE;
            let dst = (upper as isize - delta) as usize;
            self.buf_mut().copy_within(upper..end, dst);
            self.set_upper(dst);

            self.node_hdr_mut(indx).ksize = U16::new(key.len() as u16);
        }

        let at = self.slot(indx) + NODE_HDR_SIZE;
        self.buf_mut()[at..at + key.len()].copy_from_slice(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{P_BRANCH, P_LEAF};

    fn leaf() -> Page {
        Page::new(4096, 1, P_LEAF)
    }

    #[test]
    fn add_and_read_inline_nodes() {
        let mut page = leaf();
        page.add_node(0, b"bb", NodeData::Inline(b"2"), 0).unwrap();
        page.add_node(0, b"aa", NodeData::Inline(b"1"), 0).unwrap();
        page.add_node(2, b"cc", NodeData::Inline(b"3"), 0).unwrap();

        assert_eq!(page.num_keys(), 3);
        assert_eq!(page.node_key(0), b"aa");
        assert_eq!(page.node_key(1), b"bb");
        assert_eq!(page.node_key(2), b"cc");
        assert_eq!(page.node_value(0), b"1");
        assert_eq!(page.node_value(1), b"2");
        assert_eq!(page.node_value(2), b"3");
    }

    #[test]
    fn add_branch_child_pointers() {
        let mut page = Page::new(4096, 1, P_BRANCH);
        page.add_node(0, b"", NodeData::Child(11), 0).unwrap();
        page.add_node(1, b"m", NodeData::Child(22), 0).unwrap();

        assert_eq!(page.node_child(0), 11);
        assert_eq!(page.node_child(1), 22);
        assert_eq!(page.node_ksize(0), 0);

        page.set_node_child(1, 33);
        assert_eq!(page.node_child(1), 33);
    }

    #[test]
    fn bigdata_node_stores_head_pgno() {
        let mut page = leaf();
        page.add_node(0, b"k", NodeData::Overflow { head: 42, size: 9000 }, 0)
            .unwrap();

        assert!(page.node_is_bigdata(0));
        assert_eq!(page.node_data_size(0), 9000);
        assert_eq!(page.node_overflow(0), 42);

        page.set_node_overflow(0, 43);
        assert_eq!(page.node_overflow(0), 43);
    }

    #[test]
    fn del_node_reclaims_space_and_repoints_slots() {
        let mut page = leaf();
        page.add_node(0, b"aa", NodeData::Inline(b"111"), 0).unwrap();
        page.add_node(1, b"bb", NodeData::Inline(b"222"), 0).unwrap();
        page.add_node(2, b"cc", NodeData::Inline(b"333"), 0).unwrap();
        let free_before = page.size_left();

        page.del_node(1);

        assert_eq!(page.num_keys(), 2);
        assert_eq!(page.node_key(0), b"aa");
        assert_eq!(page.node_key(1), b"cc");
        assert_eq!(page.node_value(0), b"111");
        assert_eq!(page.node_value(1), b"333");
        assert_eq!(page.size_left(), free_before + NODE_HDR_SIZE + 2 + 3 + 2);
    }

    #[test]
    fn del_then_add_reuses_space() {
        let mut page = leaf();
        page.add_node(0, b"k1", NodeData::Inline(b"v1"), 0).unwrap();
        let free_empty = page.size_left();
        page.del_node(0);
        page.add_node(0, b"k2", NodeData::Inline(b"v2"), 0).unwrap();
        assert_eq!(page.size_left(), free_empty);
        assert_eq!(page.node_key(0), b"k2");
    }

    #[test]
    fn add_node_rejects_overfull_page() {
        let mut page = Page::new(512, 1, P_LEAF);
        let big = vec![0xAAu8; 600];
        let err = page.add_node(0, b"k", NodeData::Inline(&big), 0).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[test]
    fn update_key_grows_and_shrinks() {
        let mut page = leaf();
        page.add_node(0, b"aa", NodeData::Inline(b"first"), 0).unwrap();
        page.add_node(1, b"mm", NodeData::Inline(b"second"), 0).unwrap();
        page.add_node(2, b"zz", NodeData::Inline(b"third"), 0).unwrap();

        page.update_key(1, b"mmmm").unwrap();
        assert_eq!(page.node_key(1), b"mmmm");
        assert_eq!(page.node_value(1), b"second");
        assert_eq!(page.node_value(0), b"first");
        assert_eq!(page.node_value(2), b"third");

        page.update_key(1, b"m").unwrap();
        assert_eq!(page.node_key(1), b"m");
        assert_eq!(page.node_value(1), b"second");
        assert_eq!(page.node_key(0), b"aa");
        assert_eq!(page.node_key(2), b"zz");
    }

    #[test]
    fn update_key_same_size_overwrites_in_place() {
        let mut page = leaf();
        page.add_node(0, b"ab", NodeData::Inline(b"v"), 0).unwrap();
        let free = page.size_left();
        page.update_key(0, b"cd").unwrap();
        assert_eq!(page.node_key(0), b"cd");
        assert_eq!(page.size_left(), free);
    }
}
