//! On-disk page representation.
//!
//! A page is a fixed-size block whose first 12 bytes form the header. For
//! branch and leaf pages the header carries `lower`/`upper` free-space
//! bounds: a slot array of 2-byte payload offsets grows upward from
//! `lower`, node payloads grow downward from `upper`, and the gap between
//! them is the free space. Overflow pages reinterpret the bound bytes as a
//! `next_pgno` chain link and carry raw value bytes after the header.
//!
//! ```text
//! +--------------------+
//! | header (12 bytes)  |
//! +--------------------+
//! | slot array         |  <- grows up from lower
//! +--------------------+
//! | free space         |
//! +--------------------+
//! | node payloads      |  <- grow down from upper
//! +--------------------+
//! ```
//!
//! The `Page` type owns its buffer; header fields are accessed through
//! zerocopy views so the in-memory bytes are always the exact on-disk
//! bytes.

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

use super::{Pgno, P_BRANCH, P_LEAF, P_META, P_OVERFLOW, PAGE_HDR_SIZE};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct PageHeader {
    pgno: U32,
    flags: U32,
    lower: U16,
    upper: U16,
}

/// Header view for overflow pages: the free-space bounds are repurposed as
/// the chain link.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct OverflowHeader {
    pgno: U32,
    flags: U32,
    next_pgno: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HDR_SIZE);
const _: () = assert!(std::mem::size_of::<OverflowHeader>() == PAGE_HDR_SIZE);

/// An owned page buffer of exactly one page size.
#[derive(Clone)]
pub(crate) struct Page {
    buf: Box<[u8]>,
}

impl Page {
    /// Allocates a zeroed page with empty free-space bounds.
    pub fn new(psize: usize, pgno: Pgno, flags: u32) -> Self {
        let mut page = Page {
            buf: vec![0u8; psize].into_boxed_slice(),
        };
        let hdr = page.header_mut();
        hdr.pgno = U32::new(pgno);
        hdr.flags = U32::new(flags);
        hdr.lower = U16::new(PAGE_HDR_SIZE as u16);
        hdr.upper = U16::new(psize as u16);
        page
    }

    pub fn from_buf(buf: Box<[u8]>) -> Self {
        debug_assert!(buf.len() >= PAGE_HDR_SIZE);
        Page { buf }
    }

    pub fn psize(&self) -> usize {
        self.buf.len()
    }

    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn header(&self) -> &PageHeader {
        PageHeader::ref_from_bytes(&self.buf[..PAGE_HDR_SIZE]).expect("12-byte page header")
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::mut_from_bytes(&mut self.buf[..PAGE_HDR_SIZE]).expect("12-byte page header")
    }

    pub fn pgno(&self) -> Pgno {
        self.header().pgno.get()
    }

    pub fn set_pgno(&mut self, pgno: Pgno) {
        self.header_mut().pgno = U32::new(pgno);
    }

    pub fn flags(&self) -> u32 {
        self.header().flags.get()
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & P_LEAF != 0
    }

    pub fn is_branch(&self) -> bool {
        self.flags() & P_BRANCH != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.flags() & P_OVERFLOW != 0
    }

    pub fn is_meta(&self) -> bool {
        self.flags() & P_META != 0
    }

    pub fn lower(&self) -> usize {
        self.header().lower.get() as usize
    }

    pub fn upper(&self) -> usize {
        self.header().upper.get() as usize
    }

    pub fn set_lower(&mut self, lower: usize) {
        self.header_mut().lower = U16::new(lower as u16);
    }

    pub fn set_upper(&mut self, upper: usize) {
        self.header_mut().upper = U16::new(upper as u16);
    }

    /// Chain link of an overflow page; 0 terminates the chain.
    pub fn next_pgno(&self) -> Pgno {
        OverflowHeader::ref_from_bytes(&self.buf[..PAGE_HDR_SIZE])
            .expect("12-byte page header")
            .next_pgno
            .get()
    }

    pub fn set_next_pgno(&mut self, next: Pgno) {
        OverflowHeader::mut_from_bytes(&mut self.buf[..PAGE_HDR_SIZE])
            .expect("12-byte page header")
            .next_pgno = U32::new(next);
    }

    /// Payload region of an overflow page.
    pub fn overflow_body(&self) -> &[u8] {
        &self.buf[PAGE_HDR_SIZE..]
    }

    pub fn overflow_body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_HDR_SIZE..]
    }

    pub fn num_keys(&self) -> usize {
        (self.lower() - PAGE_HDR_SIZE) / 2
    }

    /// Free bytes between the slot array and the payload region.
    pub fn size_left(&self) -> usize {
        self.upper() - self.lower()
    }

    /// Fill ratio in per mille of usable bytes.
    pub fn fill(&self) -> usize {
        let usable = self.psize() - PAGE_HDR_SIZE;
        1000 * (usable - self.size_left()) / usable
    }

    /// Payload offset stored in slot `i`.
    pub fn slot(&self, i: usize) -> usize {
        debug_assert!(i < self.num_keys());
        let at = PAGE_HDR_SIZE + 2 * i;
        u16::from_le_bytes([self.buf[at], self.buf[at + 1]]) as usize
    }

    pub fn set_slot(&mut self, i: usize, offset: usize) {
        let at = PAGE_HDR_SIZE + 2 * i;
        self.buf[at..at + 2].copy_from_slice(&(offset as u16).to_le_bytes());
    }

    /// Resets the page to an empty branch/leaf, keeping pgno and flags.
    pub fn clear(&mut self) {
        let psize = self.psize();
        self.buf[PAGE_HDR_SIZE..].fill(0);
        self.set_lower(PAGE_HDR_SIZE);
        self.set_upper(psize);
    }

    /// Checks the free-space invariant after a page is read from disk.
    pub fn validate(&self) -> Result<()> {
        if self.is_overflow() || self.is_meta() {
            return Ok(());
        }
        let (lower, upper) = (self.lower(), self.upper());
        if lower < PAGE_HDR_SIZE || lower > upper || upper > self.psize() {
            return Err(Error::corrupted(format!(
                "page {} bounds out of range: lower={} upper={} psize={}",
                self.pgno(),
                lower,
                upper,
                self.psize()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("pgno", &self.pgno())
            .field("flags", &self.flags())
            .field("lower", &self.lower())
            .field("upper", &self.upper())
            .finish()
    }
}
