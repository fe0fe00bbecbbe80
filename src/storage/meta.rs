//! Header and meta page content.
//!
//! Page 0 carries the immutable file header: magic, format version and the
//! page size every other page obeys. Meta pages are appended after the
//! data pages of each commit and anchor a revision: they name the root
//! page, carry the tree counters, and end in a SHA-256 hash over all
//! preceding meta bytes. A torn meta write therefore fails verification
//! and the opener falls back to the previous valid meta page.
//!
//! ## Meta Content Layout (80 bytes, after the page header)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------------
//! 0       4     flags (TOMBSTONE)
//! 4       4     root pgno (0xFFFFFFFF = empty tree)
//! 8       4     previous root pgno
//! 12      8     creation time (unix seconds)
//! 20      4     branch_pages
//! 24      4     leaf_pages
//! 28      4     overflow_pages
//! 32      4     revisions
//! 36      4     depth
//! 40      8     entries
//! 48      32    SHA-256 over bytes 0..48
//! ```

use sha2::{Digest, Sha256};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

use super::{Page, Pgno, MAGIC, PAGE_HDR_SIZE, P_INVALID, VERSION};

/// Meta flag: the file has been superseded by compaction.
pub(crate) const META_TOMBSTONE: u32 = 0x01;

const META_CONTENT_SIZE: usize = 80;
const META_HASH_OFFSET: usize = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeadContent {
    magic: U32,
    version: U32,
    flags: U32,
    psize: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaContent {
    flags: U32,
    root: U32,
    prev_root: U32,
    created_at: U64,
    branch_pages: U32,
    leaf_pages: U32,
    overflow_pages: U32,
    revisions: U32,
    depth: U32,
    entries: U64,
    hash: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<MetaContent>() == META_CONTENT_SIZE);
const _: () = assert!(std::mem::size_of::<HeadContent>() == 16);

/// In-memory copy of the file header content.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Head {
    pub flags: u32,
    pub psize: u32,
}

impl Head {
    /// Serializes the header into page 0's content area.
    pub fn write_to(&self, page: &mut Page) {
        let body = &mut page.buf_mut()[PAGE_HDR_SIZE..PAGE_HDR_SIZE + 16];
        let head = HeadContent {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            flags: U32::new(self.flags),
            psize: U32::new(self.psize),
        };
        body.copy_from_slice(head.as_bytes());
    }

    /// Parses and validates the header content read from page 0.
    pub fn read_from(bytes: &[u8]) -> Result<Head> {
        if bytes.len() < 16 {
            return Err(Error::corrupted("file too short for header page"));
        }
        let head = HeadContent::ref_from_bytes(&bytes[..16])
            .map_err(|_| Error::corrupted("unreadable header page"))?;
        if head.magic.get() != MAGIC {
            return Err(Error::corrupted(format!(
                "bad magic {:#010x}",
                head.magic.get()
            )));
        }
        if head.version.get() != VERSION {
            return Err(Error::corrupted(format!(
                "unsupported format version {}",
                head.version.get()
            )));
        }
        Ok(Head {
            flags: head.flags.get(),
            psize: head.psize.get(),
        })
    }
}

/// In-memory copy of the current meta page content. The hash is computed
/// at write time and verified at read time, never stored here.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Meta {
    pub flags: u32,
    pub root: Pgno,
    pub prev_root: Pgno,
    pub created_at: u64,
    pub branch_pages: u32,
    pub leaf_pages: u32,
    pub overflow_pages: u32,
    pub revisions: u32,
    pub depth: u32,
    pub entries: u64,
}

impl Meta {
    /// Meta state of a freshly created, empty database.
    pub fn empty() -> Meta {
        Meta {
            flags: 0,
            root: P_INVALID,
            prev_root: P_INVALID,
            created_at: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            revisions: 0,
            depth: 0,
            entries: 0,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.flags & META_TOMBSTONE != 0
    }

    /// Serializes the meta content into a META page, hash included.
    pub fn write_to(&self, page: &mut Page) {
        let mut content = MetaContent {
            flags: U32::new(self.flags),
            root: U32::new(self.root),
            prev_root: U32::new(self.prev_root),
            created_at: U64::new(self.created_at),
            branch_pages: U32::new(self.branch_pages),
            leaf_pages: U32::new(self.leaf_pages),
            overflow_pages: U32::new(self.overflow_pages),
            revisions: U32::new(self.revisions),
            depth: U32::new(self.depth),
            entries: U64::new(self.entries),
            hash: [0u8; 32],
        };
        let digest: [u8; 32] = Sha256::digest(&content.as_bytes()[..META_HASH_OFFSET]).into();
        content.hash = digest;
        page.buf_mut()[PAGE_HDR_SIZE..PAGE_HDR_SIZE + META_CONTENT_SIZE]
            .copy_from_slice(content.as_bytes());
    }

    /// Validates `page` as a meta page: META flag set, root older than the
    /// meta page itself, and a matching hash. Returns the decoded meta on
    /// success.
    pub fn read_from(page: &Page) -> Option<Meta> {
        if !page.is_meta() {
            return None;
        }
        let bytes = &page.buf()[PAGE_HDR_SIZE..PAGE_HDR_SIZE + META_CONTENT_SIZE];
        let content = MetaContent::ref_from_bytes(bytes).ok()?;
        if content.root.get() >= page.pgno() && content.root.get() != P_INVALID {
            return None;
        }
        let digest: [u8; 32] = Sha256::digest(&bytes[..META_HASH_OFFSET]).into();
        if digest != content.hash {
            return None;
        }
        Some(Meta {
            flags: content.flags.get(),
            root: content.root.get(),
            prev_root: content.prev_root.get(),
            created_at: content.created_at.get(),
            branch_pages: content.branch_pages.get(),
            leaf_pages: content.leaf_pages.get(),
            overflow_pages: content.overflow_pages.get(),
            revisions: content.revisions.get(),
            depth: content.depth.get(),
            entries: content.entries.get(),
        })
    }
}

/// Unix time in seconds; stamps new meta pages.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{P_LEAF, P_META};

    fn sample_meta() -> Meta {
        Meta {
            flags: 0,
            root: 5,
            prev_root: 2,
            created_at: 1_700_000_000,
            branch_pages: 1,
            leaf_pages: 3,
            overflow_pages: 0,
            revisions: 4,
            depth: 2,
            entries: 123,
        }
    }

    #[test]
    fn meta_round_trips_through_page() {
        let mut page = Page::new(4096, 9, P_META);
        sample_meta().write_to(&mut page);

        let meta = Meta::read_from(&page).expect("valid meta");
        assert_eq!(meta.root, 5);
        assert_eq!(meta.prev_root, 2);
        assert_eq!(meta.revisions, 4);
        assert_eq!(meta.depth, 2);
        assert_eq!(meta.entries, 123);
    }

    #[test]
    fn meta_rejects_tampered_bytes() {
        let mut page = Page::new(4096, 9, P_META);
        sample_meta().write_to(&mut page);
        page.buf_mut()[PAGE_HDR_SIZE + 4] ^= 0xFF;
        assert!(Meta::read_from(&page).is_none());
    }

    #[test]
    fn meta_rejects_wrong_page_flags() {
        let mut page = Page::new(4096, 9, P_LEAF);
        sample_meta().write_to(&mut page);
        assert!(Meta::read_from(&page).is_none());
    }

    #[test]
    fn meta_rejects_root_newer_than_itself() {
        let mut page = Page::new(4096, 3, P_META);
        sample_meta().write_to(&mut page);
        assert!(Meta::read_from(&page).is_none());
    }

    #[test]
    fn empty_root_is_accepted() {
        let mut page = Page::new(4096, 1, P_META);
        let mut meta = sample_meta();
        meta.root = P_INVALID;
        meta.write_to(&mut page);
        assert!(Meta::read_from(&page).is_some());
    }

    #[test]
    fn head_round_trips_and_validates() {
        let mut page = Page::new(4096, 0, crate::storage::P_HEAD);
        let head = Head {
            flags: 0,
            psize: 4096,
        };
        head.write_to(&mut page);

        let parsed = Head::read_from(&page.buf()[PAGE_HDR_SIZE..]).unwrap();
        assert_eq!(parsed.psize, 4096);
    }

    #[test]
    fn head_rejects_bad_magic() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x42;
        let err = Head::read_from(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }
}
