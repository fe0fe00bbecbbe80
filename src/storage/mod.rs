//! # Storage Layer
//!
//! Everything that touches raw bytes lives here: the on-disk page format,
//! the node codec inside branch/leaf pages, the header/meta page anchors,
//! positioned file I/O, and the in-memory page cache.
//!
//! ## File Layout
//!
//! A database is a single file of fixed-size pages:
//!
//! ```text
//! +-------------+-------------+-------------+-------------+------
//! | page 0 HEAD | data page   | data page   | META page   | ...
//! +-------------+-------------+-------------+-------------+------
//! ```
//!
//! Page 0 holds the immutable file header (magic, version, page size).
//! Every commit appends its copy-on-write data pages followed by one meta
//! page; the newest meta page whose SHA-256 hash verifies anchors the
//! current tree. Nothing is ever overwritten in place, so a torn commit is
//! recovered by scanning backwards to the previous valid meta page.
//!
//! ## Page Header Layout (12 bytes)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       4     pgno       Page number (self-check on read)
//! 4       4     flags      BRANCH / LEAF / OVERFLOW / META / HEAD
//! 8       2     lower      Lower bound of free space (slot array end)
//! 10      2     upper      Upper bound of free space (payload start)
//! ```
//!
//! Overflow pages reuse bytes 8..12 as a single `next_pgno` link instead
//! of the free-space bounds.

mod cache;
mod file;
mod meta;
mod node;
mod page;

pub(crate) use cache::{CachedPage, PageCache};
pub(crate) use file::{open_file, DbFile};
pub(crate) use meta::{unix_now, Head, Meta, META_TOMBSTONE};
pub(crate) use node::{NodeData, NODE_HDR_SIZE};
pub(crate) use page::Page;

/// Page number; doubles as the page's offset in the file divided by the
/// page size.
pub type Pgno = u32;

/// Sentinel page number: "no page" (empty tree root, absent link).
pub const P_INVALID: Pgno = 0xFFFF_FFFF;

pub const P_BRANCH: u32 = 0x01;
pub const P_LEAF: u32 = 0x02;
pub const P_OVERFLOW: u32 = 0x04;
pub const P_META: u32 = 0x08;
pub const P_HEAD: u32 = 0x10;

pub const PAGE_HDR_SIZE: usize = 12;

pub const MAGIC: u32 = 0xB3DB_B3DB;
pub const VERSION: u32 = 4;

/// Keys are limited to 255 bytes so a stripped key plus a reconstructed
/// prefix always fits a fixed scratch buffer.
pub const MAX_KEY_SIZE: usize = 255;

/// Minimum keys per leaf; values of `psize / MIN_KEYS` bytes or more are
/// spilled to an overflow chain.
pub const MIN_KEYS: usize = 4;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;
pub const MIN_PAGE_SIZE: u32 = 512;

/// Maximum number of dirty pages written per gathered append at commit.
pub const COMMIT_BATCH: usize = 64;

/// Default page cache capacity, in pages.
pub const DEFAULT_MAX_CACHE: usize = 1024;

/// A page below this fill ratio (per mille of usable bytes) becomes a
/// rebalance candidate.
pub const FILL_THRESHOLD: usize = 250;
