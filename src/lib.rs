//! # stratadb — embeddable ordered key-value store
//!
//! stratadb stores an ordered key-value map in a single file organized as
//! an append-only, copy-on-write B+tree. Nothing is ever overwritten in
//! place: every commit appends its modified pages followed by a SHA-256
//! anchored meta page, so readers keep consistent snapshots for free and
//! a crash at any point recovers to the previous committed revision.
//!
//! ## Quick Start
//!
//! ```no_run
//! use stratadb::Db;
//!
//! # fn main() -> stratadb::Result<()> {
//! let mut db = Db::open("./data.strata")?;
//!
//! db.update(|txn| {
//!     txn.put(b"apple", b"red")?;
//!     txn.put(b"banana", b"yellow")
//! })?;
//!
//! db.view(|txn| {
//!     assert_eq!(txn.get(b"apple")?.as_deref(), Some(&b"red"[..]));
//!     let mut cur = txn.cursor();
//!     while let Some((key, value)) = cur.next()? {
//!         println!("{:?} = {:?}", key, value);
//!     }
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │   Db / OpenOptions (handle, meta)     │
//! ├───────────────────────────────────────┤
//! │   Txn (COW protocol, dirty queue)     │
//! ├──────────────────────┬────────────────┤
//! │   B+tree ops         │    Cursor      │
//! │   (search/split/     │   (ordered     │
//! │    rebalance/prefix) │    traversal)  │
//! ├──────────────────────┴────────────────┤
//! │   Page cache (LRU, pin counts)        │
//! ├───────────────────────────────────────┤
//! │   Pages / nodes / meta (zerocopy)     │
//! ├───────────────────────────────────────┤
//! │   Append-only page file (pread/flock) │
//! └───────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! The engine is single-threaded per handle: transactions mutably borrow
//! the `Db`, cursors mutably borrow their transaction. Across processes a
//! non-blocking exclusive file lock admits one writer at a time while
//! readers keep whatever root their transaction snapshotted.
//!
//! ## Durability
//!
//! Commit order is: data pages, fsync, meta page, fsync. The newest meta
//! page whose hash verifies wins at open; a torn tail is ignored and a
//! partially appended commit is truncated away by the next writer.
//! `no_sync` trades the fsyncs for throughput.
//!
//! ## Space
//!
//! Superseded pages are never reused in place; [`Db::compact`] rewrites
//! the live tree into a fresh file and tombstones the old one, and
//! [`Db::revert`] republishes the previous committed revision.

mod btree;
mod compact;
mod cursor;
mod db;
mod error;
mod storage;
mod txn;

pub use btree::cmp;
pub use cursor::Cursor;
pub use db::{Db, OpenOptions, Stat};
pub use error::{Error, Result};
pub use txn::Txn;
