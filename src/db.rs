//! Database handle.
//!
//! A `Db` owns the file descriptor, the immutable file header, the
//! current meta snapshot and the page cache. Opening an existing file
//! validates the header and scans backward for the newest meta page whose
//! SHA-256 hash verifies; opening a missing path creates the header page.
//!
//! The page size of a new database comes from the filesystem's preferred
//! I/O block size, capped at 32 KiB, and is fixed for the file's
//! lifetime.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::{
    open_file, unix_now, CachedPage, DbFile, Head, Meta, Page, PageCache, Pgno,
    DEFAULT_MAX_CACHE, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, META_TOMBSTONE, MIN_PAGE_SIZE,
    PAGE_HDR_SIZE, P_HEAD, P_INVALID, P_META,
};

/// Configuration for opening a database. The defaults match
/// [`Db::open`]: read-write, synchronous commits, a 1024-page cache and a
/// page size chosen from the filesystem.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    read_only: bool,
    no_sync: bool,
    mode: u32,
    cache_size: usize,
    page_size: Option<u32>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            read_only: false,
            no_sync: false,
            mode: 0o644,
            cache_size: DEFAULT_MAX_CACHE,
            page_size: None,
        }
    }
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    /// Open the file read-only; write transactions fail with
    /// [`Error::ReadOnly`].
    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    /// Skip fsync after commit, trading durability for throughput.
    pub fn no_sync(mut self, yes: bool) -> Self {
        self.no_sync = yes;
        self
    }

    /// Unix permission bits for a newly created file.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Page cache capacity, in pages.
    pub fn cache_size(mut self, pages: usize) -> Self {
        self.cache_size = pages;
        self
    }

    /// Page size for a newly created database; ignored when the file
    /// already exists. Must lie within [512, 32768].
    pub fn page_size(mut self, psize: u32) -> Self {
        self.page_size = Some(psize);
        self
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<Db> {
        Db::open_with(path.as_ref(), self.clone())
    }
}

/// Tree statistics from the current meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub psize: u32,
    pub depth: u32,
    pub branch_pages: u32,
    pub leaf_pages: u32,
    pub overflow_pages: u32,
    pub revisions: u32,
    pub entries: u64,
}

/// An open database.
pub struct Db {
    pub(crate) file: DbFile,
    pub(crate) cache: PageCache,
    pub(crate) head: Head,
    pub(crate) meta: Meta,
    /// Page number of the meta page `meta` was read from; `P_INVALID`
    /// for an empty database.
    pub(crate) meta_pgno: Pgno,
    /// File size at the last meta read; growth triggers a rescan.
    pub(crate) size: u64,
    /// A torn commit left a partial page at the end; the next writer
    /// truncates up to alignment before its first write.
    pub(crate) fix_padding: bool,
    pub(crate) read_only: bool,
    no_sync: bool,
    path: PathBuf,
    pub(crate) opts: OpenOptions,
}

impl Db {
    /// Opens `path` with default options, creating the file if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Db> {
        OpenOptions::new().open(path.as_ref())
    }

    /// Options builder for non-default opens.
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    fn open_with(path: &Path, opts: OpenOptions) -> Result<Db> {
        let file = open_file(path, opts.read_only, opts.mode)?;
        let len = file.metadata()?.len();

        let head = if len == 0 {
            if opts.read_only {
                return Err(Error::Invalid("cannot create a database in read-only mode"));
            }
            let psize = match opts.page_size {
                Some(p) => p,
                None => preferred_page_size(&file),
            };
            if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&psize) {
                return Err(Error::Invalid("page size out of range"));
            }
            let head = Head { flags: 0, psize };
            let mut page = Page::new(psize as usize, 0, P_HEAD);
            head.write_to(&mut page);
            let mut dbfile = DbFile::new(file, psize);
            dbfile.append(page.buf())?;
            debug!(path = %path.display(), psize, "created database");
            return Self::finish_open(dbfile, head, path, opts);
        } else {
            use std::os::unix::fs::FileExt;
            let mut buf = [0u8; PAGE_HDR_SIZE + 16];
            file.read_exact_at(&mut buf, 0).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::corrupted("file too short for header page")
                } else {
                    Error::Io(e)
                }
            })?;
            let flags = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
            if flags & P_HEAD == 0 {
                return Err(Error::corrupted("page 0 is not a header page"));
            }
            let head = Head::read_from(&buf[PAGE_HDR_SIZE..])?;
            if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&head.psize) {
                return Err(Error::corrupted(format!(
                    "page size {} out of range",
                    head.psize
                )));
            }
            head
        };

        let dbfile = DbFile::new(file, head.psize);
        Self::finish_open(dbfile, head, path, opts)
    }

    fn finish_open(file: DbFile, head: Head, path: &Path, opts: OpenOptions) -> Result<Db> {
        let mut db = Db {
            file,
            cache: PageCache::new(opts.cache_size),
            head,
            meta: Meta::empty(),
            meta_pgno: P_INVALID,
            size: 0,
            fix_padding: false,
            read_only: opts.read_only,
            no_sync: opts.no_sync,
            path: path.to_path_buf(),
            opts,
        };
        db.read_meta()?;
        debug!(
            path = %db.path.display(),
            psize = db.head.psize,
            root = db.meta.root,
            revisions = db.meta.revisions,
            entries = db.meta.entries,
            "opened database"
        );
        Ok(db)
    }

    /// Re-reads the newest valid meta page if the file grew since the
    /// last read. Returns the next unallocated page number. Fails with
    /// [`Error::Stale`] when the newest meta is a tombstone.
    pub(crate) fn read_meta(&mut self) -> Result<Pgno> {
        let psize = self.head.psize as u64;
        let size = self.file.len()?;
        if size < self.size {
            return Err(Error::corrupted("database file shrank"));
        }

        if size == psize {
            // Only the header page: an empty database.
            return Ok(1);
        }

        let mut next_pgno = (size / psize) as Pgno;
        if next_pgno == 0 {
            return Err(Error::corrupted("file smaller than one page"));
        }
        let mut meta_pgno = next_pgno - 1;
        if size % psize != 0 {
            self.fix_padding = true;
            next_pgno += 1;
        }

        if size == self.size {
            // Nothing appended since the last scan.
            if self.meta.is_tombstoned() {
                return Err(Error::Stale);
            }
            return Ok(next_pgno);
        }
        self.size = size;

        while meta_pgno > 0 {
            let meta = match self.cache_page(meta_pgno) {
                Ok(entry) => Meta::read_from(&entry.page),
                Err(_) => {
                    warn!(pgno = meta_pgno, "skipping unreadable page in meta scan");
                    None
                }
            };
            if let Some(meta) = meta {
                if meta.is_tombstoned() {
                    return Err(Error::Stale);
                }
                self.meta = meta;
                self.meta_pgno = meta_pgno;
                return Ok(next_pgno);
            }
            meta_pgno -= 1;
        }
        Err(Error::corrupted("no valid meta page found"))
    }

    /// Makes sure `pgno` is resident in the cache, reading it from the
    /// file if necessary.
    pub(crate) fn cache_page(&mut self, pgno: Pgno) -> Result<&CachedPage> {
        if !self.cache.contains(pgno) {
            let page = self.file.read_page(pgno)?;
            self.cache.insert(pgno, CachedPage::new(page));
        }
        self.cache
            .get(pgno)
            .ok_or_else(|| Error::corrupted(format!("page {pgno} vanished from cache")))
    }

    /// Flushes the file to stable storage unless the database was opened
    /// with `no_sync`.
    pub fn sync(&self) -> Result<()> {
        if self.no_sync {
            return Ok(());
        }
        self.file.sync()
    }

    /// Adjusts the page cache capacity.
    pub fn set_cache_size(&mut self, pages: usize) {
        self.cache.set_capacity(pages);
    }

    /// Tree statistics from the current meta.
    pub fn stat(&self) -> Stat {
        Stat {
            psize: self.head.psize,
            depth: self.meta.depth,
            branch_pages: self.meta.branch_pages,
            leaf_pages: self.meta.leaf_pages,
            overflow_pages: self.meta.overflow_pages,
            revisions: self.meta.revisions,
            entries: self.meta.entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reverts the database to its previous committed revision by
    /// republishing the newest valid meta page older than the current
    /// one. The revert is itself a durable revision: a fresh meta page is
    /// appended restoring the older root and counters.
    pub fn revert(&mut self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.file.lock_exclusive()?;
        let res = self.revert_inner();
        self.file.unlock();
        res
    }

    fn revert_inner(&mut self) -> Result<()> {
        self.read_meta()?;
        if self.meta_pgno == P_INVALID {
            return Err(Error::NotFound);
        }

        let mut pgno = self.meta_pgno;
        let previous = loop {
            if pgno <= 1 {
                return Err(Error::NotFound);
            }
            pgno -= 1;
            let found = match self.cache_page(pgno) {
                Ok(entry) => Meta::read_from(&entry.page),
                Err(_) => None,
            };
            if let Some(m) = found {
                if !m.is_tombstoned() {
                    break m;
                }
            }
        };

        self.publish_meta(Meta {
            flags: 0,
            root: previous.root,
            prev_root: self.meta.root,
            created_at: unix_now(),
            branch_pages: previous.branch_pages,
            leaf_pages: previous.leaf_pages,
            overflow_pages: previous.overflow_pages,
            revisions: self.meta.revisions + 1,
            depth: previous.depth,
            entries: previous.entries,
        })?;
        debug!(
            root = self.meta.root,
            revision = self.meta.revisions,
            "reverted to previous revision"
        );
        Ok(())
    }

    /// Appends a meta page outside any transaction (revert, tombstone).
    /// The caller holds the exclusive lock.
    pub(crate) fn publish_meta(&mut self, meta: Meta) -> Result<()> {
        let psize = self.head.psize as u64;
        if self.fix_padding {
            let len = self.file.len()?;
            self.file.set_len(len + (psize - len % psize) % psize)?;
            self.fix_padding = false;
        }
        let pgno = (self.file.len()? / psize) as Pgno;
        let mut page = Page::new(psize as usize, pgno, P_META);
        meta.write_to(&mut page);
        self.file.append(page.buf())?;
        self.sync()?;

        self.meta = meta;
        self.meta_pgno = pgno;
        self.size = self.file.len()?;
        self.cache.insert(pgno, CachedPage::new(page));
        Ok(())
    }

    /// Appends a tombstone meta marking this file as superseded; other
    /// handles observe [`Error::Stale`] on their next meta read.
    pub(crate) fn write_tombstone(&mut self) -> Result<()> {
        let m = self.meta;
        self.publish_meta(Meta {
            flags: META_TOMBSTONE,
            root: P_INVALID,
            prev_root: m.root,
            created_at: unix_now(),
            revisions: m.revisions + 1,
            ..m
        })
    }
}

/// Preferred I/O block size of the filesystem, capped to what a 16-bit
/// page offset can address.
fn preferred_page_size(file: &std::fs::File) -> u32 {
    match file.metadata() {
        Ok(md) => {
            let blk = md.blksize();
            if blk == 0 {
                DEFAULT_PAGE_SIZE
            } else {
                (blk.min(MAX_PAGE_SIZE as u64) as u32).max(MIN_PAGE_SIZE)
            }
        }
        Err(_) => DEFAULT_PAGE_SIZE,
    }
}
