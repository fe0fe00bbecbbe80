//! Page-granular file I/O.
//!
//! The file is only ever written by appending whole pages at the end;
//! existing pages are immutable. Reads are positioned at `pgno * psize`.
//! A writer transaction holds a non-blocking exclusive advisory lock on
//! the file for its whole lifetime, so at most one writer exists per file
//! across all processes.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use fs2::FileExt as _;

use crate::error::{Error, Result};

use super::{Page, Pgno};

pub(crate) struct DbFile {
    file: File,
    psize: u32,
}

impl DbFile {
    pub fn new(file: File, psize: u32) -> DbFile {
        DbFile { file, psize }
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Reads page `pgno` into a fresh buffer and checks the self-stored
    /// page number against the requested one.
    pub fn read_page(&self, pgno: Pgno) -> Result<Page> {
        let psize = self.psize as usize;
        let mut buf = vec![0u8; psize].into_boxed_slice();
        self.file
            .read_exact_at(&mut buf, pgno as u64 * self.psize as u64)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => {
                    Error::corrupted(format!("short read of page {pgno}"))
                }
                _ => Error::Io(e),
            })?;
        let page = Page::from_buf(buf);
        if page.pgno() != pgno {
            return Err(Error::corrupted(format!(
                "page {} stores page number {}",
                pgno,
                page.pgno()
            )));
        }
        page.validate()?;
        Ok(page)
    }

    /// Appends one gathered batch of whole pages at the end of the file.
    /// Callers allocate page numbers sequentially from the file length, so
    /// append order equals page-number order.
    pub fn append(&mut self, batch: &[u8]) -> Result<()> {
        debug_assert_eq!(batch.len() % self.psize as usize, 0);
        self.file.write_all(batch)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Truncates (or zero-extends) the file to `len` bytes; used to repair
    /// torn-commit padding before the first write of a transaction.
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Non-blocking exclusive advisory lock; `Busy` when another writer
    /// holds it.
    pub fn lock_exclusive(&self) -> Result<()> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::Busy),
            // Some platforms report contention as EAGAIN (11) or the BSD
            // EAGAIN value (35) instead of WouldBlock.
            Err(e) if e.raw_os_error() == Some(11) || e.raw_os_error() == Some(35) => {
                Err(Error::Busy)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn unlock(&self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Opens (or creates) the database file in append mode.
pub(crate) fn open_file(path: &Path, read_only: bool, mode: u32) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut opts = std::fs::OpenOptions::new();
    if read_only {
        opts.read(true);
    } else {
        opts.read(true).write(true).append(true).create(true).mode(mode);
    }
    Ok(opts.open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{P_LEAF, PAGE_HDR_SIZE};

    fn scratch_file(psize: u32) -> (tempfile::TempDir, DbFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let file = open_file(&path, false, 0o644).unwrap();
        (dir, DbFile::new(file, psize))
    }

    #[test]
    fn append_then_read_round_trips() {
        let (_dir, mut f) = scratch_file(512);
        let mut page = Page::new(512, 0, P_LEAF);
        page.buf_mut()[PAGE_HDR_SIZE] = 0xEE;
        f.append(page.buf()).unwrap();

        let read = f.read_page(0).unwrap();
        assert_eq!(read.pgno(), 0);
        assert_eq!(read.buf()[PAGE_HDR_SIZE], 0xEE);
    }

    #[test]
    fn read_detects_pgno_mismatch() {
        let (_dir, mut f) = scratch_file(512);
        let page = Page::new(512, 3, P_LEAF);
        f.append(page.buf()).unwrap();

        let err = f.read_page(0).unwrap_err();
        assert!(err.to_string().contains("stores page number"));
    }

    #[test]
    fn read_past_end_is_a_short_read() {
        let (_dir, f) = scratch_file(512);
        let err = f.read_page(9).unwrap_err();
        assert!(err.to_string().contains("short read"));
    }

    #[test]
    fn second_exclusive_lock_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let a = DbFile::new(open_file(&path, false, 0o644).unwrap(), 512);
        let b = DbFile::new(open_file(&path, false, 0o644).unwrap(), 512);

        a.lock_exclusive().unwrap();
        assert!(matches!(b.lock_exclusive(), Err(Error::Busy)));

        a.unlock();
        b.lock_exclusive().unwrap();
    }
}
