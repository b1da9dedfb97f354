//! A minimal paged file store.
//!
//! Pages are fixed size and 1-indexed; page 1 begins with a 100-byte file
//! header (magic string plus the page size) the way a SQLite-family file
//! does, though nothing else in this crate inspects that header -- the
//! machine learns table/index root pages from the caller, not by parsing
//! a schema page. Read/write-through-to-file, simplified relative to a
//! full SQLite-style pager: no WAL, no journal, no page cache eviction
//! (pages are cached for the file's lifetime).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, ErrorCode, Result};

pub type Pgno = u32;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;

const HEADER_MAGIC: &[u8] = b"dbmachine format 1\0";
const HEADER_SIZE: usize = 100;
const PAGE_SIZE_OFFSET: usize = 18;

pub struct Pager {
    file: File,
    page_size: usize,
    page_count: Pgno,
    cache: HashMap<Pgno, Vec<u8>>,
}

impl Pager {
    /// Open an existing file, or create one with a fresh header page if it
    /// doesn't exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let existed = path.exists();
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;

        let mut pager = Pager { file, page_size: DEFAULT_PAGE_SIZE, page_count: 0, cache: HashMap::new() };

        if existed && pager.file.metadata()?.len() > 0 {
            pager.load_header()?;
        } else {
            pager.init_header()?;
        }
        tracing::debug!(page_size = pager.page_size, page_count = pager.page_count, "pager opened");
        Ok(pager)
    }

    fn load_header(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;
        let page_size = u16::from_be_bytes([header[PAGE_SIZE_OFFSET], header[PAGE_SIZE_OFFSET + 1]]) as usize;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::with_message(ErrorCode::IoError, "corrupt page size in file header"));
        }
        self.page_size = page_size;
        let len = self.file.metadata()?.len() as usize;
        self.page_count = (len / self.page_size) as Pgno;
        Ok(())
    }

    fn init_header(&mut self) -> Result<()> {
        let mut page = vec![0u8; self.page_size];
        page[..HEADER_MAGIC.len()].copy_from_slice(HEADER_MAGIC);
        page[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 2].copy_from_slice(&(self.page_size as u16).to_be_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&page)?;
        self.file.flush()?;
        self.page_count = 1;
        self.cache.insert(1, page);
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> Pgno {
        self.page_count
    }

    /// Read a page, filling the cache from disk on first access.
    pub fn read_page(&mut self, pgno: Pgno) -> Result<&[u8]> {
        if !self.cache.contains_key(&pgno) {
            let mut buf = vec![0u8; self.page_size];
            if pgno <= self.page_count {
                self.file.seek(SeekFrom::Start((pgno - 1) as u64 * self.page_size as u64))?;
                self.file.read_exact(&mut buf)?;
            }
            self.cache.insert(pgno, buf);
        }
        Ok(self.cache.get(&pgno).unwrap())
    }

    /// Overwrite a page's bytes, both in cache and on disk.
    pub fn write_page(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::with_message(ErrorCode::IoError, "page write size mismatch"));
        }
        self.file.seek(SeekFrom::Start((pgno - 1) as u64 * self.page_size as u64))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        self.cache.insert(pgno, data.to_vec());
        if pgno > self.page_count {
            self.page_count = pgno;
        }
        Ok(())
    }

    /// Allocate a new, zeroed page at the end of the file and return its number.
    pub fn allocate_page(&mut self) -> Result<Pgno> {
        let pgno = self.page_count + 1;
        self.write_page(pgno, &vec![0u8; self.page_size])?;
        tracing::debug!(pgno, "allocated page");
        Ok(pgno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_file_has_one_header_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.bin");
        let mut pager = Pager::open(&path).unwrap();
        assert_eq!(pager.page_count(), 1);
        let header = pager.read_page(1).unwrap().to_vec();
        assert_eq!(&header[..HEADER_MAGIC.len()], HEADER_MAGIC);
    }

    #[test]
    fn reopen_reads_back_the_same_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.bin");
        {
            Pager::open(&path).unwrap();
        }
        let pager = Pager::open(&path).unwrap();
        assert_eq!(pager.page_size(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn allocate_grows_the_page_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("db.bin")).unwrap();
        let p2 = pager.allocate_page().unwrap();
        assert_eq!(p2, 2);
        assert_eq!(pager.page_count(), 2);
    }
}
