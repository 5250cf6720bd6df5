//! The Pager is responsible for reading and writing the pages of one
//! container file.
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::page::Page;
use crate::page_id::PageId;
use crate::PAGE_SIZE;

pub struct Pager {
    file: File,
    path: PathBuf,
    container: u16,
    num_pages: u32,
}

impl Pager {
    /// Opens the container file, creating it and its parent directories if
    /// they don't exist.
    pub fn open<P: AsRef<Path>>(path: P, container: u16) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;
        debug!(?path, container, num_pages, "opened container");

        Ok(Self {
            file,
            path,
            container,
            num_pages,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container(&self) -> u16 {
        self.container
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Reads a page. Pages beyond the end of the file come back fresh and
    /// empty; pages that were never written read as all zeroes and skip the
    /// checksum test.
    pub fn read_page(&mut self, number: u32) -> Result<Page> {
        let id = PageId::new(self.container, number);
        if number >= self.num_pages {
            trace!(page = %id, "page beyond end of file, returning fresh page");
            return Ok(Page::new(id));
        }

        let mut buf = [0u8; PAGE_SIZE];
        self.file
            .seek(SeekFrom::Start(number as u64 * PAGE_SIZE as u64))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let read = self.file.read(&mut buf[filled..])?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        let page = Page::from_bytes(id, &buf)?;
        if page.is_zeroed() {
            return Ok(Page::new(id));
        }
        if Page::stored_checksum(&buf) != Page::compute_checksum(&buf) {
            return Err(StoreError::Checksum(id));
        }
        Ok(page)
    }

    /// Writes a page, stamping its checksum. Durability requires `sync`.
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        if page.id.container() != self.container {
            return Err(StoreError::fatal(
                page.id,
                format!("page written to container {}", self.container),
            ));
        }
        let mut buf = *page.as_bytes();
        Page::stamp_checksum(&mut buf);
        let number = page.id.number();
        self.file
            .seek(SeekFrom::Start(number as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(&buf)?;
        if number >= self.num_pages {
            self.num_pages = number + 1;
        }
        trace!(page = %page.id, lsn = page.lsn(), "wrote page");
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
