//! Disk manager for page-level file I/O.

use opal_common::page::{PageId, PAGE_SIZE};
use opal_common::{OpalError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Path to the data file.
    pub path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/opal.dat"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading and writing pages to a single data file.
///
/// Pages are addressed by their `PageId`; the byte offset of page `n` is
/// `n * PAGE_SIZE`. Writing past the current end of file extends it.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// Open file handle and page count.
    inner: Mutex<DiskInner>,
}

struct DiskInner {
    file: File,
    num_pages: u32,
}

impl DiskManager {
    /// Opens (or creates) the data file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            config,
            inner: Mutex::new(DiskInner { file, num_pages }),
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Returns the number of pages currently in the file.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut inner = self.inner.lock();

        if !page_id.is_valid() || page_id.as_u32() >= inner.num_pages {
            return Err(OpalError::PageNotFound {
                page_id: page_id.as_u32(),
            });
        }

        let offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;

        let mut buf = [0u8; PAGE_SIZE];
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes a page to disk, extending the file if necessary.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(OpalError::PageNotFound {
                page_id: page_id.as_u32(),
            });
        }
        if data.len() != PAGE_SIZE {
            return Err(OpalError::Internal(format!(
                "page write of {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            )));
        }

        let mut inner = self.inner.lock();
        let offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;

        if self.config.fsync_enabled {
            inner.file.sync_data()?;
        }

        inner.num_pages = inner.num_pages.max(page_id.as_u32() + 1);
        Ok(())
    }

    /// Forces all buffered writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}
