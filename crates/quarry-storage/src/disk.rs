//! File-backed disk manager.

use parking_lot::Mutex;
use quarry_buffer::DiskManager;
use quarry_common::page::{PageId, PAGE_SIZE};
use quarry_common::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Manages reading and writing pages to a single data file.
///
/// Pages live at `page_id * PAGE_SIZE`. Reads past the current end of the
/// file zero-fill the buffer: a freshly allocated page that was never
/// flushed must still be fetchable.
pub struct FileDiskManager {
    /// Path of the data file.
    path: PathBuf,
    /// Enable fsync after writes.
    fsync_enabled: bool,
    /// Open file handle and page count.
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: File,
    /// Number of pages the file currently covers.
    num_pages: u32,
}

impl FileDiskManager {
    /// Data file name inside the data directory.
    const FILE_NAME: &'static str = "quarry.db";

    /// Opens or creates the data file under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>, fsync_enabled: bool) -> Result<Self> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let path = data_dir.as_ref().join(Self::FILE_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            path,
            fsync_enabled,
            inner: Mutex::new(FileInner { file, num_pages }),
        })
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of pages the data file covers.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl DiskManager for FileDiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        assert!(page_id.is_valid(), "read of {page_id}");

        let mut inner = self.inner.lock();
        if page_id.0 as u32 >= inner.num_pages {
            buf.fill(0);
            return Ok(());
        }

        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        assert!(page_id.is_valid(), "write of {page_id}");

        let mut inner = self.inner.lock();
        let offset = (page_id.0 as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;

        if self.fsync_enabled {
            inner.file.sync_all()?;
        }

        if page_id.0 as u32 >= inner.num_pages {
            inner.num_pages = page_id.0 as u32 + 1;
        }
        Ok(())
    }
}

impl Drop for FileDiskManager {
    fn drop(&mut self) {
        let _ = self.inner.lock().file.sync_all();
    }
}
