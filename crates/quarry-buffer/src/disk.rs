//! Disk collaborator interface for the buffer pool.

use parking_lot::Mutex;
use quarry_common::page::{PageId, PAGE_SIZE};
use quarry_common::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable storage the buffer pool reads and writes pages through.
///
/// Page ids are allocated by the pool's own counter, so the interface is
/// just the two transfers. Reads of pages that were never written must
/// zero-fill the buffer rather than fail: a freshly allocated page may be
/// evicted clean and fetched back before anything was flushed for it.
pub trait DiskManager: Send + Sync {
    /// Fills `buf` with the stored contents of `page_id`.
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Writes `data` for `page_id`; durable on return.
    fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()>;
}

/// In-memory disk manager for tests and ephemeral pools.
pub struct MemoryDiskManager {
    pages: Mutex<HashMap<PageId, Box<[u8; PAGE_SIZE]>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryDiskManager {
    /// Creates an empty in-memory disk.
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of pages that have been written at least once.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Total reads served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total writes accepted.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl Default for MemoryDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskManager for MemoryDiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.pages.lock().get(&page_id) {
            Some(data) => buf.copy_from_slice(&**data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut pages = self.pages.lock();
        match pages.get_mut(&page_id) {
            Some(slot) => slot.copy_from_slice(data),
            None => {
                let mut boxed = Box::new([0u8; PAGE_SIZE]);
                boxed.copy_from_slice(data);
                pages.insert(page_id, boxed);
            }
        }
        Ok(())
    }
}
