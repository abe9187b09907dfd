//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{BufferFrame, FrameId};
use crate::hash_table::ExtendibleHashTable;
use crate::log_manager::LogManager;
use crate::replacer::{LruKReplacer, Replacer};
use log::trace;
use parking_lot::Mutex;
use quarry_common::page::{PageId, PAGE_SIZE};
use quarry_common::{QuarryError, Result, StorageConfig};
use std::collections::VecDeque;
use std::sync::Arc;
use sysinfo::System;

/// Bucket capacity of the page table when none is configured.
const DEFAULT_BUCKET_SIZE: usize = 4;

/// Buffer pool manager.
///
/// Owns a fixed array of frames and mediates every page access:
/// - page id to frame id mapping through an extendible hash table
/// - LRU-K replacement for eviction victims
/// - pin counting so in-use pages are never reclaimed
/// - write-back of dirty pages through the disk manager
///
/// A single pool-wide latch guards all metadata (page table, free list,
/// replacer, next page id). Disk I/O happens while holding it, which is
/// acceptable at this scope; pages returned from `new_page`/`fetch_page`
/// are pinned and stay resident until every pin is released.
pub struct BufferPoolManager {
    /// Number of frames in the pool.
    pool_size: usize,
    /// Fixed array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Stable storage for pages.
    disk: Arc<dyn DiskManager>,
    /// Recovery hook notified before dirty evictions.
    log: Arc<dyn LogManager>,
    /// Metadata behind the pool latch.
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Page id to frame id mapping for resident pages.
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// Frames not hosting any page.
    free_list: VecDeque<FrameId>,
    /// Replacement policy over unpinned frames.
    replacer: LruKReplacer,
    /// Next page id to hand out; id 0 is reserved for the header page.
    next_page_id: i32,
}

impl BufferPoolManager {
    /// Creates a buffer pool with `pool_size` frames and an LRU-K replacer.
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        disk: Arc<dyn DiskManager>,
        log: Arc<dyn LogManager>,
    ) -> Self {
        Self::with_bucket_size(pool_size, DEFAULT_BUCKET_SIZE, replacer_k, disk, log)
    }

    /// Creates a buffer pool with an explicit page-table bucket size.
    pub fn with_bucket_size(
        pool_size: usize,
        bucket_size: usize,
        replacer_k: usize,
        disk: Arc<dyn DiskManager>,
        log: Arc<dyn LogManager>,
    ) -> Self {
        assert!(pool_size > 0, "buffer pool needs at least one frame");

        let frames: Vec<_> = (0..pool_size)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();
        let free_list: VecDeque<_> = (0..pool_size).map(|i| FrameId(i as u32)).collect();

        Self {
            pool_size,
            frames,
            disk,
            log,
            state: Mutex::new(PoolState {
                page_table: ExtendibleHashTable::new(bucket_size),
                free_list,
                replacer: LruKReplacer::new(pool_size, replacer_k),
                next_page_id: 1,
            }),
        }
    }

    /// Creates a buffer pool from the shared storage configuration.
    pub fn from_config(
        config: &StorageConfig,
        disk: Arc<dyn DiskManager>,
        log: Arc<dyn LogManager>,
    ) -> Self {
        Self::with_bucket_size(
            config.pool_size,
            config.bucket_size,
            config.replacer_k,
            disk,
            log,
        )
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames so caching stays useful on small machines; no
    /// upper limit.
    pub fn auto_sized(
        replacer_k: usize,
        disk: Arc<dyn DiskManager>,
        log: Arc<dyn LogManager>,
    ) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let pool_size = (available_bytes / 4 / PAGE_SIZE).max(1_000);

        Self::new(pool_size, replacer_k, disk, log)
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of frames the replacer could evict right now.
    pub fn evictable_count(&self) -> usize {
        self.state.lock().replacer.size()
    }

    /// Checks if a page is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.find(&page_id).is_some()
    }

    /// Obtains a frame for a new or incoming page: free list first, then a
    /// replacer victim with dirty write-back.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(victim) = state.replacer.evict() else {
            return Err(QuarryError::BufferPoolExhausted);
        };
        let frame = &self.frames[victim.0 as usize];
        let old_page_id = frame.page_id();
        if frame.is_dirty() {
            self.log.before_evict(old_page_id);
            let data = frame.read_data();
            self.disk.write_page(old_page_id, &data)?;
            drop(data);
            frame.set_dirty(false);
        }
        state.page_table.remove(&old_page_id);
        trace!("evicted {} from {}", old_page_id, victim);
        Ok(victim)
    }

    /// Registers `frame_id` as hosting `page_id`, pinned and protected from
    /// eviction.
    fn install(&self, state: &mut PoolState, page_id: PageId, frame_id: FrameId) -> &BufferFrame {
        let frame = &self.frames[frame_id.0 as usize];
        frame.set_page_id(page_id);
        frame.pin();
        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        frame
    }

    /// Allocates a fresh page and returns its pinned, zeroed frame.
    ///
    /// Fails with `BufferPoolExhausted` when every frame is pinned.
    pub fn new_page(&self) -> Result<&BufferFrame> {
        let mut state = self.state.lock();
        let frame_id = self.acquire_frame(&mut state)?;

        let page_id = PageId(state.next_page_id);
        state.next_page_id += 1;

        self.frames[frame_id.0 as usize].reset();
        Ok(self.install(&mut state, page_id, frame_id))
    }

    /// Fetches `page_id`, reading it from disk on a miss, and returns its
    /// pinned frame.
    ///
    /// Fails with `BufferPoolExhausted` when the page is not resident and
    /// every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        assert!(page_id.is_valid(), "fetch of {page_id}");

        let mut state = self.state.lock();
        if let Some(frame_id) = state.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok(frame);
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        {
            let mut data = frame.write_data();
            if let Err(e) = self.disk.read_page(page_id, &mut data) {
                drop(data);
                frame.reset();
                state.free_list.push_back(frame_id);
                return Err(e);
            }
        }
        Ok(self.install(&mut state, page_id, frame_id))
    }

    /// Drops one pin on `page_id`, folding `is_dirty` into the frame's
    /// dirty flag (dirty is sticky until the page is flushed or evicted).
    ///
    /// Returns false if the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();
        let Some(frame_id) = state.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.pin_count() == 0 {
            return false;
        }
        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            state.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes `page_id` through to disk, dirty or not, and clears its dirty
    /// flag. Returns Ok(false) if the page is not resident.
    ///
    /// The page latch is taken after the pool latch is released: a latch
    /// holder may be blocked on the pool latch for its unpin, so waiting
    /// for page latches inside the pool latch would deadlock.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let frame_id = {
            let state = self.state.lock();
            match state.page_table.find(&page_id) {
                Some(frame_id) => frame_id,
                None => return Ok(false),
            }
        };
        let frame = &self.frames[frame_id.0 as usize];
        let data = frame.read_data();
        // The frame may have been recycled between the lookup and the latch
        if frame.page_id() != page_id {
            return Ok(false);
        }
        self.disk.write_page(page_id, &data)?;
        frame.set_dirty(false);
        Ok(true)
    }

    /// Flushes every resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        for frame in &self.frames {
            let data = frame.read_data();
            let page_id = frame.page_id();
            if !page_id.is_valid() {
                continue;
            }
            self.disk.write_page(page_id, &data)?;
            frame.set_dirty(false);
        }
        Ok(())
    }

    /// Removes `page_id` from the pool, freeing its frame.
    ///
    /// Returns true if the page was not resident or was deleted; false if
    /// it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.state.lock();
        let Some(frame_id) = state.page_table.find(&page_id) else {
            return true;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.is_pinned() {
            return false;
        }
        state.page_table.remove(&page_id);
        // pin_count == 0 means the last unpin marked the frame evictable,
        // so the replacer is guaranteed to be tracking it.
        state.replacer.remove(frame_id);
        frame.reset();
        state.free_list.push_back(frame_id);
        true
    }

    /// Fetches `page_id` behind an RAII guard that unpins on drop.
    pub fn read_page(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageReadGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Fetches `page_id` for writing behind an RAII guard that unpins on
    /// drop.
    pub fn write_page(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageWriteGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        let mut used_frames = 0;

        for frame in &self.frames {
            if !frame.page_id().is_valid() {
                continue;
            }
            used_frames += 1;
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.pool_size,
            free_frames: state.free_list.len(),
            used_frames,
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames hosting pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// RAII guard holding one pin for reading a page.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageReadGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Latches the page shared and returns its data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII guard holding one pin for writing a page.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageWriteGuard<'a> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Latches the page exclusive and returns its data.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.write_data()
    }

    /// Marks the page as dirty.
    pub fn set_dirty(&self) {
        self.frame.set_dirty(true);
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        // The dirty flag was set directly on the frame; unpin keeps it.
        self.pool.unpin_page(self.page_id, false);
    }
}
