//! Buffer frame management.

use parking_lot::RwLock;
use quarry_common::page::{PageId, PAGE_SIZE};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// Unique identifier for a frame in the buffer pool.
///
/// A frame id is an index into the pool's fixed frame array; it never refers
/// to anything on disk. Components outside the pool hold page ids instead
/// and must not keep a frame id across an unpin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Invalid frame ID.
    pub const INVALID: FrameId = FrameId(u32::MAX);

    /// Returns true if this is a valid frame ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in the buffer pool holding a single page.
///
/// Each frame contains the page data (PAGE_SIZE bytes behind a reader-writer
/// latch) plus the metadata the pool needs: the hosted page id, a pin count,
/// and a dirty flag. The pool mutates the metadata under its own latch; the
/// data latch is what B+ tree descent crabs over.
pub struct BufferFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// The page currently hosted by this frame (INVALID when free).
    page_id: AtomicI32,
    /// Page data buffer. The RwLock doubles as the page latch.
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    /// Number of users currently holding this page.
    pin_count: AtomicU32,
    /// Whether the page has been modified since it was last written out.
    is_dirty: AtomicBool,
}

impl BufferFrame {
    /// Creates a new empty buffer frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicI32::new(PageId::INVALID.0),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID currently hosted by this frame.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::Acquire))
    }

    /// Sets the page ID for this frame.
    #[inline]
    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count.
    #[inline]
    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the pin count and returns the new value. Saturates at 0.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Marks this frame as dirty or clean.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Returns true if no page is loaded in this frame.
    #[inline]
    pub fn is_free(&self) -> bool {
        !self.page_id().is_valid()
    }

    /// Acquires the page latch in shared mode and returns the data.
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Acquires the page latch in exclusive mode and returns the data.
    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Copies data into the frame.
    #[inline]
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let len = src.len().min(PAGE_SIZE);
        data[..len].copy_from_slice(&src[..len]);
    }

    /// Copies data out of the frame.
    #[inline]
    pub fn copy_to(&self, dst: &mut [u8]) {
        let data = self.data.read();
        let len = dst.len().min(PAGE_SIZE);
        dst[..len].copy_from_slice(&data[..len]);
    }

    /// Resets the frame to its empty state and zeroes the page buffer.
    #[inline]
    pub fn reset(&self) {
        self.page_id.store(PageId::INVALID.0, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        let mut data = self.data.write();
        data.fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}
