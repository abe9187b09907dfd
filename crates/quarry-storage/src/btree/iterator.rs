//! Forward iterator over the B+ tree's linked leaves.

use crate::btree::codec::IndexKey;
use crate::btree::page::{BTreePage, LeafPage};
use quarry_buffer::BufferPoolManager;
use quarry_common::page::PageId;
use quarry_common::rid::RecordId;
use std::marker::PhantomData;
use std::sync::Arc;

/// Cursor over `(key, record id)` entries in key order.
///
/// The iterator keeps exactly one leaf pinned (never latched) while it is
/// positioned on it; each element read takes a short shared latch, so a
/// scan sees each leaf as it is when visited without claiming a snapshot
/// across leaves. Reaching the end of a leaf unpins it and follows
/// `next_page_id`; dropping the iterator releases the remaining pin.
pub struct IndexIterator<K: IndexKey> {
    pool: Arc<BufferPoolManager>,
    /// Current leaf (one pin held) or INVALID for the end sentinel.
    page_id: PageId,
    /// Entry index within the current leaf.
    index: usize,
    _key: PhantomData<K>,
}

impl<K: IndexKey> IndexIterator<K> {
    /// Wraps a leaf the caller has already pinned.
    pub(crate) fn from_pinned(pool: Arc<BufferPoolManager>, page_id: PageId, index: usize) -> Self {
        Self {
            pool,
            page_id,
            index,
            _key: PhantomData,
        }
    }

    /// The past-the-end sentinel.
    pub(crate) fn end(pool: Arc<BufferPoolManager>) -> Self {
        Self {
            pool,
            page_id: PageId::INVALID,
            index: 0,
            _key: PhantomData,
        }
    }

    /// Returns true once the iterator has moved past the last leaf.
    pub fn is_end(&self) -> bool {
        !self.page_id.is_valid()
    }

    /// Returns the entry under the cursor, if any.
    pub fn current(&self) -> Option<(K, RecordId)> {
        if self.is_end() {
            return None;
        }
        let guard = self.pool.read_page(self.page_id).ok()?;
        let data = guard.data();
        if self.index < BTreePage::size(&**data) as usize {
            Some((
                LeafPage::key_at::<K>(&**data, self.index),
                LeafPage::value_at::<K>(&**data, self.index),
            ))
        } else {
            None
        }
    }

    /// Moves the cursor one entry forward, hopping to the next leaf when
    /// the current one is exhausted.
    pub fn advance(&mut self) {
        if self.is_end() {
            return;
        }
        let (size, next) = match self.pool.read_page(self.page_id) {
            Ok(guard) => {
                let data = guard.data();
                (BTreePage::size(&**data) as usize, LeafPage::next(&**data))
            }
            Err(_) => (0, PageId::INVALID),
        };
        if self.index + 1 < size {
            self.index += 1;
        } else {
            self.move_to(next);
        }
    }

    /// Swaps the held pin over to `next` (or ends the iteration).
    fn move_to(&mut self, next: PageId) {
        let old = self.page_id;
        if next.is_valid() && self.pool.fetch_page(next).is_ok() {
            self.page_id = next;
        } else {
            self.page_id = PageId::INVALID;
        }
        self.index = 0;
        self.pool.unpin_page(old, false);
    }
}

impl<K: IndexKey> Iterator for IndexIterator<K> {
    type Item = (K, RecordId);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.is_end() {
            match self.current() {
                Some(item) => {
                    self.advance();
                    return Some(item);
                }
                // Positioned past the leaf's entries (begin_at beyond the
                // last key, or an emptied root leaf): skip ahead.
                None => self.advance(),
            }
        }
        None
    }
}

impl<K: IndexKey> std::fmt::Debug for IndexIterator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexIterator")
            .field("page_id", &self.page_id)
            .field("index", &self.index)
            .finish()
    }
}

impl<K: IndexKey> PartialEq for IndexIterator<K> {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.index == other.index
    }
}

impl<K: IndexKey> Eq for IndexIterator<K> {}

impl<K: IndexKey> Drop for IndexIterator<K> {
    fn drop(&mut self) {
        if self.page_id.is_valid() {
            self.pool.unpin_page(self.page_id, false);
        }
    }
}
