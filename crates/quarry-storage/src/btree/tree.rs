//! Concurrent B+ tree index driven through the buffer pool.
//!
//! Descent uses latch crabbing: readers hand-over-hand shared latches;
//! writers hold exclusive latches from the last unsafe ancestor down and
//! release everything above a node that cannot propagate structural change.
//! The per-frame reader-writer lock around each page buffer is the page
//! latch; the tree-wide `root` lock orders access to the root page id.

use crate::btree::codec::IndexKey;
use crate::btree::header::HeaderPage;
use crate::btree::iterator::IndexIterator;
use crate::btree::page::{BTreePage, InternalPage, LeafPage};
use log::debug;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use quarry_buffer::BufferFrame;
use quarry_buffer::BufferPoolManager;
use quarry_common::page::{PageId, HEADER_PAGE_ID, PAGE_SIZE};
use quarry_common::rid::RecordId;
use quarry_common::{QuarryError, Result};
use std::marker::PhantomData;
use std::sync::Arc;

type PageData = Box<[u8; PAGE_SIZE]>;

/// Exclusive latches held by one write operation, root-to-leaf.
///
/// Dropping the set releases every latch in acquisition order and unpins
/// the pages, so error paths cannot leak pins.
struct WriteSet<'a> {
    pool: &'a BufferPoolManager,
    root: Option<RwLockWriteGuard<'a, PageId>>,
    pages: Vec<(PageId, RwLockWriteGuard<'a, PageData>)>,
    /// Dirty hint used when the set is dropped without an explicit release.
    dirty: bool,
}

impl<'a> WriteSet<'a> {
    fn new(pool: &'a BufferPoolManager) -> Self {
        Self {
            pool,
            root: None,
            pages: Vec::new(),
            dirty: true,
        }
    }

    fn push(&mut self, page_id: PageId, guard: RwLockWriteGuard<'a, PageData>) {
        self.pages.push((page_id, guard));
    }

    /// Releases every latch currently held; the pages were not modified.
    /// Called during descent once the newly latched child is safe.
    fn release_ancestors(&mut self) {
        self.root = None;
        for (page_id, guard) in self.pages.drain(..) {
            drop(guard);
            self.pool.unpin_page(page_id, false);
        }
    }

    /// Releases everything, root latch first, then pages root-to-leaf.
    fn release_all(&mut self, dirty: bool) {
        self.root = None;
        for (page_id, guard) in self.pages.drain(..) {
            drop(guard);
            self.pool.unpin_page(page_id, dirty);
        }
        self.dirty = false;
    }
}

impl Drop for WriteSet<'_> {
    fn drop(&mut self) {
        let dirty = self.dirty;
        self.release_all(dirty);
    }
}

/// B+ tree index over fixed-width keys and record ids.
///
/// The tree owns no page memory; every node is a page fetched from the
/// buffer pool and pinned only for the duration of the access. The root
/// page id is persisted in the header page under the index name.
pub struct BPlusTree<K: IndexKey> {
    name: String,
    pool: Arc<BufferPoolManager>,
    leaf_max_size: u16,
    internal_max_size: u16,
    /// Orders access to the root page id; INVALID means an empty tree.
    root: RwLock<PageId>,
    _key: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Opens the index `name`, loading its root from the header page if it
    /// was created before.
    pub fn new(
        name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        leaf_max_size: u16,
        internal_max_size: u16,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > HeaderPage::MAX_NAME_LEN {
            return Err(QuarryError::InvalidConfig(format!(
                "index name must be 1..={} bytes",
                HeaderPage::MAX_NAME_LEN
            )));
        }
        if leaf_max_size < 2 || leaf_max_size as usize > LeafPage::capacity::<K>() {
            return Err(QuarryError::InvalidConfig(format!(
                "leaf_max_size must be in 2..={}",
                LeafPage::capacity::<K>()
            )));
        }
        if internal_max_size < 3 || internal_max_size as usize >= InternalPage::capacity::<K>() {
            return Err(QuarryError::InvalidConfig(format!(
                "internal_max_size must be in 3..{}",
                InternalPage::capacity::<K>()
            )));
        }

        let root = {
            let guard = pool.read_page(HEADER_PAGE_ID)?;
            let data = guard.data();
            HeaderPage::find(&**data, &name).unwrap_or(PageId::INVALID)
        };

        Ok(Self {
            name,
            pool,
            leaf_max_size,
            internal_max_size,
            root: RwLock::new(root),
            _key: PhantomData,
        })
    }

    /// Returns true if the tree has no root page.
    pub fn is_empty(&self) -> bool {
        !self.root.read().is_valid()
    }

    /// Returns the current root page id (INVALID for an empty tree).
    pub fn root_page_id(&self) -> PageId {
        *self.root.read()
    }

    /// Records the root page id in the header page.
    fn persist_root(&self, root: PageId) -> Result<()> {
        let guard = self.pool.write_page(HEADER_PAGE_ID)?;
        {
            let mut data = guard.data_mut();
            HeaderPage::upsert(&mut **data, &self.name, root)?;
        }
        guard.set_dirty();
        Ok(())
    }

    /// Rewrites a child's parent pointer, going through the latch we
    /// already hold when the child is part of the current write set.
    fn set_parent_pointer(
        &self,
        set: &mut WriteSet<'_>,
        child: PageId,
        parent: PageId,
    ) -> Result<()> {
        if let Some(pos) = set.pages.iter().position(|(pid, _)| *pid == child) {
            let (_, guard) = &mut set.pages[pos];
            BTreePage::set_parent(&mut ***guard, parent);
            return Ok(());
        }
        let guard = self.pool.write_page(child)?;
        {
            let mut data = guard.data_mut();
            BTreePage::set_parent(&mut **data, parent);
        }
        guard.set_dirty();
        Ok(())
    }

    /// A node that cannot overflow from one more entry.
    fn safe_for_insert(&self, data: &[u8]) -> bool {
        if BTreePage::is_leaf(data) {
            BTreePage::size(data) + 1 < self.leaf_max_size
        } else {
            BTreePage::size(data) < self.internal_max_size
        }
    }

    /// A node that cannot underflow from losing one entry.
    fn safe_for_remove(&self, data: &[u8]) -> bool {
        let size = BTreePage::size(data);
        if BTreePage::is_root(data) {
            if BTreePage::is_leaf(data) {
                size > 1
            } else {
                size > 2
            }
        } else if BTreePage::is_leaf(data) {
            size > LeafPage::min_size(BTreePage::max_size(data))
        } else {
            size > InternalPage::min_size(BTreePage::max_size(data))
        }
    }

    // =========================================================================
    // Point lookup
    // =========================================================================

    /// Shared-latch descent to the leaf responsible for `key`, or the
    /// leftmost leaf when no key is given. Returns the leaf's frame still
    /// pinned with its read latch held, or None for an empty tree.
    fn descend_shared(
        &self,
        key: Option<&K>,
    ) -> Result<Option<(&BufferFrame, RwLockReadGuard<'_, PageData>)>> {
        let root_guard = self.root.read();
        let root_id = *root_guard;
        if !root_id.is_valid() {
            return Ok(None);
        }

        let mut frame = self.pool.fetch_page(root_id)?;
        let mut guard = frame.read_data();
        drop(root_guard);

        while !BTreePage::is_leaf(&**guard) {
            let child = match key {
                Some(key) => InternalPage::find_child::<K>(&**guard, key),
                None => InternalPage::child_at::<K>(&**guard, 0),
            };
            let child_frame = match self.pool.fetch_page(child) {
                Ok(f) => f,
                Err(e) => {
                    let page_id = frame.page_id();
                    drop(guard);
                    self.pool.unpin_page(page_id, false);
                    return Err(e);
                }
            };
            let child_guard = child_frame.read_data();
            let page_id = frame.page_id();
            drop(guard);
            self.pool.unpin_page(page_id, false);
            frame = child_frame;
            guard = child_guard;
        }

        Ok(Some((frame, guard)))
    }

    /// Point lookup. Keys are unique, so the result holds zero or one
    /// record id.
    pub fn get_value(&self, key: &K) -> Result<Vec<RecordId>> {
        let Some((frame, guard)) = self.descend_shared(Some(key))? else {
            return Ok(Vec::new());
        };
        let result = LeafPage::lookup::<K>(&**guard, key).into_iter().collect();
        let page_id = frame.page_id();
        drop(guard);
        self.pool.unpin_page(page_id, false);
        Ok(result)
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts a key and record id. Returns false when the key already
    /// exists (unique index) and leaves the tree unchanged.
    pub fn insert(&self, key: K, rid: RecordId) -> Result<bool> {
        let mut set = WriteSet::new(&self.pool);
        set.root = Some(self.root.write());

        let root_id = **set.root.as_ref().expect("root latch held");
        if !root_id.is_valid() {
            let page_id = self.start_new_tree(&key, rid)?;
            **set.root.as_mut().expect("root latch held") = page_id;
            self.persist_root(page_id)?;
            set.release_all(false);
            return Ok(true);
        }

        // Exclusive descent; ancestors are released at each safe child.
        let mut cur = root_id;
        loop {
            let frame = self.pool.fetch_page(cur)?;
            let guard = frame.write_data();
            if self.safe_for_insert(&**guard) {
                set.release_ancestors();
            }
            if BTreePage::is_leaf(&**guard) {
                set.push(cur, guard);
                break;
            }
            let child = InternalPage::find_child::<K>(&**guard, &key);
            set.push(cur, guard);
            cur = child;
        }

        {
            let (_, leaf_guard) = set.pages.last_mut().expect("leaf latched");
            let data: &mut [u8] = &mut ***leaf_guard;
            if !LeafPage::insert::<K>(data, &key, rid) {
                set.release_all(false);
                return Ok(false);
            }
            if BTreePage::size(data) < self.leaf_max_size {
                set.release_all(true);
                return Ok(true);
            }
        }

        self.split_and_propagate(&mut set)?;
        set.release_all(true);
        Ok(true)
    }

    /// Allocates a root leaf holding the first entry.
    fn start_new_tree(&self, key: &K, rid: RecordId) -> Result<PageId> {
        let frame = self.pool.new_page()?;
        let page_id = frame.page_id();
        {
            let mut data = frame.write_data();
            LeafPage::init::<K>(&mut **data, PageId::INVALID, self.leaf_max_size);
            LeafPage::insert::<K>(&mut **data, key, rid);
        }
        self.pool.unpin_page(page_id, true);
        debug!("started new tree {} at {}", self.name, page_id);
        Ok(page_id)
    }

    /// Splits the full leaf at the bottom of the write set and walks the
    /// separator up through the latched ancestors, splitting overflowing
    /// internal nodes as it goes.
    fn split_and_propagate(&self, set: &mut WriteSet<'_>) -> Result<()> {
        let leaf_level = set.pages.len() - 1;

        let right_frame = self.pool.new_page()?;
        let right_pid = right_frame.page_id();
        let mut separator = {
            let (leaf_pid, leaf_guard) = set.pages.last_mut().expect("leaf latched");
            let leaf: &mut [u8] = &mut ***leaf_guard;
            let mut right = right_frame.write_data();
            LeafPage::init::<K>(&mut **right, BTreePage::parent(leaf), self.leaf_max_size);
            LeafPage::split::<K>(leaf, &mut **right);
            LeafPage::set_next(&mut **right, LeafPage::next(leaf));
            LeafPage::set_next(leaf, right_pid);
            debug!("split leaf {} into {}", leaf_pid, right_pid);
            LeafPage::key_at::<K>(&**right, 0)
        };
        self.pool.unpin_page(right_pid, true);

        let mut new_child = right_pid;
        let mut level = leaf_level;
        loop {
            if level == 0 {
                // Crabbing only leaves a splitting node at the top of the
                // set when it is the root itself.
                self.grow_root(set, &separator, new_child)?;
                return Ok(());
            }

            let parent_level = level - 1;
            let parent_pid = set.pages[parent_level].0;
            let overflow = {
                let (_, parent_guard) = &mut set.pages[parent_level];
                let parent: &mut [u8] = &mut ***parent_guard;
                InternalPage::insert::<K>(parent, &separator, new_child);
                BTreePage::size(parent) > self.internal_max_size
            };
            self.set_parent_pointer(set, new_child, parent_pid)?;
            if !overflow {
                return Ok(());
            }

            let right_frame = self.pool.new_page()?;
            let right_pid = right_frame.page_id();
            let moved = {
                let (_, parent_guard) = &mut set.pages[parent_level];
                let parent: &mut [u8] = &mut ***parent_guard;
                let mut right = right_frame.write_data();
                InternalPage::init::<K>(
                    &mut **right,
                    BTreePage::parent(parent),
                    self.internal_max_size,
                );
                let moved = InternalPage::split::<K>(parent, &mut **right);
                separator = InternalPage::key_at::<K>(&**right, 0);
                moved
            };
            self.pool.unpin_page(right_pid, true);
            debug!("split internal {} into {}", parent_pid, right_pid);
            for child in moved {
                self.set_parent_pointer(set, child, right_pid)?;
            }
            new_child = right_pid;
            level = parent_level;
        }
    }

    /// Replaces a split root with a fresh root holding two children.
    fn grow_root(&self, set: &mut WriteSet<'_>, separator: &K, right_child: PageId) -> Result<()> {
        let old_root = set.pages[0].0;
        debug_assert!(BTreePage::is_root(&**set.pages[0].1));

        let root_frame = self.pool.new_page()?;
        let root_pid = root_frame.page_id();
        {
            let mut data = root_frame.write_data();
            InternalPage::init::<K>(&mut **data, PageId::INVALID, self.internal_max_size);
            InternalPage::set_entry::<K>(&mut **data, 0, separator, old_root);
            InternalPage::set_entry::<K>(&mut **data, 1, separator, right_child);
            BTreePage::set_size(&mut **data, 2);
        }
        self.pool.unpin_page(root_pid, true);

        self.set_parent_pointer(set, old_root, root_pid)?;
        self.set_parent_pointer(set, right_child, root_pid)?;
        **set.root.as_mut().expect("root latch held across root split") = root_pid;
        self.persist_root(root_pid)?;
        debug!("grew new root {}", root_pid);
        Ok(())
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes `key` if present; absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut set = WriteSet::new(&self.pool);
        set.root = Some(self.root.write());

        let root_id = **set.root.as_ref().expect("root latch held");
        if !root_id.is_valid() {
            set.release_all(false);
            return Ok(());
        }

        let mut cur = root_id;
        loop {
            let frame = self.pool.fetch_page(cur)?;
            let guard = frame.write_data();
            if self.safe_for_remove(&**guard) {
                set.release_ancestors();
            }
            if BTreePage::is_leaf(&**guard) {
                set.push(cur, guard);
                break;
            }
            let child = InternalPage::find_child::<K>(&**guard, key);
            set.push(cur, guard);
            cur = child;
        }

        let (removed, root_leaf, underflow) = {
            let (_, leaf_guard) = set.pages.last_mut().expect("leaf latched");
            let data: &mut [u8] = &mut ***leaf_guard;
            let removed = LeafPage::remove::<K>(data, key);
            let root_leaf = BTreePage::is_root(data);
            let underflow = BTreePage::size(data) < LeafPage::min_size(self.leaf_max_size);
            (removed, root_leaf, underflow)
        };
        if !removed {
            set.release_all(false);
            return Ok(());
        }
        if root_leaf || !underflow {
            set.release_all(true);
            return Ok(());
        }

        let mut freed = Vec::new();
        let bottom = set.pages.len() - 1;
        self.handle_underflow(&mut set, bottom, &mut freed)?;
        set.release_all(true);
        for page_id in freed {
            self.pool.delete_page(page_id);
        }
        Ok(())
    }

    /// Rebalances the underflowed node at `idx` in the write set by
    /// borrowing from or merging with a sibling, recursing into the parent
    /// when the merge leaves it underfull.
    fn handle_underflow(
        &self,
        set: &mut WriteSet<'_>,
        idx: usize,
        freed: &mut Vec<PageId>,
    ) -> Result<()> {
        let (is_root, is_leaf, size) = {
            let (_, guard) = &set.pages[idx];
            let data: &[u8] = &***guard;
            (
                BTreePage::is_root(data),
                BTreePage::is_leaf(data),
                BTreePage::size(data),
            )
        };

        if is_root {
            // A root leaf may shrink arbitrarily; an internal root with a
            // single child hands the tree over to that child.
            if is_leaf || size > 1 {
                return Ok(());
            }
            let old_root = set.pages[idx].0;
            let child = {
                let (_, guard) = &set.pages[idx];
                InternalPage::child_at::<K>(&***guard, 0)
            };
            self.set_parent_pointer(set, child, PageId::INVALID)?;
            **set.root.as_mut().expect("root latch held across collapse") = child;
            self.persist_root(child)?;
            freed.push(old_root);
            debug!("root {} collapsed into {}", old_root, child);
            return Ok(());
        }

        let node_pid = set.pages[idx].0;
        let parent_idx = idx - 1;
        let (node_pos, left_id, right_id) = {
            let (_, parent_guard) = &set.pages[parent_idx];
            let parent: &[u8] = &***parent_guard;
            let pos = InternalPage::child_index_of::<K>(parent, node_pid)
                .expect("underflowed node is registered in its parent");
            let n = BTreePage::size(parent) as usize;
            let left = (pos > 0).then(|| InternalPage::child_at::<K>(parent, pos - 1));
            let right = (pos + 1 < n).then(|| InternalPage::child_at::<K>(parent, pos + 1));
            (pos, left, right)
        };

        if let Some(left_pid) = left_id {
            if self.try_borrow_from_left(set, idx, node_pos, left_pid)? {
                return Ok(());
            }
        }
        if let Some(right_pid) = right_id {
            if self.try_borrow_from_right(set, idx, node_pos, right_pid)? {
                return Ok(());
            }
        }

        if let Some(left_pid) = left_id {
            self.merge_into_left(set, idx, node_pos, left_pid, freed)?;
        } else {
            let right_pid = right_id.expect("non-root node has at least one sibling");
            self.merge_right_into_node(set, idx, node_pos, right_pid, freed)?;
        }

        let parent_underflow = {
            let (_, parent_guard) = &set.pages[parent_idx];
            let parent: &[u8] = &***parent_guard;
            if BTreePage::is_root(parent) {
                BTreePage::size(parent) == 1
            } else {
                BTreePage::size(parent) < InternalPage::min_size(BTreePage::max_size(parent))
            }
        };
        if parent_underflow {
            self.handle_underflow(set, parent_idx, freed)?;
        }
        Ok(())
    }

    /// Whether a latched sibling can give up an entry.
    fn can_lend(data: &[u8]) -> bool {
        let size = BTreePage::size(data);
        if BTreePage::is_leaf(data) {
            size > LeafPage::min_size(BTreePage::max_size(data))
        } else {
            size > InternalPage::min_size(BTreePage::max_size(data))
        }
    }

    /// Moves the left sibling's last entry into the node at `idx` and
    /// refreshes the parent separator. Returns false if the sibling is at
    /// its minimum.
    fn try_borrow_from_left(
        &self,
        set: &mut WriteSet<'_>,
        idx: usize,
        node_pos: usize,
        left_pid: PageId,
    ) -> Result<bool> {
        let node_pid = set.pages[idx].0;
        let left_frame = self.pool.fetch_page(left_pid)?;
        let mut left_guard = left_frame.write_data();
        if !Self::can_lend(&**left_guard) {
            drop(left_guard);
            self.pool.unpin_page(left_pid, false);
            return Ok(false);
        }

        let mut lent_child = None;
        {
            let (front, back) = set.pages.split_at_mut(idx);
            let (_, parent_guard) = &mut front[idx - 1];
            let (_, node_guard) = &mut back[0];
            let parent: &mut [u8] = &mut ***parent_guard;
            let node: &mut [u8] = &mut ***node_guard;
            let left: &mut [u8] = &mut **left_guard;

            if BTreePage::is_leaf(node) {
                let n = BTreePage::size(left) as usize;
                let key = LeafPage::key_at::<K>(left, n - 1);
                let value = LeafPage::value_at::<K>(left, n - 1);
                LeafPage::remove_at::<K>(left, n - 1);
                LeafPage::insert::<K>(node, &key, value);
                InternalPage::set_key_at::<K>(parent, node_pos, &key);
            } else {
                // Rotate through the parent: the separator descends in
                // front of the node's children, the sibling's last key
                // ascends.
                let n = BTreePage::size(left) as usize;
                let separator = InternalPage::key_at::<K>(parent, node_pos);
                let old_first = InternalPage::child_at::<K>(node, 0);
                InternalPage::insert::<K>(node, &separator, old_first);
                let child = InternalPage::child_at::<K>(left, n - 1);
                let new_separator = InternalPage::key_at::<K>(left, n - 1);
                InternalPage::set_child_at::<K>(node, 0, child);
                InternalPage::remove_at::<K>(left, n - 1);
                InternalPage::set_key_at::<K>(parent, node_pos, &new_separator);
                lent_child = Some(child);
            }
        }
        drop(left_guard);
        self.pool.unpin_page(left_pid, true);

        if let Some(child) = lent_child {
            self.set_parent_pointer(set, child, node_pid)?;
        }
        debug!("{} borrowed from left sibling {}", node_pid, left_pid);
        Ok(true)
    }

    /// Moves the right sibling's first entry into the node at `idx` and
    /// refreshes the parent separator. Returns false if the sibling is at
    /// its minimum.
    fn try_borrow_from_right(
        &self,
        set: &mut WriteSet<'_>,
        idx: usize,
        node_pos: usize,
        right_pid: PageId,
    ) -> Result<bool> {
        let node_pid = set.pages[idx].0;
        let right_frame = self.pool.fetch_page(right_pid)?;
        let mut right_guard = right_frame.write_data();
        if !Self::can_lend(&**right_guard) {
            drop(right_guard);
            self.pool.unpin_page(right_pid, false);
            return Ok(false);
        }

        let mut moved_child = None;
        {
            let (front, back) = set.pages.split_at_mut(idx);
            let (_, parent_guard) = &mut front[idx - 1];
            let (_, node_guard) = &mut back[0];
            let parent: &mut [u8] = &mut ***parent_guard;
            let node: &mut [u8] = &mut ***node_guard;
            let right: &mut [u8] = &mut **right_guard;

            if BTreePage::is_leaf(node) {
                let key = LeafPage::key_at::<K>(right, 0);
                let value = LeafPage::value_at::<K>(right, 0);
                LeafPage::remove_at::<K>(right, 0);
                LeafPage::insert::<K>(node, &key, value);
                let new_separator = LeafPage::key_at::<K>(right, 0);
                InternalPage::set_key_at::<K>(parent, node_pos + 1, &new_separator);
            } else {
                // The separator descends onto the end of the node with the
                // sibling's first child; the sibling's next key ascends.
                let n = BTreePage::size(node) as usize;
                let separator = InternalPage::key_at::<K>(parent, node_pos + 1);
                let child = InternalPage::child_at::<K>(right, 0);
                InternalPage::set_entry::<K>(node, n, &separator, child);
                BTreePage::set_size(node, (n + 1) as u16);
                let new_separator = InternalPage::key_at::<K>(right, 1);
                InternalPage::set_child_at::<K>(right, 0, InternalPage::child_at::<K>(right, 1));
                InternalPage::remove_at::<K>(right, 1);
                InternalPage::set_key_at::<K>(parent, node_pos + 1, &new_separator);
                moved_child = Some(child);
            }
        }
        drop(right_guard);
        self.pool.unpin_page(right_pid, true);

        if let Some(child) = moved_child {
            self.set_parent_pointer(set, child, node_pid)?;
        }
        debug!("{} borrowed from right sibling {}", node_pid, right_pid);
        Ok(true)
    }

    /// Merges the node at `idx` into its left sibling and removes its
    /// separator from the parent. The node's page is queued for deletion.
    fn merge_into_left(
        &self,
        set: &mut WriteSet<'_>,
        idx: usize,
        node_pos: usize,
        left_pid: PageId,
        freed: &mut Vec<PageId>,
    ) -> Result<()> {
        let node_pid = set.pages[idx].0;
        let left_frame = self.pool.fetch_page(left_pid)?;
        let mut left_guard = left_frame.write_data();

        let mut moved_children = Vec::new();
        {
            let (front, back) = set.pages.split_at_mut(idx);
            let (_, parent_guard) = &mut front[idx - 1];
            let (_, node_guard) = &mut back[0];
            let parent: &mut [u8] = &mut ***parent_guard;
            let node: &mut [u8] = &mut ***node_guard;
            let left: &mut [u8] = &mut **left_guard;

            let ln = BTreePage::size(left) as usize;
            let nn = BTreePage::size(node) as usize;
            if BTreePage::is_leaf(node) {
                for i in 0..nn {
                    let key = LeafPage::key_at::<K>(node, i);
                    let value = LeafPage::value_at::<K>(node, i);
                    LeafPage::set_entry::<K>(left, ln + i, &key, value);
                }
                BTreePage::set_size(left, (ln + nn) as u16);
                LeafPage::set_next(left, LeafPage::next(node));
            } else {
                // The parent separator descends in front of the node's
                // children.
                let separator = InternalPage::key_at::<K>(parent, node_pos);
                InternalPage::set_entry::<K>(
                    left,
                    ln,
                    &separator,
                    InternalPage::child_at::<K>(node, 0),
                );
                for i in 1..nn {
                    let key = InternalPage::key_at::<K>(node, i);
                    let child = InternalPage::child_at::<K>(node, i);
                    InternalPage::set_entry::<K>(left, ln + i, &key, child);
                }
                BTreePage::set_size(left, (ln + nn) as u16);
                moved_children = (0..nn)
                    .map(|i| InternalPage::child_at::<K>(node, i))
                    .collect();
            }
            InternalPage::remove_at::<K>(parent, node_pos);
        }
        drop(left_guard);
        self.pool.unpin_page(left_pid, true);

        for child in moved_children {
            self.set_parent_pointer(set, child, left_pid)?;
        }
        freed.push(node_pid);
        debug!("merged {} into left sibling {}", node_pid, left_pid);
        Ok(())
    }

    /// Merges the right sibling into the node at `idx` and removes the
    /// sibling's separator from the parent. The sibling's page is queued
    /// for deletion.
    fn merge_right_into_node(
        &self,
        set: &mut WriteSet<'_>,
        idx: usize,
        node_pos: usize,
        right_pid: PageId,
        freed: &mut Vec<PageId>,
    ) -> Result<()> {
        let node_pid = set.pages[idx].0;
        let right_frame = self.pool.fetch_page(right_pid)?;
        let mut right_guard = right_frame.write_data();

        let mut moved_children = Vec::new();
        {
            let (front, back) = set.pages.split_at_mut(idx);
            let (_, parent_guard) = &mut front[idx - 1];
            let (_, node_guard) = &mut back[0];
            let parent: &mut [u8] = &mut ***parent_guard;
            let node: &mut [u8] = &mut ***node_guard;
            let right: &mut [u8] = &mut **right_guard;

            let nn = BTreePage::size(node) as usize;
            let rn = BTreePage::size(right) as usize;
            if BTreePage::is_leaf(node) {
                for i in 0..rn {
                    let key = LeafPage::key_at::<K>(right, i);
                    let value = LeafPage::value_at::<K>(right, i);
                    LeafPage::set_entry::<K>(node, nn + i, &key, value);
                }
                BTreePage::set_size(node, (nn + rn) as u16);
                LeafPage::set_next(node, LeafPage::next(right));
            } else {
                let separator = InternalPage::key_at::<K>(parent, node_pos + 1);
                InternalPage::set_entry::<K>(
                    node,
                    nn,
                    &separator,
                    InternalPage::child_at::<K>(right, 0),
                );
                for i in 1..rn {
                    let key = InternalPage::key_at::<K>(right, i);
                    let child = InternalPage::child_at::<K>(right, i);
                    InternalPage::set_entry::<K>(node, nn + i, &key, child);
                }
                BTreePage::set_size(node, (nn + rn) as u16);
                moved_children = (0..rn)
                    .map(|i| InternalPage::child_at::<K>(right, i))
                    .collect();
            }
            InternalPage::remove_at::<K>(parent, node_pos + 1);
        }
        drop(right_guard);
        self.pool.unpin_page(right_pid, true);

        for child in moved_children {
            self.set_parent_pointer(set, child, node_pid)?;
        }
        freed.push(right_pid);
        debug!("merged right sibling {} into {}", right_pid, node_pid);
        Ok(())
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Iterator positioned at the first entry of the leftmost leaf.
    pub fn begin(&self) -> Result<IndexIterator<K>> {
        match self.descend_shared(None)? {
            None => Ok(IndexIterator::end(Arc::clone(&self.pool))),
            Some((frame, guard)) => {
                let page_id = frame.page_id();
                drop(guard);
                // the descent's pin transfers to the iterator
                Ok(IndexIterator::from_pinned(
                    Arc::clone(&self.pool),
                    page_id,
                    0,
                ))
            }
        }
    }

    /// Iterator positioned at the first entry >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<IndexIterator<K>> {
        match self.descend_shared(Some(key))? {
            None => Ok(IndexIterator::end(Arc::clone(&self.pool))),
            Some((frame, guard)) => {
                let index = match LeafPage::position_of::<K>(&**guard, key) {
                    Ok(i) | Err(i) => i,
                };
                let page_id = frame.page_id();
                drop(guard);
                Ok(IndexIterator::from_pinned(
                    Arc::clone(&self.pool),
                    page_id,
                    index,
                ))
            }
        }
    }

    /// The past-the-end sentinel.
    pub fn end(&self) -> IndexIterator<K> {
        IndexIterator::end(Arc::clone(&self.pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_buffer::{DiskManager, MemoryDiskManager, NoopLogManager};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn rid(key: i64) -> RecordId {
        RecordId::new(PageId(key as i32), key as u32)
    }

    fn make_tree(
        leaf_max: u16,
        internal_max: u16,
        pool_size: usize,
    ) -> (Arc<BufferPoolManager>, BPlusTree<i64>) {
        let disk = Arc::new(MemoryDiskManager::new());
        let pool = Arc::new(BufferPoolManager::new(
            pool_size,
            2,
            disk as Arc<dyn DiskManager>,
            Arc::new(NoopLogManager),
        ));
        let tree = BPlusTree::new("test_index", Arc::clone(&pool), leaf_max, internal_max).unwrap();
        (pool, tree)
    }

    fn collect_keys(tree: &BPlusTree<i64>) -> Vec<i64> {
        tree.begin().unwrap().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_empty_tree() {
        let (_pool, tree) = make_tree(3, 3, 16);

        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), PageId::INVALID);
        assert!(tree.get_value(&1).unwrap().is_empty());
        tree.remove(&1).unwrap();
        assert!(tree.begin().unwrap().is_end());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let disk = Arc::new(MemoryDiskManager::new());
        let pool = Arc::new(BufferPoolManager::new(
            4,
            2,
            disk as Arc<dyn DiskManager>,
            Arc::new(NoopLogManager),
        ));

        assert!(BPlusTree::<i64>::new("t", Arc::clone(&pool), 1, 3).is_err());
        assert!(BPlusTree::<i64>::new("t", Arc::clone(&pool), 3, 2).is_err());
        assert!(BPlusTree::<i64>::new("t", Arc::clone(&pool), u16::MAX, 3).is_err());
        let long_name = "n".repeat(HeaderPage::MAX_NAME_LEN + 1);
        assert!(BPlusTree::<i64>::new(long_name, pool, 3, 3).is_err());
    }

    #[test]
    fn test_insert_and_lookup() {
        let (_pool, tree) = make_tree(4, 4, 16);

        for key in [5i64, 1, 9, 3] {
            assert!(tree.insert(key, rid(key)).unwrap());
        }
        assert!(!tree.is_empty());

        for key in [5i64, 1, 9, 3] {
            assert_eq!(tree.get_value(&key).unwrap(), vec![rid(key)]);
        }
        assert!(tree.get_value(&2).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (_pool, tree) = make_tree(4, 4, 16);

        assert!(tree.insert(7, rid(7)).unwrap());
        assert!(!tree.insert(7, rid(8)).unwrap());
        assert_eq!(tree.get_value(&7).unwrap(), vec![rid(7)]);
        assert_eq!(collect_keys(&tree), vec![7]);
    }

    #[test]
    fn test_five_key_build() {
        // leaf_max 3, internal_max 3: 1,2,3 splits the root leaf, 5 splits
        // again and the separators land in one internal root.
        let (_pool, tree) = make_tree(3, 3, 16);

        for key in 1..=2i64 {
            tree.insert(key, rid(key)).unwrap();
        }
        let leaf_root = tree.root_page_id();

        tree.insert(3, rid(3)).unwrap();
        assert_ne!(tree.root_page_id(), leaf_root, "leaf split grows a root");

        for key in 4..=5i64 {
            tree.insert(key, rid(key)).unwrap();
        }

        assert_eq!(tree.get_value(&3).unwrap(), vec![rid(3)]);
        assert_eq!(collect_keys(&tree), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_five_key_remove_rebalances() {
        let (_pool, tree) = make_tree(3, 3, 16);
        for key in 1..=5i64 {
            tree.insert(key, rid(key)).unwrap();
        }

        tree.remove(&2).unwrap();
        tree.remove(&1).unwrap();

        assert!(tree.get_value(&1).unwrap().is_empty());
        assert!(tree.get_value(&2).unwrap().is_empty());
        assert_eq!(collect_keys(&tree), vec![3, 4, 5]);
        for key in 3..=5i64 {
            assert_eq!(tree.get_value(&key).unwrap(), vec![rid(key)]);
        }
    }

    #[test]
    fn test_sequential_inserts_with_small_pool() {
        // Pool of 16 frames forces steady eviction underneath the tree.
        let (pool, tree) = make_tree(4, 4, 16);

        for key in 0..200i64 {
            assert!(tree.insert(key, rid(key)).unwrap());
        }
        for key in 0..200i64 {
            assert_eq!(tree.get_value(&key).unwrap(), vec![rid(key)]);
        }
        assert_eq!(collect_keys(&tree), (0..200).collect::<Vec<_>>());
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_reverse_inserts() {
        let (_pool, tree) = make_tree(4, 4, 32);

        for key in (0..100i64).rev() {
            assert!(tree.insert(key, rid(key)).unwrap());
        }
        assert_eq!(collect_keys(&tree), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_to_empty_root_leaf() {
        let (_pool, tree) = make_tree(3, 3, 16);

        tree.insert(1, rid(1)).unwrap();
        tree.insert(2, rid(2)).unwrap();
        tree.remove(&1).unwrap();
        tree.remove(&2).unwrap();

        // The root leaf stays allocated but holds nothing.
        assert!(!tree.is_empty());
        assert!(tree.get_value(&1).unwrap().is_empty());
        assert_eq!(collect_keys(&tree), Vec::<i64>::new());

        // And keeps working afterwards.
        tree.insert(9, rid(9)).unwrap();
        assert_eq!(collect_keys(&tree), vec![9]);
    }

    #[test]
    fn test_root_collapse_shrinks_height() {
        let (pool, tree) = make_tree(3, 3, 32);
        for key in 1..=5i64 {
            tree.insert(key, rid(key)).unwrap();
        }
        let tall_root = tree.root_page_id();

        for key in [5i64, 4, 3, 2] {
            tree.remove(&key).unwrap();
        }

        assert_ne!(tree.root_page_id(), tall_root, "root collapses");
        assert_eq!(collect_keys(&tree), vec![1]);
        assert_eq!(tree.get_value(&1).unwrap(), vec![rid(1)]);
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_remove_all_then_reinsert() {
        let (pool, tree) = make_tree(4, 4, 32);

        for key in 0..60i64 {
            tree.insert(key, rid(key)).unwrap();
        }
        for key in 0..60i64 {
            tree.remove(&key).unwrap();
        }
        assert_eq!(collect_keys(&tree), Vec::<i64>::new());

        for key in (0..60i64).step_by(2) {
            assert!(tree.insert(key, rid(key)).unwrap());
        }
        assert_eq!(collect_keys(&tree), (0..60).step_by(2).collect::<Vec<_>>());
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_randomized_against_btreemap() {
        let (pool, tree) = make_tree(4, 4, 32);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut oracle = BTreeMap::new();

        let mut keys: Vec<i64> = (0..300).collect();
        keys.shuffle(&mut rng);
        for &key in &keys {
            tree.insert(key, rid(key)).unwrap();
            oracle.insert(key, rid(key));
        }

        let mut to_remove: Vec<i64> = (0..300).step_by(2).collect();
        to_remove.shuffle(&mut rng);
        for &key in &to_remove {
            tree.remove(&key).unwrap();
            oracle.remove(&key);
        }

        let scanned: Vec<(i64, RecordId)> = tree.begin().unwrap().collect();
        let expected: Vec<(i64, RecordId)> = oracle.iter().map(|(&k, &v)| (k, v)).collect();
        assert_eq!(scanned, expected);

        for key in 0..300i64 {
            let got = tree.get_value(&key).unwrap();
            match oracle.get(&key) {
                Some(&v) => assert_eq!(got, vec![v]),
                None => assert!(got.is_empty()),
            }
        }
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_begin_at_positions() {
        let (_pool, tree) = make_tree(4, 4, 32);
        for key in (0..40i64).step_by(4) {
            tree.insert(key, rid(key)).unwrap();
        }

        // Exact hit
        let keys: Vec<i64> = tree.begin_at(&12).unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, (12..40).step_by(4).collect::<Vec<_>>());

        // Between keys: lands on the next greater one
        let keys: Vec<i64> = tree.begin_at(&13).unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, (16..40).step_by(4).collect::<Vec<_>>());

        // Past the last key
        let mut it = tree.begin_at(&99).unwrap();
        assert!(it.next().is_none());
    }

    #[test]
    fn test_iterator_equality_and_sentinel() {
        let (_pool, tree) = make_tree(4, 4, 16);
        tree.insert(1, rid(1)).unwrap();

        assert!(tree.end().is_end());
        assert_eq!(tree.end(), tree.end());

        let begin = tree.begin().unwrap();
        assert!(begin != tree.end());
        assert_eq!(begin.current(), Some((1, rid(1))));
        drop(begin);

        let mut it = tree.begin().unwrap();
        it.next();
        assert!(it.is_end());
        assert_eq!(it, tree.end());
    }

    #[test]
    fn test_root_persisted_across_reopen() {
        let disk = Arc::new(MemoryDiskManager::new());
        let pool = Arc::new(BufferPoolManager::new(
            16,
            2,
            disk as Arc<dyn DiskManager>,
            Arc::new(NoopLogManager),
        ));

        let root;
        {
            let tree =
                BPlusTree::<i64>::new("orders_pk", Arc::clone(&pool), 4, 4).unwrap();
            for key in 0..20i64 {
                tree.insert(key, rid(key)).unwrap();
            }
            root = tree.root_page_id();
        }

        // A fresh handle finds the root through the header page.
        let reopened = BPlusTree::<i64>::new("orders_pk", Arc::clone(&pool), 4, 4).unwrap();
        assert_eq!(reopened.root_page_id(), root);
        assert_eq!(reopened.get_value(&13).unwrap(), vec![rid(13)]);
    }

    #[test]
    fn test_two_indexes_share_header_page() {
        let disk = Arc::new(MemoryDiskManager::new());
        let pool = Arc::new(BufferPoolManager::new(
            32,
            2,
            disk as Arc<dyn DiskManager>,
            Arc::new(NoopLogManager),
        ));

        let a = BPlusTree::<i64>::new("index_a", Arc::clone(&pool), 4, 4).unwrap();
        let b = BPlusTree::<i64>::new("index_b", Arc::clone(&pool), 4, 4).unwrap();

        for key in 0..30i64 {
            a.insert(key, rid(key)).unwrap();
            b.insert(key * 10, rid(key * 10)).unwrap();
        }

        assert_ne!(a.root_page_id(), b.root_page_id());
        assert_eq!(collect_keys(&a), (0..30).collect::<Vec<_>>());
        assert_eq!(
            b.begin().unwrap().map(|(k, _)| k).collect::<Vec<_>>(),
            (0..30).map(|k| k * 10).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_no_pins_leaked_after_mixed_operations() {
        let (pool, tree) = make_tree(3, 3, 16);

        for key in 0..50i64 {
            tree.insert(key, rid(key)).unwrap();
        }
        for key in (0..50i64).step_by(3) {
            tree.remove(&key).unwrap();
        }
        for key in 0..50i64 {
            tree.get_value(&key).unwrap();
        }
        let _ = collect_keys(&tree);

        let stats = pool.stats();
        assert_eq!(stats.pinned_frames, 0, "every fetch must be unpinned");
    }
}
