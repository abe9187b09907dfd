//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as evictable or pins it out of consideration.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame, drops its tracking state, and returns it.
    ///
    /// Returns None if no frames are evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Removes a frame from the replacer. The frame must be evictable.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU-K replacement policy.
///
/// Tracks up to K access timestamps per frame. Frames with fewer than K
/// recorded accesses have infinite backward K-distance and are evicted
/// first, ordered by their oldest recorded access; among frames with a full
/// history the one whose oldest (i.e. K-th most recent) access is earliest
/// is chosen. Ties break by ascending frame id.
pub struct LruKReplacer {
    /// Total number of frames this replacer may track.
    capacity: usize,
    /// K for the backward distance.
    k: usize,
    /// Tracked frames and the timestamp counter, behind one mutex.
    inner: Mutex<LruKInner>,
}

struct LruKInner {
    /// Monotonic access counter.
    current_ts: u64,
    /// Access history and evictable flag per tracked frame.
    frames: HashMap<FrameId, FrameAccess>,
    /// Number of tracked frames currently evictable.
    current_size: usize,
}

struct FrameAccess {
    /// Last up-to-K access timestamps, oldest first.
    history: VecDeque<u64>,
    evictable: bool,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer for `capacity` frames.
    pub fn new(capacity: usize, k: usize) -> Self {
        assert!(k > 0, "LRU-K requires k > 0");
        Self {
            capacity,
            k,
            inner: Mutex::new(LruKInner {
                current_ts: 0,
                frames: HashMap::new(),
                current_size: 0,
            }),
        }
    }

    /// Returns the total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns K.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&self, frame_id: FrameId) {
        assert!(
            (frame_id.0 as usize) < self.capacity,
            "{frame_id} is out of the replacer's range"
        );

        let mut inner = self.inner.lock();
        inner.current_ts += 1;
        let ts = inner.current_ts;
        let entry = inner.frames.entry(frame_id).or_insert_with(|| FrameAccess {
            history: VecDeque::new(),
            evictable: false,
        });
        entry.history.push_back(ts);
        if entry.history.len() > self.k {
            entry.history.pop_front();
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.frames.get_mut(&frame_id) else {
            return;
        };
        if entry.evictable != evictable {
            entry.evictable = evictable;
            if evictable {
                inner.current_size += 1;
            } else {
                inner.current_size -= 1;
            }
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        // (full history, oldest timestamp, frame id), minimized: under-K
        // frames sort before full-K ones, then earliest oldest access wins.
        let mut victim: Option<(bool, u64, FrameId)> = None;
        for (&frame_id, entry) in &inner.frames {
            if !entry.evictable {
                continue;
            }
            let oldest = *entry
                .history
                .front()
                .expect("tracked frame has at least one access");
            let candidate = (entry.history.len() >= self.k, oldest, frame_id);
            if victim.map_or(true, |best| candidate < best) {
                victim = Some(candidate);
            }
        }

        let (_, _, frame_id) = victim?;
        inner.frames.remove(&frame_id);
        inner.current_size -= 1;
        Some(frame_id)
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.frames.get(&frame_id) else {
            return;
        };
        assert!(entry.evictable, "{frame_id} is pinned and cannot be removed");
        inner.frames.remove(&frame_id);
        inner.current_size -= 1;
    }

    fn size(&self) -> usize {
        self.inner.lock().current_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_new() {
        let replacer = LruKReplacer::new(10, 2);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.k(), 2);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_evict_empty() {
        let replacer = LruKReplacer::new(10, 2);
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_set_evictable_counts() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.record_access(FrameId(2));
        assert_eq!(replacer.size(), 0);

        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.size(), 2);

        // Repeated toggles must not double-count
        replacer.set_evictable(FrameId(1), true);
        assert_eq!(replacer.size(), 2);

        replacer.set_evictable(FrameId(1), false);
        assert_eq!(replacer.size(), 1);

        // Unknown frame is a no-op
        replacer.set_evictable(FrameId(9), true);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_lru_k_under_k_preferred() {
        let replacer = LruKReplacer::new(10, 2);

        // Frame 0 gets a full history, frame 1 stays under-K with a later
        // access; the under-K frame must still be evicted first.
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(0)));
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_eviction_order() {
        // Frames 1-6, K=2, access sequence 1,2,3,4,5,6,1,2,3,1,2,3,4,5,6.
        // Frames 4,5,6 keep a single recorded pair with early oldest
        // timestamps; eviction must yield 4,5,6,1,2,3.
        let replacer = LruKReplacer::new(10, 2);

        for f in [1u32, 2, 3, 4, 5, 6, 1, 2, 3, 1, 2, 3, 4, 5, 6] {
            replacer.record_access(FrameId(f));
        }
        for f in 1..=6u32 {
            replacer.set_evictable(FrameId(f), true);
        }
        assert_eq!(replacer.size(), 6);

        let order: Vec<u32> = std::iter::from_fn(|| replacer.evict().map(|f| f.0)).collect();
        assert_eq!(order, vec![4, 5, 6, 1, 2, 3]);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_evicted_frame_forgotten() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        replacer.set_evictable(FrameId(0), true);
        assert_eq!(replacer.evict(), Some(FrameId(0)));

        // History was dropped with the frame; re-recording starts fresh
        // and the frame comes back non-evictable.
        replacer.record_access(FrameId(0));
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_pinned_frames_skipped() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(0), false);

        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_k_remove() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        replacer.remove(FrameId(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId(1)));

        // Removing an untracked frame is a no-op
        replacer.remove(FrameId(7));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    #[should_panic(expected = "pinned")]
    fn test_lru_k_remove_pinned_panics() {
        let replacer = LruKReplacer::new(10, 2);
        replacer.record_access(FrameId(0));
        replacer.remove(FrameId(0));
    }

    #[test]
    #[should_panic(expected = "out of the replacer's range")]
    fn test_lru_k_record_access_out_of_range_panics() {
        let replacer = LruKReplacer::new(5, 2);
        replacer.record_access(FrameId(5));
    }

    #[test]
    fn test_lru_k_history_bounded() {
        let replacer = LruKReplacer::new(10, 2);

        // Frame 0 accessed many times early, frame 1 twice late. With only
        // the last K=2 accesses retained, frame 0's oldest recorded access
        // is later than frame 1's and frame 1 must go first... unless the
        // early accesses were still in history, which would flip the order.
        for _ in 0..5 {
            replacer.record_access(FrameId(1));
        }
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(0));
        replacer.set_evictable(FrameId(0), true);
        replacer.set_evictable(FrameId(1), true);

        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(0)));
    }

    #[test]
    fn test_lru_k_tie_break_by_frame_id() {
        let replacer = LruKReplacer::new(10, 3);

        // Both frames under-K; frame 2's first access precedes frame 1's,
        // so it wins despite the larger id. Equal-timestamp ties cannot
        // occur with a monotonic counter, so ordering is by oldest access
        // and only then by id.
        replacer.record_access(FrameId(2));
        replacer.record_access(FrameId(1));
        replacer.set_evictable(FrameId(1), true);
        replacer.set_evictable(FrameId(2), true);

        assert_eq!(replacer.evict(), Some(FrameId(2)));
        assert_eq!(replacer.evict(), Some(FrameId(1)));
    }

    #[test]
    fn test_lru_k_one_behaves_like_lru() {
        let replacer = LruKReplacer::new(10, 1);

        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.record_access(FrameId(0));
        for f in 0..2u32 {
            replacer.set_evictable(FrameId(f), true);
        }

        // With K=1 only the most recent access counts: frame 1 is older.
        assert_eq!(replacer.evict(), Some(FrameId(1)));
        assert_eq!(replacer.evict(), Some(FrameId(0)));
    }
}
