//! Extendible hash table used as the buffer pool's page table.

use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// Dynamically growing hash table with extendible directory doubling.
///
/// The directory is indexed by the low `global_depth` bits of the key hash
/// and stores indices into a bucket arena, so several directory slots may
/// share one bucket whenever the bucket's `local_depth` is smaller than the
/// global depth. Doubling the directory copies indices, never buckets.
///
/// All operations take a single table-wide mutex, which is sufficient for
/// the page-table workload of the buffer pool (the pool serializes its
/// metadata behind its own latch anyway).
///
/// The hasher is pluggable the way `HashMap`'s is; tests that assert on
/// directory growth can pin an identity hash for integer keys.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    /// Maximum number of items per bucket.
    bucket_size: usize,
    hasher: S,
    dir: Mutex<Directory<K, V>>,
}

struct Directory<K, V> {
    global_depth: u32,
    /// Bucket arena; slots below index into it.
    buckets: Vec<Bucket<K, V>>,
    /// Directory slots, one per low-bit pattern of the hash.
    slots: Vec<usize>,
}

struct Bucket<K, V> {
    local_depth: u32,
    items: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32) -> Self {
        Self {
            local_depth,
            items: Vec::new(),
        }
    }
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq,
{
    /// Creates an empty table: one bucket, global depth 0.
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates an empty table using the given hasher.
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        assert!(bucket_size > 0, "bucket_size must be positive");
        Self {
            bucket_size,
            hasher,
            dir: Mutex::new(Directory {
                global_depth: 0,
                buckets: vec![Bucket::new(0)],
                slots: vec![0],
            }),
        }
    }

    /// Directory index for a key at the given depth.
    fn index_of(&self, key: &K, global_depth: u32) -> usize {
        let mask = (1usize << global_depth) - 1;
        (self.hasher.hash_one(key) as usize) & mask
    }

    /// Returns the value stored under `key`, if any.
    pub fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let dir = self.dir.lock();
        let idx = self.index_of(key, dir.global_depth);
        let bucket = &dir.buckets[dir.slots[idx]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Removes `key`. Returns true if it was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut dir = self.dir.lock();
        let idx = self.index_of(key, dir.global_depth);
        let slot = dir.slots[idx];
        let bucket = &mut dir.buckets[slot];
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Inserts or overwrites `key`, splitting buckets and doubling the
    /// directory as often as needed for the insert to succeed.
    pub fn insert(&self, key: K, value: V) {
        let mut dir = self.dir.lock();
        loop {
            let idx = self.index_of(&key, dir.global_depth);
            let slot = dir.slots[idx];
            let bucket = &mut dir.buckets[slot];

            if let Some(item) = bucket.items.iter_mut().find(|(k, _)| k == &key) {
                item.1 = value;
                return;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                return;
            }

            self.split(&mut dir, idx);
        }
    }

    /// Splits the full bucket behind directory slot `idx`, doubling the
    /// directory first when the bucket's depth already equals the global
    /// depth, then redistributes the old bucket's items.
    fn split(&self, dir: &mut Directory<K, V>, idx: usize) {
        let old_bucket = dir.slots[idx];
        let new_bucket = dir.buckets.len();

        if dir.buckets[old_bucket].local_depth == dir.global_depth {
            // Double the directory: new slot i + old_len starts out
            // aliasing slot i, except the one alias of the split bucket,
            // which gets the fresh bucket.
            let old_len = dir.slots.len();
            let dup = dir.slots.clone();
            dir.slots.extend(dup);
            dir.global_depth += 1;
            dir.buckets[old_bucket].local_depth += 1;
            let depth = dir.buckets[old_bucket].local_depth;
            dir.buckets.push(Bucket::new(depth));
            dir.slots[idx + old_len] = new_bucket;
        } else {
            dir.buckets[old_bucket].local_depth += 1;
            let depth = dir.buckets[old_bucket].local_depth;
            dir.buckets.push(Bucket::new(depth));
            // Every slot whose low depth-1 bits match the split bucket's
            // suffix and whose next bit is set moves to the new bucket.
            let suffix_mask = (1usize << (depth - 1)) - 1;
            let high_bit = 1usize << (depth - 1);
            let target = (idx & suffix_mask) | high_bit;
            let full_mask = (1usize << depth) - 1;
            for slot in 0..dir.slots.len() {
                if slot & full_mask == target {
                    dir.slots[slot] = new_bucket;
                }
            }
        }

        // Redistribute under the updated hashing. Each side receives at
        // most the old item count, so neither can exceed bucket_size here.
        let items = std::mem::take(&mut dir.buckets[old_bucket].items);
        for (k, v) in items {
            let i = self.index_of(&k, dir.global_depth);
            let b = dir.slots[i];
            dir.buckets[b].items.push((k, v));
        }
    }

    /// Current global depth of the directory.
    pub fn global_depth(&self) -> u32 {
        self.dir.lock().global_depth
    }

    /// Local depth of the bucket behind directory slot `dir_index`.
    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let dir = self.dir.lock();
        dir.buckets[dir.slots[dir_index]].local_depth
    }

    /// Number of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        self.dir.lock().buckets.len()
    }

    /// Number of directory slots (2^global_depth).
    pub fn dir_size(&self) -> usize {
        self.dir.lock().slots.len()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        let dir = self.dir.lock();
        dir.buckets.iter().map(|b| b.items.len()).sum()
    }

    /// Returns true if no items are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
