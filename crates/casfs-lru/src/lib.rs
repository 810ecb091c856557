//! # casfs-lru
//!
//! A fixed-capacity, thread-safe LRU cache for hot metadata (path lookups,
//! chunk tables, catalog entries).
//!
//! Entries live in a closed-addressing hash table; recency is tracked by a
//! doubly linked list realized as integer-indexed nodes in a bitmap-allocated
//! pool, so a full cache never allocates.  The capacity must be a multiple of
//! 64 and at least 128.
//!
//! ```
//! use casfs_lru::LruCache;
//!
//! let cache: LruCache<u32, String> = LruCache::new(128);
//! cache.insert(42, "fourtytwo".to_string());
//! assert_eq!(cache.lookup(&42), Some("fourtytwo".to_string()));
//! ```

mod pool;
mod smallhash;

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use pool::BitmapAllocator;
use smallhash::SmallHash;

/// Operation counts, snapshotted under the cache lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub n_hit: u64,
    pub n_miss: u64,
    pub n_insert: u64,
    pub n_update: u64,
    pub n_update_value: u64,
    pub n_replace: u64,
    pub n_forget: u64,
    pub n_drop: u64,
}

struct Node<K> {
    key: Option<K>,
    prev: u32,
    next: u32,
}

struct TableEntry<V> {
    node: u32,
    value: V,
}

struct Inner<K, V> {
    paused: bool,
    gauge: u32,
    capacity: u32,
    /// Index of the sentinel node; `nodes[sentinel].next` is the LRU end,
    /// `nodes[sentinel].prev` the MRU end.
    sentinel: u32,
    nodes: Vec<Node<K>>,
    alloc: BitmapAllocator,
    table: SmallHash<K, TableEntry<V>>,
    counters: Counters,
}

impl<K: Hash + Eq + Clone, V: Clone> Inner<K, V> {
    fn new(capacity: u32) -> Self {
        let alloc = BitmapAllocator::new(capacity);
        let sentinel = capacity;
        let mut nodes: Vec<Node<K>> = (0..=capacity)
            .map(|_| Node {
                key: None,
                prev: sentinel,
                next: sentinel,
            })
            .collect();
        nodes[sentinel as usize].prev = sentinel;
        nodes[sentinel as usize].next = sentinel;
        Self {
            paused: false,
            gauge: 0,
            capacity,
            sentinel,
            nodes,
            alloc,
            table: SmallHash::with_capacity(capacity as usize),
            counters: Counters::default(),
        }
    }

    /// Link `idx` in front of the sentinel (MRU end).
    fn link_back(&mut self, idx: u32) {
        let tail = self.nodes[self.sentinel as usize].prev;
        self.nodes[idx as usize].prev = tail;
        self.nodes[idx as usize].next = self.sentinel;
        self.nodes[tail as usize].next = idx;
        self.nodes[self.sentinel as usize].prev = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let prev = self.nodes[idx as usize].prev;
        let next = self.nodes[idx as usize].next;
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;
        self.nodes[idx as usize].prev = idx;
        self.nodes[idx as usize].next = idx;
    }

    fn touch(&mut self, idx: u32) {
        self.unlink(idx);
        self.link_back(idx);
    }

    /// Drop the entry at the LRU end.
    fn evict_oldest(&mut self) {
        assert!(self.gauge > 0);
        let victim = self.nodes[self.sentinel as usize].next;
        assert_ne!(victim, self.sentinel);
        self.unlink(victim);
        let key = self.nodes[victim as usize].key.take().expect("linked node has a key");
        self.table.remove(&key);
        self.alloc.release(victim);
        self.gauge -= 1;
        self.counters.n_replace += 1;
    }

    /// Remove the node at `idx` and its table entry.
    fn remove_node(&mut self, idx: u32) {
        self.unlink(idx);
        let key = self.nodes[idx as usize].key.take().expect("linked node has a key");
        self.table.remove(&key);
        self.alloc.release(idx);
        self.gauge -= 1;
        self.counters.n_forget += 1;
    }
}

/// Bounded key/value cache with least-recently-used eviction.
///
/// A single mutex covers every operation; critical sections are O(1) except
/// for filter traversals, which hold the lock for their whole lifetime.
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    /// Create a cache for `capacity` entries.  The node pool is allocated
    /// here and never grows or shrinks.
    ///
    /// Panics if `capacity` is not a multiple of 64 or is below 128.
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a key/value pair, evicting the least recently used entry when
    /// full.  An existing key is updated in place and moved to the MRU end.
    /// Returns true on insert, false on update (or while paused).
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut inner = self.lock();
        if inner.paused {
            return false;
        }

        if let Some(entry) = inner.table.get_mut(&key) {
            entry.value = value;
            let node = entry.node;
            inner.counters.n_update += 1;
            inner.touch(node);
            return false;
        }

        inner.counters.n_insert += 1;
        if inner.gauge >= inner.capacity {
            inner.evict_oldest();
        }
        let idx = inner.alloc.allocate();
        inner.nodes[idx as usize].key = Some(key.clone());
        inner.link_back(idx);
        inner.table.insert(key, TableEntry { node: idx, value });
        inner.gauge += 1;
        true
    }

    /// Move an existing key to the MRU end.  Calling this on an absent key is
    /// a programming error.
    pub fn update(&self, key: &K) {
        let mut inner = self.lock();
        assert!(!inner.paused);
        let node = inner.table.get(key).expect("update of an absent key").node;
        inner.counters.n_update += 1;
        inner.touch(node);
    }

    /// Replace the value of an existing key without touching recency order.
    pub fn update_value(&self, key: &K, value: V) -> bool {
        let mut inner = self.lock();
        if inner.paused {
            return false;
        }
        match inner.table.get_mut(key) {
            Some(entry) => {
                entry.value = value;
                inner.counters.n_update_value += 1;
                true
            }
            None => false,
        }
    }

    /// Look up a key, marking it recently used on a hit.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.lookup_inner(key, true)
    }

    /// Look up a key without changing recency order.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.lookup_inner(key, false)
    }

    fn lookup_inner(&self, key: &K, update_lru: bool) -> Option<V> {
        let mut inner = self.lock();
        if inner.paused {
            return None;
        }
        match inner.table.get(key) {
            Some(entry) => {
                let node = entry.node;
                let value = entry.value.clone();
                inner.counters.n_hit += 1;
                if update_lru {
                    inner.touch(node);
                }
                Some(value)
            }
            None => {
                inner.counters.n_miss += 1;
                None
            }
        }
    }

    /// Remove a key.  Returns false if it was not cached.
    pub fn forget(&self, key: &K) -> bool {
        let mut inner = self.lock();
        if inner.paused {
            return false;
        }
        match inner.table.get(key) {
            Some(entry) => {
                let node = entry.node;
                inner.remove_node(node);
                true
            }
            None => false,
        }
    }

    /// Remove every entry.  The node pool stays allocated.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let sentinel = inner.sentinel;
        let mut idx = inner.nodes[sentinel as usize].next;
        while idx != sentinel {
            let next = inner.nodes[idx as usize].next;
            inner.nodes[idx as usize].key = None;
            inner.nodes[idx as usize].prev = idx;
            inner.nodes[idx as usize].next = idx;
            idx = next;
        }
        inner.nodes[sentinel as usize].prev = sentinel;
        inner.nodes[sentinel as usize].next = sentinel;
        inner.alloc.clear();
        inner.table.clear();
        inner.gauge = 0;
        inner.counters.n_drop += 1;
    }

    /// Stop serving: until `resume`, every lookup and mutation no-ops and
    /// reports a miss.  Used to keep a transiently inconsistent upper layer
    /// from poisoning the cache.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
    }

    pub fn is_full(&self) -> bool {
        let inner = self.lock();
        inner.gauge >= inner.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.lock().gauge == 0
    }

    pub fn len(&self) -> usize {
        self.lock().gauge as usize
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity as usize
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    /// Begin a filter traversal from the LRU end toward the MRU end.  The
    /// cache lock is held until the returned guard is dropped.
    pub fn filter(&self) -> Filter<'_, K, V> {
        let guard = self.lock();
        let cursor = guard.sentinel;
        Filter { guard, cursor }
    }
}

/// Cursor over the cache in eviction order, with deletion.  Holds the cache
/// lock for its whole lifetime.
pub struct Filter<'a, K, V> {
    guard: MutexGuard<'a, Inner<K, V>>,
    cursor: u32,
}

impl<K: Hash + Eq + Clone, V: Clone> Filter<'_, K, V> {
    /// Advance to the next entry; false once the traversal is exhausted.
    pub fn next(&mut self) -> bool {
        self.cursor = self.guard.nodes[self.cursor as usize].next;
        self.cursor != self.guard.sentinel
    }

    /// The entry under the cursor.  Only valid after `next` returned true.
    pub fn get(&self) -> (&K, &V) {
        assert_ne!(self.cursor, self.guard.sentinel, "cursor not on an entry");
        let key = self.guard.nodes[self.cursor as usize]
            .key
            .as_ref()
            .expect("linked node has a key");
        let value = &self.guard.table.get(key).expect("table entry for linked key").value;
        (key, value)
    }

    /// Delete the entry under the cursor; the cursor steps back so the
    /// following `next` continues with the successor.
    pub fn delete(&mut self) {
        assert_ne!(self.cursor, self.guard.sentinel, "cursor not on an entry");
        let prev = self.guard.nodes[self.cursor as usize].prev;
        let doomed = self.cursor;
        self.guard.remove_node(doomed);
        self.cursor = prev;
    }
}
