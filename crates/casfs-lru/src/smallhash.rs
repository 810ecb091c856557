//! Fixed-size closed-addressing hash table with linear probing.
//!
//! Sized once for the cache capacity; never grows.  Deletion uses the
//! classic backward-shift so no tombstones accumulate.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub(crate) struct SmallHash<K, V> {
    slots: Vec<Option<(K, V)>>,
    mask: usize,
    len: usize,
}

impl<K: Hash + Eq, V> SmallHash<K, V> {
    /// Table sized for `expected` entries at ≤ 50% load.
    pub fn with_capacity(expected: usize) -> Self {
        let size = (expected.max(8) * 2).next_power_of_two();
        Self {
            slots: (0..size).map(|_| None).collect(),
            mask: size - 1,
            len: 0,
        }
    }

    fn home_slot(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    fn find(&self, key: &K) -> Option<usize> {
        let mut i = self.home_slot(key);
        loop {
            match &self.slots[i] {
                Some((k, _)) if k == key => return Some(i),
                Some(_) => i = (i + 1) & self.mask,
                None => return None,
            }
        }
    }

    /// Insert or replace; returns the previous value on replace.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        assert!(self.len < self.slots.len(), "table over capacity");
        let mut i = self.home_slot(&key);
        loop {
            match &self.slots[i] {
                Some((k, _)) if *k == key => break,
                Some(_) => i = (i + 1) & self.mask,
                None => break,
            }
        }
        match self.slots[i].replace((key, value)) {
            Some((_, old)) => Some(old),
            None => {
                self.len += 1;
                None
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.find(key)
            .and_then(|i| self.slots[i].as_ref().map(|(_, v)| v))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let i = self.find(key)?;
        self.slots[i].as_mut().map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let mut i = self.find(key)?;
        let (_, removed) = self.slots[i].take()?;
        self.len -= 1;

        // Backward-shift the probe cluster so lookups stay correct.
        let mut j = i;
        loop {
            j = (j + 1) & self.mask;
            let home = match &self.slots[j] {
                Some((k, _)) => self.home_slot(k),
                None => break,
            };
            let in_between = if i <= j {
                i < home && home <= j
            } else {
                i < home || home <= j
            };
            if in_between {
                continue;
            }
            self.slots[i] = self.slots[j].take();
            i = j;
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
