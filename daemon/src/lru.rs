//! Bounded LRU cache for resolved events
//!
//! A hash map from key to slot index over a slab of entries linked into a
//! doubly-linked list by index, eldest at the head. No unsafe and no
//! pointer chasing; every operation is amortized O(1).

use std::collections::HashMap;
use std::hash::Hash;

struct Entry<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    /// Eldest entry, evicted first.
    head: Option<usize>,
    /// Newest entry.
    tail: Option<usize>,
    max_size: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Capacity below 1 is clamped to 1.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        LruCache {
            map: HashMap::with_capacity(max_size),
            slots: Vec::with_capacity(max_size),
            free: Vec::new(),
            head: None,
            tail: None,
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.touch(index);
        self.slots[index].as_ref().map(|e| &e.value)
    }

    /// Look up without disturbing the recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.slots[index].as_ref().map(|e| &e.value)
    }

    /// Insert or replace, marking the entry most recently used. Returns
    /// the evicted eldest entry when the insert overflowed the capacity.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&index) = self.map.get(&key) {
            if let Some(entry) = self.slots[index].as_mut() {
                entry.value = value;
            }
            self.touch(index);
            return None;
        }

        let evicted = if self.map.len() >= self.max_size {
            self.pop_eldest()
        } else {
            None
        };

        let entry = Entry {
            key: key.clone(),
            value,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        if let Some(tail) = self.tail {
            if let Some(prev_entry) = self.slots[tail].as_mut() {
                prev_entry.next = Some(index);
            }
        }
        self.tail = Some(index);
        if self.head.is_none() {
            self.head = Some(index);
        }
        self.map.insert(key, index);
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.map.remove(key)?;
        self.detach(index);
        let entry = self.slots[index].take()?;
        self.free.push(index);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Mutable walk over all entries in slab order, without touching
    /// recency.
    pub fn values_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut().map(|e| (&e.key, &mut e.value)))
    }

    /// Entries eldest to newest.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cache: self,
            cursor: self.head,
        }
    }

    fn pop_eldest(&mut self) -> Option<(K, V)> {
        let index = self.head?;
        self.detach(index);
        let entry = self.slots[index].take()?;
        self.map.remove(&entry.key);
        self.free.push(index);
        Some((entry.key, entry.value))
    }

    /// Unlink the slot from the list, leaving the slot itself in place.
    fn detach(&mut self, index: usize) {
        let (prev, next) = match self.slots[index].as_ref() {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(entry) = self.slots[p].as_mut() {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(entry) = self.slots[n].as_mut() {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(entry) = self.slots[index].as_mut() {
            entry.prev = None;
            entry.next = None;
        }
    }

    /// Move the slot to the newest end.
    fn touch(&mut self, index: usize) {
        if self.tail == Some(index) {
            return;
        }
        self.detach(index);
        if let Some(entry) = self.slots[index].as_mut() {
            entry.prev = self.tail;
        }
        if let Some(tail) = self.tail {
            if let Some(entry) = self.slots[tail].as_mut() {
                entry.next = Some(index);
            }
        }
        self.tail = Some(index);
        if self.head.is_none() {
            self.head = Some(index);
        }
    }
}

pub struct Iter<'a, K, V> {
    cache: &'a LruCache<K, V>,
    cursor: Option<usize>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let entry = self.cache.slots[index].as_ref()?;
        self.cursor = entry.next;
        Some((&entry.key, &entry.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_eldest_on_overflow() {
        let mut cache = LruCache::new(2);
        assert!(cache.insert(1, "a").is_none());
        assert!(cache.insert(2, "b").is_none());
        assert_eq!(cache.insert(3, "c"), Some((1, "a")));
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = LruCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        assert_eq!(cache.get(&1), Some(&"a"));
        // 2 is now the eldest.
        assert_eq!(cache.insert(3, "c"), Some((2, "b")));
        assert!(cache.contains(&1));
    }

    #[test]
    fn insert_existing_replaces_and_refreshes() {
        let mut cache = LruCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        assert!(cache.insert(1, "a2").is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.insert(3, "c"), Some((2, "b")));
        assert_eq!(cache.peek(&1), Some(&"a2"));
    }

    #[test]
    fn remove_frees_capacity() {
        let mut cache = LruCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        assert_eq!(cache.remove(&1), Some("a"));
        assert_eq!(cache.len(), 1);
        assert!(cache.insert(3, "c").is_none());
        assert_eq!(cache.remove(&1), None);
    }

    #[test]
    fn iter_runs_eldest_to_newest() {
        let mut cache = LruCache::new(3);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(3, "c");
        cache.get(&1);
        let keys: Vec<i32> = cache.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![2, 3, 1]);
    }

    #[test]
    fn capacity_is_clamped_to_one() {
        let mut cache = LruCache::new(0);
        cache.insert(1, "a");
        assert_eq!(cache.insert(2, "b"), Some((1, "a")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_empties_everything() {
        let mut cache = LruCache::new(3);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.iter().count(), 0);
        cache.insert(4, "d");
        assert_eq!(cache.len(), 1);
    }
}
