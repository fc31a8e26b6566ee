use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Concurrency-safe map from keys to 32-bit counters.
///
/// Increments and reads from concurrent threads need no external
/// coordination; there is no per-operation global lock.
#[derive(Debug, Default)]
pub struct CountersMap<K: Eq + Hash> {
    data: DashMap<K, AtomicU32>,
}

impl<K: Eq + Hash + Clone> CountersMap<K> {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Increase the counter for `key` by 1.
    /// Returns `true` if the key already existed, `false` if it was newly created.
    pub fn increment(&self, key: K) -> bool {
        self.add(key, 1)
    }

    /// Increase the counter for `key` by `v`.
    /// Returns `true` if the key already existed, `false` if it was newly created.
    pub fn add(&self, key: K, v: u32) -> bool {
        // Fast path: the entry usually exists already.
        if let Some(counter) = self.data.get(&key) {
            counter.fetch_add(v, Ordering::Relaxed);
            return true;
        }

        match self.data.entry(key) {
            Entry::Occupied(e) => {
                e.get().fetch_add(v, Ordering::Relaxed);
                true
            }
            Entry::Vacant(e) => {
                e.insert(AtomicU32::new(v));
                false
            }
        }
    }

    /// Current counter value for `key`, and whether the key exists.
    pub fn get(&self, key: &K) -> (u32, bool) {
        match self.data.get(key) {
            Some(counter) => (counter.load(Ordering::Relaxed), true),
            None => (0, false),
        }
    }

    /// Iterate over all key/count pairs, calling `f` for each.
    /// Iteration stops when `f` returns `false`.
    ///
    /// The counts do not form a consistent snapshot: they may change while
    /// iteration is in progress. Callers that need a stable view must stop
    /// all writers first.
    pub fn range(&self, mut f: impl FnMut(&K, u32) -> bool) {
        for item in self.data.iter() {
            if !f(item.key(), item.value().load(Ordering::Relaxed)) {
                break;
            }
        }
    }

    /// Collect the current counter values into a plain map.
    /// Subject to the same snapshot caveat as [`CountersMap::range`].
    pub fn count_map(&self) -> HashMap<K, u32> {
        let mut r = HashMap::with_capacity(self.data.len());
        self.range(|k, count| {
            r.insert(k.clone(), count);
            true
        });
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_reports_presence() {
        let m = CountersMap::new();
        assert!(!m.increment("a"));
        assert!(m.increment("a"));
        assert!(!m.increment("b"));
        assert_eq!(m.get(&"a"), (2, true));
        assert_eq!(m.get(&"b"), (1, true));
        assert_eq!(m.get(&"c"), (0, false));
    }

    #[test]
    fn add_accumulates() {
        let m = CountersMap::new();
        m.add("k", 10);
        m.add("k", 5);
        assert_eq!(m.get(&"k"), (15, true));
    }

    #[test]
    fn range_visits_all_keys() {
        let m = CountersMap::new();
        m.increment("x");
        m.increment("y");
        m.increment("y");

        let counts = m.count_map();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&"x"], 1);
        assert_eq!(counts[&"y"], 2);
    }

    #[test]
    fn range_stops_early() {
        let m = CountersMap::new();
        m.increment(1);
        m.increment(2);
        m.increment(3);

        let mut seen = 0;
        m.range(|_, _| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }
}
