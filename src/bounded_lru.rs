//! A [BoundedLruCache] is an LRU map which accounts for the size of its items and evicts until the total size is
//! within a ceiling.
//!
//! This is implemented on top of a vec-backed linked list plus an auxiliary hash-based index.  Both `get` and `put`
//! count as a touch.  Evicted entries are reported to an [EvictionListener] while they are still in the cache, so the
//! listener can inspect the value before it goes away.
//!
//! An item whose own size is at least the maximum size is never inserted: it goes straight to the listener and the
//! cache is left untouched.  This makes the cache usable as a funnel which immediately hands back items too large to
//! keep.
use std::collections::HashMap;
use std::hash::Hash;

use ahash::RandomState;

use crate::linked_slab::LinkedSlab;

/// Estimate the cost of an item.  This is usually in bytes.
///
/// Pass [cost_of] as the sizer of a [BoundedLruCache] to account items by their estimated cost.
pub trait EstimateCost {
    fn estimate_cost(&self) -> u64;
}

/// Sizer which uses [EstimateCost].
pub fn cost_of<V: EstimateCost>(item: &V) -> u64 {
    item.estimate_cost()
}

/// Sizer which counts every item as 1, turning the cache into a plain count-bounded LRU.
pub fn unit_size<V>(_item: &V) -> u64 {
    1
}

/// Told about every entry which leaves the cache because of a size constraint.
pub trait EvictionListener<K, V> {
    fn on_evicted(&mut self, key: &K, value: &V);
}

/// A listener which ignores evictions.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreEvictions;

impl<K, V> EvictionListener<K, V> for IgnoreEvictions {
    fn on_evicted(&mut self, _key: &K, _value: &V) {}
}

impl<K, V, F: FnMut(&K, &V)> EvictionListener<K, V> for F {
    fn on_evicted(&mut self, key: &K, value: &V) {
        self(key, value)
    }
}

struct Entry<K, V> {
    key: K,
    value: V,
    size: u64,
}

pub struct BoundedLruCache<K, V, L = IgnoreEvictions> {
    entries: LinkedSlab<Entry<K, V>>,
    /// Points at the slab index of the key.
    index: HashMap<K, usize, RandomState>,
    /// The configured ceiling, before any multiplier.
    initial_max_size: u64,
    /// The ceiling currently in force.
    max_size: u64,
    /// Current size of the items in the cache.
    current_size: u64,
    sizer: fn(&V) -> u64,
    listener: L,
}

impl<K: Hash + Eq + Clone, V> BoundedLruCache<K, V, IgnoreEvictions> {
    /// A cache counting every item as size 1 and ignoring evictions.
    pub fn new(max_size: u64) -> BoundedLruCache<K, V, IgnoreEvictions> {
        BoundedLruCache::with_listener(max_size, unit_size, IgnoreEvictions)
    }
}

impl<K: Hash + Eq + Clone, V, L: EvictionListener<K, V>> BoundedLruCache<K, V, L> {
    pub fn with_listener(max_size: u64, sizer: fn(&V) -> u64, listener: L) -> BoundedLruCache<K, V, L> {
        BoundedLruCache {
            entries: LinkedSlab::new(),
            index: Default::default(),
            initial_max_size: max_size,
            max_size,
            current_size: 0,
            sizer,
            listener,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look an item up, making it the most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let ind = *self.index.get(key)?;
        self.entries.move_to_front(ind);
        self.entries.get(ind).map(|e| &e.value)
    }

    /// Look an item up without counting it as a touch.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let ind = *self.index.get(key)?;
        self.entries.get(ind).map(|e| &e.value)
    }

    /// Add an entry to the cache.
    ///
    /// If the key was already present, the old value is handed back to the caller rather than to the listener.  If
    /// the new value is at least as large as the whole cache it is reported to the listener and nothing changes.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        let size = (self.sizer)(&value);
        if size >= self.max_size {
            self.listener.on_evicted(&key, &value);
            return None;
        }

        let old = self.remove(&key);
        let ind = self.entries.push_front(Entry {
            key: key.clone(),
            value,
            size,
        });
        self.index.insert(key, ind);
        self.current_size += size;

        let ceiling = self.max_size;
        self.trim_to_size(ceiling);
        old
    }

    /// Remove an entry without telling the listener.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let ind = self.index.remove(key)?;
        let entry = self.entries.remove(ind)?;
        self.current_size -= entry.size;
        Some(entry.value)
    }

    /// Evict least recently used entries until the total size is at most `size`.
    pub fn trim_to_size(&mut self, size: u64) {
        while self.current_size > size {
            let last = match self.entries.back() {
                Some(l) => l,
                None => break,
            };

            // The listener sees the entry before our book-keeping forgets it.
            if let Some(entry) = self.entries.get(last) {
                self.listener.on_evicted(&entry.key, &entry.value);
            }

            if let Some(entry) = self.entries.remove(last) {
                self.index.remove(&entry.key);
                self.current_size -= entry.size;
            }
        }
    }

    /// Evict everything, telling the listener about each entry.
    pub fn clear_memory(&mut self) {
        self.trim_to_size(0);
        // Zero-sized items survive trimming by size alone.
        while let Some(last) = self.entries.back() {
            if let Some(entry) = self.entries.get(last) {
                self.listener.on_evicted(&entry.key, &entry.value);
            }
            if let Some(entry) = self.entries.remove(last) {
                self.index.remove(&entry.key);
            }
        }
        self.entries.clear();
        self.index.clear();
        self.current_size = 0;
    }

    /// Replace the configured ceiling, keeping any size multiplier in force.
    pub fn set_max_size(&mut self, max_size: u64) {
        let multiplier = if self.initial_max_size == 0 {
            1.0
        } else {
            self.max_size as f64 / self.initial_max_size as f64
        };
        self.initial_max_size = max_size;
        self.apply_ceiling((max_size as f64 * multiplier).round() as u64);
    }

    /// Rescale the ceiling relative to the configured one and evict down to it.
    ///
    /// Negative multipliers are treated as zero.
    pub fn set_size_multiplier(&mut self, multiplier: f32) {
        let multiplier = f64::from(multiplier.max(0.0));
        self.apply_ceiling((self.initial_max_size as f64 * multiplier).round() as u64);
    }

    fn apply_ceiling(&mut self, max_size: u64) {
        self.max_size = max_size;
        self.trim_to_size(max_size);
    }

    /// Iterator visiting entries in most-recently-used order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|e| (&e.key, &e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lru::LruCache;
    use proptest::prelude::*;

    /// Simple helper to build proptest strategies so that we can test the unit-size case against [LruCache].
    #[derive(Copy, Clone, Debug, Ord, Eq, PartialOrd, PartialEq)]
    enum CacheCommand {
        Put(u64, u64),
        Get(u64),
        Delete(u64),
    }

    fn cache_command_strat(
        max_key: std::ops::Range<u64>,
        max_value: std::ops::Range<u64>,
    ) -> prop::strategy::BoxedStrategy<CacheCommand> {
        proptest::prop_oneof![
            max_key.clone().prop_map(CacheCommand::Get),
            (max_key.clone(), max_value).prop_map(|(x, y)| CacheCommand::Put(x, y)),
            max_key.prop_map(CacheCommand::Delete),
        ]
        .boxed()
    }

    fn value_as_size(v: &u64) -> u64 {
        *v
    }

    // With every item costing 1 and a ceiling of at least 2, we get something exactly equivalent to [LruCache].
    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 500,
            max_shrink_iters: 10000,
            ..Default::default()
        })]
        #[test]
        fn test_against_lru_cache_bounded(
            bound in 2..200u64,
            commands in prop::collection::vec(cache_command_strat(0..100, 0..10000), 0..2000)
        ) {
            let mut known_good = LruCache::<u64, u64>::new(bound as usize);
            let mut ours = BoundedLruCache::<u64, u64>::new(bound);

            for c in commands {
                use CacheCommand::*;

                match c {
                    Get(k) => {
                        let left: Option<u64> = known_good.get(&k).cloned();
                        let right: Option<u64> = ours.get(&k).cloned();
                        prop_assert_eq!(left, right);
                    },
                    Put(k, v) => prop_assert_eq!(known_good.put(k, v), ours.put(k, v)),
                    Delete(k) => prop_assert_eq!(known_good.pop(&k), ours.remove(&k)),
                }
            }

            let good_state = known_good.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
            let our_state = ours.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
            prop_assert_eq!(good_state, our_state);
        }

        #[test]
        fn test_size_never_exceeds_ceiling(
            bound in 1..500u64,
            puts in prop::collection::vec((0..50u64, 0..700u64), 0..500)
        ) {
            let mut ours = BoundedLruCache::with_listener(bound, value_as_size, IgnoreEvictions);
            for (k, size) in puts {
                let before = ours.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
                ours.put(k, size);
                prop_assert!(ours.current_size() <= ours.max_size());
                prop_assert_eq!(ours.current_size(), ours.iter().map(|(_, v)| *v).sum::<u64>());
                if size >= bound {
                    let after = ours.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>();
                    prop_assert_eq!(before, after);
                }
            }
        }
    }

    #[test]
    fn test_eviction() {
        let mut cache = BoundedLruCache::with_listener(10, value_as_size, IgnoreEvictions);
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);
        cache.put(4, 4);
        cache.put(5, 5);

        let state = cache
            .iter()
            .map(|x| (*x.0, *x.1))
            .collect::<Vec<(u64, u64)>>();
        assert_eq!(state, vec![(5, 5), (4, 4)]);
    }

    #[test]
    fn oversized_item_goes_straight_to_listener() {
        let mut evicted = vec![];
        let mut cache = BoundedLruCache::with_listener(100, value_as_size, |k: &&'static str, v: &u64| {
            evicted.push((*k, *v))
        });
        assert_eq!(cache.put("k", 150), None);
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        drop(cache);
        assert_eq!(evicted, vec![("k", 150)]);
    }

    #[test]
    fn item_exactly_at_ceiling_is_rejected() {
        let mut cache = BoundedLruCache::with_listener(100, value_as_size, IgnoreEvictions);
        cache.put("small", 10);
        cache.put("exact", 100);
        assert!(cache.contains(&"small"));
        assert!(!cache.contains(&"exact"));
    }

    #[test]
    fn reads_count_as_touches() {
        let mut evicted = vec![];
        let mut cache =
            BoundedLruCache::with_listener(2, unit_size, |k: &&'static str, _: &u32| evicted.push(*k));
        cache.put("a", 1);
        cache.put("b", 2);
        // Touch a, so b becomes the least recently used.
        assert_eq!(cache.get(&"a"), Some(&1));
        cache.put("c", 3);
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
        drop(cache);
        assert_eq!(evicted, vec!["b"]);
    }

    #[test]
    fn peek_does_not_touch() {
        let mut cache = BoundedLruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.peek(&"a"), Some(&1));
        cache.put("c", 3);
        assert!(!cache.contains(&"a"));
    }

    #[test]
    fn listener_sees_value_before_removal() {
        struct Checker {
            seen: Vec<u64>,
        }
        impl EvictionListener<u32, u64> for Checker {
            fn on_evicted(&mut self, _key: &u32, value: &u64) {
                self.seen.push(*value);
            }
        }

        let mut cache = BoundedLruCache::with_listener(10, value_as_size, Checker { seen: vec![] });
        cache.put(1, 4);
        cache.put(2, 4);
        cache.put(3, 4);
        assert_eq!(cache.listener().seen, vec![4]);
        assert_eq!(cache.current_size(), 8);
    }

    #[test]
    fn replacing_a_key_returns_the_old_value() {
        let mut evicted = 0;
        let mut cache = BoundedLruCache::with_listener(10, value_as_size, |_: &u32, _: &u64| evicted += 1);
        cache.put(1, 3);
        assert_eq!(cache.put(1, 4), Some(3));
        assert_eq!(cache.current_size(), 4);
        drop(cache);
        assert_eq!(evicted, 0);
    }

    #[test]
    fn size_multiplier_shrinks_and_restores() {
        let mut cache = BoundedLruCache::with_listener(100, value_as_size, IgnoreEvictions);
        for k in 0..10u64 {
            cache.put(k, 10);
        }
        assert_eq!(cache.current_size(), 100);

        cache.set_size_multiplier(0.5);
        assert_eq!(cache.max_size(), 50);
        assert_eq!(cache.current_size(), 50);
        // The most recent half survives.
        assert!(cache.contains(&9));
        assert!(!cache.contains(&0));

        cache.set_size_multiplier(1.0);
        assert_eq!(cache.max_size(), 100);

        cache.set_size_multiplier(0.5);
        cache.set_max_size(40);
        assert_eq!(cache.max_size(), 20);
        assert_eq!(cache.current_size(), 20);
    }

    #[test]
    fn clear_memory_reports_everything() {
        let mut evicted = vec![];
        let mut cache = BoundedLruCache::with_listener(10, value_as_size, |k: &u32, _: &u64| {
            evicted.push(*k)
        });
        cache.put(1, 0);
        cache.put(2, 3);
        cache.clear_memory();
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        drop(cache);
        evicted.sort_unstable();
        assert_eq!(evicted, vec![1, 2]);
    }
}
