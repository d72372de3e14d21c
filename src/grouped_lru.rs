//! A [GroupedLruMap] keeps groups of interchangeable values under a key, and orders the *groups* (not the values) by
//! recency.
//!
//! - `get` pops a value and moves its group to the most recently used end.
//! - `put` into a new group places the group at the most recently used end; `put` into an existing group moves it to
//!   the least recently used end, so groups which are only ever filled sink towards eviction while groups being
//!   drained stay hot.
//! - `remove_last` pops one value from the least recently used group.
//!
//! Groups which become empty are dropped from the map immediately, so shapes requested only once do not leave
//! metadata behind.
use std::collections::HashMap;
use std::hash::Hash;

use ahash::RandomState;

use crate::linked_slab::LinkedSlab;

struct Group<K, V> {
    key: K,
    values: Vec<V>,
}

pub(crate) struct GroupedLruMap<K, V> {
    groups: LinkedSlab<Group<K, V>>,
    index: HashMap<K, usize, RandomState>,
}

impl<K: Hash + Eq + Clone, V> GroupedLruMap<K, V> {
    pub(crate) fn new() -> GroupedLruMap<K, V> {
        GroupedLruMap {
            groups: LinkedSlab::new(),
            index: Default::default(),
        }
    }

    pub(crate) fn put(&mut self, key: K, value: V) {
        if let Some(&ind) = self.index.get(&key) {
            self.groups.move_to_back(ind);
            if let Some(group) = self.groups.get_mut(ind) {
                group.values.push(value);
            }
            return;
        }

        let ind = self.groups.push_front(Group {
            key: key.clone(),
            values: vec![value],
        });
        self.index.insert(key, ind);
    }

    pub(crate) fn get(&mut self, key: &K) -> Option<V> {
        let ind = *self.index.get(key)?;
        self.groups.move_to_front(ind);
        let (value, now_empty) = {
            let group = self.groups.get_mut(ind)?;
            let value = group.values.pop();
            (value, group.values.is_empty())
        };
        if now_empty {
            self.drop_group(ind);
        }
        value
    }

    /// Pop a value from the least recently used non-empty group, returning the key it lived under.
    pub(crate) fn remove_last(&mut self) -> Option<(K, V)> {
        let mut cur = self.groups.back();
        while let Some(ind) = cur {
            let prev = self.groups.prev(ind);
            let popped = match self.groups.get_mut(ind) {
                Some(group) => group.values.pop().map(|v| (group.key.clone(), v, group.values.is_empty())),
                None => None,
            };

            match popped {
                Some((key, value, now_empty)) => {
                    if now_empty {
                        self.drop_group(ind);
                    }
                    return Some((key, value));
                }
                None => {
                    self.drop_group(ind);
                    cur = prev;
                }
            }
        }
        None
    }

    fn drop_group(&mut self, ind: usize) {
        if let Some(group) = self.groups.remove(ind) {
            self.index.remove(&group.key);
        }
    }

    pub(crate) fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub(crate) fn value_count(&self) -> usize {
        self.groups.iter().map(|g| g.values.len()).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.groups.clear();
        self.index.clear();
    }

    /// Group keys from most to least recently used.
    #[cfg(test)]
    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        self.groups.iter().map(|g| &g.key)
    }
}
