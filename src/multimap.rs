//! Keyed bag of values with stable per-key insertion order.

use std::collections::HashMap;
use std::hash::Hash;

/// A map from key to an ordered list of values.
///
/// The network manager uses this to correlate a request hash with whichever
/// protocol id (request id or interception id) arrived first; `first` must
/// therefore return the oldest value still present.
pub struct MultiMap<K, V> {
    map: HashMap<K, Vec<V>>,
}

impl<K: Eq + Hash, V: PartialEq> Default for MultiMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V: PartialEq> MultiMap<K, V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Append `value` under `key`.
    pub fn add(&mut self, key: K, value: V) {
        self.map.entry(key).or_default().push(value);
    }

    /// Remove the first value under `key` equal to `value`.
    /// Returns whether anything was removed.
    pub fn remove(&mut self, key: &K, value: &V) -> bool {
        let Some(values) = self.map.get_mut(key) else {
            return false;
        };
        let Some(pos) = values.iter().position(|v| v == value) else {
            return false;
        };
        values.remove(pos);
        if values.is_empty() {
            self.map.remove(key);
        }
        true
    }

    /// The oldest value still present under `key`.
    pub fn first(&self, key: &K) -> Option<&V> {
        self.map.get(key).and_then(|values| values.first())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_returns_oldest_surviving_value() {
        let mut map = MultiMap::new();
        map.add("h", "a");
        map.add("h", "b");
        map.add("h", "c");

        assert_eq!(map.first(&"h"), Some(&"a"));
        assert!(map.remove(&"h", &"a"));
        assert_eq!(map.first(&"h"), Some(&"b"));
    }

    #[test]
    fn remove_takes_first_match_only() {
        let mut map = MultiMap::new();
        map.add(1, "x");
        map.add(1, "x");

        assert!(map.remove(&1, &"x"));
        assert_eq!(map.first(&1), Some(&"x"));
        assert!(map.remove(&1, &"x"));
        assert_eq!(map.first(&1), None);
        assert!(!map.remove(&1, &"x"));
        assert!(map.is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let mut map = MultiMap::new();
        map.add("a", 1);
        map.add("b", 2);

        assert!(map.remove(&"a", &1));
        assert_eq!(map.first(&"b"), Some(&2));
        assert!(!map.is_empty());
    }
}
