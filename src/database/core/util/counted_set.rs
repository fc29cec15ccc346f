/// Small associative container that keeps insertion order.
///
/// Backed by a vector; lookups are linear, which is fine for the handful of
/// views or registrations kept per location.
#[derive(Clone, Debug)]
pub struct CountedSet<K, V> {
    entries: Vec<(K, V)>,
}

impl<K, V> Default for CountedSet<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: PartialEq, V> CountedSet<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the value for `key`. A replaced entry keeps its position.
    pub fn add(&mut self, key: K, value: V) -> Option<V> {
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.iter().any(|(existing, _)| existing == key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries
            .iter_mut()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let position = self.entries.iter().position(|(existing, _)| existing == key)?;
        Some(self.entries.remove(position).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn each(&self, mut f: impl FnMut(&K, &V)) {
        for (key, value) in &self.entries {
            f(key, value);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, value)| value)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.iter_mut().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }

    /// Removes every entry matching `remove` and returns them in order.
    pub fn drain_where(&mut self, mut remove: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (key, value) in self.entries.drain(..) {
            if remove(&key, &value) {
                removed.push((key, value));
            } else {
                kept.push((key, value));
            }
        }
        self.entries = kept;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_and_replaces_in_place() {
        let mut set = CountedSet::new();
        set.add("b", 1);
        set.add("a", 2);
        assert_eq!(set.add("b", 3), Some(1));
        let keys: Vec<_> = set.keys().copied().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(set.get(&"b"), Some(&3));
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn remove_and_drain() {
        let mut set = CountedSet::new();
        for (key, value) in [("x", 1), ("y", 2), ("z", 3)] {
            set.add(key, value);
        }
        assert_eq!(set.remove(&"y"), Some(2));
        assert!(!set.contains(&"y"));
        let odd = set.drain_where(|_, value| value % 2 == 1);
        assert_eq!(odd, vec![("x", 1), ("z", 3)]);
        assert!(set.is_empty());
    }
}
