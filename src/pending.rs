//! The set of messages delivered to the pipeline and not yet acknowledged.

use std::collections::{BTreeMap, btree_map::Entry};

use parking_lot::Mutex;

/// Mutex-guarded map from stringified message id to the received message.
///
/// Every operation takes the lock once and releases it before returning, so callers never
/// hold it across an `.await`.
#[derive(Debug)]
pub struct PendingSet<M> {
    entries: Mutex<BTreeMap<String, M>>,
}

impl<M> Default for PendingSet<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> PendingSet<M> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert `message` under `key` unless the key is already pending.
    ///
    /// Returns `false` and keeps the existing entry when the key is taken.
    pub fn insert_if_absent(&self, key: String, message: M) -> bool {
        match self.entries.lock().entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(message);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Remove and return the entry for `key`, if pending.
    pub fn remove_if_present(&self, key: &str) -> Option<M> {
        self.entries.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Pending keys in ascending order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Take every entry, leaving the set empty.
    pub fn drain(&self) -> Vec<(String, M)> {
        std::mem::take(&mut *self.entries.lock())
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_if_absent_keeps_first_entry() {
        let pending = PendingSet::new();
        assert!(pending.insert_if_absent("1:1".to_string(), "first"));
        assert!(!pending.insert_if_absent("1:1".to_string(), "second"));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.remove_if_present("1:1"), Some("first"));
    }

    #[test]
    fn remove_if_present_removes_once() {
        let pending = PendingSet::new();
        pending.insert_if_absent("a".to_string(), 1);
        assert!(pending.contains("a"));
        assert_eq!(pending.remove_if_present("a"), Some(1));
        assert_eq!(pending.remove_if_present("a"), None);
        assert!(pending.is_empty());
    }

    #[test]
    fn drain_returns_entries_in_key_order() {
        let pending = PendingSet::new();
        for key in ["c", "a", "b"] {
            pending.insert_if_absent(key.to_string(), key.to_uppercase());
        }
        assert_eq!(pending.keys(), vec!["a", "b", "c"]);

        let drained = pending.drain();
        assert_eq!(
            drained,
            vec![
                ("a".to_string(), "A".to_string()),
                ("b".to_string(), "B".to_string()),
                ("c".to_string(), "C".to_string()),
            ]
        );
        assert!(pending.is_empty());
    }
}
