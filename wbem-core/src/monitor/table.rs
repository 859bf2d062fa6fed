//! Mutex-guarded table of watched entities.
//!
//! One `parking_lot::Mutex` covers the entries *and* the stop flag, so a
//! poll iteration's lookup/insert/erase happens as a single critical
//! section and a stop request is observed between iterations, never in the
//! middle of one.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Difference between the table and one poll's view of the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled<K, V> {
    pub appeared: Vec<(K, V)>,
    pub changed: Vec<(K, V)>,
    pub vanished: Vec<(K, V)>,
}

impl<K, V> Reconciled<K, V> {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.changed.is_empty() && self.vanished.is_empty()
    }
}

struct TableState<K, V> {
    entries: BTreeMap<K, V>,
    stop: bool,
}

pub struct WatchTable<K, V> {
    state: Mutex<TableState<K, V>>,
}

impl<K: Ord + Clone, V: Clone + PartialEq> Default for WatchTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> WatchTable<K, V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                entries: BTreeMap::new(),
                stop: false,
            }),
        }
    }

    /// Replace the entries with `live` and report what changed.
    pub fn reconcile(&self, live: BTreeMap<K, V>) -> Reconciled<K, V> {
        let mut state = self.state.lock();
        let mut result = Reconciled {
            appeared: Vec::new(),
            changed: Vec::new(),
            vanished: Vec::new(),
        };
        for (key, value) in &live {
            match state.entries.get(key) {
                None => result.appeared.push((key.clone(), value.clone())),
                Some(old) if old != value => result.changed.push((key.clone(), value.clone())),
                Some(_) => {}
            }
        }
        for (key, value) in &state.entries {
            if !live.contains_key(key) {
                result.vanished.push((key.clone(), value.clone()));
            }
        }
        state.entries = live;
        result
    }

    /// Insert or replace one entry; returns the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.state.lock().entries.insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.state.lock().entries.remove(key)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Consistent copy of all entries.
    pub fn snapshot(&self) -> BTreeMap<K, V> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn request_stop(&self) {
        self.state.lock().stop = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(entries: &[(u32, &str)]) -> BTreeMap<u32, String> {
        entries.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_reconcile_reports_differences() {
        let table = WatchTable::new();
        let first = table.reconcile(live(&[(1, "a"), (2, "b")]));
        assert_eq!(first.appeared.len(), 2);
        assert!(first.vanished.is_empty());

        let second = table.reconcile(live(&[(2, "B"), (3, "c")]));
        assert_eq!(second.appeared, vec![(3, "c".to_string())]);
        assert_eq!(second.changed, vec![(2, "B".to_string())]);
        assert_eq!(second.vanished, vec![(1, "a".to_string())]);

        assert!(table.reconcile(live(&[(2, "B"), (3, "c")])).is_empty());
    }

    #[test]
    fn test_stop_flag() {
        let table: WatchTable<u32, String> = WatchTable::new();
        assert!(!table.is_stopped());
        table.request_stop();
        assert!(table.is_stopped());
    }

    #[test]
    fn test_insert_remove() {
        let table = WatchTable::new();
        assert_eq!(table.insert(7, "x".to_string()), None);
        assert!(table.contains(&7));
        assert_eq!(table.remove(&7), Some("x".to_string()));
        assert!(table.is_empty());
    }
}
