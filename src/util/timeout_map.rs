//! Idle-expiring concurrent map.
//!
//! Backs the NAT table and both proxy pools: entries carry a last-use
//! timestamp that every lookup refreshes, and a periodic sweep removes
//! entries idle past the configured timeout.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Mapping whose entries expire after an idle interval.
///
/// The sweep is driven by the owner ([`TimeoutMap::sweep`]) so pools can
/// share one maintenance task instead of one timer per map.
pub struct TimeoutMap<K, V> {
    entries: DashMap<K, Entry<V>>,
    idle_timeout: Duration,
}

struct Entry<V> {
    value: V,
    last_used: Instant,
}

impl<K: Eq + Hash + Clone, V: Clone> TimeoutMap<K, V> {
    /// Create a map whose entries expire after `idle_timeout` without use.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_timeout,
        }
    }

    /// Insert or replace an entry, stamping it as just used.
    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                last_used: Instant::now(),
            },
        );
    }

    /// Look up an entry, refreshing its idle timer on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get_mut(key).map(|mut entry| {
            entry.last_used = Instant::now();
            entry.value.clone()
        })
    }

    /// Look up without refreshing the timer.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Fetch the entry for `key`, inserting the result of `make` if absent.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        let mut entry = self.entries.entry(key).or_insert_with(|| Entry {
            value: make(),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        entry.value.clone()
    }

    /// Remove an entry, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry satisfies the predicate.
    pub fn any(&self, mut pred: impl FnMut(&K, &V) -> bool) -> bool {
        self.entries.iter().any(|e| pred(e.key(), &e.value().value))
    }

    /// Snapshot of live keys.
    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Evict entries idle past the timeout; returns the evicted values.
    pub fn sweep(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.value().last_used) > self.idle_timeout)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|(k, e)| (k, e.value)))
            .collect()
    }

    /// The configured idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
