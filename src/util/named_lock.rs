//! Named async-lock registry.
//!
//! Serializes work keyed by a name shared across otherwise unrelated tasks.
//! The session-recovery path holds the lock for its session id so concurrent
//! requests after a server restart trigger exactly one access-manager call.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of async locks keyed by name.
///
/// Locks are created on first use and dropped again once no task holds or
/// waits on them.
pub struct NamedLockRegistry<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> NamedLockRegistry<K> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;

        // Opportunistic cleanup: drop registry entries nobody else references.
        let mut locks = self.locks.lock();
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        guard
    }

    /// Number of live named locks.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether the registry holds no locks.
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for NamedLockRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_serializes_same_key() {
        let registry = Arc::new(NamedLockRegistry::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = registry.lock(42u64).await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Never more than one holder at a time for the same key.
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_shrinks_after_release() {
        let registry = NamedLockRegistry::new();
        {
            let _guard = registry.lock("a").await;
        }
        // The next acquisition on any key purges unreferenced entries.
        let _guard = registry.lock("b").await;
        assert_eq!(registry.len(), 1);
    }
}
