//! Destination Key Registry
//!
//! Process-wide set of destination keys that currently have a publisher.
//! A key can be held by at most one session at a time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared registry of active destination keys
///
/// Cheap to clone; all clones share the same set. Operations are O(1) under
/// a single lock and never await, so they are safe to call from `Drop`.
#[derive(Clone, Default)]
pub struct KeyRegistry {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-operation.
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `key` as active. Returns false if it was already active.
    pub fn try_acquire(&self, key: &str) -> bool {
        let acquired = self.keys().insert(key.to_string());
        if acquired {
            log::info!("Destination key acquired: {}", key);
        } else {
            log::debug!("Destination key already active: {}", key);
        }
        acquired
    }

    /// Remove `key` if present. Calling it twice is harmless.
    pub fn release(&self, key: &str) {
        if self.keys().remove(key) {
            log::info!("Destination key released: {}", key);
        }
    }

    /// Acquire `key` and tie its release to the returned lease.
    pub fn lease(&self, key: &str) -> Option<KeyLease> {
        self.try_acquire(key).then(|| KeyLease {
            registry: self.clone(),
            key: key.to_string(),
            released: false,
        })
    }

    /// Check whether a key is currently held
    pub fn is_active(&self, key: &str) -> bool {
        self.keys().contains(key)
    }

    /// Number of keys currently held
    pub fn active_count(&self) -> usize {
        self.keys().len()
    }
}

/// Ownership of one registry key; releases it exactly once.
pub struct KeyLease {
    registry: KeyRegistry,
    key: String,
    released: bool,
}

impl KeyLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(&self.key);
        }
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_registry_acquire_release() {
        let registry = KeyRegistry::new();

        assert!(registry.try_acquire("ABCDEF"));
        assert!(!registry.try_acquire("ABCDEF"));
        assert!(registry.is_active("ABCDEF"));

        registry.release("ABCDEF");
        assert!(!registry.is_active("ABCDEF"));
        assert!(registry.try_acquire("ABCDEF"));
    }

    #[test]
    fn test_registry_release_is_idempotent() {
        let registry = KeyRegistry::new();
        registry.release("missing");

        assert!(registry.try_acquire("k"));
        registry.release("k");
        registry.release("k");
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let registry = KeyRegistry::new();
        {
            let lease = registry.lease("live").unwrap();
            assert_eq!(lease.key(), "live");
            assert!(registry.lease("live").is_none());
        }
        assert!(!registry.is_active("live"));
    }

    #[test]
    fn test_lease_does_not_release_foreign_holder() {
        let registry = KeyRegistry::new();
        let lease = registry.lease("live").unwrap();
        lease.release();

        // A new holder must survive the old lease having been consumed.
        let _second = registry.lease("live").unwrap();
        assert!(registry.is_active("live"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registry_concurrent_acquire_single_winner() {
        let registry = KeyRegistry::new();
        let winners = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let winners = winners.clone();
            tasks.push(tokio::spawn(async move {
                if registry.try_acquire("shared") {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_registry_concurrent_churn_never_double_holds() {
        let registry = KeyRegistry::new();
        let holders = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let holders = holders.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(lease) = registry.lease("hot") {
                            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            assert_eq!(now, 1, "two sessions held the same key");
                            holders.fetch_sub(1, Ordering::SeqCst);
                            lease.release();
                        }
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert!(!registry.is_active("hot"));
    }
}
