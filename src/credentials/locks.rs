//! Per-key flow guards.
//!
//! A refresh or a cookie merge is a read-modify-write sequence that can span
//! network IO. Holding the guard for its key serialises writers of the same
//! credential without blocking writers of unrelated keys.

use super::CredentialKey;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type GuardMap = DashMap<CredentialKey, Arc<Mutex<()>>>;

/// Lazily created async mutex per [`CredentialKey`]. An entry is dropped as
/// soon as nobody holds or waits for it.
#[derive(Default)]
pub struct KeyLocks {
    guards: Arc<GuardMap>,
}

/// Exclusive access to one key; releases and evicts on drop.
pub struct KeyGuard {
    guards: Arc<GuardMap>,
    key: CredentialKey,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        // Only the map's own reference left: no holder, no waiter
        self.guards
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: &CredentialKey) -> KeyGuard {
        // Clone the Arc out so the shard lock is released before awaiting
        let mutex = self
            .guards
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            guards: Arc::clone(&self.guards),
            key: key.clone(),
            held: Some(mutex.lock_owned().await),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}
