//! Synchronization helpers
//!
//! - [`KeyedLocks`]: one async mutex per key, created on demand
//! - [`cancelled`]: await a cancellation signal on a watch channel

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

/// Registry of per-key async mutexes
///
/// Serializes work on one key (a fingerprint, an incident, a dispatch pair)
/// without a global lock. Entries are pruned once nobody holds them.
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquire the lock for `key`, waiting for any current holder
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        // Clone the Arc out so no DashMap shard guard is held across the await
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop the entry for `key` if no one holds or awaits it
    pub fn prune(&self, key: &K) {
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Number of keys with a live entry
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the watched flag becomes `true`
///
/// Never resolves if the sender is dropped without signalling, so it is safe
/// to use as a `select!` arm.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            if *rx.borrow() {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let key = "adf/pipelineA".to_string();

        let guard = locks.lock(&key).await;
        let contender = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(&1).await;
        let _b = locks.lock(&2).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_held_entries() {
        let locks = KeyedLocks::<u32>::new();
        let guard = locks.lock(&1).await;
        locks.prune(&1);
        assert_eq!(locks.len(), 1);

        drop(guard);
        locks.prune(&1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_resolves_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { cancelled(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pends_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result = tokio::time::timeout(Duration::from_secs(5), cancelled(&mut rx)).await;
        assert!(result.is_err());
    }
}
