//! Process local advisory locks, one per business key.
//!
//! Read, apply, write cycles on the same instance or hierarchy node must
//! not interleave, otherwise one of the updates is lost.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Idle locks are pruned once the table grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive ownership of `key`. Released on drop.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        if self.locks.len() > PRUNE_THRESHOLD {
            self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        }
        mutex.lock_owned().await
    }

    /// Locks several keys in a fixed global order so callers never
    /// deadlock on each other.
    pub async fn lock_all(&self, keys: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.lock(key).await);
        }
        guards
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock("org-1/instance-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());

        let guards = locks.lock_all(&["c".to_string(), "d".to_string(), "c".to_string()]).await;
        assert_eq!(guards.len(), 2);
        assert_eq!(locks.len(), 4);
    }
}
