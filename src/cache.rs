//! Bounded in-memory cache with TTL expiration.
//!
//! Caches are constructed and owned by the component that needs them
//! (plan lookups, the dedup fast path). Nothing here is global.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
    /// Insertion order, used to pick the eviction victim.
    sequence: u64,
}

struct Entries<K, V> {
    map: HashMap<K, CachedEntry<V>>,
    next_sequence: u64,
}

/// Thread-safe cache evicting expired entries first, then the oldest one.
pub struct TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    entries: RwLock<Entries<K, V>>,
    max_entries: usize,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                next_sequence: 0,
            }),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    fn is_expired(&self, entry: &CachedEntry<V>) -> bool {
        entry.inserted_at.elapsed() >= self.ttl
    }

    /// Returns a live entry. Expired entries are left for the next insert.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .map
            .get(key)
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;

        if !entries.map.contains_key(&key) && entries.map.len() >= self.max_entries {
            let ttl = self.ttl;
            entries
                .map
                .retain(|_, entry| entry.inserted_at.elapsed() < ttl);

            if entries.map.len() >= self.max_entries {
                let oldest = entries
                    .map
                    .iter()
                    .min_by_key(|(_, entry)| entry.sequence)
                    .map(|(k, _)| k.clone());
                if let Some(k) = oldest {
                    entries.map.remove(&k);
                }
            }
        }

        let sequence = entries.next_sequence;
        entries.next_sequence += 1;
        entries.map.insert(
            key,
            CachedEntry {
                value,
                inserted_at: Instant::now(),
                sequence,
            },
        );
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;
        entries.map.remove(key).map(|entry| entry.value)
    }

    /// Entry count, expired entries included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.map.is_empty()
    }
}
