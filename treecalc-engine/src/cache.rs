//! Content-addressed cache of computed payloads
//!
//! Keys are blake3 fingerprints of a canonical key text combined with the
//! fingerprints of its computed arguments, so a payload can be reused by any
//! session that arrives at the same computation over the same inputs.

use blake3::Hasher;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Fingerprint of a computation or a payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// blake3 digest
    pub content_hash: [u8; 32],
}

impl CacheKey {
    /// Fingerprint of raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        CacheKey {
            content_hash: *blake3::hash(bytes).as_bytes(),
        }
    }

    /// Length-prefixed components, so `["ab", "c"]` and `["a", "bc"]` differ
    pub fn from_components(components: &[&[u8]]) -> Self {
        let mut hasher = Hasher::new();
        for component in components {
            hasher.update(&(component.len() as u64).to_le_bytes());
            hasher.update(component);
        }
        CacheKey {
            content_hash: *hasher.finalize().as_bytes(),
        }
    }

    /// Fingerprint of applying `key_text` to inputs with these fingerprints
    pub fn for_computation(key_text: &str, inputs: &[CacheKey]) -> Self {
        let mut components: Vec<&[u8]> = Vec::with_capacity(inputs.len() + 1);
        components.push(key_text.as_bytes());
        components.extend(inputs.iter().map(|k| &k.content_hash[..]));
        Self::from_components(&components)
    }

    /// Lowercase hex digest, for logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

/// Serialized payload plus access bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// JSON encoding of the payload
    pub value: Vec<u8>,
    /// When the payload was stored
    pub created_at: Instant,
    /// Number of hits
    pub access_count: u64,
    /// Drives eviction
    pub last_accessed: Instant,
}

impl CacheEntry {
    /// Fresh entry, never accessed
    pub fn new(value: Vec<u8>) -> Self {
        let now = Instant::now();
        CacheEntry {
            value,
            created_at: now,
            access_count: 0,
            last_accessed: now,
        }
    }

    /// Count a hit
    pub fn record_access(&mut self) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
    }

    /// Time since the last access
    pub fn idle_time(&self) -> Duration {
        self.last_accessed.elapsed()
    }
}

/// Counters of a [`CalcCache`]
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups that found a payload
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Number of stored payloads
    pub entries: usize,
    /// Sum of serialized payload sizes
    pub total_size_bytes: usize,
}

impl CacheStats {
    /// Hits over lookups; 0 before the first lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "payload cache: {} hits, {} misses ({:.1}%), {} entries, {:.2} MB",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.entries,
            self.total_size_bytes as f64 / 1_048_576.0
        )
    }
}

/// Shared across sessions; thread safe
#[derive(Debug)]
pub struct CalcCache {
    entries: DashMap<CacheKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    /// 0 = unlimited
    max_size_bytes: usize,
}

impl CalcCache {
    /// Unbounded cache
    pub fn new() -> Self {
        Self::with_max_size(0)
    }

    /// Cache that evicts least recently used payloads beyond `max_size_bytes`
    pub fn with_max_size(max_size_bytes: usize) -> Self {
        CalcCache {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            max_size_bytes,
        }
    }

    /// Payload stored under `key`, counting a hit or a miss
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.record_access();
                self.hits.fetch_add(1, Ordering::Relaxed);
                serde_json::from_slice(&entry.value).ok()
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value`, evicting older payloads when a limit is set
    pub fn put<T: Serialize>(&self, key: CacheKey, value: &T) -> Result<(), CacheError> {
        let serialized = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        if self.max_size_bytes > 0 {
            if serialized.len() > self.max_size_bytes {
                return Err(CacheError::SizeLimitExceeded {
                    size: serialized.len(),
                    limit: self.max_size_bytes,
                });
            }
            let current = self.total_size();
            if current + serialized.len() > self.max_size_bytes {
                self.evict_to_fit(current + serialized.len() - self.max_size_bytes);
            }
        }
        self.entries.insert(key, CacheEntry::new(serialized));
        Ok(())
    }

    /// Is a payload stored under `key`?
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// `true` if something was removed
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop all payloads and reset the counters
    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
            total_size_bytes: self.total_size(),
        }
    }

    fn total_size(&self) -> usize {
        self.entries.iter().map(|entry| entry.value.len()).sum()
    }

    /// Drop least recently used entries until `needed_bytes` are freed
    fn evict_to_fit(&self, needed_bytes: usize) {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().idle_time()))
            .collect();
        entries.sort_by_key(|(_, idle)| std::cmp::Reverse(*idle));

        let mut freed = 0;
        for (key, _) in entries {
            if freed >= needed_bytes {
                break;
            }
            if let Some((_, entry)) = self.entries.remove(&key) {
                freed += entry.value.len();
            }
        }
    }
}

impl Default for CalcCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Failures of [`CalcCache::put`]
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The payload could not be encoded
    #[error("Failed to serialize payload: {0}")]
    Serialization(String),

    /// The payload alone is larger than the cache
    #[error("Payload of {size} bytes exceeds the cache limit of {limit} bytes")]
    SizeLimitExceeded {
        /// Serialized size of the payload
        size: usize,
        /// Configured limit
        limit: usize,
    },
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Column;

    #[test]
    fn computation_keys_depend_on_inputs() {
        let a = CacheKey::from_bytes(b"a");
        let b = CacheKey::from_bytes(b"b");
        let k1 = CacheKey::for_computation("(add x y)", &[a.clone(), b.clone()]);
        let k2 = CacheKey::for_computation("(add x y)", &[b, a]);
        assert_ne!(k1, k2);
        assert_eq!(k1.to_hex().len(), 64);
    }

    #[test]
    fn component_boundaries_matter() {
        let ab_c = CacheKey::from_components(&[b"ab", b"c"]);
        let a_bc = CacheKey::from_components(&[b"a", b"bc"]);
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn columns_round_trip_with_stats() {
        let cache = CalcCache::new();
        let key = CacheKey::from_bytes(b"col");
        cache.put(key.clone(), &Column::UInt32(vec![1, 2, 3])).unwrap();
        assert_eq!(cache.get::<Column>(&key), Some(Column::UInt32(vec![1, 2, 3])));
        assert_eq!(cache.get::<Column>(&CacheKey::from_bytes(b"other")), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn eviction_keeps_within_limit() {
        let cache = CalcCache::with_max_size(64);
        for i in 0..10u8 {
            cache.put(CacheKey::from_bytes(&[i]), &vec![i; 8]).unwrap();
        }
        assert!(cache.stats().total_size_bytes <= 64);
        assert!(cache.contains(&CacheKey::from_bytes(&[9])));
        assert!(matches!(
            cache.put(CacheKey::from_bytes(b"big"), &vec![0u8; 100]),
            Err(CacheError::SizeLimitExceeded { .. })
        ));
    }
}
