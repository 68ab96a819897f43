use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::host::AddresseeRecord;
use crate::identity_parser::Identity;
use crate::matching::ValidationResult;

/// Rough in-memory footprint used for the cache size budget.
pub trait CacheWeight {
    fn weight(&self) -> usize;
}

impl CacheWeight for String {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl<T: CacheWeight> CacheWeight for Vec<T> {
    fn weight(&self) -> usize {
        self.iter().map(CacheWeight::weight).sum::<usize>() + std::mem::size_of::<Self>()
    }
}

impl CacheWeight for AddresseeRecord {
    fn weight(&self) -> usize {
        self.address.len() + self.display_name.as_ref().map_or(0, String::len)
    }
}

impl CacheWeight for Identity {
    fn weight(&self) -> usize {
        self.address.len()
            + self.display_name.as_ref().map_or(0, String::len)
            + self.name_tokens.iter().map(String::len).sum::<usize>()
    }
}

impl CacheWeight for ValidationResult {
    fn weight(&self) -> usize {
        self.greeting_name.len()
            + self.suggested_identity.as_ref().map_or(0, CacheWeight::weight)
            + std::mem::size_of::<Self>()
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub size_estimate: usize,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, size_estimate: usize) -> Self {
        let now = Instant::now();
        Self {
            data,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            size_estimate,
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }

    /// Frequency discounted by idle time; lowest score is evicted first.
    fn retention_score(&self, now: Instant) -> f64 {
        let idle = now.saturating_duration_since(self.last_accessed_at).as_secs_f64();
        (self.access_count as f64 + 1.0) / (1.0 + idle)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub ttl: Duration,
    pub max_entries: usize,
    pub max_size_bytes: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 128,
            max_size_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    size_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<T> CacheInner<T> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_estimate);
        Some(entry)
    }

    fn purge_expired(&mut self, ttl: Duration) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(ttl))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_one(&mut self) -> bool {
        let now = Instant::now();
        let victim = self
            .entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.retention_score(now)
                    .total_cmp(&b.retention_score(now))
                    .then(a.last_accessed_at.cmp(&b.last_accessed_at))
            })
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                self.remove(&key);
                self.evictions += 1;
                log::debug!("Evicted cache entry {key}");
                true
            }
            None => false,
        }
    }
}

/// Shared TTL cache keyed by string. Clones share the same storage.
#[derive(Debug)]
pub struct Cache<T> {
    name: &'static str,
    limits: CacheLimits,
    inner: Arc<Mutex<CacheInner<T>>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            limits: self.limits,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + CacheWeight + Send + 'static> Cache<T> {
    pub fn new(name: &'static str, limits: CacheLimits) -> Self {
        Self {
            name,
            limits,
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            })),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut guard = self.inner.lock().ok()?;
        let inner = &mut *guard;
        let expired = match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(self.limits.ttl) => {
                entry.access_count += 1;
                entry.last_accessed_at = Instant::now();
                let data = entry.data.clone();
                inner.hits += 1;
                return Some(data);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.remove(key);
        }
        inner.misses += 1;
        None
    }

    /// Insert or replace `key`. Returns false when the value alone exceeds
    /// the size budget and was not stored.
    pub fn set(&self, key: impl Into<String>, data: T) -> bool {
        let key = key.into();
        let size = data.weight();
        if size > self.limits.max_size_bytes {
            log::debug!(
                "{} cache: entry {key} ({size} bytes) exceeds size budget, not cached",
                self.name
            );
            return false;
        }

        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.remove(&key);
        inner.entries.insert(key, CacheEntry::new(data, size));
        inner.size_bytes += size;

        if inner.entries.len() > self.limits.max_entries
            || inner.size_bytes > self.limits.max_size_bytes
        {
            inner.purge_expired(self.limits.ttl);
        }
        while inner.entries.len() > self.limits.max_entries
            || inner.size_bytes > self.limits.max_size_bytes
        {
            if !inner.evict_one() {
                break;
            }
        }
        true
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner
            .lock()
            .map(|mut inner| inner.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.size_bytes = 0;
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.inner
            .lock()
            .map(|mut inner| inner.purge_expired(self.limits.ttl))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|inner| CacheStats {
                entries: inner.entries.len(),
                size_bytes: inner.size_bytes,
                hits: inner.hits,
                misses: inner.misses,
                evictions: inner.evictions,
            })
            .unwrap_or_default()
    }

    /// Periodically drop expired entries until the handle is aborted.
    pub fn spawn_janitor(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                let purged = cache.purge_expired();
                if purged > 0 {
                    log::debug!("{} cache: purged {purged} expired entries", cache.name);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(ttl_secs: u64, max_entries: usize, max_size_bytes: usize) -> CacheLimits {
        CacheLimits {
            ttl: Duration::from_secs(ttl_secs),
            max_entries,
            max_size_bytes,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_until_ttl() {
        let cache: Cache<String> = Cache::new("test", limits(10, 8, 1024));
        cache.set("k", "value".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("value"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k").as_deref(), Some("value"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_least_used_entry() {
        let cache: Cache<String> = Cache::new("test", limits(300, 2, 1024));
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        for _ in 0..3 {
            cache.get("a");
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("c", "3".to_string());

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_budget() {
        let cache: Cache<String> = Cache::new("test", limits(300, 100, 10));
        assert!(!cache.set("huge", "x".repeat(11)));
        assert!(cache.set("a", "x".repeat(6)));
        assert!(cache.set("b", "y".repeat(6)));
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert!(stats.size_bytes <= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_stats() {
        let cache: Cache<String> = Cache::new("test", limits(300, 8, 1024));
        cache.set("k", "v".to_string());
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        assert!(cache.get("k").is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_purges_expired() {
        let cache: Cache<String> = Cache::new("test", limits(5, 8, 1024));
        cache.set("k", "v".to_string());
        let janitor = cache.spawn_janitor(Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(cache.len(), 0);
        janitor.abort();
    }
}
