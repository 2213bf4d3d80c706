//! Response cache for read requests
//!
//! Entries are keyed by request [`Fingerprint`] and remember the resource path
//! they were read from, so a write to `messages/abc` can drop both the cached
//! `messages/abc` content and any cached `messages` listing.
//!
//! Lookups take the shared lock and use `peek`, so concurrent readers never
//! block each other; puts, invalidations and purges take the exclusive lock
//! and finish before any reader can observe the map again.
//!
//! Every invalidation advances a write generation. A read that was dispatched
//! at generation `g` is only stored through [`CacheStore::put_if_current`] if
//! no write touching its resource has landed since `g`.

use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::request::Fingerprint;

/// Recently written resources remembered for in-flight read checks
const WRITE_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub resource: String,
    pub payload: Value,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    stale_fills: AtomicU64,
}

/// Snapshot of cache activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    /// Read responses discarded because a write overtook them
    pub stale_fills: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<Fingerprint, CacheEntry>,
    /// Bumped by every invalidation
    generation: u64,
    /// Generation of the latest write per resource
    writes: LruCache<String, u64>,
    /// Highest generation dropped from `writes`; older reads can't be checked
    forgotten: u64,
}

impl CacheState {
    fn written_since(&self, resource: &str, since: u64) -> bool {
        since < self.forgotten
            || self
                .writes
                .iter()
                .any(|(written, generation)| *generation > since && touches(resource, written))
    }
}

/// Bounded TTL cache shared by every call path. Clones share state.
#[derive(Debug, Clone)]
pub struct CacheStore {
    state: Arc<RwLock<CacheState>>,
    counters: Arc<CacheCounters>,
}

/// Whether a cached entry read from `cached` can be affected by a write to `written`
fn touches(cached: &str, written: &str) -> bool {
    cached == written
        || written
            .strip_prefix(cached)
            .is_some_and(|rest| rest.starts_with('/'))
        || cached
            .strip_prefix(written)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl CacheStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let write_log = NonZeroUsize::new(WRITE_LOG_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Arc::new(RwLock::new(CacheState {
                entries: LruCache::new(capacity),
                generation: 0,
                writes: LruCache::new(write_log),
                forgotten: 0,
            })),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    /// Return the cached payload if present and not expired
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Value> {
        let state = self.state.read().await;
        let now = Instant::now();

        match state.entries.peek(fingerprint) {
            Some(entry) if !entry.is_expired(now) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!("Cache hit for {}", fingerprint);
                Some(entry.payload.clone())
            }
            Some(_) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                trace!("Cache entry expired for {}", fingerprint);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current write generation; take it before dispatching a read
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    pub async fn put(&self, fingerprint: Fingerprint, resource: String, payload: Value, ttl: Duration) {
        let mut state = self.state.write().await;
        self.insert(&mut state, fingerprint, resource, payload, ttl);
    }

    /// Store a read response unless a write touching `resource` has been
    /// invalidated since generation `since`. Returns whether it was stored.
    pub async fn put_if_current(
        &self,
        since: u64,
        fingerprint: Fingerprint,
        resource: String,
        payload: Value,
        ttl: Duration,
    ) -> bool {
        let mut state = self.state.write().await;
        if state.written_since(&resource, since) {
            self.counters.stale_fills.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding response for {}: written while in flight", fingerprint);
            return false;
        }
        self.insert(&mut state, fingerprint, resource, payload, ttl);
        true
    }

    fn insert(
        &self,
        state: &mut CacheState,
        fingerprint: Fingerprint,
        resource: String,
        payload: Value,
        ttl: Duration,
    ) {
        let entry = CacheEntry {
            resource,
            payload,
            stored_at: Instant::now(),
            ttl,
        };

        if let Some((evicted, _)) = state.entries.push(fingerprint.clone(), entry) {
            if evicted != fingerprint {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("Evicted least recently stored entry {}", evicted);
            }
        }
    }

    /// Remove every entry touching the given resource; returns how many were dropped
    pub async fn invalidate(&self, resource: &str) -> usize {
        let mut state = self.state.write().await;

        state.generation += 1;
        let generation = state.generation;
        if let Some((dropped, dropped_generation)) = state.writes.push(resource.to_string(), generation) {
            if dropped != resource {
                state.forgotten = state.forgotten.max(dropped_generation);
            }
        }

        let stale: Vec<Fingerprint> = state
            .entries
            .iter()
            .filter(|(_, entry)| touches(&entry.resource, resource))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            state.entries.pop(key);
        }

        if !stale.is_empty() {
            self.counters
                .invalidations
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            debug!("Invalidated {} cached entries for {}", stale.len(), resource);
        }
        stale.len()
    }

    /// Drop expired entries; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut state = self.state.write().await;
        let now = Instant::now();

        let expired: Vec<Fingerprint> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.entries.pop(key);
        }
        expired.len()
    }

    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len().await,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            stale_fills: self.counters.stale_fills.load(Ordering::Relaxed),
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(1024)
    }
}
