//! Single-flight TTL cache.
//!
//! Lookups take a read lock on the entry map, so unrelated keys never block
//! each other. On a miss the first caller installs a shared in-flight future
//! for the key; concurrent callers for the same key await that future instead
//! of starting their own fetch. The in-flight future stores its value before
//! unregistering itself, so a caller that misses both maps can re-check the
//! entry map under the in-flight lock without racing the leader.
//!
//! A flight is only polled by its waiters. When the last one is dropped
//! before the fetch completes, the flight is unregistered so the next caller
//! starts a fresh fetch instead of joining an abandoned one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// `query_id ⊕ param fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub query_id: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(query_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.query_id, self.fingerprint)
    }
}

/// How a lookup was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// Served from a live entry.
    Hit,
    /// This caller ran the fetch.
    Miss,
    /// Joined another caller's in-flight fetch.
    Coalesced,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Coalesced => "coalesced",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cached<V> {
    pub value: V,
    pub status: CacheStatus,
}

/// Counters since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub entries: usize,
    pub in_flight: usize,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

type InFlight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct Flight<V, E> {
    id: u64,
    future: InFlight<V, E>,
    waiters: usize,
}

struct Inner<V, E> {
    entries: RwLock<HashMap<CacheKey, Entry<V>>>,
    in_flight: Mutex<HashMap<CacheKey, Flight<V, E>>>,
    next_flight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held by each caller awaiting a flight.
struct Waiter<'a, V, E> {
    inner: &'a Inner<V, E>,
    key: CacheKey,
    flight_id: u64,
}

impl<V, E> Drop for Waiter<'_, V, E> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.inner.in_flight);
        let Some(flight) = in_flight.get_mut(&self.key) else {
            return;
        };
        if flight.id != self.flight_id {
            return;
        }
        flight.waiters = flight.waiters.saturating_sub(1);
        if flight.waiters == 0 {
            in_flight.remove(&self.key);
            debug!(key = %self.key, "In-flight fetch abandoned by every caller");
        }
    }
}

impl<V: Clone, E> Inner<V, E> {
    fn live(&self, key: &CacheKey) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    fn store(&self, key: CacheKey, value: V, ttl: Duration) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn remove(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).is_some()
    }
}

/// Lookup-or-compute cache with one in-flight computation per key.
///
/// Only successful values are stored; an error is handed to every caller
/// that joined the failed flight and the next caller tries again.
pub struct SingleFlightCache<V, E> {
    inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for SingleFlightCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> Default for SingleFlightCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> SingleFlightCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Return the live value for `key`, or run `fetch` once across all
    /// concurrent callers and store its success for `ttl`.
    ///
    /// With `invalidate` set, any stored entry is dropped first. A flight that
    /// is already running is still joined; its result is fresh.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        invalidate: bool,
        fetch: F,
    ) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if invalidate {
            if self.inner.remove(&key) {
                debug!(key = %key, "Cache entry invalidated");
            }
        } else if let Some(value) = self.inner.live(&key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache hit");
            return Ok(Cached {
                value,
                status: CacheStatus::Hit,
            });
        }

        let (flight, flight_id, status) = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(existing) = in_flight.get_mut(&key) {
                existing.waiters += 1;
                (existing.future.clone(), existing.id, CacheStatus::Coalesced)
            } else if let Some(value) = (!invalidate).then(|| self.inner.live(&key)).flatten() {
                // Leader finished between our lookup and taking the lock.
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Cached {
                    value,
                    status: CacheStatus::Hit,
                });
            } else {
                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let future = Self::launch(Arc::downgrade(&self.inner), key.clone(), id, ttl, fetch());
                in_flight.insert(
                    key.clone(),
                    Flight {
                        id,
                        future: future.clone(),
                        waiters: 1,
                    },
                );
                (future, id, CacheStatus::Miss)
            }
        };
        let _waiter = Waiter {
            inner: &self.inner,
            key: key.clone(),
            flight_id,
        };

        match status {
            CacheStatus::Coalesced => {
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Joining in-flight fetch");
            }
            _ => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Cache miss");
            }
        }

        flight.await.map(|value| Cached { value, status })
    }

    fn launch<Fut>(
        inner: Weak<Inner<V, E>>,
        key: CacheKey,
        id: u64,
        ttl: Duration,
        fetch: Fut,
    ) -> InFlight<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        async move {
            let result = fetch.await;
            if let Some(inner) = inner.upgrade() {
                if let Ok(value) = &result {
                    inner.store(key.clone(), value.clone(), ttl);
                }
                let mut in_flight = lock(&inner.in_flight);
                if in_flight.get(&key).is_some_and(|f| f.id == id) {
                    in_flight.remove(&key);
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Live value without fetching.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        self.inner.live(key)
    }

    /// Drop one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.remove(key)
    }

    /// Drop every entry for a query, across all parameter sets.
    pub fn invalidate_query(&self, query_id: &str) -> usize {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|k, _| k.query_id != query_id);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            entries: self.len(),
            in_flight: lock(&self.inner.in_flight).len(),
        }
    }
}
