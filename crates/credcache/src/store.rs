//! A bounded key/value store with per-entry expiration.
//!
//! The [`ExpiringStore`] keeps at most [`StoreConfig::capacity`] entries. Each entry may carry an
//! absolute expiration [`Instant`], after which it is treated as absent: it is never returned
//! by any read, even if the background sweep did not get to remove it yet.
//!
//! When a new key is inserted into a full store, expired entries are dropped first. If the
//! store is still full afterwards, the least-recently-used entry is evicted. Reads that return a
//! value, as well as replacing a value, count as a use. Looking at or updating an expiration
//! does not.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use lru::LruCache;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::CacheError;
pub use crate::config::StoreConfig;

/// An entry of the store.
///
/// Setting a key again always installs a fresh entry, only the expiration is modified in place.
#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Why an entry was removed without being explicitly deleted.
#[derive(Debug, Clone, Copy)]
enum EvictionReason {
    Expired,
    Capacity,
}

impl EvictionReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Capacity => "capacity",
        }
    }
}

fn record_eviction(key: &str, reason: EvictionReason) {
    tracing::trace!(key, reason = reason.as_str(), "Evicted cache entry");
    metric!(counter("caches.store.evicted") += 1, "reason" => reason.as_str());
}

#[derive(Debug)]
struct State<V> {
    /// Entries ordered by recency, the least recently used one is evicted first.
    entries: LruCache<String, Entry<V>>,
}

impl<V> State<V> {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Drops the entry for `key` if it is expired, returning whether it is still live.
    fn retain_live(&mut self, key: &str, now: Instant) -> bool {
        let Some(expired) = self.entries.peek(key).map(|entry| entry.is_expired(now)) else {
            return false;
        };
        if expired {
            self.entries.pop(key);
            record_eviction(key, EvictionReason::Expired);
        }
        !expired
    }

    /// Returns the live entry for `key` without marking it as used.
    fn peek_live(&mut self, key: &str, now: Instant) -> Option<&mut Entry<V>> {
        if !self.retain_live(key, now) {
            return None;
        }
        self.entries.peek_mut(key)
    }

    /// Returns the live entry for `key`, marking it as the most recently used one.
    fn get_live(&mut self, key: &str, now: Instant) -> Option<&Entry<V>> {
        if !self.retain_live(key, now) {
            return None;
        }
        self.entries.get(key)
    }

    /// Removes all expired entries, returning how many were removed.
    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key.as_str());
            record_eviction(key, EvictionReason::Expired);
        }
        expired.len()
    }

    /// Makes room for one more entry if the store is full.
    fn make_room(&mut self, now: Instant) {
        if self.entries.len() < self.entries.cap().get() {
            return;
        }

        // An expired least-recently-used entry makes room without scanning the others.
        if self
            .entries
            .peek_lru()
            .is_some_and(|(_, entry)| entry.is_expired(now))
        {
            if let Some((key, _)) = self.entries.pop_lru() {
                record_eviction(&key, EvictionReason::Expired);
            }
            return;
        }

        self.remove_expired(now);
        while self.entries.len() >= self.entries.cap().get() {
            let Some((key, _)) = self.entries.pop_lru() else {
                break;
            };
            record_eviction(&key, EvictionReason::Capacity);
        }
    }

    fn insert(&mut self, key: String, value: V, expires_at: Option<Instant>, now: Instant) {
        if !self.entries.contains(key.as_str()) {
            self.make_room(now);
        }
        self.entries.put(key, Entry { value, expires_at });
    }

    /// Returns the number of entries that are not expired.
    fn live_len(&self, now: Instant) -> usize {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .count()
    }
}

#[derive(Debug)]
struct Inner<V> {
    state: Mutex<State<V>>,
    capacity: NonZeroUsize,
    default_expiration: Option<Duration>,
}

impl<V> Inner<V> {
    /// Locks the store state.
    ///
    /// No operation can leave the state half-modified when panicking, so a poisoned lock is
    /// still safe to use.
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A bounded, concurrency-safe key/value store with per-entry expiration.
///
/// Cloning the store is cheap and yields another handle to the same entries. The background
/// sweep that removes expired entries is stopped once [`shutdown`](Self::shutdown) is called or
/// the last handle is dropped.
pub struct ExpiringStore<V> {
    inner: Arc<Inner<V>>,
    sweeper: Arc<DropGuard>,
    shutdown: CancellationToken,
}

impl<V> Clone for ExpiringStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            sweeper: Arc::clone(&self.sweeper),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<V> fmt::Debug for ExpiringStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .state
            .try_lock()
            .map(|state| state.entries.len())
            .unwrap_or_default();
        f.debug_struct("ExpiringStore")
            .field("capacity", &self.inner.capacity)
            .field("default_expiration", &self.inner.default_expiration)
            .field("entries", &entries)
            .field("shut down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<V> ExpiringStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new store.
    ///
    /// When called from within a tokio runtime, this spawns the background sweep onto it.
    /// Outside of a runtime there is no sweep at all: expired entries are then only removed
    /// when they are read, when room is made for a new key, or by an explicit
    /// [`remove_expired`](Self::remove_expired).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] for a zero capacity or a zero cleanup interval.
    pub fn new(config: &StoreConfig) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(config.capacity).ok_or_else(|| {
            CacheError::InvalidConfig("capacity must be greater than zero".into())
        })?;
        if config.cleanup_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "cleanup interval must be greater than zero".into(),
            ));
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(State::new(capacity)),
            capacity,
            default_expiration: config.default_expiration,
        });

        let shutdown = CancellationToken::new();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(sweep(
                    Arc::downgrade(&inner),
                    config.cleanup_interval,
                    shutdown.clone(),
                ));
            }
            Err(_) => {
                tracing::warn!(
                    "No tokio runtime available, expired entries are only removed lazily"
                );
            }
        }

        Ok(Self {
            inner,
            sweeper: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
        })
    }
}

impl<V: Clone> ExpiringStore<V> {
    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity.get()
    }

    /// Inserts or replaces the value for `key`.
    ///
    /// The entry expires after the configured default expiration, or never if there is none.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let now = Instant::now();
        let expires_at = self.inner.default_expiration.map(|ttl| now + ttl);
        self.insert(key.into(), value, expires_at, now);
    }

    /// Inserts or replaces the value for `key`, expiring at `expires_at`.
    ///
    /// The value and its expiration become visible at the same time.
    pub fn set_with_expiration(&self, key: impl Into<String>, value: V, expires_at: Instant) {
        self.insert(key.into(), value, Some(expires_at), Instant::now());
    }

    fn insert(&self, key: String, value: V, expires_at: Option<Instant>, now: Instant) {
        tracing::trace!(key, "Storing cache entry");
        self.inner.lock().insert(key, value, expires_at, now);
    }

    /// Returns the value for `key`, if present and not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        state.get_live(key, now).map(|entry| entry.value.clone())
    }

    /// Attaches or updates the expiration of an existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] if `key` is absent or already expired.
    pub fn set_expiration(&self, key: &str, expires_at: Instant) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        let entry = state.peek_live(key, now).ok_or(CacheError::NotFound)?;
        entry.expires_at = Some(expires_at);
        Ok(())
    }

    /// Returns the expiration of an existing entry.
    ///
    /// The expiration is `None` for entries that never expire.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] if `key` is absent or already expired.
    pub fn get_expiration(&self, key: &str) -> Result<Option<Instant>, CacheError> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        let entry = state.peek_live(key, now).ok_or(CacheError::NotFound)?;
        Ok(entry.expires_at)
    }

    /// Removes the entry for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] if `key` is absent or already expired.
    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        match state.entries.pop(key) {
            Some(entry) if !entry.is_expired(now) => Ok(()),
            _ => Err(CacheError::NotFound),
        }
    }

    /// Returns the keys of all live entries, in sorted order.
    pub fn list_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        state.remove_expired(now);
        let mut keys: Vec<_> = state.entries.iter().map(|(key, _)| key.clone()).collect();
        keys.sort_unstable();
        keys
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.lock().live_len(now)
    }

    /// Returns `true` if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Removes all expired entries right away, returning how many were removed.
    pub fn remove_expired(&self) -> usize {
        self.inner.lock().remove_expired(Instant::now())
    }

    /// Stops the background sweep.
    ///
    /// The store remains usable afterwards, expired entries are then only removed lazily.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Returns the number of stored entries, including expired ones that were not removed yet.
    #[cfg(test)]
    fn stored_entries(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Periodically removes expired entries from the store.
///
/// Only holds a weak reference, so a store whose handles were all dropped is not kept alive.
async fn sweep<V>(inner: Weak<Inner<V>>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let (removed, remaining) = {
            let mut state = inner.lock();
            let removed = state.remove_expired(Instant::now());
            (removed, state.entries.len())
        };
        if removed > 0 {
            tracing::debug!(removed, remaining, "Swept expired cache entries");
        }
        metric!(gauge("caches.store.items") = remaining as u64);
    }

    tracing::trace!("Stopped cache sweep");
}
