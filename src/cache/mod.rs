//! Response caching — storage backend, cacheability policy and key derivation.
//!
//! - [`CacheBackend`] — the storage contract the proxy depends on.
//! - [`MemoryCache`] — process-local backend with lazy TTL expiry.
//! - [`policy::CachePolicy`] — method/endpoint allow-list plus TTL.
//! - [`key::derive_key`] — deterministic key from path and query parameters.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

pub mod key;
pub mod policy;

pub use key::derive_key;
pub use policy::CachePolicy;

/// Storage contract for cached values.
///
/// Implementations must be shareable across Tokio tasks. None of the methods
/// are async: a backend must not block on I/O while a caller holds it.
pub trait CacheBackend<V>: Send + Sync {
    /// Returns the value stored under `key` unless it is absent or expired.
    fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// `ttl` of `None` or zero means the entry never expires. Otherwise the
    /// expiry instant is computed from the moment of the call.
    fn set(&self, key: &str, value: V, ttl: Option<Duration>);

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str);

    /// Returns `true` if an entry exists for `key`, expired or not.
    fn exists(&self, key: &str) -> bool;
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`CacheBackend`] with lazy expiry.
///
/// Expired entries are never returned; they are dropped from the map the
/// next time they are read. Nothing bounds the number of entries.
///
/// Time is read from [`tokio::time::Instant`], so a paused test runtime
/// controls expiry.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cacheproxy::cache::{CacheBackend, MemoryCache};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache: MemoryCache<String> = MemoryCache::new();
/// cache.set("cache:abc", "hello".to_owned(), Some(Duration::from_secs(60)));
/// assert_eq!(cache.get("cache:abc").as_deref(), Some("hello"));
/// cache.delete("cache:abc");
/// assert!(cache.get("cache:abc").is_none());
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> MemoryCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of stored entries, including expired ones not yet
    /// discovered by a read.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave an entry half-written, so a
    // poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheBackend<V> for MemoryCache<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            trace!(key, "cache entry expired");
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| Instant::now() + ttl);
        self.lock()
            .insert(key.to_owned(), Entry { value, expires_at });
    }

    fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    fn exists(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }
}
