//! TTL correlation cache
//!
//! A key-value store where entries expire after a configurable duration,
//! with optional insertion and expiry callbacks. Used by the trigger
//! engines, the DNS-log service and the tunnel registry wherever state
//! must clean itself up.
//!
//! Expiry callbacks run after the entry has been removed and never under a
//! map shard lock, so a callback may freely call back into the same cache
//! (or a sibling cache whose callbacks point back here).

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Callback invoked with the key and value of an inserted or expired entry
pub type Callback<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: RwLock<Duration>,
    on_insert: RwLock<Option<Callback<K, V>>>,
    on_expire: RwLock<Option<Callback<K, V>>>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Remove every expired entry, then fire expiry callbacks outside the map
    fn sweep(&self) {
        let now = Instant::now();
        let expired_keys: Vec<K> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        for key in expired_keys {
            // Re-check under the removal so a concurrent refresh wins
            if let Some((k, entry)) = self
                .entries
                .remove_if(&key, |_, e| e.expires_at <= Instant::now())
            {
                self.fire_expire(&k, &entry.value);
            }
        }
    }

    fn fire_expire(&self, key: &K, value: &V) {
        let cb = self.on_expire.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(key, value);
        }
    }

    fn fire_insert(&self, key: &K, value: &V) {
        let cb = self.on_insert.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(key, value);
        }
    }
}

/// A TTL cache instance
///
/// Clones share the same underlying store. The background sweep task is
/// started when the first clone is created inside a tokio runtime and
/// aborted when the last clone is dropped; correctness does not depend on
/// it, since reads lazily discard expired entries.
pub struct TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<K, V>>,
    sweeper: Arc<Sweeper>,
}

impl<K, V> Clone for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            sweeper: self.sweeper.clone(),
        }
    }
}

struct Sweeper {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache whose entries expire `ttl` after their last `set`
    pub fn new(ttl: Duration) -> Self {
        let inner = Arc::new(Inner {
            entries: DashMap::new(),
            ttl: RwLock::new(ttl),
            on_insert: RwLock::new(None),
            on_expire: RwLock::new(None),
        });

        // The sweep task is best-effort; outside a runtime (plain unit
        // tests) lazy expiry on get() carries the contract alone.
        let handle = tokio::runtime::Handle::try_current().ok().map(|rt| {
            let weak = Arc::downgrade(&inner);
            rt.spawn(async move {
                let mut tick = tokio::time::interval(SWEEP_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    match weak.upgrade() {
                        Some(inner) => inner.sweep(),
                        None => break,
                    }
                }
            })
        });

        Self {
            inner,
            sweeper: Arc::new(Sweeper {
                handle: Mutex::new(handle),
            }),
        }
    }

    /// Register a callback fired synchronously when a genuinely new key is
    /// inserted (refreshes do not fire it)
    pub fn set_on_insert(&self, cb: Callback<K, V>) {
        *self.inner.on_insert.write().unwrap() = Some(cb);
    }

    /// Register a callback fired after an entry expired and was removed
    pub fn set_on_expire(&self, cb: Callback<K, V>) {
        *self.inner.on_expire.write().unwrap() = Some(cb);
    }

    /// Change the default TTL for future insertions and refreshes
    pub fn set_ttl(&self, ttl: Duration) {
        *self.inner.ttl.write().unwrap() = ttl;
    }

    /// Insert or refresh an entry, resetting its TTL
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, *self.inner.ttl.read().unwrap());
    }

    /// Insert or refresh an entry with an explicit TTL
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        };
        let previous = self.inner.entries.insert(key.clone(), entry);
        if previous.is_none() {
            self.inner.fire_insert(&key, &value);
        }
    }

    /// Look up a live entry; an expired entry is removed and reported absent
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.inner.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some((k, entry)) = self
                .inner
                .entries
                .remove_if(key, |_, e| e.expires_at <= Instant::now())
            {
                self.inner.fire_expire(&k, &entry.value);
            }
        }
        None
    }

    /// Mutate a live entry in place without refreshing its TTL
    ///
    /// Returns false if the key is missing or expired.
    pub fn mutate<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        match self.inner.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at > Instant::now() => {
                f(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    /// Remove an entry without firing the expiry callback
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.entries.remove(key).map(|(_, e)| e.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Snapshot of live entries
    pub fn entries(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|e| e.value().expires_at > now)
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|e| e.value().expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force an expiry sweep now (normally driven by the background task)
    pub fn sweep(&self) {
        self.inner.sweep();
    }
}
