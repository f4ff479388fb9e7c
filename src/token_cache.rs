//! Credential cache: hands out a fresh-enough token for one identity.
//!
//! Reads go straight to the key-value store. On a miss, callers serialize on
//! a refresh lock scoped to the identity's cache key, re-check the store, and
//! only the first one through calls the credential source. Everyone queued
//! behind it then finds the new token in the store.
//!
//! ```text
//! Empty/Expired --get_token--> Refreshing --fetch ok--> Valid
//!                              Refreshing --fetch err-> Empty
//! Valid --get_token before expiry--> Valid
//! Valid --invalidate--> Empty
//! ```
//!
//! Cache hits take no refresh lock, and skip the invalidation state unless
//! an invalidation is pending.

use crate::cache::KvCache;
use crate::clock::{Clock, SystemClock};
use crate::credential::{CredentialRecord, CredentialSource};
use crate::error::{RestError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default buffer subtracted from the provider-declared lifetime.
///
/// The margin is capped at half the lifetime, so with this default a token
/// declared valid for less than 600s is served for half its lifetime.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(300);

/// Registry of refresh locks keyed by cache key.
///
/// Grows with the number of identities, not with request volume. Clones share
/// the same registry, so credential caches for the same key that share a
/// registry never refresh concurrently.
#[derive(Debug, Clone, Default)]
pub struct RefreshLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RefreshLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock guarding refreshes of `key`
    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(lock.value());
        }
        let entry = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    /// Number of keys with a lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check whether no lock was created yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Token removed by the last invalidation.
///
/// It is never handed out again until a newer token has been persisted.
/// `armed` lets cache hits skip the mutex while nothing is buried.
#[derive(Debug, Default)]
struct Tombstone {
    armed: AtomicBool,
    token: Mutex<Option<String>>,
}

impl Tombstone {
    fn bury(&self, token: String) {
        let mut buried = self.token.lock();
        *buried = Some(token);
        self.armed.store(true, Ordering::Release);
    }

    fn covers(&self, token: &str) -> bool {
        if !self.armed.load(Ordering::Acquire) {
            return false;
        }
        self.token.lock().as_deref() == Some(token)
    }

    // A concurrent invalidation of `persisted` itself stays in place.
    fn lift(&self, persisted: &str) {
        let mut buried = self.token.lock();
        if buried.as_deref() != Some(persisted) {
            *buried = None;
            self.armed.store(false, Ordering::Release);
        }
    }
}

/// Cached access token for one identity.
///
/// Cloning is cheap and clones share the store, the refresh lock and the
/// invalidation state.
#[derive(Clone)]
pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    store: Arc<dyn KvCache>,
    locks: RefreshLocks,
    clock: Arc<dyn Clock>,
    safety_margin: Duration,
    tombstone: Arc<Tombstone>,
}

impl CredentialCache {
    /// Create a cache for `source`, persisting into `store`
    pub fn new(source: Arc<dyn CredentialSource>, store: Arc<dyn KvCache>) -> Self {
        CredentialCache {
            source,
            store,
            locks: RefreshLocks::new(),
            clock: Arc::new(SystemClock),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            tombstone: Arc::new(Tombstone::default()),
        }
    }

    /// Set the buffer subtracted from the declared lifetime.
    ///
    /// The margin is capped at half of each token's lifetime: a 100s token is
    /// served until +90s with a 10s margin, but only until +50s with the
    /// default 300s margin.
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Use a custom clock (useful for testing)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a lock registry with other caches
    pub fn with_refresh_locks(mut self, locks: RefreshLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Cache key of the identity
    pub fn cache_key(&self) -> String {
        self.source.cache_key()
    }

    /// Safety margin in use
    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Get a token, fetching a new one when none is cached or it is about to expire
    pub fn get_token(&self) -> Result<String> {
        self.acquire(None)
    }

    /// Like [`get_token`](Self::get_token), but waits at most `wait` for a
    /// refresh running in another caller. The refresh itself is not cancelled.
    pub fn get_token_within(&self, wait: Duration) -> Result<String> {
        self.acquire(Some(wait))
    }

    /// Drop the cached token so the next call fetches a new one
    pub fn invalidate(&self) {
        let key = self.source.cache_key();
        if let Some(record) = self.stored_record(&key) {
            self.tombstone.bury(record.token);
        }
        self.remove(&key);
    }

    /// Drop the cached token only if it is still `rejected`.
    ///
    /// A caller that saw `rejected` fail does not throw away a newer token that
    /// another caller already fetched.
    pub fn invalidate_token(&self, rejected: &str) {
        let key = self.source.cache_key();
        self.tombstone.bury(rejected.to_string());

        match self.stored_record(&key) {
            Some(record) if record.token != rejected => {
                debug!(key = %key, "rejected credential already replaced");
            }
            _ => self.remove(&key),
        }
    }

    fn acquire(&self, wait: Option<Duration>) -> Result<String> {
        let key = self.source.cache_key();

        if let Some(record) = self.lookup(&key) {
            debug!(key = %key, "credential cache hit");
            return Ok(record.token);
        }

        let lock = self.locks.lock_for(&key);
        let _guard = match wait {
            Some(wait) => lock
                .try_lock_for(wait)
                .ok_or_else(|| RestError::RefreshTimeout { key: key.clone() })?,
            None => lock.lock(),
        };

        if let Some(record) = self.lookup(&key) {
            debug!(key = %key, "credential refreshed by another caller");
            return Ok(record.token);
        }

        self.refresh(&key)
    }

    // Must be called with the key's refresh lock held.
    fn refresh(&self, key: &str) -> Result<String> {
        let start = Instant::now();
        let issued = self.source.fetch().map_err(|e| {
            warn!(key, error = %e, "credential fetch failed");
            e
        })?;

        let record = CredentialRecord::new(issued, self.clock.now());
        info!(
            key,
            expires_in = record.expires_in,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fetched new credential"
        );

        // The old token may still sit in the store, so the tombstone stays
        // until the new one has replaced it.
        match serde_json::to_value(&record) {
            Ok(value) => match self.store.set(key, value, record.ttl()) {
                Ok(()) => self.tombstone.lift(&record.token),
                Err(e) => warn!(key, error = %e, "failed to persist credential, returning it uncached"),
            },
            Err(e) => warn!(key, error = %e, "failed to encode credential"),
        }

        Ok(record.token)
    }

    fn lookup(&self, key: &str) -> Option<CredentialRecord> {
        let record = self.stored_record(key)?;

        if !record.is_fresh(self.clock.now(), self.safety_margin) {
            debug!(key, "cached credential is past its safe lifetime");
            return None;
        }

        if self.tombstone.covers(&record.token) {
            debug!(key, "cached credential was invalidated");
            return None;
        }

        Some(record)
    }

    fn stored_record(&self, key: &str) -> Option<CredentialRecord> {
        let value = self.store.get(key)?;
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(key, error = %e, "cached credential is undecodable");
                None
            }
        }
    }

    fn remove(&self, key: &str) {
        match self.store.delete(key) {
            Ok(()) => info!(key, "credential invalidated"),
            Err(e) => warn!(key, error = %e, "failed to delete invalidated credential"),
        }
    }
}
