//! Key-value storage used to persist credentials between callers.
//!
//! [`KvCache`] is object safe so product code can hold an
//! `Arc<dyn KvCache>` and stay agnostic of the backend. Values are JSON
//! values; the cache never looks inside them.

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Storage contract shared by the in-process and networked backends.
///
/// Reads never fail: a backend that cannot answer reports a miss so the
/// caller falls back to fetching a fresh value.
pub trait KvCache: Send + Sync {
    /// Get a value, `None` on miss or backend failure
    fn get(&self, key: &str) -> Option<Value>;

    /// Store a value that expires after `ttl`
    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Check whether a live value exists, `false` on backend failure
    fn exists(&self, key: &str) -> bool;

    /// Remove a value; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// In-process cache backed by a mutex-guarded map.
///
/// Expired entries are dropped lazily on read.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    /// Create an empty cache on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty cache on a custom clock (useful for testing)
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemoryCache {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored entries, including expired ones not yet read
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

impl<T: KvCache + ?Sized> KvCache for Arc<T> {
    fn get(&self, key: &str) -> Option<Value> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        (**self).set(key, value, ttl)
    }

    fn exists(&self, key: &str) -> bool {
        (**self).exists(key)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
}
