//! Redis-backed [`KvCache`] shared between processes.
//!
//! Values are stored JSON-encoded with `SETEX`. Reads use `EXISTS` then `GET`
//! as two round trips; a key deleted in between reads as a miss.
//!
//! Connections come from an r2d2 pool. A connection that sat idle for less
//! than [`LIVENESS_GRACE`] is handed out as-is, anything older is probed with
//! `PING` first and replaced when the probe fails.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wxcore::{AppCredential, CredentialCache, RedisCache, RedisOptions};
//!
//! let store = Arc::new(RedisCache::open(&RedisOptions::new("redis://:secrets@127.0.0.1:6379/3"))?);
//! let credential = CredentialCache::new(Arc::new(AppCredential::new("wx1234567890", "app-secret")), store);
//! let token = credential.get_token()?;
//! # Ok::<(), wxcore::RestError>(())
//! ```

use crate::cache::KvCache;
use crate::error::{RestError, Result};
use r2d2::{ManageConnection, Pool};
use redis::ConnectionLike;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Idle time under which a pooled connection skips the liveness probe
pub const LIVENESS_GRACE: Duration = Duration::from_secs(60);

const DEFAULT_PORT: u16 = 6379;

/// Parts of a cache connection URL `scheme://[:password@]host:port[/db]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisUrl {
    /// URL scheme, e.g. `redis` or `rediss`
    pub scheme: String,
    /// `host:port`
    pub host: String,
    /// Password, empty when the URL carries none
    pub password: String,
    /// Database index, 0 when omitted
    pub db: i64,
}

impl RedisUrl {
    /// Parse a connection URL
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| RestError::InvalidCacheUrl(format!("{}: {}", raw, e)))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RestError::InvalidCacheUrl(format!("{}: missing host", raw)))?;
        let host = format!("{}:{}", host, url.port().unwrap_or(DEFAULT_PORT));

        let password = match url.password() {
            Some(p) => urlencoding::decode(p)
                .map_err(|e| RestError::InvalidCacheUrl(format!("{}: {}", raw, e)))?
                .into_owned(),
            None => String::new(),
        };

        let db = match url.path().trim_matches('/') {
            "" => 0,
            segment => segment
                .parse::<i64>()
                .map_err(|_| RestError::InvalidCacheUrl(format!("{}: invalid db {:?}", raw, segment)))?,
        };

        Ok(RedisUrl {
            scheme: url.scheme().to_string(),
            host,
            password,
            db,
        })
    }
}

/// Connection and pool settings for [`RedisCache`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    /// Connection URL
    pub url: String,
    /// Connections kept open while idle
    pub max_idle: u32,
    /// Upper bound on open connections
    pub max_active: u32,
    /// Idle connections above `max_idle` are closed after this many seconds, 0 keeps them
    pub idle_timeout_secs: u64,
    /// Dial timeout for a new connection
    pub connect_timeout_ms: u64,
    /// How long a caller waits to borrow a connection
    pub wait_timeout_ms: u64,
}

impl Default for RedisOptions {
    fn default() -> Self {
        RedisOptions {
            url: "redis://127.0.0.1:6379/0".to_string(),
            max_idle: 2,
            max_active: 10,
            idle_timeout_secs: 240,
            connect_timeout_ms: 1000,
            wait_timeout_ms: 1000,
        }
    }
}

impl RedisOptions {
    /// Options for `url` with default pool tuning
    pub fn new(url: impl Into<String>) -> Self {
        RedisOptions {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Pooled connection remembering when it was last used successfully
pub struct RedisConnection {
    conn: redis::Connection,
    last_used: Instant,
}

/// r2d2 manager dialing Redis connections
#[derive(Debug)]
pub struct RedisConnectionManager {
    client: redis::Client,
    connect_timeout: Duration,
}

impl ManageConnection for RedisConnectionManager {
    type Connection = RedisConnection;
    type Error = redis::RedisError;

    fn connect(&self) -> std::result::Result<RedisConnection, redis::RedisError> {
        let conn = self.client.get_connection_with_timeout(self.connect_timeout)?;
        Ok(RedisConnection {
            conn,
            last_used: Instant::now(),
        })
    }

    fn is_valid(&self, conn: &mut RedisConnection) -> std::result::Result<(), redis::RedisError> {
        if conn.last_used.elapsed() < LIVENESS_GRACE {
            return Ok(());
        }
        redis::cmd("PING").query::<()>(&mut conn.conn)?;
        conn.last_used = Instant::now();
        Ok(())
    }

    fn has_broken(&self, conn: &mut RedisConnection) -> bool {
        !conn.conn.is_open()
    }
}

#[derive(Debug)]
struct TracingErrorHandler;

impl r2d2::HandleError<redis::RedisError> for TracingErrorHandler {
    fn handle_error(&self, error: redis::RedisError) {
        warn!(error = %error, "redis pool connection error");
    }
}

/// Redis-backed cache
pub struct RedisCache {
    pool: Pool<RedisConnectionManager>,
    target: RedisUrl,
}

impl RedisCache {
    /// Build a cache from options.
    ///
    /// The pool is created without dialing, so an unreachable server does not
    /// fail construction; it shows up as misses and write errors instead.
    pub fn open(options: &RedisOptions) -> Result<Self> {
        let target = RedisUrl::parse(&options.url)?;
        let client = redis::Client::open(options.url.as_str())
            .map_err(|e| RestError::InvalidCacheUrl(format!("{}: {}", options.url, e)))?;

        let manager = RedisConnectionManager {
            client,
            connect_timeout: Duration::from_millis(options.connect_timeout_ms.max(1)),
        };

        let max_size = options.max_active.max(1);
        let idle_timeout = match options.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(options.max_idle.min(max_size)))
            .idle_timeout(idle_timeout)
            .connection_timeout(Duration::from_millis(options.wait_timeout_ms.max(1)))
            .test_on_check_out(true)
            .error_handler(Box::new(TracingErrorHandler))
            .build_unchecked(manager);

        info!(host = %target.host, db = target.db, max_active = max_size, "redis cache pool created");

        Ok(RedisCache { pool, target })
    }

    /// Parsed connection target
    pub fn target(&self) -> &RedisUrl {
        &self.target
    }

    /// Open and idle connection counts
    pub fn pool_state(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }

    fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    {
        let mut pooled = self.pool.get()?;
        let result = op(&mut pooled.conn)?;
        pooled.last_used = Instant::now();
        Ok(result)
    }
}

impl KvCache for RedisCache {
    fn get(&self, key: &str) -> Option<Value> {
        let raw = self.with_conn(|conn| {
            let exists: bool = redis::cmd("EXISTS").arg(key).query(conn)?;
            if !exists {
                return Ok(None);
            }
            redis::cmd("GET").arg(key).query::<Option<String>>(conn)
        });

        let raw = match raw {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key, "redis cache miss");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "redis cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "redis cache value is not JSON, treating as miss");
                None
            }
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let encoded = serde_json::to_string(&value)?;
        let seconds = ttl.as_secs().max(1);
        self.with_conn(|conn| {
            redis::cmd("SETEX")
                .arg(key)
                .arg(seconds)
                .arg(encoded)
                .query::<()>(conn)
        })
    }

    fn exists(&self, key: &str) -> bool {
        match self.with_conn(|conn| redis::cmd("EXISTS").arg(key).query::<bool>(conn)) {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key, error = %e, "redis cache exists check failed, treating as miss");
                false
            }
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| redis::cmd("DEL").arg(key).query::<i64>(conn))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_with_db() {
        let url = RedisUrl::parse("redis://127.0.0.1:6379/0").unwrap();
        assert_eq!(url.db, 0);
        assert_eq!(url.host, "127.0.0.1:6379");
        assert_eq!(url.password, "");
    }

    #[test]
    fn test_parse_url_with_password() {
        let url = RedisUrl::parse("redis://:secrets@127.0.0.1:6379/3").unwrap();
        assert_eq!(url.db, 3);
        assert_eq!(url.host, "127.0.0.1:6379");
        assert_eq!(url.password, "secrets");
    }

    #[test]
    fn test_parse_url_without_db() {
        let url = RedisUrl::parse("redis://a.com:12345").unwrap();
        assert_eq!(url.db, 0);
        assert_eq!(url.host, "a.com:12345");
        assert_eq!(url.password, "");
        assert_eq!(url.scheme, "redis");
    }

    #[test]
    fn test_parse_url_trailing_slash_and_encoded_password() {
        let url = RedisUrl::parse("rediss://:p%40ss@cache.internal:6380/").unwrap();
        assert_eq!(url.scheme, "rediss");
        assert_eq!(url.db, 0);
        assert_eq!(url.host, "cache.internal:6380");
        assert_eq!(url.password, "p@ss");
    }

    #[test]
    fn test_parse_url_default_port() {
        let url = RedisUrl::parse("redis://cache.internal/2").unwrap();
        assert_eq!(url.host, "cache.internal:6379");
        assert_eq!(url.db, 2);
    }

    #[test]
    fn test_parse_url_errors() {
        assert!(matches!(RedisUrl::parse("not a url"), Err(RestError::InvalidCacheUrl(_))));
        assert!(matches!(
            RedisUrl::parse("redis://127.0.0.1:6379/db1"),
            Err(RestError::InvalidCacheUrl(_))
        ));
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: RedisOptions =
            serde_json::from_str(r#"{"url": "redis://a.com:12345", "max_active": 32}"#).unwrap();
        assert_eq!(options.url, "redis://a.com:12345");
        assert_eq!(options.max_active, 32);
        assert_eq!(options.max_idle, 2);
        assert_eq!(options.idle_timeout_secs, 240);
    }
}
