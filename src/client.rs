use crate::error::Result;
use reqwest::blocking::{Client, ClientBuilder};
use std::time::Duration;

/// Base URL of the official account / mini program API
pub const DEFAULT_BASE_URL: &str = "https://api.weixin.qq.com";

/// Base URL of the work (corp) API
pub const WORK_BASE_URL: &str = "https://qyapi.weixin.qq.com";

/// Provider codes meaning the access token is invalid or expired:
/// 40001 invalid credential, 40014 invalid access_token, 42001 access_token expired
pub const DEFAULT_CREDENTIAL_CODES: [i64; 3] = [40001, 40014, 42001];

/// Where the credential goes on an outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPlacement {
    /// Query string parameter, e.g. `?access_token=...`
    Query { param: String },
    /// Request header with a value prefix, e.g. `Authorization: Bearer ...`
    Header { name: String, prefix: String },
}

impl AuthPlacement {
    /// Token in the given query parameter
    pub fn query(param: impl Into<String>) -> Self {
        AuthPlacement::Query { param: param.into() }
    }

    /// Token as an `Authorization: Bearer` header
    pub fn bearer() -> Self {
        AuthPlacement::Header {
            name: "Authorization".to_string(),
            prefix: "Bearer ".to_string(),
        }
    }
}

impl Default for AuthPlacement {
    fn default() -> Self {
        AuthPlacement::query("access_token")
    }
}

/// Create the HTTP client for provider API requests
/// with connection pooling and timeouts taken from `config`
pub fn create_rest_client(config: &Config) -> Result<Client> {
    let client = ClientBuilder::new()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .build()?;
    Ok(client)
}

/// Configuration for the provider API client
#[derive(Debug, Clone)]
pub struct Config {
    /// API base URL, e.g. `https://api.weixin.qq.com`
    pub base_url: String,
    /// Whole-request timeout
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,
    /// Provider codes that trigger a credential refresh and one retry
    pub credential_codes: Vec<i64>,
    /// How the credential is attached
    pub auth: AuthPlacement,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 50,
            credential_codes: DEFAULT_CREDENTIAL_CODES.to_vec(),
            auth: AuthPlacement::default(),
        }
    }
}

impl Config {
    /// Create a new configuration for the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Config {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Configuration for the work (corp) API
    pub fn work() -> Self {
        Self::new(WORK_BASE_URL)
    }

    /// Set the whole-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Replace the credential-invalid code list
    pub fn with_credential_codes(mut self, codes: impl Into<Vec<i64>>) -> Self {
        self.credential_codes = codes.into();
        self
    }

    /// Set where the credential is attached
    pub fn with_auth(mut self, auth: AuthPlacement) -> Self {
        self.auth = auth;
        self
    }

    /// Join the base URL and an endpoint path
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
