use crate::response::Response;
use thiserror::Error;

/// Main error type for provider API and credential operations
#[derive(Debug, Error)]
pub enum RestError {
    /// Non-zero `errcode` reported by the provider
    #[error("provider error {code}: {}", or_unknown(.message))]
    Api {
        code: i64,
        message: String,
        response: Response,
    },

    /// HTTP transport error with a body that is not an envelope
    #[error("HTTP error {status}: {body}")]
    Http {
        status: u16,
        body: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Malformed or envelope-less response body
    #[error("failed to decode response: {message}")]
    Decode { message: String },

    /// Cache backend write or delete failure
    #[error("cache error: {0}")]
    Cache(String),

    /// Cache connection URL could not be parsed
    #[error("invalid cache URL: {0}")]
    InvalidCacheUrl(String),

    /// Gave up waiting for another caller's credential refresh
    #[error("timed out waiting for credential refresh of {key}")]
    RefreshTimeout { key: String },

    /// Component identity has no verification ticket yet
    #[error("no component verify ticket available for {appid}")]
    MissingTicket { appid: String },

    /// Credential-bearing call on a client without a credential cache
    #[error("no credential cache configured for this client")]
    MissingCredential,

    /// Request building error
    #[error("failed to build request: {0}")]
    RequestBuild(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl RestError {
    /// Create a provider error from a decoded response envelope
    pub fn from_response(response: Response) -> Self {
        RestError::Api {
            code: response.errcode,
            message: response.errmsg.clone(),
            response,
        }
    }

    /// Create a new HTTP error
    pub fn http(status: u16, body: String, source: Option<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        RestError::Http { status, body, source }
    }

    /// Create a new decode error
    pub fn decode(message: impl Into<String>) -> Self {
        RestError::Decode {
            message: message.into(),
        }
    }

    /// Provider error code, if this is a provider-reported error
    pub fn code(&self) -> Option<i64> {
        match self {
            RestError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if the provider rejected the credential with one of `codes`
    pub fn is_credential_invalid(&self, codes: &[i64]) -> bool {
        matches!(self, RestError::Api { code, .. } if codes.contains(code))
    }

    /// Check if this error happened before a response envelope was read
    pub fn is_transport(&self) -> bool {
        matches!(self, RestError::Reqwest(_) | RestError::Http { .. })
    }

    /// Get the HTTP status code if this is an HTTP error
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RestError::Http { status, .. } => Some(*status),
            RestError::Reqwest(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RestError {
    fn from(e: redis::RedisError) -> Self {
        RestError::Cache(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<r2d2::Error> for RestError {
    fn from(e: r2d2::Error) -> Self {
        RestError::Cache(e.to_string())
    }
}

fn or_unknown(message: &str) -> &str {
    if message.is_empty() {
        "unknown error"
    } else {
        message
    }
}

/// Result type for REST operations
pub type Result<T> = std::result::Result<T, RestError>;
