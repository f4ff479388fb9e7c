//! Credential sources: how a fresh access token is obtained for one identity.

use crate::cache::KvCache;
use crate::client::{DEFAULT_BASE_URL, WORK_BASE_URL};
use crate::error::{RestError, Result};
use crate::rest::decode_body;
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a pushed component verify ticket is kept
pub const VERIFY_TICKET_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Longest lifetime accepted from an issuing endpoint (one year)
pub const MAX_EXPIRES_IN: i64 = 366 * 24 * 60 * 60;

/// Knows how to obtain a fresh credential for one identity and which cache
/// key that credential lives under.
pub trait CredentialSource: Send + Sync {
    /// Cache key, unique per identity
    fn cache_key(&self) -> String;

    /// Fetch a fresh credential from the issuing endpoint
    fn fetch(&self) -> Result<IssuedCredential>;
}

impl<T: CredentialSource + ?Sized> CredentialSource for Arc<T> {
    fn cache_key(&self) -> String {
        (**self).cache_key()
    }

    fn fetch(&self) -> Result<IssuedCredential> {
        (**self).fetch()
    }
}

/// Token as returned by an issuing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuedCredential {
    /// Bearer token
    #[serde(alias = "component_access_token")]
    pub access_token: String,

    /// Lifetime in seconds
    pub expires_in: i64,
}

impl IssuedCredential {
    /// Create a credential valid for `expires_in` seconds
    pub fn new(access_token: impl Into<String>, expires_in: i64) -> Self {
        IssuedCredential {
            access_token: access_token.into(),
            expires_in,
        }
    }
}

/// Credential as persisted in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Bearer token
    pub token: String,
    /// Lifetime in seconds declared by the issuing endpoint
    pub expires_in: u64,
    /// When the token was obtained
    pub fetched_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Record a credential fetched at `now`
    pub fn new(issued: IssuedCredential, now: DateTime<Utc>) -> Self {
        CredentialRecord {
            token: issued.access_token,
            expires_in: issued.expires_in.max(0) as u64,
            fetched_at: now,
        }
    }

    /// Lifetime declared by the provider
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.expires_in)
    }

    /// Instant after which the record must not be handed out, `None` when
    /// the lifetime does not fit the calendar.
    ///
    /// The margin never exceeds half the lifetime.
    pub fn expires_at(&self, safety_margin: Duration) -> Option<DateTime<Utc>> {
        let margin = safety_margin.as_secs().min(self.expires_in / 2);
        let usable = chrono::Duration::from_std(Duration::from_secs(self.expires_in.saturating_sub(margin))).ok()?;
        self.fetched_at.checked_add_signed(usable)
    }

    /// Check whether the record may still be handed out at `now`.
    /// A record with an unrepresentable expiry is never fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        matches!(self.expires_at(safety_margin), Some(at) if now < at)
    }
}

/// Issuing endpoint and the HTTP client used to reach it
#[derive(Debug, Clone)]
struct Issuer {
    endpoint: String,
    http: Client,
}

impl Issuer {
    fn new(endpoint: &str) -> Self {
        Issuer {
            endpoint: endpoint.to_string(),
            http: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn issue(&self, request: RequestBuilder) -> Result<IssuedCredential> {
        let start = Instant::now();
        let response = request.send()?;
        let status = response.status();
        let body = response.bytes()?;

        debug!(
            endpoint = %self.endpoint,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "credential endpoint responded"
        );

        let envelope = decode_body(status, &body)?.into_result()?;
        let issued: IssuedCredential = serde_json::from_value(envelope.raw())
            .map_err(|e| RestError::decode(format!("credential response: {}", e)))?;

        if issued.access_token.is_empty() {
            return Err(RestError::decode("credential response has an empty token"));
        }
        if issued.expires_in <= 0 || issued.expires_in > MAX_EXPIRES_IN {
            return Err(RestError::decode(format!(
                "credential response has out-of-range expires_in {}",
                issued.expires_in
            )));
        }

        Ok(issued)
    }
}

/// Official account or mini program identity (`appid` + `secret`)
#[derive(Debug, Clone)]
pub struct AppCredential {
    appid: String,
    secret: String,
    issuer: Issuer,
}

impl AppCredential {
    /// Create a source for an app identity
    pub fn new(appid: impl Into<String>, secret: impl Into<String>) -> Self {
        AppCredential {
            appid: appid.into(),
            secret: secret.into(),
            issuer: Issuer::new(DEFAULT_BASE_URL),
        }
    }

    /// Use a different issuing endpoint base URL
    pub fn with_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.issuer.endpoint = base_url.into();
        self
    }

    /// Use a preconfigured HTTP client
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.issuer.http = http;
        self
    }

    /// Application id
    pub fn appid(&self) -> &str {
        &self.appid
    }
}

impl CredentialSource for AppCredential {
    fn cache_key(&self) -> String {
        format!("wxcore:access_token:{}", self.appid)
    }

    fn fetch(&self) -> Result<IssuedCredential> {
        let request = self.issuer.http.get(self.issuer.url("/cgi-bin/token")).query(&[
            ("grant_type", "client_credential"),
            ("appid", self.appid.as_str()),
            ("secret", self.secret.as_str()),
        ]);
        self.issuer.issue(request)
    }
}

/// Work (corp) identity: one corp id with one application secret
#[derive(Debug, Clone)]
pub struct CorpCredential {
    corpid: String,
    secret: String,
    issuer: Issuer,
}

impl CorpCredential {
    /// Create a source for a corp application
    pub fn new(corpid: impl Into<String>, secret: impl Into<String>) -> Self {
        CorpCredential {
            corpid: corpid.into(),
            secret: secret.into(),
            issuer: Issuer::new(WORK_BASE_URL),
        }
    }

    /// Use a different issuing endpoint base URL
    pub fn with_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.issuer.endpoint = base_url.into();
        self
    }

    /// Use a preconfigured HTTP client
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.issuer.http = http;
        self
    }

    /// Corp id
    pub fn corpid(&self) -> &str {
        &self.corpid
    }
}

impl CredentialSource for CorpCredential {
    // Each application of a corp has its own secret and token.
    fn cache_key(&self) -> String {
        let digest = format!("{:x}", Sha256::digest(self.secret.as_bytes()));
        format!("wxcore:corp_access_token:{}:{}", self.corpid, &digest[..16])
    }

    fn fetch(&self) -> Result<IssuedCredential> {
        let request = self.issuer.http.get(self.issuer.url("/cgi-bin/gettoken")).query(&[
            ("corpid", self.corpid.as_str()),
            ("corpsecret", self.secret.as_str()),
        ]);
        self.issuer.issue(request)
    }
}

/// Third-party platform component identity.
///
/// Issuing a component token also needs the verify ticket the provider pushes
/// to the component's callback every few minutes. The ticket is kept in the
/// same key-value cache as the tokens so every process sees the latest one.
#[derive(Clone)]
pub struct ComponentCredential {
    appid: String,
    secret: String,
    issuer: Issuer,
    store: Arc<dyn KvCache>,
}

impl ComponentCredential {
    /// Create a source for a component app, reading tickets from `store`
    pub fn new(appid: impl Into<String>, secret: impl Into<String>, store: Arc<dyn KvCache>) -> Self {
        ComponentCredential {
            appid: appid.into(),
            secret: secret.into(),
            issuer: Issuer::new(DEFAULT_BASE_URL),
            store,
        }
    }

    /// Use a different issuing endpoint base URL
    pub fn with_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.issuer.endpoint = base_url.into();
        self
    }

    /// Use a preconfigured HTTP client
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.issuer.http = http;
        self
    }

    /// Component app id
    pub fn appid(&self) -> &str {
        &self.appid
    }

    fn ticket_key(&self) -> String {
        format!("wxcore:component_verify_ticket:{}", self.appid)
    }

    /// Store the latest ticket pushed by the provider
    pub fn set_verify_ticket(&self, ticket: &str) -> Result<()> {
        self.store.set(
            &self.ticket_key(),
            Value::String(ticket.to_string()),
            VERIFY_TICKET_TTL,
        )
    }

    /// Latest stored ticket
    pub fn verify_ticket(&self) -> Option<String> {
        match self.store.get(&self.ticket_key())? {
            Value::String(ticket) if !ticket.is_empty() => Some(ticket),
            _ => None,
        }
    }
}

impl CredentialSource for ComponentCredential {
    fn cache_key(&self) -> String {
        format!("wxcore:component_access_token:{}", self.appid)
    }

    fn fetch(&self) -> Result<IssuedCredential> {
        let ticket = self.verify_ticket().ok_or_else(|| RestError::MissingTicket {
            appid: self.appid.clone(),
        })?;

        let request = self
            .issuer
            .http
            .post(self.issuer.url("/cgi-bin/component/api_component_token"))
            .json(&serde_json::json!({
                "component_appid": self.appid,
                "component_appsecret": self.secret,
                "component_verify_ticket": ticket,
            }));
        self.issuer.issue(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use chrono::TimeZone;

    fn fetched_at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_record_expiry_with_margin() {
        let record = CredentialRecord::new(IssuedCredential::new("tok", 100), fetched_at());
        let margin = Duration::from_secs(10);

        assert_eq!(record.expires_at(margin).unwrap().timestamp(), 1_700_000_090);
        assert!(record.is_fresh(fetched_at() + chrono::Duration::seconds(50), margin));
        assert!(record.is_fresh(fetched_at() + chrono::Duration::seconds(89), margin));
        assert!(!record.is_fresh(fetched_at() + chrono::Duration::seconds(90), margin));
        assert_eq!(record.ttl(), Duration::from_secs(100));
    }

    #[test]
    fn test_record_margin_clamped_to_half_lifetime() {
        let record = CredentialRecord::new(IssuedCredential::new("tok", 100), fetched_at());
        assert_eq!(record.expires_at(Duration::from_secs(300)).unwrap().timestamp(), 1_700_000_050);
    }

    #[test]
    fn test_record_with_unrepresentable_lifetime_is_stale() {
        for expires_in in [10_000_000_000_000, i64::MAX as u64, u64::MAX] {
            let record = CredentialRecord {
                token: "tok".to_string(),
                expires_in,
                fetched_at: fetched_at(),
            };
            assert_eq!(record.expires_at(Duration::from_secs(300)), None);
            assert!(!record.is_fresh(fetched_at(), Duration::from_secs(300)));
        }
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let record = CredentialRecord::new(IssuedCredential::new("tok", 7200), fetched_at());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["token"], "tok");
        let back: CredentialRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_issued_accepts_component_field() {
        let issued: IssuedCredential =
            serde_json::from_str(r#"{"component_access_token": "c-1", "expires_in": 7200}"#).unwrap();
        assert_eq!(issued, IssuedCredential::new("c-1", 7200));
    }

    #[test]
    fn test_cache_keys_are_per_identity() {
        let a = AppCredential::new("wx-a", "s");
        let b = AppCredential::new("wx-b", "s");
        assert_ne!(a.cache_key(), b.cache_key());

        let corp_one = CorpCredential::new("corp", "secret-one");
        let corp_two = CorpCredential::new("corp", "secret-two");
        assert_ne!(corp_one.cache_key(), corp_two.cache_key());
        assert!(!corp_one.cache_key().contains("secret-one"));
    }

    #[test]
    fn test_component_ticket_storage() {
        let store: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let component = ComponentCredential::new("wx-comp", "s", store);
        assert_eq!(component.verify_ticket(), None);

        component.set_verify_ticket("ticket@@@1").unwrap();
        assert_eq!(component.verify_ticket(), Some("ticket@@@1".to_string()));
    }

    #[test]
    fn test_component_fetch_without_ticket() {
        let store: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let component = ComponentCredential::new("wx-comp", "s", store)
            .with_endpoint("http://127.0.0.1:1");

        match component.fetch() {
            Err(RestError::MissingTicket { appid }) => assert_eq!(appid, "wx-comp"),
            other => panic!("expected MissingTicket, got {:?}", other),
        }
    }
}
