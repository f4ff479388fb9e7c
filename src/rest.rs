use crate::client::{create_rest_client, AuthPlacement, Config};
use crate::error::{RestError, Result};
use crate::response::Response;
use crate::token_cache::CredentialCache;
use crate::upload::{is_envelope_type, Download, MediaUpload};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Client for provider API calls.
///
/// Credential-bearing calls take a token from the [`CredentialCache`]. When the
/// provider answers with one of [`Config::credential_codes`], the token is
/// invalidated, a new one is fetched and the call is sent exactly once more.
#[derive(Clone)]
pub struct RestClient {
    /// HTTP client
    client: Client,
    /// Configuration
    config: Config,
    /// Credential for authenticated calls
    credential: Option<CredentialCache>,
    /// Per-request timeout override
    timeout: Option<Duration>,
}

impl RestClient {
    /// Create a client whose calls are authenticated with `credential`
    pub fn new(config: Config, credential: CredentialCache) -> Result<Self> {
        Ok(RestClient {
            client: create_rest_client(&config)?,
            config,
            credential: Some(credential),
            timeout: None,
        })
    }

    /// Create a client that can only make calls authenticated by their own parameters
    pub fn anonymous(config: Config) -> Result<Self> {
        Ok(RestClient {
            client: create_rest_client(&config)?,
            config,
            credential: None,
            timeout: None,
        })
    }

    /// Use a preconfigured HTTP client
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Copy of this client whose requests time out after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut client = self.clone();
        client.timeout = Some(timeout);
        client
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Credential cache backing this client
    pub fn credential(&self) -> Option<&CredentialCache> {
        self.credential.as_ref()
    }

    /// POST a JSON body
    ///
    /// # Arguments
    /// * `path` - API endpoint path, e.g. `/cgi-bin/menu/create`
    /// * `body` - Request body, serialized as JSON
    pub fn post_json<B>(&self, path: &str, body: &B) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        self.with_credential(path, |token| {
            let request = self.request(Method::POST, path, Some(token))?.json(body);
            self.execute(request, "POST", path)
        })
    }

    /// GET with query parameters
    pub fn get<Q>(&self, path: &str, query: &Q) -> Result<Response>
    where
        Q: Serialize + ?Sized,
    {
        self.with_credential(path, |token| {
            let request = self.request(Method::GET, path, Some(token))?.query(query);
            self.execute(request, "GET", path)
        })
    }

    /// GET without attaching a cached credential, for calls such as the OAuth
    /// code exchange that authenticate through their own parameters
    pub fn get_without_credential<Q>(&self, path: &str, query: &Q) -> Result<Response>
    where
        Q: Serialize + ?Sized,
    {
        let request = self.request(Method::GET, path, None)?.query(query);
        self.execute(request, "GET", path)
    }

    /// Upload a file as multipart form data
    ///
    /// # Arguments
    /// * `path` - API endpoint path, may carry its own query, e.g. `/cgi-bin/media/upload?type=image`
    /// * `field_name` - Form field holding the file
    /// * `file_name` - File name reported to the provider
    /// * `reader` - File content
    pub fn post_multipart<R: Read>(
        &self,
        path: &str,
        field_name: &str,
        file_name: &str,
        reader: R,
    ) -> Result<Response> {
        let media = MediaUpload::from_reader(field_name, file_name, reader)?;
        self.upload(path, &media)
    }

    /// Upload a prepared payload as multipart form data
    pub fn upload(&self, path: &str, media: &MediaUpload) -> Result<Response> {
        self.with_credential(path, |token| {
            let request = self
                .request(Method::POST, path, Some(token))?
                .multipart(media.form()?);
            self.execute(request, "POST", path)
        })
    }

    /// POST a JSON body and return the binary response
    ///
    /// An envelope-typed response is decoded first, so provider errors are
    /// reported (and credential rejections retried) like any other call.
    pub fn post_download<B>(&self, path: &str, body: &B) -> Result<Download>
    where
        B: Serialize + ?Sized,
    {
        self.with_credential(path, |token| {
            let start = Instant::now();
            let response = self.request(Method::POST, path, Some(token))?.json(body).send()?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            debug!(
                method = "POST",
                path,
                status = status.as_u16(),
                content_type = content_type.as_deref().unwrap_or(""),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "download responded"
            );

            if is_envelope_type(content_type.as_deref()) || !status.is_success() {
                let body = response.bytes()?;
                decode_body(status, &body)?.into_result()?;
                return Ok(Download::buffered(content_type, body.to_vec()));
            }

            Ok(Download::streaming(content_type, response))
        })
    }

    /// Run `send` with a token, retrying once with a new token if the provider
    /// rejected the first one
    fn with_credential<T, F>(&self, path: &str, send: F) -> Result<T>
    where
        F: Fn(&str) -> Result<T>,
    {
        let credential = self.credential.as_ref().ok_or(RestError::MissingCredential)?;

        let token = credential.get_token()?;
        match send(&token) {
            Err(e) if e.is_credential_invalid(&self.config.credential_codes) => {
                warn!(
                    path,
                    code = e.code().unwrap_or_default(),
                    key = %credential.cache_key(),
                    "credential rejected, refreshing and retrying once"
                );
                credential.invalidate_token(&token);
                let token = credential.get_token()?;
                send(&token)
            }
            other => other,
        }
    }

    /// Build a request for `path`, attaching `token` as configured
    fn request(&self, method: Method, path: &str, token: Option<&str>) -> Result<RequestBuilder> {
        let mut url = Url::parse(&self.config.url(path))?;
        let mut header = None;

        if let Some(token) = token {
            match self.config.auth {
                AuthPlacement::Query { ref param } => {
                    url.query_pairs_mut().append_pair(param, token);
                }
                AuthPlacement::Header { ref name, ref prefix } => {
                    header = Some((name.clone(), format!("{}{}", prefix, token)));
                }
            }
        }

        let mut request = self.client.request(method, url);
        if let Some((name, value)) = header {
            request = request.header(name, value);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        Ok(request)
    }

    /// Send a request and decode its envelope
    fn execute(&self, request: RequestBuilder, method: &str, path: &str) -> Result<Response> {
        let start = Instant::now();
        let http_response = request.send()?;
        let status = http_response.status();
        let body = http_response.bytes()?;

        debug!(
            method,
            path,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "request completed"
        );

        decode_body(status, &body)?.into_result()
    }
}

/// Decode a response body into an envelope.
///
/// A body that is not an envelope becomes an HTTP error when the status is an
/// error, a decode error otherwise. An error status with a successful envelope
/// is still an HTTP error.
pub(crate) fn decode_body(status: StatusCode, body: &[u8]) -> Result<Response> {
    let failed = status.is_client_error() || status.is_server_error();

    match Response::decode(body) {
        Ok(response) if failed && response.is_success() => Err(RestError::http(
            status.as_u16(),
            String::from_utf8_lossy(body).to_string(),
            None,
        )),
        Ok(response) => Ok(response),
        Err(e) if failed => Err(RestError::http(
            status.as_u16(),
            String::from_utf8_lossy(body).to_string(),
            Some(Box::new(e)),
        )),
        Err(e) => Err(e),
    }
}
