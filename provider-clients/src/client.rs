//! Session-authenticated HTTP client.
//!
//! Every request re-reads the stored session, so cookies rotated by an
//! earlier response (or by a fresh capture) are picked up immediately.

use crate::cookies;
use crate::pagination::{self, parse_next_link, Paged};
use crate::profile::{ApiBase, ClientProfile, PayloadCheck};
use crate::transport::{with_query, RawResponse, SendError, Transport};
use authbroker::config::ClientConfig;
use authbroker::credentials::{BrowserSession, CredentialKey, CredentialRecord, CredentialStore};
use authbroker::BrokerError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, LINK, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};


/// Upper bound on a server-requested retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Bounded exponential backoff for idempotent requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl From<&ClientConfig> for RetryPolicy {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    /// Relative to the provider's API base
    Path(String),
    /// Absolute URL, used verbatim
    Url(String),
}

/// One provider API call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    method: Method,
    target: Target,
    query: Vec<(String, String)>,
    form: Option<Vec<(String, String)>>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            target: Target::Path(path.into()),
            query: Vec::new(),
            form: None,
        }
    }

    /// Form-encoded POST.
    pub fn post_form(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            target: Target::Path(path.into()),
            query: Vec::new(),
            form: Some(Vec::new()),
        }
    }

    /// GET of an absolute URL taken from a previous response.
    pub fn follow(self, url: String) -> Self {
        Self {
            method: Method::GET,
            target: Target::Url(url),
            query: Vec::new(),
            form: None,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a query parameter, or a form field for form requests.
    pub fn set_param(&mut self, name: &str, value: &str) {
        let params = match &mut self.form {
            Some(form) => form,
            None => &mut self.query,
        };
        match params.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => params.push((name.to_string(), value.to_string())),
        }
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.set_param(name, value);
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.method == Method::GET
    }

    fn params(&self) -> &[(String, String)] {
        self.form.as_deref().unwrap_or(&self.query)
    }

    fn describe(&self) -> &str {
        match &self.target {
            Target::Path(p) | Target::Url(p) => p,
        }
    }
}

/// Successful, classified response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// `rel="next"` target of the `Link` header
    pub next_link: Option<String>,
}

struct Failure {
    error: BrokerError,
    retryable: bool,
}

impl Failure {
    fn fatal(error: BrokerError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }

    fn retryable(error: BrokerError) -> Self {
        Self {
            error,
            retryable: true,
        }
    }
}

/// Authenticated client for one browser-session provider.
///
/// Owns its own connection pool; redirects are never followed so a bounce
/// to the login page is seen as such. Profiles marked `impersonate` get a
/// transport that emulates Chrome's TLS and HTTP/2 fingerprint.
pub struct SessionClient {
    profile: ClientProfile,
    store: Arc<CredentialStore>,
    http: Transport,
    retry: RetryPolicy,
    api_base: Option<String>,
}

impl SessionClient {
    pub fn new(
        profile: ClientProfile,
        store: Arc<CredentialStore>,
        config: &ClientConfig,
    ) -> anyhow::Result<Self> {
        let http = Transport::build(
            profile.provider,
            profile.impersonate,
            Duration::from_secs(config.request_timeout_seconds),
        )?;
        debug!(provider = profile.provider, transport = http.name(), "Session client ready");
        Ok(Self {
            profile,
            store,
            http,
            retry: RetryPolicy::from(config),
            api_base: None,
        })
    }

    /// Overrides the API base (for testing with a mock server).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = Some(base.into());
        self
    }

    pub fn provider(&self) -> &'static str {
        self.profile.provider
    }

    pub fn profile(&self) -> &ClientProfile {
        &self.profile
    }

    /// `"chrome"` when requests carry a browser TLS fingerprint, else `"plain"`.
    pub fn transport(&self) -> &'static str {
        self.http.name()
    }

    /// GET `path` with query parameters and return the parsed body.
    pub async fn get(
        &self,
        path: &str,
        params: &[(&str, &str)],
        account: &str,
    ) -> Result<Value, BrokerError> {
        let request = params
            .iter()
            .fold(ApiRequest::get(path), |req, (k, v)| req.with_param(k, v));
        Ok(self.send(&request, account).await?.body)
    }

    /// Form-encoded POST to `path`. Never retried.
    pub async fn post_form(
        &self,
        path: &str,
        form: &[(&str, &str)],
        account: &str,
    ) -> Result<Value, BrokerError> {
        let request = form
            .iter()
            .fold(ApiRequest::post_form(path), |req, (k, v)| req.with_param(k, v));
        Ok(self.send(&request, account).await?.body)
    }

    /// Pages through `request` with the profile's pagination convention.
    pub async fn fetch_all(
        &self,
        request: ApiRequest,
        account: &str,
        max_pages: u32,
    ) -> Result<Paged, BrokerError> {
        pagination::fetch_all(self, request, &self.profile.pagination, account, max_pages).await
    }

    /// Issues `request`, merges rotated cookies and classifies the result.
    pub async fn send(&self, request: &ApiRequest, account: &str) -> Result<ApiResponse, BrokerError> {
        let key = CredentialKey::new(self.profile.provider, account);
        let mut attempt = 0;

        loop {
            let session = self.load_session(&key)?;
            let url = with_query(&self.url_for(request, &session), &request.query);
            let headers = self.headers(&session)?;

            debug!(provider = self.provider(), account = %account, method = %request.method, target = request.describe(), "Sending request");
            let response = match self
                .http
                .send(&request.method, &url, headers, request.form.as_deref())
                .await
            {
                Ok(response) => response,
                Err(SendError::Transport(e)) => {
                    return Err(BrokerError::integration(
                        self.provider(),
                        format!("request to {} failed: {}", request.describe(), e),
                    ))
                }
                Err(SendError::Body(e)) => {
                    return Err(BrokerError::integration(
                        self.provider(),
                        format!("failed to read response body: {}", e),
                    ))
                }
            };

            self.absorb_rotations(&key, &response.headers).await;

            let failure = match self.classify(&key, response) {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };
            if !(failure.retryable && request.is_idempotent() && attempt < self.retry.max_retries) {
                return Err(failure.error);
            }

            let delay = match &failure.error {
                BrokerError::RateLimit {
                    retry_after: Some(after),
                    ..
                } => (*after).min(MAX_RETRY_DELAY),
                _ => self.retry.delay(attempt),
            };
            warn!(
                provider = self.provider(),
                account = %account,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn load_session(&self, key: &CredentialKey) -> Result<BrowserSession, BrokerError> {
        match self.store.get(key) {
            Some(CredentialRecord::BrowserSession(session)) => Ok(session),
            Some(other) => Err(BrokerError::authentication(
                &key.provider,
                &key.account,
                format!("stored credential is a {:?} record, not a browser session", other.kind()),
            )),
            None => Err(BrokerError::authentication(
                &key.provider,
                &key.account,
                "no captured session",
            )),
        }
    }

    fn url_for(&self, request: &ApiRequest, session: &BrowserSession) -> String {
        let path = match &request.target {
            Target::Url(url) => return url.clone(),
            Target::Path(path) => path,
        };
        let base = match (&self.api_base, &self.profile.api_base) {
            (Some(base), _) => base.trim_end_matches('/').to_string(),
            (None, ApiBase::SessionBaseUrl(suffix)) => {
                format!("{}{}", session.base_url.trim_end_matches('/'), suffix)
            }
            (None, ApiBase::Fixed(base)) => base.to_string(),
        };
        format!("{}/{}", base, path.trim_start_matches('/'))
    }

    fn headers(&self, session: &BrowserSession) -> Result<HeaderMap, BrokerError> {
        let invalid = |name: &str| {
            BrokerError::integration(
                self.provider(),
                format!("stored session holds a value not valid in the {} header", name),
            )
        };

        let mut headers = HeaderMap::new();
        for &(name, value) in &self.profile.fixed_headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?;
            headers.insert(header, HeaderValue::from_static(value));
        }
        if !session.cookie_jar.is_empty() {
            let cookie = HeaderValue::from_str(&cookies::cookie_header(&session.cookie_jar))
                .map_err(|_| invalid("Cookie"))?;
            headers.insert(COOKIE, cookie);
        }
        if let (Some(header), Some(token)) = (&self.profile.token_header, self.profile.token(session)) {
            let value = HeaderValue::from_str(&header.template.replace("{token}", &token))
                .map_err(|_| invalid(header.name))?;
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| invalid(header.name))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Merges `Set-Cookie` values into the stored jar under the key guard.
    /// A failed write is logged; the response itself is still usable.
    async fn absorb_rotations(&self, key: &CredentialKey, headers: &HeaderMap) {
        let rotated = cookies::rotated_cookies(headers);
        if rotated.is_empty() {
            return;
        }

        let _guard = self.store.lock_key(key).await;
        let Some(CredentialRecord::BrowserSession(mut session)) = self.store.get(key) else {
            return;
        };

        let mut changed = cookies::merge(&mut session.cookie_jar, &rotated);
        let token_rotated = match self.profile.rotated_token(&session.cookie_jar, &session.client_token) {
            Some(token) => {
                session.client_token = token;
                changed = true;
                true
            }
            None => false,
        };
        if !changed {
            return;
        }

        match self
            .store
            .put(key, &CredentialRecord::BrowserSession(session))
        {
            Ok(()) => info!(
                provider = %key.provider,
                account = %key.account,
                cookies = rotated.len(),
                token_rotated = token_rotated,
                "Merged rotated cookies"
            ),
            Err(e) => warn!(
                provider = %key.provider,
                account = %key.account,
                error = %e,
                "Failed to persist rotated cookies"
            ),
        }
    }

    fn classify(&self, key: &CredentialKey, response: RawResponse) -> Result<ApiResponse, Failure> {
        let provider = self.provider();
        let status = response.status;
        let code = status.as_u16();

        if self.profile.auth_statuses.contains(&code) {
            warn!(provider = provider, account = %key.account, status = code, "Session rejected");
            return Err(Failure::fatal(BrokerError::authentication(
                provider,
                &key.account,
                format!("session rejected by the provider (HTTP {})", code),
            )));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Failure::retryable(BrokerError::rate_limit(provider, retry_after)));
        }

        let next_link = response
            .headers
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_link);
        let text = response.body;

        if !status.is_success() {
            let error = BrokerError::integration(
                provider,
                format!("HTTP {}: {}", code, truncate(&text)),
            );
            return Err(if status.is_server_error() {
                Failure::retryable(error)
            } else {
                Failure::fatal(error)
            });
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            Failure::fatal(BrokerError::integration(
                provider,
                format!("malformed JSON response: {}", e),
            ))
        })?;

        if let PayloadCheck::OkField { auth_errors } = &self.profile.payload_check {
            if body.get("ok").and_then(Value::as_bool) != Some(true) {
                let error = body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown_error");
                return Err(if auth_errors.iter().any(|e| *e == error) {
                    Failure::fatal(BrokerError::authentication(
                        provider,
                        &key.account,
                        format!("auth error: {}", error),
                    ))
                } else if error == "ratelimited" {
                    Failure::retryable(BrokerError::rate_limit(provider, None))
                } else {
                    Failure::fatal(BrokerError::integration(provider, error.to_string()))
                });
            }
        }

        Ok(ApiResponse {
            status: code,
            body,
            next_link,
        })
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(500) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
