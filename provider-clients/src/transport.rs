//! HTTP transports behind [`crate::SessionClient`].
//!
//! Providers that fingerprint the TLS handshake get a client that emulates
//! desktop Chrome (`impersonate` cargo feature). Everyone else uses a plain
//! reqwest client with a browser user agent. Both never follow redirects.

use anyhow::Context;
use authbroker::capture::profile::BROWSER_USER_AGENT;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::time::Duration;
#[cfg(not(feature = "impersonate"))]
use tracing::warn;

/// Response with its body already read.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// Failure before any response was received.
#[derive(Debug)]
pub(crate) enum SendError {
    /// Connection, TLS or timeout
    Transport(String),
    /// Headers arrived but the body could not be read
    Body(String),
}

pub(crate) enum Transport {
    Plain(reqwest::Client),
    #[cfg(feature = "impersonate")]
    Chrome(wreq::Client),
}

impl Transport {
    pub fn build(provider: &str, impersonate: bool, timeout: Duration) -> anyhow::Result<Self> {
        if impersonate {
            return Self::chrome(provider, timeout);
        }
        Self::plain(timeout)
    }

    fn plain(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::Plain(http))
    }

    #[cfg(feature = "impersonate")]
    fn chrome(_provider: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = wreq::Client::builder()
            .emulation(wreq_util::Emulation::Chrome131)
            .redirect(wreq::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .context("Failed to build browser-emulating HTTP client")?;
        Ok(Self::Chrome(http))
    }

    #[cfg(not(feature = "impersonate"))]
    fn chrome(provider: &str, timeout: Duration) -> anyhow::Result<Self> {
        warn!(
            provider = provider,
            "Built without the impersonate feature; provider may reject the TLS fingerprint"
        );
        Self::plain(timeout)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            #[cfg(feature = "impersonate")]
            Self::Chrome(_) => "chrome",
        }
    }

    /// Sends one request. `url` already carries the query string.
    pub async fn send(
        &self,
        method: &Method,
        url: &str,
        headers: HeaderMap,
        form: Option<&[(String, String)]>,
    ) -> Result<RawResponse, SendError> {
        match self {
            Self::Plain(http) => {
                let mut builder = http.request(method.clone(), url).headers(headers);
                if let Some(form) = form {
                    builder = builder.form(form);
                }
                let response = builder
                    .send()
                    .await
                    .map_err(|e| SendError::Transport(e.to_string()))?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response
                    .text()
                    .await
                    .map_err(|e| SendError::Body(e.to_string()))?;
                Ok(RawResponse {
                    status,
                    headers,
                    body,
                })
            }
            #[cfg(feature = "impersonate")]
            Self::Chrome(http) => {
                let method = wreq::Method::from_bytes(method.as_str().as_bytes())
                    .map_err(|e| SendError::Transport(e.to_string()))?;
                let mut builder = http.request(method, url);
                for (name, value) in &headers {
                    builder = builder.header(name.as_str(), value.as_bytes());
                }
                if let Some(form) = form {
                    let body = serde_urlencoded::to_string(form)
                        .map_err(|e| SendError::Transport(e.to_string()))?;
                    builder = builder
                        .header("content-type", "application/x-www-form-urlencoded")
                        .body(body);
                }
                let response = builder
                    .send()
                    .await
                    .map_err(|e| SendError::Transport(e.to_string()))?;
                let status = StatusCode::from_u16(response.status().as_u16())
                    .map_err(|e| SendError::Transport(e.to_string()))?;
                let mut converted = HeaderMap::new();
                for (name, value) in response.headers() {
                    if let (Ok(name), Ok(value)) = (
                        reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                        reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
                    ) {
                        converted.append(name, value);
                    }
                }
                let body = response
                    .text()
                    .await
                    .map_err(|e| SendError::Body(e.to_string()))?;
                Ok(RawResponse {
                    status,
                    headers: converted,
                    body,
                })
            }
        }
    }
}

/// Appends `query` to `url`, keeping any query it already has.
pub(crate) fn with_query(url: &str, query: &[(String, String)]) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().extend_pairs(query);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}
