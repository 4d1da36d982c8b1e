//! OAuth 2.0 flows.
//!
//! Two variants share the consent/callback shape:
//!
//! - [`AuthorizationCodeManager`]: offline access with silent refresh.
//! - [`DirectExchangeManager`]: one exchange, no refresh path; a revoked
//!   token only shows up when a later request fails.
//!
//! Both keep the credential key out of the `state` parameter; see
//! [`StateManager`].

mod authorization_code;
mod direct;
mod provider;
mod state_manager;

pub use authorization_code::AuthorizationCodeManager;
pub use direct::DirectExchangeManager;
pub use provider::{OAuthProvider, GOOGLE_FAMILY, SLACK_USER_SCOPES};
pub use state_manager::{run_state_cleanup, PendingConsent, StateManager};

use crate::error::BrokerError;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;

/// Usable bearer token handed to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BearerToken {
    #[serde(skip_serializing)]
    pub access_token: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Redirect URI registered for `provider`.
pub fn redirect_uri(callback_base_url: &str, provider: &str) -> String {
    format!(
        "{}/auth/{}/callback",
        callback_base_url.trim_end_matches('/'),
        provider
    )
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps a failed token-endpoint response onto the error taxonomy.
///
/// `invalid_grant` and 401 mean the grant is dead and the user must consent
/// again; 429 is throttling; anything else is a provider fault.
async fn classify_token_failure(
    provider: &str,
    account: &str,
    response: reqwest::Response,
) -> BrokerError {
    let status = response.status();
    let retry = retry_after(&response);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        return BrokerError::rate_limit(provider, retry);
    }
    if status == StatusCode::UNAUTHORIZED
        || (status == StatusCode::BAD_REQUEST && body.contains("invalid_grant"))
    {
        return BrokerError::authentication(
            provider,
            account,
            "the provider rejected the stored grant",
        );
    }
    BrokerError::integration(
        provider,
        format!(
            "token endpoint returned HTTP {}: {}",
            status.as_u16(),
            truncate_body(&body)
        ),
    )
}

fn truncate_body(body: &str) -> &str {
    match body.char_indices().nth(500) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
