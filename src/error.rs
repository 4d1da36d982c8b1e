//! Shared error taxonomy.
//!
//! Every provider-facing component funnels its failures into one of three
//! kinds. Callers relay the `Display` output verbatim to an end user, so every
//! authentication failure names the provider, the account and the setup path.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Broker error type shared by the credential core and every provider client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Credential missing, expired with no refresh path, or rejected by the
    /// provider (401/403-class). Never retried automatically.
    #[error("{provider} authentication required (account={account}): {message}. Visit {} to connect.", setup_path(.provider, .account))]
    Authentication {
        provider: String,
        account: String,
        message: String,
    },

    /// Provider signaled throttling. Retryable after a delay.
    #[error("{provider} rate limit hit{}. Wait a moment and retry.", retry_hint(.retry_after))]
    RateLimit {
        provider: String,
        retry_after: Option<Duration>,
    },

    /// Any other non-success response or malformed payload.
    #[error("{provider} API error: {message}")]
    Integration { provider: String, message: String },
}

/// Machine-readable error code, used in JSON error bodies.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    RateLimit,
    IntegrationError,
}

impl BrokerError {
    pub fn authentication(
        provider: impl Into<String>,
        account: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Authentication {
            provider: provider.into(),
            account: account.into(),
            message: message.into(),
        }
    }

    pub fn rate_limit(provider: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            provider: provider.into(),
            retry_after,
        }
    }

    pub fn integration(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Integration {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Authentication { .. } => ErrorCode::AuthError,
            Self::RateLimit { .. } => ErrorCode::RateLimit,
            Self::Integration { .. } => ErrorCode::IntegrationError,
        }
    }

    /// Only rate-limit failures are worth retrying, and only after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit { .. })
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::Authentication { provider, .. }
            | Self::RateLimit { provider, .. }
            | Self::Integration { provider, .. } => provider,
        }
    }
}

/// Setup entry point for a provider/account pair.
pub fn setup_path(provider: &str, account: &str) -> String {
    format!(
        "/auth/{}/setup?account={}",
        provider,
        urlencoding::encode(account)
    )
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_message_is_actionable() {
        let err = BrokerError::authentication("canvas", "school", "session expired");
        let msg = err.to_string();
        assert!(msg.contains("canvas"));
        assert!(msg.contains("account=school"));
        assert!(msg.contains("/auth/canvas/setup?account=school"));
        assert_eq!(err.code(), ErrorCode::AuthError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_setup_path_encodes_account() {
        assert_eq!(
            setup_path("gmail", "me@example.com"),
            "/auth/gmail/setup?account=me%40example.com"
        );
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = BrokerError::rate_limit("linkedin", Some(Duration::from_secs(30)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("retry after 30s"));

        let err = BrokerError::rate_limit("linkedin", None);
        assert!(!err.to_string().contains("retry after"));
    }

    #[test]
    fn test_error_code_serialization() {
        let code = BrokerError::integration("slack", "boom").code();
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"integration_error\"");
    }
}
