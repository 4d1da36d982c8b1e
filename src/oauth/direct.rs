//! Exchange-only OAuth for user tokens that never expire on their own.
//!
//! The token endpoint answers HTTP 200 for most failures and reports them in
//! an `{"ok": false, "error": "..."}` envelope.

use super::{classify_token_failure, redirect_uri, BearerToken, OAuthProvider, StateManager};
use crate::credentials::{CredentialKey, CredentialRecord, CredentialStore};
use crate::error::BrokerError;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Error codes meaning the code or client is unusable and the user must
/// start over.
const REJECTED_GRANT_ERRORS: &[&str] = &[
    "invalid_code",
    "code_already_used",
    "code_expired",
    "bad_redirect_uri",
    "invalid_client_id",
    "bad_client_secret",
    "invalid_grant_type",
];

#[derive(Deserialize, Debug)]
struct ExchangeResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    authed_user: Option<AuthedUser>,
    #[serde(default)]
    team: Option<Team>,
}

#[derive(Deserialize, Debug)]
struct AuthedUser {
    id: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Team {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

pub struct DirectExchangeManager {
    store: Arc<CredentialStore>,
    states: StateManager,
    http: reqwest::Client,
    callback_base_url: String,
}

impl DirectExchangeManager {
    pub fn new(
        store: Arc<CredentialStore>,
        states: StateManager,
        http: reqwest::Client,
        callback_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            states,
            http,
            callback_base_url: callback_base_url.into(),
        }
    }

    pub fn build_consent_url(
        &self,
        provider: &OAuthProvider,
        scopes: Option<&[String]>,
        account: &str,
    ) -> Result<String, BrokerError> {
        let client = provider.client()?;
        let scopes = scopes.unwrap_or(&provider.scopes);
        let state = self.states.issue(&provider.name, account, scopes);
        let redirect = redirect_uri(&self.callback_base_url, &provider.name);
        Ok(provider.build_auth_url(&client.client_id, &state, &redirect, scopes))
    }

    /// Exchanges the code once and stores the user token with its user and
    /// workspace identifiers.
    pub async fn exchange(
        &self,
        provider: &OAuthProvider,
        code: &str,
        state: &str,
    ) -> Result<CredentialKey, BrokerError> {
        let consent = self.states.redeem(state, &provider.name)?;
        let key = consent.key.clone();
        let client = provider.client()?;
        let redirect = redirect_uri(&self.callback_base_url, &provider.name);
        let form = [
            ("code", code),
            ("redirect_uri", redirect.as_str()),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
        ];

        debug!(provider = %provider.name, account = %key.account, "Exchanging code for user token");
        let response = self
            .http
            .post(&provider.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                BrokerError::integration(&provider.name, format!("token request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(classify_token_failure(&provider.name, &key.account, response).await);
        }

        let body: ExchangeResponse = response.json().await.map_err(|e| {
            BrokerError::integration(
                &provider.name,
                format!("failed to parse token response: {}", e),
            )
        })?;

        if !body.ok {
            let code = body.error.unwrap_or_else(|| "unknown_error".to_string());
            warn!(provider = %provider.name, error = %code, "Token exchange refused");
            return Err(exchange_error(&key, &code));
        }

        let user = body.authed_user.ok_or_else(|| {
            BrokerError::integration(&provider.name, "token response is missing authed_user")
        })?;
        let access_token = user.access_token.ok_or_else(|| {
            BrokerError::integration(
                &provider.name,
                "token response carries no user token; request user scopes",
            )
        })?;
        let team = body.team.ok_or_else(|| {
            BrokerError::integration(&provider.name, "token response is missing team")
        })?;

        let scopes = user
            .scope
            .as_deref()
            .map(|s| provider.split_scopes(s))
            .unwrap_or(consent.scopes);
        let record = CredentialRecord::OAuthDirect {
            access_token,
            account_id: user.id,
            workspace_id: team.id,
            scopes,
        };

        {
            let _guard = self.store.lock_key(&key).await;
            self.store.put(&key, &record).map_err(|e| {
                BrokerError::integration(
                    &provider.name,
                    format!("failed to store credentials: {:#}", e),
                )
            })?;
        }

        info!(
            provider = %key.provider,
            account = %key.account,
            workspace = team.name.as_deref().unwrap_or("unknown"),
            "OAuth flow completed successfully"
        );
        Ok(key)
    }

    /// Presence check only. A revoked token is discovered when a request
    /// made with it fails.
    pub fn ensure_valid(&self, provider: &str, account: &str) -> Result<BearerToken, BrokerError> {
        let key = CredentialKey::new(provider, account);
        match self.store.get(&key) {
            Some(CredentialRecord::OAuthDirect {
                access_token,
                scopes,
                ..
            }) => Ok(BearerToken {
                access_token,
                scopes,
                expires_at: None,
            }),
            Some(other) => Err(BrokerError::authentication(
                provider,
                account,
                format!("stored credential is a {:?} record, not a user token", other.kind()),
            )),
            None => Err(BrokerError::authentication(provider, account, "not connected")),
        }
    }
}

fn exchange_error(key: &CredentialKey, code: &str) -> BrokerError {
    if code == "ratelimited" {
        BrokerError::rate_limit(&key.provider, None)
    } else if REJECTED_GRANT_ERRORS.contains(&code) {
        BrokerError::authentication(
            &key.provider,
            &key.account,
            format!("authorization rejected: {}", code),
        )
    } else {
        BrokerError::integration(&key.provider, format!("token exchange failed: {}", code))
    }
}
