//! Authorization-code OAuth with offline refresh.
//!
//! Handles consent URLs, exchanging authorization codes for tokens and
//! refreshing near-expired access tokens in place.

use super::{classify_token_failure, redirect_uri, BearerToken, OAuthProvider, StateManager};
use crate::credentials::{CredentialKey, CredentialRecord, CredentialStore};
use crate::error::BrokerError;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

pub struct AuthorizationCodeManager {
    store: Arc<CredentialStore>,
    states: StateManager,
    http: reqwest::Client,
    callback_base_url: String,
    refresh_skew: Duration,
}

impl AuthorizationCodeManager {
    pub fn new(
        store: Arc<CredentialStore>,
        states: StateManager,
        http: reqwest::Client,
        callback_base_url: impl Into<String>,
        refresh_skew_seconds: i64,
    ) -> Self {
        Self {
            store,
            states,
            http,
            callback_base_url: callback_base_url.into(),
            refresh_skew: Duration::seconds(refresh_skew_seconds),
        }
    }

    /// Consent URL for `(provider, account)`, narrowed to `scopes` when given.
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

        debug!(provider = %provider.name, account = %account, "Built consent URL");
        Ok(provider.build_auth_url(&client.client_id, &state, &redirect, scopes))
    }

    /// Exchange authorization code for tokens and persist them under the key
    /// recorded for `state`.
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

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", redirect.as_str());
        form.insert("client_id", client.client_id.as_str());
        form.insert("client_secret", client.client_secret.as_str());

        debug!(provider = %provider.name, "Exchanging authorization code for token");
        let token = self.post_token(provider, &key, &form).await?;

        let scopes = token
            .scope
            .as_deref()
            .map(|s| provider.split_scopes(s))
            .unwrap_or(consent.scopes);
        let record = {
            let _guard = self.store.lock_key(&key).await;
            // Re-consent may omit the refresh token; keep the stored one
            let refresh_token = token.refresh_token.or_else(|| match self.store.get(&key) {
                Some(CredentialRecord::OAuthRefreshable { refresh_token, .. }) => refresh_token,
                _ => None,
            });
            let record = CredentialRecord::OAuthRefreshable {
                access_token: token.access_token,
                refresh_token,
                expiry: expires_at(token.expires_in),
                scopes,
            };
            self.persist(&key, &record)?;
            record
        };

        info!(
            provider = %key.provider,
            account = %key.account,
            has_refresh_token = matches!(&record, CredentialRecord::OAuthRefreshable { refresh_token: Some(_), .. }),
            "OAuth flow completed successfully"
        );
        Ok(key)
    }

    /// Returns a usable access token, refreshing it first when it is expired
    /// or about to expire.
    pub async fn ensure_valid(
        &self,
        provider: &OAuthProvider,
        account: &str,
    ) -> Result<BearerToken, BrokerError> {
        let key = CredentialKey::new(&provider.name, account);
        let record = self.load(&key)?;
        if let Some(token) = self.fresh_token(&record) {
            return Ok(token);
        }
        require_refresh_token(&key, &record)?;

        let _guard = self.store.lock_key(&key).await;
        // Another caller may have refreshed while we waited
        let record = self.load(&key)?;
        if let Some(token) = self.fresh_token(&record) {
            return Ok(token);
        }
        self.refresh(provider, &key, record).await
    }

    /// Refreshes regardless of expiry; used after a collaborator reported
    /// the access token as rejected.
    pub async fn force_refresh(
        &self,
        provider: &OAuthProvider,
        account: &str,
    ) -> Result<BearerToken, BrokerError> {
        let key = CredentialKey::new(&provider.name, account);
        let _guard = self.store.lock_key(&key).await;
        let record = self.load(&key)?;
        if !matches!(record, CredentialRecord::OAuthRefreshable { refresh_token: Some(_), .. }) {
            return Err(BrokerError::authentication(
                &key.provider,
                &key.account,
                "access token was rejected by the provider and no refresh token is stored",
            ));
        }
        self.refresh(provider, &key, record).await
    }

    /// Returns true if the access token should be refreshed.
    ///
    /// Refresh is triggered when `expiry` is within the skew (or already
    /// past). Tokens without an expiry never need a refresh.
    pub fn needs_refresh(&self, expiry: Option<DateTime<Utc>>) -> bool {
        match expiry {
            Some(expires_at) => expires_at <= Utc::now() + self.refresh_skew,
            None => false,
        }
    }

    fn fresh_token(&self, record: &CredentialRecord) -> Option<BearerToken> {
        match record {
            CredentialRecord::OAuthRefreshable {
                access_token,
                expiry,
                scopes,
                ..
            } if !self.needs_refresh(*expiry) => Some(BearerToken {
                access_token: access_token.clone(),
                scopes: scopes.clone(),
                expires_at: *expiry,
            }),
            _ => None,
        }
    }

    fn load(&self, key: &CredentialKey) -> Result<CredentialRecord, BrokerError> {
        let record = self.store.get(key).ok_or_else(|| {
            BrokerError::authentication(&key.provider, &key.account, "not connected")
        })?;
        match record {
            CredentialRecord::OAuthRefreshable { .. } => Ok(record),
            other => Err(BrokerError::authentication(
                &key.provider,
                &key.account,
                format!(
                    "stored credential is a {:?} record, not an OAuth token",
                    other.kind()
                ),
            )),
        }
    }

    /// POSTs `grant_type=refresh_token` and overwrites the access token and
    /// expiry in place. Caller holds the key lock.
    async fn refresh(
        &self,
        provider: &OAuthProvider,
        key: &CredentialKey,
        record: CredentialRecord,
    ) -> Result<BearerToken, BrokerError> {
        let CredentialRecord::OAuthRefreshable {
            refresh_token: Some(refresh_token),
            scopes,
            ..
        } = record
        else {
            return Err(no_refresh_token(key));
        };

        let client = provider.client()?;
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token.as_str());
        form.insert("client_id", client.client_id.as_str());
        form.insert("client_secret", client.client_secret.as_str());

        info!(provider = %key.provider, account = %key.account, "Refreshing OAuth token");
        let token = self.post_token(provider, key, &form).await?;

        let expiry = expires_at(token.expires_in);
        let scopes = token
            .scope
            .as_deref()
            .map(|s| provider.split_scopes(s))
            .unwrap_or(scopes);
        // Keep the existing refresh token if the provider did not rotate it
        let refresh_token = token.refresh_token.or(Some(refresh_token));

        let updated = CredentialRecord::OAuthRefreshable {
            access_token: token.access_token.clone(),
            refresh_token,
            expiry,
            scopes: scopes.clone(),
        };
        self.persist(key, &updated)?;

        info!(provider = %key.provider, account = %key.account, "OAuth token refreshed successfully");
        Ok(BearerToken {
            access_token: token.access_token,
            scopes,
            expires_at: expiry,
        })
    }

    async fn post_token(
        &self,
        provider: &OAuthProvider,
        key: &CredentialKey,
        form: &HashMap<&str, &str>,
    ) -> Result<TokenResponse, BrokerError> {
        let response = self
            .http
            .post(&provider.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                BrokerError::integration(&provider.name, format!("token request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let err = classify_token_failure(&provider.name, &key.account, response).await;
            warn!(provider = %provider.name, account = %key.account, error = %err, "Token endpoint rejected request");
            return Err(err);
        }

        response.json::<TokenResponse>().await.map_err(|e| {
            BrokerError::integration(
                &provider.name,
                format!("failed to parse token response: {}", e),
            )
        })
    }

    fn persist(&self, key: &CredentialKey, record: &CredentialRecord) -> Result<(), BrokerError> {
        self.store.put(key, record).map_err(|e| {
            BrokerError::integration(
                &key.provider,
                format!("failed to store credentials: {:#}", e),
            )
        })
    }
}

fn expires_at(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in.map(|seconds| Utc::now() + Duration::seconds(seconds))
}

fn no_refresh_token(key: &CredentialKey) -> BrokerError {
    BrokerError::authentication(
        &key.provider,
        &key.account,
        "access token expired and no refresh token is stored",
    )
}

fn require_refresh_token(key: &CredentialKey, record: &CredentialRecord) -> Result<(), BrokerError> {
    match record {
        CredentialRecord::OAuthRefreshable {
            refresh_token: Some(_),
            ..
        } => Ok(()),
        _ => Err(no_refresh_token(key)),
    }
}
