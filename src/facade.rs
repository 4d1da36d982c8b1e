//! Credential facade: the one call every capability makes.
//!
//! `get_credential` dispatches on the provider's registered strategy and on
//! the stored record variant; callers never learn which protocol produced
//! the credential.

use crate::credentials::{BrowserSession, CredentialKey, CredentialRecord, CredentialStore};
use crate::error::{setup_path, BrokerError};
use crate::oauth::{AuthorizationCodeManager, BearerToken, DirectExchangeManager};
use crate::registry::{AuthStrategy, ProviderRegistry, StrategyKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ready-to-use credential.
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    /// OAuth access token, sent as `Authorization: Bearer`.
    Bearer(BearerToken),
    /// Captured browser session, consumed by a session client.
    Session(BrowserSession),
}

/// Credential state of one key, computed without touching the network.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub provider: String,
    pub account: String,
    pub strategy: StrategyKind,
    /// A record of the provider's variant is stored
    pub connected: bool,
    /// `get_credential` is expected to succeed
    pub ready: bool,
    /// A collaborator reported the credential as rejected
    pub suspect: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    pub setup_path: String,
}

/// Status of one provider across its accounts.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub strategy: StrategyKind,
    /// Setup can start (OAuth client or capture prerequisites present)
    pub configured: bool,
    pub accounts: Vec<CredentialStatus>,
}

pub struct CredentialFacade {
    registry: Arc<ProviderRegistry>,
    store: Arc<CredentialStore>,
    authorization_code: Arc<AuthorizationCodeManager>,
    direct: Arc<DirectExchangeManager>,
    /// Keys reported as rejected, with the report time
    reports: DashMap<CredentialKey, DateTime<Utc>>,
}

impl CredentialFacade {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<CredentialStore>,
        authorization_code: Arc<AuthorizationCodeManager>,
        direct: Arc<DirectExchangeManager>,
    ) -> Self {
        Self {
            registry,
            store,
            authorization_code,
            direct,
            reports: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn authorization_code(&self) -> &AuthorizationCodeManager {
        &self.authorization_code
    }

    pub fn direct(&self) -> &DirectExchangeManager {
        &self.direct
    }

    /// Working credential for `(provider, account)`, refreshing an OAuth
    /// token first when it is near expiry or was reported as rejected.
    pub async fn get_credential(
        &self,
        provider: &str,
        account: &str,
    ) -> Result<Credential, BrokerError> {
        let strategy = self.strategy(provider)?;
        let key = CredentialKey::new(provider, account);

        match strategy {
            AuthStrategy::AuthorizationCode(oauth) => {
                let reported_at = self.reports.get(&key).map(|at| *at);
                let token = match reported_at {
                    Some(reported_at) => {
                        info!(provider = %provider, account = %account, "Refreshing reported credential");
                        // The report stays until a refresh actually succeeds
                        let token = self.authorization_code.force_refresh(oauth, account).await?;
                        self.reports.remove_if(&key, |_, at| *at <= reported_at);
                        token
                    }
                    None => self.authorization_code.ensure_valid(oauth, account).await?,
                };
                Ok(Credential::Bearer(token))
            }
            AuthStrategy::DirectExchange(_) => self
                .direct
                .ensure_valid(provider, account)
                .map(Credential::Bearer),
            AuthStrategy::BrowserSession(_) => match self.store.get(&key) {
                Some(CredentialRecord::BrowserSession(session)) => {
                    self.session_report(&key, &session);
                    debug!(provider = %provider, account = %account, cookies = session.cookie_jar.len(), "Loaded browser session");
                    Ok(Credential::Session(session))
                }
                Some(other) => Err(BrokerError::authentication(
                    provider,
                    account,
                    format!(
                        "stored credential is a {:?} record, not a browser session",
                        other.kind()
                    ),
                )),
                None => Err(BrokerError::authentication(
                    provider,
                    account,
                    "no captured session",
                )),
            },
        }
    }

    /// Like [`get_credential`](Self::get_credential), but first checks the
    /// stored scopes cover `required`. Browser sessions carry no scopes and
    /// skip the check.
    pub async fn get_credential_with_scopes(
        &self,
        provider: &str,
        account: &str,
        required: &[String],
    ) -> Result<Credential, BrokerError> {
        if let Some(record) = self.store.get(&CredentialKey::new(provider, account)) {
            if !matches!(record, CredentialRecord::BrowserSession(_)) {
                let missing: Vec<&str> = required
                    .iter()
                    .filter(|scope| !record.scopes().contains(*scope))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(BrokerError::authentication(
                        provider,
                        account,
                        format!("granted scopes do not include {}", missing.join(", ")),
                    ));
                }
            }
        }
        self.get_credential(provider, account).await
    }

    /// Records that a collaborator's request was rejected with an auth-class
    /// status. Refreshable tokens are force-refreshed on the next lookup;
    /// other credentials show as suspect until re-authenticated.
    pub fn report_auth_failure(&self, provider: &str, account: &str) -> Result<(), BrokerError> {
        self.strategy(provider)?;
        warn!(provider = %provider, account = %account, "Credential reported as rejected");
        self.reports
            .insert(CredentialKey::new(provider, account), Utc::now());
        Ok(())
    }

    /// Drops a pending report, after a successful re-authentication.
    pub fn clear_report(&self, key: &CredentialKey) {
        self.reports.remove(key);
    }

    /// Status of one key. Never calls the provider.
    pub fn status(&self, provider: &str, account: &str) -> Result<CredentialStatus, BrokerError> {
        let strategy = self.strategy(provider)?;
        let key = CredentialKey::new(provider, account);
        let record = self.store.get(&key);
        let reported_at = self.reports.get(&key).map(|r| *r);

        let mut status = CredentialStatus {
            provider: provider.to_string(),
            account: account.to_string(),
            strategy: strategy.kind(),
            connected: false,
            ready: false,
            suspect: false,
            expires_at: None,
            captured_at: None,
            scopes: Vec::new(),
            setup_path: setup_path(provider, account),
        };

        match (strategy, record) {
            (
                AuthStrategy::AuthorizationCode(_),
                Some(CredentialRecord::OAuthRefreshable {
                    refresh_token,
                    expiry,
                    scopes,
                    ..
                }),
            ) => {
                status.connected = true;
                let unexpired = !self.authorization_code.needs_refresh(expiry);
                status.ready = unexpired || refresh_token.is_some();
                status.suspect = reported_at.is_some();
                status.expires_at = expiry;
                status.scopes = scopes;
            }
            (AuthStrategy::DirectExchange(_), Some(CredentialRecord::OAuthDirect { scopes, .. })) => {
                status.connected = true;
                status.suspect = reported_at.is_some();
                status.ready = !status.suspect;
                status.scopes = scopes;
            }
            (AuthStrategy::BrowserSession(_), Some(CredentialRecord::BrowserSession(session))) => {
                status.connected = true;
                status.suspect = self.session_report(&key, &session).is_some();
                status.ready = !status.suspect;
                status.captured_at = Some(session.captured_at);
            }
            (_, Some(other)) => {
                warn!(provider = %provider, account = %account, kind = ?other.kind(), "Stored record does not match provider strategy");
            }
            (_, None) => {}
        }

        Ok(status)
    }

    /// Every registered provider with its stored accounts.
    pub fn provider_statuses(&self) -> Vec<ProviderStatus> {
        self.registry
            .iter()
            .map(|(name, strategy)| ProviderStatus {
                provider: name.to_string(),
                strategy: strategy.kind(),
                configured: strategy.is_configured(),
                accounts: self
                    .store
                    .list_accounts(name)
                    .iter()
                    .filter_map(|account| self.status(name, account).ok())
                    .collect(),
            })
            .collect()
    }

    /// Pending report for a session key. A capture newer than the report
    /// supersedes it and the report is dropped.
    fn session_report(&self, key: &CredentialKey, session: &BrowserSession) -> Option<DateTime<Utc>> {
        let reported_at = self.reports.get(key).map(|at| *at)?;
        if session.captured_at <= reported_at {
            return Some(reported_at);
        }
        self.reports
            .remove_if(key, |_, at| *at < session.captured_at);
        debug!(provider = %key.provider, account = %key.account, "Report superseded by newer capture");
        None
    }

    /// Number of pending auth-failure reports.
    pub fn pending_reports(&self) -> usize {
        self.reports.len()
    }

    fn strategy(&self, provider: &str) -> Result<&AuthStrategy, BrokerError> {
        self.registry.get(provider).ok_or_else(|| {
            BrokerError::integration(provider, format!("'{}' is not a registered provider", provider))
        })
    }
}
