//! Pending consents, keyed by the opaque OAuth `state` parameter.
//!
//! The provider only ever sees a random token. Which credential key the
//! callback may write, and which scopes were asked for, stay server-side.

use crate::credentials::{CredentialKey, DEFAULT_ACCOUNT};
use crate::error::BrokerError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A consent that has been started but not yet called back.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingConsent {
    pub key: CredentialKey,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl PendingConsent {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Single-use state tokens shared by both OAuth variants.
#[derive(Clone)]
pub struct StateManager {
    pending: Arc<DashMap<String, PendingConsent>>,
    ttl: Duration,
}

impl StateManager {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Records a pending consent for `(provider, account)` and returns its
    /// state token (UUID v4).
    pub fn issue(&self, provider: &str, account: &str, scopes: &[String]) -> String {
        let state = Uuid::new_v4().to_string();
        self.pending.insert(
            state.clone(),
            PendingConsent {
                key: CredentialKey::new(provider, account),
                scopes: scopes.to_vec(),
                expires_at: Utc::now() + self.ttl,
            },
        );
        state
    }

    /// Consumes `state` for a callback arriving at `provider`.
    ///
    /// The token is removed whatever the outcome, so a replay always fails.
    pub fn redeem(&self, state: &str, provider: &str) -> Result<PendingConsent, BrokerError> {
        let consent = self
            .pending
            .remove(state)
            .map(|(_, consent)| consent)
            .filter(|consent| !consent.is_expired(Utc::now()))
            .ok_or_else(|| {
                warn!(provider = %provider, "Unknown, expired or reused OAuth state");
                BrokerError::authentication(
                    provider,
                    DEFAULT_ACCOUNT,
                    "invalid or expired OAuth state (possible CSRF attack)",
                )
            })?;

        if consent.key.provider != provider {
            warn!(expected = %consent.key.provider, actual = %provider, "OAuth state provider mismatch");
            return Err(BrokerError::authentication(
                provider,
                &consent.key.account,
                "OAuth state was issued for a different provider",
            ));
        }
        Ok(consent)
    }

    /// Drops expired consents, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.pending.len();
        self.pending.retain(|_, consent| !consent.is_expired(now));
        before.saturating_sub(self.pending.len())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Periodically purges abandoned consents.
pub async fn run_state_cleanup(states: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
    loop {
        interval.tick().await;
        let purged = states.purge_expired();
        if purged > 0 {
            debug!(purged = purged, pending = states.pending(), "Purged expired OAuth states");
        }
    }
}
