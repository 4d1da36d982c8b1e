//! Durable credential storage for every authentication strategy.
//!
//! One JSON document holds the full `CredentialKey -> CredentialRecord` map.
//! Writes are whole-document rewrites; callers that read, mutate and write a
//! record back take the per-key flow guard first.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - get / put / list_accounts             │
//! │  - per-key flow guards                   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (serialize)          (deserialize)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption (optional)              │
//! │  - AES-256-GCM document envelope         │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       credentials.json                   │
//! │  - atomic temp-file + rename writes      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use authbroker::credentials::{CredentialKey, CredentialRecord, CredentialStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = CredentialStore::new("credentials.json");
//!
//! let key = CredentialKey::new("gmail", "work");
//! store.put(
//!     &key,
//!     &CredentialRecord::OAuthRefreshable {
//!         access_token: "ya29.token".to_string(),
//!         refresh_token: Some("1//refresh".to_string()),
//!         expiry: Some(Utc::now() + Duration::hours(1)),
//!         scopes: vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
//!     },
//! )?;
//!
//! assert!(store.get(&key).is_some());
//! assert!(store.list_accounts("gmail").contains("work"));
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

mod encryption;
mod locks;
mod storage;

pub use encryption::{generate_key, DocumentCipher};
pub use locks::{KeyGuard, KeyLocks};
pub use storage::{CredentialStore, DOCUMENT_VERSION};

/// Account name used when a caller does not name one.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Composite identifier `(provider, account)`. Case-sensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
    pub provider: String,
    pub account: String,
}

impl CredentialKey {
    pub fn new(provider: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            account: account.into(),
        }
    }

    /// Key for the sentinel `"default"` account.
    pub fn default_account(provider: impl Into<String>) -> Self {
        Self::new(provider, DEFAULT_ACCOUNT)
    }

    pub fn is_default(&self) -> bool {
        self.account == DEFAULT_ACCOUNT
    }

    /// Document key: bare provider name for the default account,
    /// `provider:account` otherwise.
    pub fn to_document_key(&self) -> String {
        if self.is_default() {
            self.provider.clone()
        } else {
            format!("{}:{}", self.provider, self.account)
        }
    }

    /// Inverse of [`to_document_key`](Self::to_document_key). Provider names
    /// never contain `:`, so the first colon splits the pair.
    pub fn from_document_key(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((provider, account)) if !account.is_empty() => Self::new(provider, account),
            Some((provider, _)) => Self::default_account(provider),
            None => Self::default_account(raw),
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.account)
    }
}

/// Session material harvested by the capture engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrowserSession {
    /// Every cookie set during the login flow, by name.
    pub cookie_jar: BTreeMap<String, String>,
    /// CSRF-style token required next to the cookies (may be empty).
    #[serde(default)]
    pub client_token: String,
    /// Base URL the session was established against, after redirects.
    pub base_url: String,
    pub captured_at: DateTime<Utc>,
    /// Status of the validation probe issued right after capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_status: Option<u16>,
    /// Provider identifiers read from the page (workspace and user ids).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub identifiers: BTreeMap<String, String>,
}

/// Credential stored per key.
///
/// The variant never changes for a key once written; re-authenticating
/// replaces the whole record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialRecord {
    /// Authorization-code OAuth with offline refresh.
    #[serde(rename = "oauth_refreshable")]
    OAuthRefreshable {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expiry: Option<DateTime<Utc>>,
        #[serde(default)]
        scopes: Vec<String>,
    },

    /// Exchange-only OAuth, no silent refresh.
    #[serde(rename = "oauth_direct")]
    OAuthDirect {
        access_token: String,
        account_id: String,
        workspace_id: String,
        #[serde(default)]
        scopes: Vec<String>,
    },

    /// Cookies and client token captured by driving a browser login.
    BrowserSession(BrowserSession),
}

impl CredentialRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            CredentialRecord::OAuthRefreshable { .. } => RecordKind::OAuthRefreshable,
            CredentialRecord::OAuthDirect { .. } => RecordKind::OAuthDirect,
            CredentialRecord::BrowserSession(_) => RecordKind::BrowserSession,
        }
    }

    /// Scopes granted alongside the token. Empty for browser sessions.
    pub fn scopes(&self) -> &[String] {
        match self {
            CredentialRecord::OAuthRefreshable { scopes, .. }
            | CredentialRecord::OAuthDirect { scopes, .. } => scopes,
            CredentialRecord::BrowserSession(_) => &[],
        }
    }
}

/// Variant tag of a [`CredentialRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    #[serde(rename = "oauth_refreshable")]
    OAuthRefreshable,
    #[serde(rename = "oauth_direct")]
    OAuthDirect,
    #[serde(rename = "browser_session")]
    BrowserSession,
}
