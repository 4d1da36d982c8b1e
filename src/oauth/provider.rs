//! OAuth provider endpoints and scope sets.

use crate::config::secrets::{self, EnvSource, OAuthClientSecrets};
use crate::error::BrokerError;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Authorization-code providers sharing the Google OAuth client. Each
/// capability asks for its own scope set.
pub const GOOGLE_FAMILY: &[(&str, &[&str])] = &[
    (
        "gmail",
        &[
            "https://www.googleapis.com/auth/gmail.readonly",
            "https://www.googleapis.com/auth/gmail.send",
            "https://www.googleapis.com/auth/gmail.modify",
        ],
    ),
    ("drive", &["https://www.googleapis.com/auth/drive"]),
    ("sheets", &["https://www.googleapis.com/auth/spreadsheets"]),
    ("docs", &["https://www.googleapis.com/auth/documents"]),
    ("slides", &["https://www.googleapis.com/auth/presentations"]),
    ("tasks", &["https://www.googleapis.com/auth/tasks"]),
    (
        "forms",
        &[
            "https://www.googleapis.com/auth/forms.body",
            "https://www.googleapis.com/auth/forms.responses.readonly",
        ],
    ),
    ("youtube", &["https://www.googleapis.com/auth/youtube.readonly"]),
    ("calendar", &["https://www.googleapis.com/auth/calendar"]),
    ("contacts", &["https://www.googleapis.com/auth/contacts.readonly"]),
];

/// User-level scopes for the chat platform.
pub const SLACK_USER_SCOPES: &[&str] = &[
    "channels:read",
    "channels:history",
    "groups:read",
    "groups:history",
    "im:read",
    "im:history",
    "mpim:read",
    "mpim:history",
    "chat:write",
    "search:read",
    "users:read",
    "users:read.email",
    "reactions:write",
    "reactions:read",
    "files:read",
];

/// OAuth provider configuration
#[derive(Clone, Debug)]
pub struct OAuthProvider {
    pub name: String,

    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Scopes requested when the caller does not narrow them
    pub scopes: Vec<String>,

    /// Query parameter carrying the scopes (`scope`, or `user_scope` for
    /// user tokens on the chat platform)
    pub scope_param: &'static str,

    pub scope_separator: &'static str,

    /// Extra consent URL parameters, such as offline access
    pub extra_params: Vec<(&'static str, &'static str)>,

    /// Client ID and secret (from environment variables)
    pub client: Option<OAuthClientSecrets>,

    /// Environment family consulted when the provider has no client of its own
    pub client_family: Option<&'static str>,
}

impl OAuthProvider {
    /// Google-family provider by name, e.g. `gmail` or `sheets`.
    pub fn google(name: &str) -> Option<Self> {
        let (_, scopes) = GOOGLE_FAMILY.iter().find(|(n, _)| *n == name)?;
        Some(Self {
            name: name.to_string(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            scope_param: "scope",
            scope_separator: " ",
            extra_params: vec![("access_type", "offline"), ("prompt", "consent")],
            client: None,
            client_family: Some("google"),
        })
    }

    pub fn slack() -> Self {
        Self {
            name: "slack".to_string(),
            auth_url: "https://slack.com/oauth/v2/authorize".to_string(),
            token_url: "https://slack.com/api/oauth.v2.access".to_string(),
            scopes: SLACK_USER_SCOPES.iter().map(|s| s.to_string()).collect(),
            scope_param: "user_scope",
            scope_separator: ",",
            extra_params: Vec::new(),
            client: None,
            client_family: None,
        }
    }

    /// Resolves the client ID and secret from the environment.
    pub fn with_client_from(mut self, env: &dyn EnvSource) -> Self {
        self.client = secrets::oauth_client(env, &self.name, self.client_family);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Configured client, or an error naming the variables to set.
    pub fn client(&self) -> Result<&OAuthClientSecrets, BrokerError> {
        self.client.as_ref().ok_or_else(|| {
            let (id_var, secret_var) = secrets::oauth_client_vars(&self.name);
            BrokerError::integration(
                &self.name,
                format!(
                    "OAuth not configured for '{}'. Set {} and {} environment variables.",
                    self.name, id_var, secret_var
                ),
            )
        })
    }

    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(
        &self,
        client_id: &str,
        state: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> String {
        let scopes = scopes.join(self.scope_separator);
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&{}={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            self.scope_param,
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        for (key, value) in &self.extra_params {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    /// Splits a granted-scope string the way this provider joins them.
    pub fn split_scopes(&self, granted: &str) -> Vec<String> {
        granted
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_provider() -> OAuthProvider {
        OAuthProvider {
            name: "example".to_string(),
            auth_url: "https://example.com/oauth/authorize".to_string(),
            token_url: "https://example.com/oauth/token".to_string(),
            scopes: vec!["read".to_string(), "write".to_string()],
            scope_param: "scope",
            scope_separator: " ",
            extra_params: vec![("access_type", "offline")],
            client: None,
            client_family: None,
        }
    }

    #[test]
    fn test_build_auth_url() {
        let provider = test_provider();
        let url = provider.build_auth_url(
            "test_client_id",
            "random_state",
            "http://localhost:3000/callback",
            &provider.scopes,
        );

        assert!(url.starts_with("https://example.com/oauth/authorize?"));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcallback"));
        // URL encoding converts spaces to %20
        assert!(url.contains("scope=read%20write"));
        assert!(url.contains("state=random_state"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("access_type=offline"));
    }

    #[test]
    fn test_slack_uses_user_scope() {
        let provider = OAuthProvider::slack();
        let scopes = vec!["channels:read".to_string(), "chat:write".to_string()];
        let url = provider.build_auth_url("id", "s", "http://localhost:9000/auth/slack/callback", &scopes);
        assert!(url.contains("user_scope=channels%3Aread%2Cchat%3Awrite"));
        assert!(!url.contains("&scope="));
    }

    #[test]
    fn test_google_family_scope_sets_are_disjoint() {
        let gmail = OAuthProvider::google("gmail").unwrap();
        let sheets = OAuthProvider::google("sheets").unwrap();
        assert!(gmail.scopes.iter().all(|s| !sheets.scopes.contains(s)));
        assert!(OAuthProvider::google("linkedin").is_none());
        assert_eq!(gmail.token_url, GOOGLE_TOKEN_URL);
    }

    #[test]
    fn test_client_family_fallback() {
        let env: HashMap<String, String> = [
            ("AUTHBROKER_OAUTH_GOOGLE_CLIENT_ID", "gid"),
            ("AUTHBROKER_OAUTH_GOOGLE_CLIENT_SECRET", "gsecret"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let drive = OAuthProvider::google("drive").unwrap().with_client_from(&env);
        assert_eq!(drive.client().unwrap().client_id, "gid");

        let slack = OAuthProvider::slack().with_client_from(&env);
        let err = slack.client().unwrap_err();
        assert!(err.to_string().contains("AUTHBROKER_OAUTH_SLACK_CLIENT_ID"));
    }

    #[test]
    fn test_split_scopes() {
        let provider = test_provider();
        assert_eq!(
            provider.split_scopes("a b,c  d"),
            vec!["a", "b", "c", "d"]
        );
        assert!(provider.split_scopes("").is_empty());
    }
}
