//! Secrets read from the environment.
//!
//! | Variable | Purpose |
//! |---|---|
//! | `AUTHBROKER_OAUTH_{PROVIDER}_CLIENT_ID` / `_CLIENT_SECRET` | OAuth client |
//! | `AUTHBROKER_OAUTH_GOOGLE_CLIENT_ID` / `_CLIENT_SECRET` | fallback for the Google family |
//! | `AUTHBROKER_{PROVIDER}_USERNAME` / `_PASSWORD` | browser login identity |
//! | `AUTHBROKER_ENCRYPTION_KEY` | base64 32-byte store key |

use std::collections::HashMap;

const PREFIX: &str = "AUTHBROKER";

/// Lookup of environment-style variables.
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).filter(|v| !v.is_empty()).cloned()
    }
}

/// OAuth client identity registered with a provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthClientSecrets {
    pub client_id: String,
    pub client_secret: String,
}

/// Identity and secret typed into a provider's login form.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginSecrets {
    pub identity: String,
    pub secret: String,
}

impl std::fmt::Debug for LoginSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginSecrets")
            .field("identity", &self.identity)
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn env_name(provider: &str) -> String {
    provider.to_uppercase().replace('-', "_")
}

/// Variable names holding the OAuth client for `provider`.
pub fn oauth_client_vars(provider: &str) -> (String, String) {
    let p = env_name(provider);
    (
        format!("{}_OAUTH_{}_CLIENT_ID", PREFIX, p),
        format!("{}_OAUTH_{}_CLIENT_SECRET", PREFIX, p),
    )
}

/// Variable names holding the browser login identity for `provider`.
pub fn login_vars(provider: &str) -> (String, String) {
    let p = env_name(provider);
    (
        format!("{}_{}_USERNAME", PREFIX, p),
        format!("{}_{}_PASSWORD", PREFIX, p),
    )
}

pub fn encryption_key_var() -> String {
    format!("{}_ENCRYPTION_KEY", PREFIX)
}

/// OAuth client for `provider`, falling back to the `fallback` family name.
pub fn oauth_client(
    env: &dyn EnvSource,
    provider: &str,
    fallback: Option<&str>,
) -> Option<OAuthClientSecrets> {
    let lookup = |name: &str| {
        let (id_var, secret_var) = oauth_client_vars(name);
        Some(OAuthClientSecrets {
            client_id: env.var(&id_var)?,
            client_secret: env.var(&secret_var)?,
        })
    };
    lookup(provider).or_else(|| fallback.and_then(lookup))
}

/// Login identity for a browser-session provider.
///
/// `identity` from the config file wins over the `_USERNAME` variable.
pub fn login(
    env: &dyn EnvSource,
    provider: &str,
    identity: Option<&str>,
) -> Option<LoginSecrets> {
    let (user_var, pass_var) = login_vars(provider);
    let identity = match identity {
        Some(id) => id.to_string(),
        None => env.var(&user_var)?,
    };
    Some(LoginSecrets {
        identity,
        secret: env.var(&pass_var)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_oauth_client_direct() {
        let env = env(&[
            ("AUTHBROKER_OAUTH_SLACK_CLIENT_ID", "id"),
            ("AUTHBROKER_OAUTH_SLACK_CLIENT_SECRET", "secret"),
        ]);
        let client = oauth_client(&env, "slack", None).unwrap();
        assert_eq!(client.client_id, "id");
        assert_eq!(client.client_secret, "secret");
    }

    #[test]
    fn test_oauth_client_family_fallback() {
        let env = env(&[
            ("AUTHBROKER_OAUTH_GOOGLE_CLIENT_ID", "gid"),
            ("AUTHBROKER_OAUTH_GOOGLE_CLIENT_SECRET", "gsecret"),
        ]);
        let client = oauth_client(&env, "sheets", Some("google")).unwrap();
        assert_eq!(client.client_id, "gid");
        assert!(oauth_client(&env, "sheets", None).is_none());
    }

    #[test]
    fn test_partial_client_is_missing() {
        let env = env(&[("AUTHBROKER_OAUTH_SLACK_CLIENT_ID", "id")]);
        assert!(oauth_client(&env, "slack", None).is_none());
    }

    #[test]
    fn test_login_vars_normalised() {
        let (user, pass) = login_vars("slack_web");
        assert_eq!(user, "AUTHBROKER_SLACK_WEB_USERNAME");
        assert_eq!(pass, "AUTHBROKER_SLACK_WEB_PASSWORD");
    }

    #[test]
    fn test_login_identity_from_config() {
        let env = env(&[
            ("AUTHBROKER_CANVAS_USERNAME", "env-user"),
            ("AUTHBROKER_CANVAS_PASSWORD", "pw"),
        ]);
        assert_eq!(login(&env, "canvas", None).unwrap().identity, "env-user");
        assert_eq!(
            login(&env, "canvas", Some("file-user")).unwrap().identity,
            "file-user"
        );

        let no_secret = env_without_password();
        assert!(login(&no_secret, "canvas", Some("file-user")).is_none());
    }

    fn env_without_password() -> HashMap<String, String> {
        env(&[("AUTHBROKER_CANVAS_USERNAME", "env-user")])
    }

    #[test]
    fn test_login_secrets_redacted_in_debug() {
        let secrets = LoginSecrets {
            identity: "me@example.com".to_string(),
            secret: "hunter2".to_string(),
        };
        let debug = format!("{:?}", secrets);
        assert!(debug.contains("me@example.com"));
        assert!(!debug.contains("hunter2"));
    }
}
