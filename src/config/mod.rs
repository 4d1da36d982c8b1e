pub mod secrets;
pub use secrets::{EnvSource, LoginSecrets, OAuthClientSecrets, ProcessEnv};

use crate::capture::ProbePolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete broker configuration.
///
/// Secrets (OAuth client secrets, login passwords, the encryption key) are
/// never read from this file; see [`secrets`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub client: ClientConfig,
    /// Per-provider overrides, keyed by provider name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable base for OAuth redirect URIs.
    /// Defaults to `http://localhost:{port}`.
    #[serde(default)]
    pub callback_base_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            callback_base_url: None,
        }
    }
}

impl ServerConfig {
    pub fn callback_base_url(&self) -> String {
        self.callback_base_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
            .trim_end_matches('/')
            .to_string()
    }
}

/// Credential store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// OAuth flow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// How long a consent `state` stays valid (seconds)
    #[serde(default = "default_state_expiry")]
    pub state_expiry_seconds: i64,
    /// Access tokens this close to expiry are refreshed (seconds)
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_seconds: i64,
    /// Expired-state sweep interval (seconds)
    #[serde(default = "default_state_cleanup")]
    pub state_cleanup_seconds: u64,
}

fn default_state_expiry() -> i64 {
    600
}

fn default_refresh_skew() -> i64 {
    90
}

fn default_state_cleanup() -> u64 {
    60
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_expiry_seconds: default_state_expiry(),
            refresh_skew_seconds: default_refresh_skew(),
            state_cleanup_seconds: default_state_cleanup(),
        }
    }
}

/// Session capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Poll interval of the challenge wait loop (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on challenge wait iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Attempts to locate a login form field before giving up
    #[serde(default = "default_form_wait_iterations")]
    pub form_wait_iterations: u32,
    /// Start captures without a window; a hard challenge still forces one
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Chrome/Chromium binary; auto-detected when unset
    #[serde(default)]
    pub chrome_executable: Option<PathBuf>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_iterations() -> u32 {
    300
}

fn default_form_wait_iterations() -> u32 {
    15
}

fn default_headless() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_iterations: default_max_iterations(),
            form_wait_iterations: default_form_wait_iterations(),
            headless: default_headless(),
            chrome_executable: None,
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Authenticated client layer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Retries for idempotent requests on 429/5xx
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay, doubled per retry (milliseconds)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

/// Per-provider overrides
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderSettings {
    /// Base URL of a self-hosted provider (the course platform)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Workspace sign-in URL (the chat web session)
    #[serde(default)]
    pub workspace_url: Option<String>,
    /// Replaces the built-in scope set of an OAuth provider
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Login identity typed into the form; the secret stays in the environment
    #[serde(default)]
    pub username: Option<String>,
    /// Whether a rejected post-capture probe fails the capture
    #[serde(default)]
    pub probe_policy: Option<ProbePolicy>,
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BrokerConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: BrokerConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Load configuration, falling back to defaults when the file does not exist
pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<BrokerConfig> {
    if path.as_ref().exists() {
        load_config(path)
    } else {
        Ok(BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.callback_base_url(), "http://localhost:9000");
        assert_eq!(config.store.path, PathBuf::from("credentials.json"));
        assert_eq!(config.oauth.state_expiry_seconds, 600);
        assert_eq!(config.capture.max_iterations, 300);
        assert!(config.capture.headless);
        assert_eq!(config.capture.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.client.max_retries, 3);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            callback_base_url = "https://broker.example.com/"

            [store]
            path = "/var/lib/authbroker/credentials.json"

            [oauth]
            refresh_skew_seconds = 30

            [capture]
            poll_interval_ms = 500
            max_iterations = 120
            headless = false

            [client]
            max_retries = 0

            [providers.canvas]
            base_url = "https://canvas.example.edu"
            username = "student@example.edu"

            [providers.slack_web]
            workspace_url = "https://acme.slack.com"
            probe_policy = "strict"

            [providers.gmail]
            scopes = ["https://www.googleapis.com/auth/gmail.readonly"]
        "#;

        let config: BrokerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.callback_base_url(), "https://broker.example.com");
        assert_eq!(config.oauth.refresh_skew_seconds, 30);
        assert_eq!(config.oauth.state_expiry_seconds, 600);
        assert_eq!(config.capture.max_iterations, 120);
        assert!(!config.capture.headless);
        assert_eq!(config.client.max_retries, 0);
        assert_eq!(
            config.providers["canvas"].base_url.as_deref(),
            Some("https://canvas.example.edu")
        );
        assert_eq!(
            config.providers["canvas"].username.as_deref(),
            Some("student@example.edu")
        );
        assert_eq!(
            config.providers["slack_web"].workspace_url.as_deref(),
            Some("https://acme.slack.com")
        );
        assert_eq!(
            config.providers["slack_web"].probe_policy,
            Some(ProbePolicy::Strict)
        );
        assert_eq!(config.providers["gmail"].scopes.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [capture]
            max_iterations = 10
        "#;

        let config: BrokerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.capture.max_iterations, 10);
        assert_eq!(config.capture.poll_interval_ms, 1000); // Default
        assert_eq!(config.server.port, 9000); // Default
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = load_or_default("/nonexistent/authbroker.toml").unwrap();
        assert_eq!(config.server.port, 9000);
    }
}
