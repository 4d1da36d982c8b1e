//! Provider registry: which authentication strategy each provider uses.

use crate::capture::CaptureProfile;
use crate::config::{secrets, BrokerConfig, EnvSource, LoginSecrets, ProviderSettings};
use crate::oauth::{OAuthProvider, GOOGLE_FAMILY};
use serde::Serialize;
use std::collections::BTreeMap;

/// Browser-session provider: capture profile plus login identity.
#[derive(Debug, Clone)]
pub struct BrowserProvider {
    pub profile: CaptureProfile,
    pub login: Option<LoginSecrets>,
}

/// Authentication strategy registered for a provider.
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    AuthorizationCode(OAuthProvider),
    DirectExchange(OAuthProvider),
    BrowserSession(BrowserProvider),
}

/// Strategy tag, for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    AuthorizationCode,
    DirectExchange,
    BrowserSession,
}

impl AuthStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::AuthorizationCode(_) => StrategyKind::AuthorizationCode,
            Self::DirectExchange(_) => StrategyKind::DirectExchange,
            Self::BrowserSession(_) => StrategyKind::BrowserSession,
        }
    }

    /// Whether setup can start at all: OAuth client or capture prerequisites
    /// present. Says nothing about stored credentials.
    pub fn is_configured(&self) -> bool {
        match self {
            Self::AuthorizationCode(p) | Self::DirectExchange(p) => p.client.is_some(),
            Self::BrowserSession(b) => b.profile.unconfigured.is_none(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, AuthStrategy>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in providers with `[providers.<name>]` overrides and secrets from
    /// `env` applied.
    pub fn from_config(config: &BrokerConfig, env: &dyn EnvSource) -> Self {
        let mut registry = Self::new();
        let settings = |name: &str| config.providers.get(name).cloned().unwrap_or_default();

        for (name, _) in GOOGLE_FAMILY.iter().copied() {
            if let Some(provider) = OAuthProvider::google(name) {
                let provider = apply_scopes(provider.with_client_from(env), &settings(name));
                registry.insert(AuthStrategy::AuthorizationCode(provider));
            }
        }

        let slack = apply_scopes(OAuthProvider::slack().with_client_from(env), &settings("slack"));
        registry.insert(AuthStrategy::DirectExchange(slack));

        let canvas = settings("canvas");
        registry.insert(browser(
            CaptureProfile::canvas(canvas.base_url.as_deref()),
            &canvas,
            env,
        ));
        registry.insert(browser(CaptureProfile::linkedin(), &settings("linkedin"), env));
        registry.insert(browser(CaptureProfile::instagram(), &settings("instagram"), env));
        let slack_web = settings("slack_web");
        registry.insert(browser(
            CaptureProfile::slack_web(slack_web.workspace_url.as_deref()),
            &slack_web,
            env,
        ));

        registry
    }

    /// Registers or replaces a provider under its own name.
    pub fn insert(&mut self, strategy: AuthStrategy) {
        let name = match &strategy {
            AuthStrategy::AuthorizationCode(p) | AuthStrategy::DirectExchange(p) => p.name.clone(),
            AuthStrategy::BrowserSession(b) => b.profile.provider.clone(),
        };
        self.providers.insert(name, strategy);
    }

    pub fn get(&self, provider: &str) -> Option<&AuthStrategy> {
        self.providers.get(provider)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AuthStrategy)> {
        self.providers.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn apply_scopes(provider: OAuthProvider, settings: &ProviderSettings) -> OAuthProvider {
    match &settings.scopes {
        Some(scopes) => provider.with_scopes(scopes.clone()),
        None => provider,
    }
}

fn browser(
    mut profile: CaptureProfile,
    settings: &ProviderSettings,
    env: &dyn EnvSource,
) -> AuthStrategy {
    if let Some(policy) = settings.probe_policy {
        profile.probe_policy = policy;
    }
    let login = secrets::login(env, &profile.provider, settings.username.as_deref());
    AuthStrategy::BrowserSession(BrowserProvider { profile, login })
}
