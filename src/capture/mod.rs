//! Browser-automated session capture.
//!
//! Drives a real browser through a provider's interactive login and turns the
//! resulting cookies and client token into a `BrowserSession` record.
//!
//! ```text
//! NOT_STARTED
//!   -> NAVIGATING           open the login page
//!   -> FILLING_CREDENTIALS  skipped when the session signal is already present
//!   -> AWAITING_CHALLENGE   poll: signal? challenge marker? known prompt?
//!   -> VALIDATING           one in-page probe request
//!   -> CAPTURED             session persisted
//!   -> FAILED | TIMED_OUT
//! ```
//!
//! A hard-challenge marker seen while headless restarts the whole flow once
//! in a visible window. So does a headless timeout, for profiles that opt in.

pub mod chromium;
pub mod driver;
pub mod jobs;
pub mod profile;

#[cfg(test)]
mod tests;

pub use chromium::ChromiumDriver;
pub use driver::{BrowserDriver, BrowserPage, LaunchMode, PageRequest};
pub use jobs::{CaptureJobs, JobSnapshot, JobStart};
pub use profile::{CaptureProfile, ProbePolicy};

use crate::config::{CaptureConfig, LoginSecrets};
use crate::credentials::{BrowserSession, CredentialKey, CredentialRecord, CredentialStore};
use crate::error::BrokerError;
use chrono::Utc;
use profile::{render_template, BaseUrlSource, ElementMatch, TokenSource};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Interval between "still waiting" log lines, in poll iterations.
const PROGRESS_LOG_EVERY: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureState {
    NotStarted,
    Navigating,
    FillingCredentials,
    AwaitingChallenge,
    Validating,
    Captured,
    Failed,
    TimedOut,
}

impl CaptureState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Captured | Self::Failed | Self::TimedOut)
    }
}

/// Polling parameters, resolved from `[capture]`.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub poll_interval: Duration,
    pub max_iterations: u32,
    pub form_wait_iterations: u32,
    pub headless: bool,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_iterations: config.max_iterations,
            form_wait_iterations: config.form_wait_iterations,
            headless: config.headless,
        }
    }
}

/// Result of a successful capture.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub key: CredentialKey,
    pub session: BrowserSession,
    /// Poll iterations spent in AWAITING_CHALLENGE on the final attempt
    pub iterations: u32,
    pub restarted_visible: bool,
    pub prompts_dismissed: Vec<String>,
}

enum Attempt {
    Captured(CaptureReport),
    RestartVisible(&'static str),
}

/// Runs captures against a browser driver and persists the results.
pub struct CaptureEngine {
    driver: Arc<dyn BrowserDriver>,
    store: Arc<CredentialStore>,
    settings: CaptureSettings,
}

impl CaptureEngine {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        store: Arc<CredentialStore>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            driver,
            store,
            settings,
        }
    }

    /// Runs one capture to completion.
    ///
    /// Every failure is an authentication error naming the setup path; the
    /// page is closed on every exit.
    pub async fn capture(
        &self,
        profile: &CaptureProfile,
        account: &str,
        login: Option<&LoginSecrets>,
        progress: &watch::Sender<CaptureState>,
    ) -> Result<CaptureReport, BrokerError> {
        let key = CredentialKey::new(&profile.provider, account);
        let fail = |state: CaptureState, message: String| {
            progress.send_replace(state);
            BrokerError::authentication(&profile.provider, account, message)
        };

        if let Some(reason) = &profile.unconfigured {
            return Err(fail(CaptureState::Failed, reason.clone()));
        }

        let mut mode = if profile.interactive || !self.settings.headless {
            LaunchMode::Visible
        } else {
            LaunchMode::Headless
        };
        let mut restarted = false;

        loop {
            info!(provider = %profile.provider, account = %account, ?mode, "Starting session capture");
            progress.send_replace(CaptureState::Navigating);

            let page = self
                .driver
                .launch(mode)
                .await
                .map_err(|e| fail(CaptureState::Failed, format!("browser launch failed: {:#}", e)))?;

            let attempt = self
                .attempt(page.as_ref(), profile, &key, login, mode, progress)
                .await;

            if let Err(e) = page.close().await {
                warn!(provider = %profile.provider, error = %e, "Failed to close browser");
            }

            match attempt {
                Ok(Attempt::Captured(mut report)) => {
                    report.restarted_visible = restarted;
                    return Ok(report);
                }
                Ok(Attempt::RestartVisible(reason)) => {
                    info!(
                        provider = %profile.provider,
                        account = %account,
                        reason,
                        "Headless login cannot finish, restarting in a visible browser"
                    );
                    mode = LaunchMode::Visible;
                    restarted = true;
                }
                Err((state, message)) => {
                    warn!(provider = %profile.provider, account = %account, ?state, message = %message, "Session capture failed");
                    return Err(fail(state, message));
                }
            }
        }
    }

    async fn attempt(
        &self,
        page: &dyn BrowserPage,
        profile: &CaptureProfile,
        key: &CredentialKey,
        login: Option<&LoginSecrets>,
        mode: LaunchMode,
        progress: &watch::Sender<CaptureState>,
    ) -> Result<Attempt, (CaptureState, String)> {
        let failed = |message: String| (CaptureState::Failed, message);

        page.goto(&profile.login_url)
            .await
            .map_err(|e| failed(format!("could not open login page: {:#}", e)))?;

        if !self.signal_present(page, profile).await {
            progress.send_replace(CaptureState::FillingCredentials);
            match login {
                Some(secrets) => self.fill_login(page, profile, secrets).await?,
                None if mode == LaunchMode::Visible => {
                    info!(provider = %profile.provider, "No login identity configured, waiting for manual login");
                }
                None => {
                    let (user_var, pass_var) = crate::config::secrets::login_vars(&profile.provider);
                    return Err(failed(format!(
                        "no login identity configured; set {} and {}",
                        user_var, pass_var
                    )));
                }
            }
        }

        progress.send_replace(CaptureState::AwaitingChallenge);
        let bound = profile.iteration_bound(self.settings.max_iterations, mode);
        let allow_restart = mode == LaunchMode::Headless;
        let mut dismissed: BTreeMap<usize, u32> = BTreeMap::new();
        let mut prompts_dismissed = Vec::new();
        let mut established = None;

        for i in 0..bound {
            let url = page.current_url().await.unwrap_or_default();
            let cookies = page.cookies().await.unwrap_or_default();
            let token = if profile.signal.token_required {
                self.extract_token(page, profile.token.as_ref(), &cookies).await
            } else {
                None
            };

            if profile.signal.is_met(&url, &cookies, token.as_deref()) {
                info!(provider = %profile.provider, iteration = i + 1, "Login complete");
                established = Some(i + 1);
                break;
            }

            if allow_restart && profile.challenge_markers.iter().any(|m| url.contains(m.as_str())) {
                return Ok(Attempt::RestartVisible("verification challenge"));
            }

            for (idx, rule) in profile.prompts.iter().enumerate() {
                let count = dismissed.entry(idx).or_insert(0);
                if *count >= rule.times {
                    continue;
                }
                if let Some(hit) = click_first(page, &rule.matches).await {
                    info!(provider = %profile.provider, prompt = %rule.name, matched = ?hit, "Dismissed prompt");
                    *count += 1;
                    prompts_dismissed.push(rule.name.clone());
                }
            }

            if i > 0 && i % PROGRESS_LOG_EVERY == 0 {
                info!(
                    provider = %profile.provider,
                    waited = i,
                    url = %truncate(&url, 80),
                    "Still waiting for login to complete"
                );
            }

            if i + 1 < bound {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }

        let Some(iterations) = established else {
            if allow_restart && profile.restart_visible_on_timeout {
                return Ok(Attempt::RestartVisible("headless timeout"));
            }
            return Err((
                CaptureState::TimedOut,
                format!("login did not complete within {} attempts", bound),
            ));
        };

        progress.send_replace(CaptureState::Validating);
        let session = self.validate(page, profile).await?;

        let record = CredentialRecord::BrowserSession(session.clone());
        {
            let _guard = self.store.lock_key(key).await;
            self.store
                .put(key, &record)
                .map_err(|e| failed(format!("could not persist captured session: {:#}", e)))?;
        }

        progress.send_replace(CaptureState::Captured);
        info!(
            provider = %profile.provider,
            account = %key.account,
            cookies = session.cookie_jar.len(),
            has_client_token = !session.client_token.is_empty(),
            "Session captured"
        );

        Ok(Attempt::Captured(CaptureReport {
            key: key.clone(),
            session,
            iterations,
            restarted_visible: false,
            prompts_dismissed,
        }))
    }

    async fn signal_present(&self, page: &dyn BrowserPage, profile: &CaptureProfile) -> bool {
        let url = page.current_url().await.unwrap_or_default();
        let cookies = page.cookies().await.unwrap_or_default();
        let token = if profile.signal.token_required {
            self.extract_token(page, profile.token.as_ref(), &cookies).await
        } else {
            None
        };
        profile.signal.is_met(&url, &cookies, token.as_deref())
    }

    async fn fill_login(
        &self,
        page: &dyn BrowserPage,
        profile: &CaptureProfile,
        secrets: &LoginSecrets,
    ) -> Result<(), (CaptureState, String)> {
        let form = &profile.form;
        if !self.wait_and_fill(page, &form.identity, &secrets.identity).await {
            let url = page.current_url().await.unwrap_or_default();
            return Err((
                CaptureState::Failed,
                format!("login form not found at {}", truncate(&url, 80)),
            ));
        }

        if !form.identity_next.is_empty() {
            click_first(page, &form.identity_next).await;
        }

        if !self.wait_and_fill(page, &form.secret, &secrets.secret).await {
            return Err((CaptureState::Failed, "password field not found".to_string()));
        }

        match click_first(page, &form.submit).await {
            Some(_) => info!(provider = %profile.provider, "Credentials submitted"),
            None => warn!(provider = %profile.provider, "No submit control matched"),
        }
        Ok(())
    }

    async fn wait_and_fill(&self, page: &dyn BrowserPage, selector: &str, value: &str) -> bool {
        for attempt in 0..self.settings.form_wait_iterations.max(1) {
            match page.fill(selector, value).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => debug!(selector, error = %e, "Fill failed"),
            }
            if attempt + 1 < self.settings.form_wait_iterations {
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        }
        false
    }

    async fn extract_token(
        &self,
        page: &dyn BrowserPage,
        source: Option<&TokenSource>,
        cookies: &BTreeMap<String, String>,
    ) -> Option<String> {
        let value = match source? {
            TokenSource::Script { expression, prefix } => page
                .eval_string(expression)
                .await
                .unwrap_or_else(|e| {
                    debug!(error = %e, "Token script failed");
                    None
                })
                .filter(|t| prefix.as_ref().map_or(true, |p| t.starts_with(p.as_str()))),
            TokenSource::MetaTag(name) => page.meta_content(name).await.unwrap_or(None),
            TokenSource::Cookie { name, strip_quotes } => cookies.get(name).map(|v| {
                if *strip_quotes {
                    v.trim_matches('"').to_string()
                } else {
                    v.clone()
                }
            }),
        };
        value.filter(|v| !v.is_empty())
    }

    async fn validate(
        &self,
        page: &dyn BrowserPage,
        profile: &CaptureProfile,
    ) -> Result<BrowserSession, (CaptureState, String)> {
        let cookies = page.cookies().await.unwrap_or_default();
        let token = self
            .extract_token(page, profile.token.as_ref(), &cookies)
            .await
            .unwrap_or_default();

        let base_url = match &profile.base_url {
            BaseUrlSource::Fixed(url) => url.clone(),
            BaseUrlSource::PageOrigin => {
                let current = page.current_url().await.unwrap_or_default();
                origin_of(&current)
                    .or_else(|| origin_of(&profile.login_url))
                    .unwrap_or_else(|| profile.login_url.clone())
            }
        };

        let request = PageRequest {
            method: profile.probe.method.to_string(),
            url: render_template(&profile.probe.url, &base_url, &token),
            headers: profile
                .probe
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), render_template(v, &base_url, &token)))
                .collect(),
        };
        let status = page.fetch_status(&request).await.unwrap_or_else(|e| {
            warn!(provider = %profile.provider, error = %e, "Probe request failed");
            0
        });

        if (200..300).contains(&status) {
            info!(provider = %profile.provider, status, "Probe succeeded");
        } else {
            warn!(provider = %profile.provider, status, policy = ?profile.probe_policy, "Probe returned non-success status");
            if profile.probe_policy == ProbePolicy::Strict {
                return Err((
                    CaptureState::Failed,
                    format!("captured session was rejected by the provider (HTTP {})", status),
                ));
            }
        }

        // Probing can rotate cookies
        let cookie_jar = page.cookies().await.unwrap_or(cookies);
        let client_token = match &profile.token {
            Some(TokenSource::Cookie { .. }) => self
                .extract_token(page, profile.token.as_ref(), &cookie_jar)
                .await
                .unwrap_or(token),
            _ => token,
        };

        let mut identifiers = BTreeMap::new();
        for (name, expression) in &profile.identifiers {
            match page.eval_string(expression).await {
                Ok(Some(value)) if !value.is_empty() => {
                    identifiers.insert(name.clone(), value);
                }
                Ok(_) => debug!(provider = %profile.provider, identifier = %name, "Identifier not found"),
                Err(e) => debug!(provider = %profile.provider, identifier = %name, error = %e, "Identifier script failed"),
            }
        }

        Ok(BrowserSession {
            cookie_jar,
            client_token,
            base_url,
            captured_at: Utc::now(),
            probe_status: Some(status),
            identifiers,
        })
    }
}

async fn click_first(page: &dyn BrowserPage, matches: &[ElementMatch]) -> Option<ElementMatch> {
    for m in matches {
        let clicked = match m {
            ElementMatch::Selector(s) => page.click(s).await,
            ElementMatch::Label(l) => page.click_label(l).await,
        };
        if matches!(clicked, Ok(true)) {
            return Some(m.clone());
        }
    }
    None
}

fn origin_of(url: &str) -> Option<String> {
    let origin = reqwest::Url::parse(url).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
