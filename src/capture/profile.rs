//! Declarative capture profiles.
//!
//! Each browser-session provider is described by data only: where to log in,
//! which fields to fill, what "logged in" looks like, which secondary prompts
//! to dismiss and how to probe the captured session. The engine in
//! [`super::CaptureEngine`] interprets these tables; adding a prompt type or a
//! provider does not touch control flow.

use super::driver::LaunchMode;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Desktop Chrome user agent presented by captures and session clients.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Element addressed either by CSS selector or by its visible label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementMatch {
    Selector(String),
    /// Case-insensitive match on the trimmed text of a button, link or input
    Label(String),
}

impl ElementMatch {
    pub fn selector(s: &str) -> Self {
        Self::Selector(s.to_string())
    }

    pub fn label(s: &str) -> Self {
        Self::Label(s.to_string())
    }
}

/// Login form layout.
#[derive(Debug, Clone)]
pub struct LoginForm {
    pub identity: String,
    pub secret: String,
    /// Clicked after the identity field on identity-first two-step forms
    pub identity_next: Vec<ElementMatch>,
    pub submit: Vec<ElementMatch>,
}

/// Observable condition meaning the login completed.
#[derive(Debug, Clone, Default)]
pub struct SessionSignal {
    pub cookie: String,
    pub cookie_prefix: Option<String>,
    /// Current URL must contain one of these (any URL when empty)
    pub url_includes: Vec<String>,
    /// Current URL must contain none of these
    pub url_excludes: Vec<String>,
    /// A client token must also have been extracted
    pub token_required: bool,
}

impl SessionSignal {
    pub fn is_met(
        &self,
        url: &str,
        cookies: &BTreeMap<String, String>,
        token: Option<&str>,
    ) -> bool {
        let cookie_ok = match cookies.get(&self.cookie) {
            Some(value) => match &self.cookie_prefix {
                Some(prefix) => value.starts_with(prefix.as_str()),
                None => !value.is_empty(),
            },
            None => false,
        };
        if !cookie_ok {
            return false;
        }
        if !self.url_includes.is_empty() && !self.url_includes.iter().any(|p| url.contains(p)) {
            return false;
        }
        if self.url_excludes.iter().any(|p| url.contains(p)) {
            return false;
        }
        !self.token_required || token.is_some_and(|t| !t.is_empty())
    }
}

/// Secondary prompt dismissed at most `times` times per run.
#[derive(Debug, Clone)]
pub struct PromptRule {
    pub name: String,
    pub matches: Vec<ElementMatch>,
    pub times: u32,
}

/// Where the client-side token lives once the app has loaded.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Page expression evaluating to a string (or null)
    Script {
        expression: String,
        prefix: Option<String>,
    },
    /// `content` of `<meta name="...">`
    MetaTag(String),
    Cookie { name: String, strip_quotes: bool },
}

/// One authenticated request issued from inside the page after capture.
///
/// `{base}` in the URL and `{token}` in header values are substituted.
#[derive(Debug, Clone)]
pub struct Probe {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// What a non-2xx probe status means for the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePolicy {
    /// Log and persist anyway; some providers only accept the session on a
    /// second request carrying a header discovered later.
    #[default]
    Lenient,
    /// Fail the capture.
    Strict,
}

#[derive(Debug, Clone)]
pub enum BaseUrlSource {
    Fixed(String),
    /// Origin of the page once the session signal fired
    PageOrigin,
}

/// Everything the capture engine needs to know about one provider.
#[derive(Debug, Clone)]
pub struct CaptureProfile {
    pub provider: String,
    pub login_url: String,
    pub form: LoginForm,
    pub signal: SessionSignal,
    pub prompts: Vec<PromptRule>,
    /// URL fragments of verification pages that cannot complete unattended
    pub challenge_markers: Vec<String>,
    pub token: Option<TokenSource>,
    pub probe: Probe,
    pub probe_policy: ProbePolicy,
    pub base_url: BaseUrlSource,
    /// Always launch a visible window (human MFA expected)
    pub interactive: bool,
    /// Provider-specific bound on the headless pass, below the global cap.
    /// Visible passes always get the global cap.
    pub max_iterations: Option<u32>,
    /// A headless pass that runs out of iterations retries once visibly
    /// instead of failing with TIMED_OUT
    pub restart_visible_on_timeout: bool,
    /// Page expressions whose string results are stored with the session,
    /// by name
    pub identifiers: Vec<(String, String)>,
    /// Set when required configuration is missing; captures refuse to start
    pub unconfigured: Option<String>,
}

impl CaptureProfile {
    /// Course platform behind an SSO (CAS-style) login with Duo-style MFA.
    pub fn canvas(base_url: Option<&str>) -> Self {
        let base = base_url.unwrap_or_default().trim_end_matches('/').to_string();
        Self {
            provider: "canvas".to_string(),
            login_url: base.clone(),
            form: LoginForm {
                identity: r#"input[name="username"], input#username"#.to_string(),
                secret: r#"input[name="password"], input#password"#.to_string(),
                identity_next: Vec::new(),
                submit: vec![
                    ElementMatch::selector(
                        r#"button[type="submit"], input[type="submit"], button[name="submit"], input[name="submit"], .btn-submit, #submit, .login-btn"#,
                    ),
                    ElementMatch::label("Login"),
                    ElementMatch::label("Log In"),
                    ElementMatch::label("Sign In"),
                ],
            },
            signal: SessionSignal {
                cookie: "canvas_session".to_string(),
                url_includes: vec![base.clone()],
                ..Default::default()
            },
            prompts: vec![PromptRule {
                name: "trust device".to_string(),
                matches: vec![
                    ElementMatch::label("Yes, this is my device"),
                    ElementMatch::selector("button#trust-browser-button"),
                    ElementMatch::label("Trust"),
                    ElementMatch::label("Yes"),
                ],
                times: 1,
            }],
            challenge_markers: Vec::new(),
            token: Some(TokenSource::MetaTag("csrf-token".to_string())),
            probe: Probe {
                method: "GET",
                url: "{base}/api/v1/users/self/profile".to_string(),
                headers: vec![("Accept".to_string(), "application/json".to_string())],
            },
            probe_policy: ProbePolicy::Lenient,
            base_url: BaseUrlSource::PageOrigin,
            interactive: true,
            max_iterations: None,
            restart_visible_on_timeout: false,
            identifiers: Vec::new(),
            unconfigured: base_url
                .is_none()
                .then(|| "canvas base_url is not configured; set [providers.canvas] base_url".to_string()),
        }
    }

    pub fn linkedin() -> Self {
        Self {
            provider: "linkedin".to_string(),
            login_url: "https://www.linkedin.com/login".to_string(),
            form: LoginForm {
                identity: "input#username".to_string(),
                secret: "input#password".to_string(),
                identity_next: Vec::new(),
                submit: vec![ElementMatch::selector(r#"button[type="submit"]"#)],
            },
            signal: SessionSignal {
                cookie: "li_at".to_string(),
                url_includes: vec![
                    "/feed".to_string(),
                    "/mynetwork".to_string(),
                    "/messaging".to_string(),
                ],
                ..Default::default()
            },
            prompts: vec![PromptRule {
                name: "add phone number".to_string(),
                matches: vec![ElementMatch::label("Skip")],
                times: 1,
            }],
            challenge_markers: vec!["/checkpoint/".to_string()],
            token: Some(TokenSource::Cookie {
                name: "JSESSIONID".to_string(),
                strip_quotes: true,
            }),
            probe: Probe {
                method: "GET",
                url: "{base}/voyager/api/me".to_string(),
                headers: vec![
                    ("Csrf-Token".to_string(), "{token}".to_string()),
                    ("X-Restli-Protocol-Version".to_string(), "2.0.0".to_string()),
                    (
                        "Accept".to_string(),
                        "application/vnd.linkedin.normalized+json+2.1".to_string(),
                    ),
                ],
            },
            probe_policy: ProbePolicy::Lenient,
            base_url: BaseUrlSource::Fixed("https://www.linkedin.com".to_string()),
            interactive: true,
            max_iterations: None,
            restart_visible_on_timeout: false,
            identifiers: Vec::new(),
            unconfigured: None,
        }
    }

    pub fn instagram() -> Self {
        Self {
            provider: "instagram".to_string(),
            login_url: "https://www.instagram.com/accounts/login/".to_string(),
            form: LoginForm {
                identity: r#"input[name="username"]"#.to_string(),
                secret: r#"input[name="password"]"#.to_string(),
                identity_next: Vec::new(),
                submit: vec![ElementMatch::selector(r#"button[type="submit"]"#)],
            },
            signal: SessionSignal {
                cookie: "sessionid".to_string(),
                url_excludes: vec!["/accounts/login".to_string()],
                ..Default::default()
            },
            // "Save login info" then "Turn on notifications", same button
            prompts: vec![PromptRule {
                name: "not now".to_string(),
                matches: vec![ElementMatch::label("Not now")],
                times: 2,
            }],
            challenge_markers: vec!["/challenge/".to_string()],
            token: Some(TokenSource::Cookie {
                name: "csrftoken".to_string(),
                strip_quotes: false,
            }),
            probe: Probe {
                method: "GET",
                url: "https://i.instagram.com/api/v1/accounts/current_user/?edit=true".to_string(),
                headers: vec![
                    ("X-IG-App-ID".to_string(), "936619743392459".to_string()),
                    ("X-Requested-With".to_string(), "XMLHttpRequest".to_string()),
                ],
            },
            probe_policy: ProbePolicy::Lenient,
            base_url: BaseUrlSource::Fixed("https://www.instagram.com".to_string()),
            interactive: true,
            max_iterations: None,
            restart_visible_on_timeout: false,
            identifiers: Vec::new(),
            unconfigured: None,
        }
    }

    /// Chat workspace web client: `d` cookie plus the `xoxc-` token that the
    /// app keeps in localStorage.
    pub fn slack_web(workspace_url: Option<&str>) -> Self {
        Self {
            provider: "slack_web".to_string(),
            login_url: workspace_url.unwrap_or_default().to_string(),
            form: LoginForm {
                identity: r#"input[type="email"], input[name="email"], input#email"#.to_string(),
                secret: r#"input[type="password"], input[name="password"], input#password"#
                    .to_string(),
                identity_next: vec![
                    ElementMatch::selector(r#"button[type="submit"]"#),
                    ElementMatch::label("Continue"),
                    ElementMatch::label("Next"),
                ],
                submit: vec![
                    ElementMatch::selector(r#"button[type="submit"]"#),
                    ElementMatch::label("Sign In"),
                ],
            },
            signal: SessionSignal {
                cookie: "d".to_string(),
                cookie_prefix: Some("xoxd-".to_string()),
                token_required: true,
                ..Default::default()
            },
            prompts: vec![PromptRule {
                name: "open in browser".to_string(),
                matches: vec![ElementMatch::label("use Slack in your browser")],
                times: 1,
            }],
            challenge_markers: vec!["challenge".to_string(), "confirm".to_string()],
            token: Some(TokenSource::Script {
                expression: slack_first_team("team.token"),
                prefix: Some("xoxc-".to_string()),
            }),
            probe: Probe {
                method: "POST",
                url: "https://slack.com/api/auth.test".to_string(),
                headers: vec![("Authorization".to_string(), "Bearer {token}".to_string())],
            },
            probe_policy: ProbePolicy::Lenient,
            base_url: BaseUrlSource::PageOrigin,
            interactive: false,
            max_iterations: Some(120),
            restart_visible_on_timeout: true,
            identifiers: vec![
                ("team_id".to_string(), slack_first_team("id")),
                ("user_id".to_string(), slack_first_team("team.user_id")),
            ],
            unconfigured: workspace_url.is_none().then(|| {
                "slack_web workspace_url is not configured; set [providers.slack_web] workspace_url"
                    .to_string()
            }),
        }
    }

    pub fn iteration_bound(&self, global: u32, mode: LaunchMode) -> u32 {
        match mode {
            LaunchMode::Headless => self.max_iterations.map_or(global, |own| own.min(global)),
            LaunchMode::Visible => global,
        }
    }
}

/// Reads `value` from the first team in the web client's `localConfig_v2`.
/// `id` is the team key and `team` its entry.
fn slack_first_team(value: &str) -> String {
    format!(
        r#"(() => {{
    try {{
        const config = JSON.parse(localStorage.getItem('localConfig_v2'));
        if (config && config.teams) {{
            const ids = Object.keys(config.teams);
            if (ids.length > 0) {{
                const id = ids[0];
                const team = config.teams[id];
                return {} || null;
            }}
        }}
    }} catch (e) {{}}
    return null;
}})()"#,
        value
    )
}

/// Substitutes `{base}` and `{token}` placeholders.
pub fn render_template(template: &str, base: &str, token: &str) -> String {
    template.replace("{base}", base).replace("{token}", token)
}
