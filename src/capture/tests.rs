use super::*;
use crate::credentials::CredentialStore;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

/// Scripted browser behaviour, shared by every page the fake launches.
#[derive(Clone)]
pub(crate) struct Scenario {
    pub form: bool,
    /// Per-page `current_url` call (1-based) from which the user is logged in
    pub session_from_call: Option<u32>,
    pub login_url: String,
    pub landing_url: String,
    /// Reported by headless pages instead, which then never log in
    pub headless_url: Option<String>,
    pub session_cookies: Vec<(String, String)>,
    pub rotated_after_probe: Vec<(String, String)>,
    pub script_token: Option<String>,
    /// Results for specific page expressions; anything else evaluates to
    /// `script_token`
    pub scripted: Vec<(String, String)>,
    pub meta_token: Option<String>,
    pub labels: Vec<String>,
    pub probe_status: u16,
}

impl Scenario {
    /// LinkedIn login where the session cookie shows up on poll iteration `n`.
    pub fn linkedin_signal_on_iteration(n: u32) -> Self {
        Self {
            form: true,
            // call 1 is the pre-form check
            session_from_call: Some(n + 1),
            login_url: "https://www.linkedin.com/login".to_string(),
            landing_url: "https://www.linkedin.com/feed/".to_string(),
            headless_url: None,
            session_cookies: vec![
                ("li_at".to_string(), "AQEDAR".to_string()),
                ("JSESSIONID".to_string(), "\"ajax:123\"".to_string()),
                ("bcookie".to_string(), "v=2&abc".to_string()),
            ],
            rotated_after_probe: Vec::new(),
            script_token: None,
            scripted: Vec::new(),
            meta_token: None,
            labels: Vec::new(),
            probe_status: 200,
        }
    }

    pub fn login() -> LoginSecrets {
        LoginSecrets {
            identity: "me@example.com".to_string(),
            secret: "hunter2".to_string(),
        }
    }
}

#[derive(Default)]
pub(crate) struct Log {
    pub launches: Vec<LaunchMode>,
    pub url_calls: u32,
    pub fills: Vec<(String, String)>,
    pub label_clicks: Vec<String>,
    pub probes: Vec<PageRequest>,
    pub closes: u32,
}

pub(crate) struct FakeDriver {
    scenario: Scenario,
    pub log: Arc<Mutex<Log>>,
}

impl FakeDriver {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            log: Arc::new(Mutex::new(Log::default())),
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn launch(&self, mode: LaunchMode) -> Result<Box<dyn BrowserPage>> {
        self.log.lock().unwrap().launches.push(mode);
        Ok(Box::new(FakePage {
            scenario: self.scenario.clone(),
            mode,
            log: Arc::clone(&self.log),
            calls: AtomicU32::new(0),
            probed: AtomicBool::new(false),
        }))
    }
}

struct FakePage {
    scenario: Scenario,
    mode: LaunchMode,
    log: Arc<Mutex<Log>>,
    calls: AtomicU32,
    probed: AtomicBool,
}

impl FakePage {
    fn stuck_headless(&self) -> bool {
        self.mode == LaunchMode::Headless && self.scenario.headless_url.is_some()
    }

    fn logged_in(&self) -> bool {
        !self.stuck_headless()
            && self
                .scenario
                .session_from_call
                .is_some_and(|n| self.calls.load(Ordering::SeqCst) >= n)
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn goto(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().url_calls += 1;
        if let (true, Some(url)) = (self.stuck_headless(), &self.scenario.headless_url) {
            return Ok(url.clone());
        }
        Ok(if self.logged_in() {
            self.scenario.landing_url.clone()
        } else {
            self.scenario.login_url.clone()
        })
    }

    async fn cookies(&self) -> Result<BTreeMap<String, String>> {
        let mut jar = BTreeMap::new();
        if self.logged_in() {
            jar.extend(self.scenario.session_cookies.iter().cloned());
        }
        if self.probed.load(Ordering::SeqCst) {
            jar.extend(self.scenario.rotated_after_probe.iter().cloned());
        }
        Ok(jar)
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<bool> {
        if !self.scenario.form {
            return Ok(false);
        }
        self.log
            .lock()
            .unwrap()
            .fills
            .push((selector.to_string(), value.to_string()));
        Ok(true)
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        Ok(self.scenario.form && selector.contains("submit"))
    }

    async fn click_label(&self, label: &str) -> Result<bool> {
        if self.scenario.labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            self.log.lock().unwrap().label_clicks.push(label.to_string());
            return Ok(true);
        }
        Ok(false)
    }

    async fn eval_string(&self, expression: &str) -> Result<Option<String>> {
        if !self.logged_in() {
            return Ok(None);
        }
        let scripted = self
            .scenario
            .scripted
            .iter()
            .find(|(expr, _)| expr == expression)
            .map(|(_, value)| value.clone());
        Ok(scripted.or_else(|| self.scenario.script_token.clone()))
    }

    async fn meta_content(&self, _name: &str) -> Result<Option<String>> {
        Ok(self.logged_in().then(|| self.scenario.meta_token.clone()).flatten())
    }

    async fn fetch_status(&self, request: &PageRequest) -> Result<u16> {
        self.probed.store(true, Ordering::SeqCst);
        self.log.lock().unwrap().probes.push(request.clone());
        Ok(self.scenario.probe_status)
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().unwrap().closes += 1;
        Ok(())
    }
}

fn settings(max_iterations: u32) -> CaptureSettings {
    CaptureSettings {
        poll_interval: Duration::from_millis(1),
        max_iterations,
        form_wait_iterations: 2,
        headless: true,
    }
}

pub(crate) fn engine_with(driver: FakeDriver) -> (TempDir, Arc<CredentialStore>, CaptureEngine) {
    engine_with_settings(driver, settings(300))
}

fn engine_with_settings(
    driver: FakeDriver,
    settings: CaptureSettings,
) -> (TempDir, Arc<CredentialStore>, CaptureEngine) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CredentialStore::new(dir.path().join("credentials.json")));
    let engine = CaptureEngine::new(Arc::new(driver), Arc::clone(&store), settings);
    (dir, store, engine)
}

fn progress() -> (watch::Sender<CaptureState>, watch::Receiver<CaptureState>) {
    watch::channel(CaptureState::NotStarted)
}

#[tokio::test]
async fn test_signal_on_iteration_n_stops_polling() {
    let driver = FakeDriver::new(Scenario::linkedin_signal_on_iteration(4));
    let log = Arc::clone(&driver.log);
    let (_dir, store, engine) = engine_with(driver);
    let (tx, rx) = progress();

    let report = engine
        .capture(&CaptureProfile::linkedin(), "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap();

    assert_eq!(report.iterations, 4);
    assert_eq!(*rx.borrow(), CaptureState::Captured);

    let log = log.lock().unwrap();
    // pre-form check plus exactly four polls; nothing after the signal
    assert_eq!(log.url_calls, 5);
    assert_eq!(log.closes, 1);
    assert_eq!(log.fills.len(), 2);
    assert_eq!(log.fills[0].1, "me@example.com");
    assert_eq!(log.probes.len(), 1);
    assert_eq!(log.probes[0].url, "https://www.linkedin.com/voyager/api/me");
    assert!(log.probes[0]
        .headers
        .contains(&("Csrf-Token".to_string(), "ajax:123".to_string())));

    let stored = store.get(&CredentialKey::new("linkedin", "default")).unwrap();
    assert_eq!(stored, CredentialRecord::BrowserSession(report.session.clone()));
    assert_eq!(report.session.client_token, "ajax:123");
    assert_eq!(report.session.base_url, "https://www.linkedin.com");
    assert_eq!(report.session.probe_status, Some(200));
    // every cookie is kept, not only the known ones
    assert_eq!(report.session.cookie_jar["bcookie"], "v=2&abc");
}

#[tokio::test]
async fn test_never_signaled_times_out_at_bound() {
    let mut scenario = Scenario::linkedin_signal_on_iteration(1);
    scenario.session_from_call = None;
    let driver = FakeDriver::new(scenario);
    let log = Arc::clone(&driver.log);
    let (_dir, store, engine) = engine_with_settings(driver, settings(5));
    let (tx, rx) = progress();

    let err = engine
        .capture(&CaptureProfile::linkedin(), "work", Some(&Scenario::login()), &tx)
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Authentication { .. }));
    assert!(err.to_string().contains("/auth/linkedin/setup?account=work"));
    assert_eq!(*rx.borrow(), CaptureState::TimedOut);
    assert_eq!(log.lock().unwrap().url_calls, 1 + 5);
    assert_eq!(log.lock().unwrap().closes, 1);
    assert!(store.list_all().is_empty());
}

#[tokio::test]
async fn test_missing_login_form_fails() {
    let mut scenario = Scenario::linkedin_signal_on_iteration(1);
    scenario.form = false;
    let driver = FakeDriver::new(scenario);
    let log = Arc::clone(&driver.log);
    let (_dir, _store, engine) = engine_with(driver);
    let (tx, rx) = progress();

    let err = engine
        .capture(&CaptureProfile::linkedin(), "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("login form not found"));
    assert_eq!(*rx.borrow(), CaptureState::Failed);
    assert_eq!(log.lock().unwrap().closes, 1);
}

#[tokio::test]
async fn test_existing_session_skips_form() {
    let driver = FakeDriver::new(Scenario::linkedin_signal_on_iteration(0));
    let log = Arc::clone(&driver.log);
    let (_dir, _store, engine) = engine_with(driver);
    let (tx, _rx) = progress();

    let report = engine
        .capture(&CaptureProfile::linkedin(), "default", None, &tx)
        .await
        .unwrap();

    assert_eq!(report.iterations, 1);
    assert!(log.lock().unwrap().fills.is_empty());
}

#[tokio::test]
async fn test_challenge_restarts_visible() {
    let scenario = Scenario {
        form: true,
        session_from_call: Some(3),
        login_url: "https://acme.slack.com/".to_string(),
        landing_url: "https://app.slack.com/client/T123".to_string(),
        headless_url: Some("https://acme.slack.com/x-challenge?step=1".to_string()),
        session_cookies: vec![("d".to_string(), "xoxd-abc".to_string())],
        rotated_after_probe: Vec::new(),
        script_token: Some("xoxc-111".to_string()),
        scripted: Vec::new(),
        meta_token: None,
        labels: Vec::new(),
        probe_status: 200,
    };
    let driver = FakeDriver::new(scenario);
    let log = Arc::clone(&driver.log);
    let (_dir, _store, engine) = engine_with(driver);
    let (tx, _rx) = progress();

    let profile = CaptureProfile::slack_web(Some("https://acme.slack.com/"));
    let report = engine
        .capture(&profile, "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap();

    assert!(report.restarted_visible);
    assert_eq!(report.session.client_token, "xoxc-111");
    assert_eq!(report.session.base_url, "https://app.slack.com");

    let log = log.lock().unwrap();
    assert_eq!(log.launches, vec![LaunchMode::Headless, LaunchMode::Visible]);
    assert_eq!(log.closes, 2);
    assert_eq!(log.probes[0].url, "https://slack.com/api/auth.test");
    assert!(log.probes[0]
        .headers
        .contains(&("Authorization".to_string(), "Bearer xoxc-111".to_string())));
}

#[tokio::test]
async fn test_prompt_dismissed_once_and_loop_continues() {
    let scenario = Scenario {
        form: true,
        session_from_call: Some(5),
        login_url: "https://sso.example.edu/cas/login".to_string(),
        landing_url: "https://canvas.example.edu/".to_string(),
        headless_url: None,
        session_cookies: vec![
            ("canvas_session".to_string(), "cs".to_string()),
            ("_csrf_token".to_string(), "abc%3D".to_string()),
        ],
        rotated_after_probe: Vec::new(),
        script_token: None,
        scripted: Vec::new(),
        meta_token: Some("meta-csrf".to_string()),
        labels: vec!["Yes".to_string()],
        probe_status: 200,
    };
    let driver = FakeDriver::new(scenario);
    let log = Arc::clone(&driver.log);
    let (_dir, _store, engine) = engine_with(driver);
    let (tx, _rx) = progress();

    let profile = CaptureProfile::canvas(Some("https://canvas.example.edu"));
    let report = engine
        .capture(&profile, "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap();

    assert_eq!(report.iterations, 4);
    assert_eq!(report.prompts_dismissed, vec!["trust device".to_string()]);
    assert_eq!(log.lock().unwrap().label_clicks, vec!["Yes".to_string()]);
    assert_eq!(report.session.client_token, "meta-csrf");
    assert_eq!(report.session.base_url, "https://canvas.example.edu");
    assert_eq!(
        log.lock().unwrap().probes[0].url,
        "https://canvas.example.edu/api/v1/users/self/profile"
    );
}

#[tokio::test]
async fn test_lenient_probe_persists_session() {
    let mut scenario = Scenario::linkedin_signal_on_iteration(1);
    scenario.probe_status = 401;
    let (_dir, store, engine) = engine_with(FakeDriver::new(scenario));
    let (tx, _rx) = progress();

    let report = engine
        .capture(&CaptureProfile::linkedin(), "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap();

    assert_eq!(report.session.probe_status, Some(401));
    assert!(store.get(&CredentialKey::new("linkedin", "default")).is_some());
}

#[tokio::test]
async fn test_strict_probe_rejects_session() {
    let mut scenario = Scenario::linkedin_signal_on_iteration(1);
    scenario.probe_status = 401;
    let (_dir, store, engine) = engine_with(FakeDriver::new(scenario));
    let (tx, rx) = progress();

    let mut profile = CaptureProfile::linkedin();
    profile.probe_policy = ProbePolicy::Strict;
    let err = engine
        .capture(&profile, "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("HTTP 401"));
    assert_eq!(*rx.borrow(), CaptureState::Failed);
    assert!(store.list_all().is_empty());
}

#[tokio::test]
async fn test_cookies_rotated_by_probe_are_kept() {
    let mut scenario = Scenario::linkedin_signal_on_iteration(1);
    scenario.rotated_after_probe = vec![("JSESSIONID".to_string(), "\"ajax:456\"".to_string())];
    let (_dir, _store, engine) = engine_with(FakeDriver::new(scenario));
    let (tx, _rx) = progress();

    let report = engine
        .capture(&CaptureProfile::linkedin(), "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap();

    assert_eq!(report.session.cookie_jar["JSESSIONID"], "\"ajax:456\"");
    assert_eq!(report.session.client_token, "ajax:456");
}

#[tokio::test]
async fn test_unconfigured_profile_never_launches() {
    let driver = FakeDriver::new(Scenario::linkedin_signal_on_iteration(1));
    let log = Arc::clone(&driver.log);
    let (_dir, _store, engine) = engine_with(driver);
    let (tx, rx) = progress();

    let err = engine
        .capture(&CaptureProfile::canvas(None), "default", None, &tx)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("base_url"));
    assert_eq!(*rx.borrow(), CaptureState::Failed);
    assert!(log.lock().unwrap().launches.is_empty());
}

#[tokio::test]
async fn test_headless_without_login_identity_fails() {
    let scenario = Scenario {
        headless_url: None,
        ..Scenario::linkedin_signal_on_iteration(3)
    };
    let (_dir, _store, engine) = engine_with(FakeDriver::new(scenario));
    let (tx, _rx) = progress();

    let mut profile = CaptureProfile::linkedin();
    profile.interactive = false;
    let err = engine
        .capture(&profile, "default", None, &tx)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("AUTHBROKER_LINKEDIN_USERNAME"));
}

fn slack_scenario(headless_url: &str) -> Scenario {
    let profile = CaptureProfile::slack_web(Some("https://acme.slack.com/"));
    Scenario {
        form: true,
        session_from_call: Some(3),
        login_url: "https://acme.slack.com/".to_string(),
        landing_url: "https://app.slack.com/client/T123".to_string(),
        headless_url: Some(headless_url.to_string()),
        session_cookies: vec![("d".to_string(), "xoxd-abc".to_string())],
        rotated_after_probe: Vec::new(),
        script_token: Some("xoxc-111".to_string()),
        scripted: vec![
            (profile.identifiers[0].1.clone(), "T123".to_string()),
            (profile.identifiers[1].1.clone(), "U456".to_string()),
        ],
        meta_token: None,
        labels: Vec::new(),
        probe_status: 200,
    }
}

#[tokio::test]
async fn test_headless_timeout_restarts_visible() {
    // never logs in headless, and the URL carries no challenge marker
    let driver = FakeDriver::new(slack_scenario("https://acme.slack.com/ssb/signin"));
    let log = Arc::clone(&driver.log);
    let (_dir, store, engine) = engine_with(driver);
    let (tx, rx) = progress();

    let profile = CaptureProfile::slack_web(Some("https://acme.slack.com/"));
    let report = engine
        .capture(&profile, "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap();

    assert!(report.restarted_visible);
    assert_eq!(*rx.borrow(), CaptureState::Captured);
    assert_eq!(report.session.identifiers["team_id"], "T123");
    assert_eq!(report.session.identifiers["user_id"], "U456");
    assert!(store.get(&CredentialKey::new("slack_web", "default")).is_some());

    let log = log.lock().unwrap();
    assert_eq!(log.launches, vec![LaunchMode::Headless, LaunchMode::Visible]);
    assert_eq!(log.closes, 2);
    // headless pass: pre-form check plus the 120-iteration slack bound
    assert!(log.url_calls > 1 + 120);
}

#[tokio::test]
async fn test_visible_pass_uses_global_bound() {
    let mut scenario = slack_scenario("https://acme.slack.com/ssb/signin");
    scenario.session_from_call = None;
    let driver = FakeDriver::new(scenario);
    let log = Arc::clone(&driver.log);
    let (_dir, store, engine) = engine_with_settings(driver, settings(150));
    let (tx, rx) = progress();

    let profile = CaptureProfile::slack_web(Some("https://acme.slack.com/"));
    let err = engine
        .capture(&profile, "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("within 150 attempts"));
    assert_eq!(*rx.borrow(), CaptureState::TimedOut);
    let log = log.lock().unwrap();
    assert_eq!(log.launches, vec![LaunchMode::Headless, LaunchMode::Visible]);
    assert_eq!(log.url_calls, (1 + 120) + (1 + 150));
    assert!(store.list_all().is_empty());
}

#[tokio::test]
async fn test_headless_timeout_without_opt_in_fails() {
    let mut scenario = Scenario::linkedin_signal_on_iteration(1);
    scenario.session_from_call = None;
    let driver = FakeDriver::new(scenario);
    let log = Arc::clone(&driver.log);
    let (_dir, _store, engine) = engine_with_settings(driver, settings(5));
    let (tx, rx) = progress();

    let mut profile = CaptureProfile::linkedin();
    profile.interactive = false;
    let err = engine
        .capture(&profile, "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("within 5 attempts"));
    assert_eq!(*rx.borrow(), CaptureState::TimedOut);
    assert_eq!(log.lock().unwrap().launches, vec![LaunchMode::Headless]);
}

#[tokio::test]
async fn test_shared_prompt_label_dismissed_twice_any_case() {
    let scenario = Scenario {
        form: true,
        session_from_call: Some(5),
        login_url: "https://www.instagram.com/accounts/login/".to_string(),
        landing_url: "https://www.instagram.com/".to_string(),
        headless_url: None,
        session_cookies: vec![
            ("sessionid".to_string(), "s".to_string()),
            ("csrftoken".to_string(), "c".to_string()),
        ],
        rotated_after_probe: Vec::new(),
        script_token: None,
        scripted: Vec::new(),
        meta_token: None,
        labels: vec!["Not Now".to_string()],
        probe_status: 200,
    };
    let driver = FakeDriver::new(scenario);
    let log = Arc::clone(&driver.log);
    let (_dir, _store, engine) = engine_with(driver);
    let (tx, _rx) = progress();

    let report = engine
        .capture(&CaptureProfile::instagram(), "default", Some(&Scenario::login()), &tx)
        .await
        .unwrap();

    assert_eq!(report.prompts_dismissed, vec!["not now".to_string(), "not now".to_string()]);
    assert_eq!(log.lock().unwrap().label_clicks.len(), 2);
}
