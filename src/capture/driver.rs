//! Browser automation seam.
//!
//! The capture engine only talks to these traits. The production
//! implementation drives Chromium over the DevTools protocol
//! ([`super::chromium`]); tests script a fake.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Whether the browser window is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Headless,
    Visible,
}

/// In-page request used to probe a captured session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Starts a fresh browser context and returns its only page.
    async fn launch(&self, mode: LaunchMode) -> Result<Box<dyn BrowserPage>>;
}

#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// Every cookie visible to the browser context, by name.
    async fn cookies(&self) -> Result<BTreeMap<String, String>>;

    /// Types `value` into the first element matching `selector`.
    /// Returns false when no element matches.
    async fn fill(&self, selector: &str, value: &str) -> Result<bool>;

    /// Clicks the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<bool>;

    /// Clicks the first visible button, link or input whose trimmed text
    /// equals `label` (case-insensitive).
    async fn click_label(&self, label: &str) -> Result<bool>;

    /// Evaluates an expression, returning its value when it is a string.
    async fn eval_string(&self, expression: &str) -> Result<Option<String>>;

    /// `content` attribute of `<meta name="{name}">`.
    async fn meta_content(&self, name: &str) -> Result<Option<String>>;

    /// Issues `request` from inside the page with the page's credentials and
    /// returns the HTTP status (0 when the request could not be sent).
    async fn fetch_status(&self, request: &PageRequest) -> Result<u16>;

    async fn close(&self) -> Result<()>;
}
