//! Chromium implementation of the browser seam, over the DevTools protocol.

use super::driver::{BrowserDriver, BrowserPage, LaunchMode, PageRequest};
use super::profile::BROWSER_USER_AGENT;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::GetAllCookiesParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Launches a dedicated Chromium process per capture.
#[derive(Debug, Clone, Default)]
pub struct ChromiumDriver {
    executable: Option<PathBuf>,
}

impl ChromiumDriver {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self, mode: LaunchMode) -> Result<Box<dyn BrowserPage>> {
        let mut builder = BrowserConfig::builder()
            .window_size(1280, 720)
            .arg(format!("--user-agent={}", BROWSER_USER_AGENT))
            .arg("--disable-blink-features=AutomationControlled");
        if mode == LaunchMode::Visible {
            builder = builder.with_head();
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("Invalid browser configuration: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch Chromium")?;

        // The CDP connection only makes progress while its handler is polled
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler stopped");
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open browser page")?;

        debug!(?mode, "Browser launched");

        Ok(Box::new(ChromiumPage {
            page,
            browser: Mutex::new(Some(browser)),
            events,
        }))
    }
}

struct ChromiumPage {
    page: Page,
    browser: Mutex<Option<Browser>>,
    events: JoinHandle<()>,
}

impl ChromiumPage {
    async fn eval_json(&self, expression: String) -> Result<serde_json::Value> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow!("Invalid evaluation: {}", e))?;
        let result = self
            .page
            .evaluate_expression(params)
            .await
            .context("Page evaluation failed")?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Navigation to {} failed", url))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn cookies(&self) -> Result<BTreeMap<String, String>> {
        let response = self
            .page
            .execute(GetAllCookiesParams::default())
            .await
            .context("Failed to read browser cookies")?;
        Ok(response
            .result
            .cookies
            .iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<bool> {
        let element = match self.page.find_element(selector).await {
            Ok(element) => element,
            Err(_) => return Ok(false),
        };
        element.click().await?;
        element.type_str(value).await?;
        Ok(true)
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        match self.page.find_element(selector).await {
            Ok(element) => {
                element.click().await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn click_label(&self, label: &str) -> Result<bool> {
        let script = format!(
            r#"(() => {{
                const wanted = {}.toLowerCase();
                const nodes = document.querySelectorAll('button, a, input[type="submit"], input[type="button"], [role="button"]');
                for (const el of nodes) {{
                    const text = (el.innerText || el.value || '').trim().toLowerCase();
                    if (text === wanted && el.offsetParent !== null) {{
                        el.click();
                        return true;
                    }}
                }}
                return false;
            }})()"#,
            js_string(label)
        );
        Ok(self.eval_json(script).await?.as_bool().unwrap_or(false))
    }

    async fn eval_string(&self, expression: &str) -> Result<Option<String>> {
        let value = self.eval_json(expression.to_string()).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn meta_content(&self, name: &str) -> Result<Option<String>> {
        let script = format!(
            r#"(() => {{
                const meta = document.querySelector('meta[name=' + JSON.stringify({}) + ']');
                return meta ? meta.getAttribute('content') : null;
            }})()"#,
            js_string(name)
        );
        self.eval_string(&script).await
    }

    async fn fetch_status(&self, request: &PageRequest) -> Result<u16> {
        let headers: serde_json::Map<String, serde_json::Value> = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let script = format!(
            r#"(async () => {{
                try {{
                    const resp = await fetch({}, {{
                        method: {},
                        headers: {},
                        credentials: 'include',
                    }});
                    return resp.status;
                }} catch (e) {{
                    return 0;
                }}
            }})()"#,
            js_string(&request.url),
            js_string(&request.method),
            serde_json::Value::Object(headers)
        );
        let status = self.eval_json(script).await?.as_u64().unwrap_or(0);
        Ok(u16::try_from(status).unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Browser did not close cleanly");
            }
            let _ = browser.wait().await;
        }
        self.events.abort();
        Ok(())
    }
}
