//! Thin wrapper over the CDP browser.
//!
//! All chromiumoxide calls in the workspace go through [`BrowserProcess`]
//! and [`DrivenPage`] so the rest of the code sees a small, stable surface:
//! navigate, read, evaluate, click, type, screenshot, cookies.

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{BrowserError, Result};

/// How long navigation waits for the load to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    DomContentLoaded,
    NetworkIdle,
}

/// Launch options for the shared browser process.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headed: bool,
    pub window: (u32, u32),
    pub user_data_dir: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headed: false,
            window: (1920, 1080),
            user_data_dir: None,
        }
    }
}

/// The one long-lived browser process plus its CDP event pump.
pub struct BrowserProcess {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserProcess {
    /// Launch the browser and start draining its event stream.
    pub async fn launch(options: &LaunchOptions) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(options.window.0, options.window.1)
            .arg("--disable-blink-features=AutomationControlled");
        if options.headed {
            builder = builder.with_head();
        }
        if let Some(dir) = &options.user_data_dir {
            builder = builder.user_data_dir(dir);
        }
        let config = builder
            .build()
            .map_err(BrowserError::Unavailable)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Unavailable(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(error = %e, "cdp handler event error");
                }
            }
        });

        tracing::info!(headed = options.headed, "browser launched");
        Ok(Self {
            browser,
            handler_task,
        })
    }

    /// Best-effort liveness probe via the CDP version call.
    pub async fn is_alive(&self) -> bool {
        self.browser.version().await.is_ok()
    }

    /// Create an isolated browser context (own cookie jar and storage).
    pub async fn new_context(&self) -> Result<BrowserContextId> {
        let id = self
            .browser
            .create_browser_context(Default::default())
            .await?;
        Ok(id)
    }

    /// Open a page, optionally inside a context.
    pub async fn new_page(&self, context_id: Option<&BrowserContextId>) -> Result<DrivenPage> {
        let mut builder = CreateTargetParams::builder().url("about:blank");
        if let Some(id) = context_id {
            builder = builder.browser_context_id(id.clone());
        }
        let params = builder
            .build()
            .map_err(BrowserError::Unavailable)?;
        let page = self.browser.new_page(params).await?;
        Ok(DrivenPage { page })
    }

    /// Dispose a context and everything in it.
    pub async fn dispose_context(&self, context_id: BrowserContextId) -> Result<()> {
        self.browser.dispose_browser_context(context_id).await?;
        Ok(())
    }

    /// Close the browser and stop the event pump.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::debug!(error = %e, "browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

/// A page handle with the operations the extraction stack needs.
#[derive(Clone)]
pub struct DrivenPage {
    page: Page,
}

impl DrivenPage {
    /// Navigate and wait according to policy.
    pub async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        if wait == WaitPolicy::NetworkIdle {
            // Ignore the secondary wait failing; the navigation itself held.
            let _ = self.page.wait_for_navigation().await;
        }
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await?
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    pub async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    /// Evaluate a JS expression and return its JSON value.
    pub async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(script).await?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Poll for a selector until it appears or the timeout elapses.
    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn exists(&self, selector: &str) -> bool {
        self.page.find_element(selector).await.is_ok()
    }

    /// Inner text of the first match, if any.
    pub async fn query_text(&self, selector: &str) -> Result<Option<String>> {
        match self.page.find_element(selector).await {
            Ok(element) => Ok(element.inner_text().await?),
            Err(_) => Ok(None),
        }
    }

    /// Attribute of the first match, if any.
    pub async fn query_attr(&self, selector: &str, attr: &str) -> Result<Option<String>> {
        match self.page.find_element(selector).await {
            Ok(element) => Ok(element.attribute(attr).await?),
            Err(_) => Ok(None),
        }
    }

    /// Text and href of every anchor matching the selector.
    pub async fn collect_links(&self, selector: &str) -> Result<Vec<(String, String)>> {
        let mut links = Vec::new();
        let elements = match self.page.find_elements(selector).await {
            Ok(elements) => elements,
            Err(_) => return Ok(links),
        };
        for element in elements {
            let href = element.attribute("href").await.ok().flatten();
            let text = element.inner_text().await.ok().flatten().unwrap_or_default();
            if let Some(href) = href {
                links.push((text.trim().to_string(), href));
            }
        }
        Ok(links)
    }

    /// Click the first element matching the selector.
    pub async fn click_selector(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(BrowserError::Cdp)?;
        element.scroll_into_view().await?;
        element.click().await?;
        Ok(())
    }

    /// Click at absolute page coordinates.
    pub async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        self.page.click(Point { x, y }).await?;
        Ok(())
    }

    /// Focus a field and type into it.
    pub async fn type_into(&self, selector: &str, text: &str) -> Result<()> {
        let element = self.page.find_element(selector).await?;
        element.click().await?;
        element.type_str(text).await?;
        Ok(())
    }

    /// Press a key (e.g. "Enter") on a focused element.
    pub async fn press_key(&self, selector: &str, key: &str) -> Result<()> {
        let element = self.page.find_element(selector).await?;
        element.press_key(key).await?;
        Ok(())
    }

    pub async fn scroll_by(&self, dy: i64) -> Result<()> {
        self.evaluate(&format!("window.scrollBy(0, {dy})")).await?;
        Ok(())
    }

    pub async fn scroll_into_view(&self, selector: &str) -> Result<()> {
        let element = self.page.find_element(selector).await?;
        element.scroll_into_view().await?;
        Ok(())
    }

    /// Screenshot to a PNG file; returns the path written.
    pub async fn screenshot(&self, path: &Path, full_page: bool) -> Result<PathBuf> {
        self.page
            .save_screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(full_page)
                    .build(),
                path,
            )
            .await?;
        Ok(path.to_path_buf())
    }

    /// Cookies for persistence, already in settable form.
    pub async fn cookies(&self) -> Result<Vec<CookieParam>> {
        let cookies = self.page.get_cookies().await?;
        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let param = CookieParam::builder()
                .name(cookie.name)
                .value(cookie.value)
                .domain(cookie.domain)
                .path(cookie.path)
                .secure(cookie.secure)
                .http_only(cookie.http_only)
                .build()
                .map_err(BrowserError::Unavailable)?;
            params.push(param);
        }
        Ok(params)
    }

    pub async fn set_cookies(&self, cookies: Vec<CookieParam>) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        self.page.set_cookies(cookies).await?;
        Ok(())
    }

    pub async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.page.set_user_agent(user_agent).await?;
        Ok(())
    }

    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(BrowserError::Unavailable)?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn set_timezone(&self, timezone_id: &str) -> Result<()> {
        let params = SetTimezoneOverrideParams::builder()
            .timezone_id(timezone_id)
            .build()
            .map_err(BrowserError::Unavailable)?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn set_locale(&self, locale: &str) -> Result<()> {
        let mut params = SetLocaleOverrideParams::default();
        params.locale = Some(locale.to_string());
        self.page.execute(params).await?;
        Ok(())
    }

    /// Quick responsiveness probe: URL read plus a tiny evaluate.
    pub async fn health_probe(&self, timeout: Duration) -> bool {
        let probe = async {
            self.current_url().await?;
            self.evaluate("1 + 1").await
        };
        matches!(tokio::time::timeout(timeout, probe).await, Ok(Ok(_)))
    }

    pub async fn close(self) -> Result<()> {
        self.page.close().await?;
        Ok(())
    }
}
