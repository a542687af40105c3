//! Real driver: a `chromiumoxide`-backed [`crate::BrowserDriver`].
//!
//! Supports both launch and attach-to-running-browser (CDP) modes (spec.md
//! §4.4). Playwright-style `clickByRole`/`clickByText` have no native
//! chromiumoxide equivalent, so they are implemented by an injected query
//! script that resolves a target element's bounding-box center, followed by
//! a native (CDP-dispatched) mouse click at that point — this keeps the
//! click itself a trusted event even though element discovery is scripted.

use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use subterm_error::CoreError;

use crate::{BrowserDriver, DriverCapabilities, LaunchMode, ScrollPosition, Viewport};

/// Standard fingerprint overrides applied on every new page, reducing bot
/// detection signals (spec.md §4.4 "Stealth"): hides `navigator.webdriver`,
/// fakes a plausible plugins array, sets `navigator.languages`, and patches
/// the WebGL vendor/renderer strings a headless Chromium exposes by default.
const STEALTH_SCRIPT: &str = r#"
(() => {
  Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
  Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
  Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
  const getParameter = WebGLRenderingContext.prototype.getParameter;
  WebGLRenderingContext.prototype.getParameter = function (parameter) {
    if (parameter === 37445) return 'Intel Inc.';
    if (parameter === 37446) return 'Intel Iris OpenGL Engine';
    return getParameter.call(this, parameter);
  };
})();
"#;

pub struct ChromiumDriver {
    browser: Browser,
    page: Page,
    element_timeout: Duration,
}

impl ChromiumDriver {
    /// Launches (or attaches to) a browser, opens one page, and applies the
    /// stealth script via `Page::evaluate_on_new_document` so it runs before
    /// any site script on every subsequent navigation.
    pub async fn new(mode: LaunchMode, element_timeout: Duration) -> Result<Self, CoreError> {
        let (browser, mut handler) = match mode {
            LaunchMode::Launch { headless } => {
                let config = BrowserConfig::builder()
                    .with_head_mode(if headless {
                        chromiumoxide::browser::HeadlessMode::True
                    } else {
                        chromiumoxide::browser::HeadlessMode::False
                    })
                    .build()
                    .map_err(|e| CoreError::Configuration(format!("browser config: {e}")))?;
                Browser::launch(config)
                    .await
                    .map_err(|e| CoreError::Internal(format!("browser launch: {e}")))?
            }
            LaunchMode::Attach { ws_url } => Browser::connect(&ws_url)
                .await
                .map_err(|e| CoreError::Internal(format!("browser attach: {e}")))?,
        };

        // Chromiumoxide requires the handler event loop to be polled
        // continuously; detach it onto its own task for the session's life.
        tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CoreError::Internal(format!("new page: {e}")))?;
        page.evaluate_on_new_document(STEALTH_SCRIPT)
            .await
            .map_err(|e| CoreError::Internal(format!("stealth injection: {e}")))?;

        Ok(ChromiumDriver {
            browser,
            page,
            element_timeout,
        })
    }

    async fn click_by_point_script(&self, find_js: &str) -> Result<(), CoreError> {
        let point: serde_json::Value = self
            .page
            .evaluate(find_js)
            .await
            .map_err(|e| CoreError::ElementNotFound(format!("evaluate: {e}")))?
            .into_value()
            .map_err(|e| CoreError::ElementNotFound(format!("decode point: {e}")))?;

        let x = point.get("x").and_then(|v| v.as_f64());
        let y = point.get("y").and_then(|v| v.as_f64());
        match (x, y) {
            (Some(x), Some(y)) => self.click_at_coordinates(x, y).await,
            _ => Err(CoreError::ElementNotFound(
                "no matching element in viewport".into(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl BrowserDriver for ChromiumDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), CoreError> {
        tokio::time::timeout(timeout, async {
            self.page
                .goto(url)
                .await
                .map_err(|e| CoreError::Transient(format!("navigate: {e}")))?;
            self.page
                .wait_for_navigation()
                .await
                .map_err(|e| CoreError::Transient(format!("wait_for_navigation: {e}")))?;
            Ok::<(), CoreError>(())
        })
        .await
        .map_err(|_| CoreError::Transient(format!("navigate to {url} timed out")))?
    }

    async fn click(&self, selectors: &[&str]) -> Result<(), CoreError> {
        for selector in selectors {
            let found = tokio::time::timeout(self.element_timeout, self.page.find_element(*selector)).await;
            if let Ok(Ok(element)) = found {
                element
                    .click()
                    .await
                    .map_err(|e| CoreError::ElementNotFound(format!("click {selector}: {e}")))?;
                return Ok(());
            }
        }
        Err(CoreError::ElementNotFound(format!(
            "none of {selectors:?} matched within {:?}",
            self.element_timeout
        )))
    }

    async fn click_by_role(&self, role: &str, name: Option<&str>) -> Result<(), CoreError> {
        let name_check = match name {
            Some(n) => format!(
                "(el.getAttribute('aria-label')||el.textContent||'').trim() === {:?}",
                n
            ),
            None => "true".to_string(),
        };
        let js = format!(
            r#"(() => {{
                const els = Array.from(document.querySelectorAll('[role="{role}"], {role}'));
                for (const el of els) {{
                    if ({name_check}) {{
                        const r = el.getBoundingClientRect();
                        if (r.width > 0 && r.height > 0) return {{x: r.x + r.width/2, y: r.y + r.height/2}};
                    }}
                }}
                return null;
            }})()"#
        );
        tokio::time::timeout(Duration::from_secs(3), self.click_by_point_script(&js))
            .await
            .map_err(|_| CoreError::ElementNotFound(format!("role={role} name={name:?} timed out")))?
    }

    async fn click_by_text(&self, text: &str, exact: bool) -> Result<(), CoreError> {
        let cmp = if exact {
            format!("el.textContent.trim() === {:?}", text)
        } else {
            format!("el.textContent.toLowerCase().includes({:?})", text.to_lowercase())
        };
        let js = format!(
            r#"(() => {{
                const els = Array.from(document.querySelectorAll('button, a, [role="button"], [role="link"]'));
                for (const el of els) {{
                    if ({cmp}) {{
                        const r = el.getBoundingClientRect();
                        if (r.width > 0 && r.height > 0) return {{x: r.x + r.width/2, y: r.y + r.height/2}};
                    }}
                }}
                return null;
            }})()"#
        );
        tokio::time::timeout(Duration::from_secs(3), self.click_by_point_script(&js))
            .await
            .map_err(|_| CoreError::ElementNotFound(format!("text={text:?} timed out")))?
    }

    async fn click_at_coordinates(&self, x: f64, y: f64) -> Result<(), CoreError> {
        if x < 0.0 || y < 0.0 {
            return Err(CoreError::InputValidation(format!(
                "coordinates must be non-negative, got ({x}, {y})"
            )));
        }
        self.page
            .click(chromiumoxide::cdp::js_protocol::runtime::Point { x, y })
            .await
            .map_err(|e| CoreError::Transient(format!("click at ({x},{y}): {e}")))?;
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), CoreError> {
        let element = tokio::time::timeout(self.element_timeout, self.page.find_element(selector))
            .await
            .map_err(|_| CoreError::ElementNotFound(format!("fill {selector} timed out")))?
            .map_err(|e| CoreError::ElementNotFound(format!("fill {selector}: {e}")))?;
        element
            .click()
            .await
            .map_err(|e| CoreError::ElementNotFound(format!("focus {selector}: {e}")))?;
        element
            .type_str(value)
            .await
            .map_err(|e| CoreError::ElementNotFound(format!("type into {selector}: {e}")))?;
        Ok(())
    }

    async fn select_option(&self, selector: &str, value: Option<&str>) -> Result<(), CoreError> {
        let element = tokio::time::timeout(self.element_timeout, self.page.find_element(selector))
            .await
            .map_err(|_| CoreError::ElementNotFound(format!("select {selector} timed out")))?
            .map_err(|e| CoreError::ElementNotFound(format!("select {selector}: {e}")))?;
        let js = match value {
            Some(v) => format!("el => {{ el.value = {:?}; el.dispatchEvent(new Event('change', {{bubbles: true}})); }}", v),
            None => "el => { if (el.options && el.options.length) { el.selectedIndex = 0; el.dispatchEvent(new Event('change', {bubbles: true})); } }".to_string(),
        };
        element
            .call_js_fn(&js, true)
            .await
            .map_err(|e| CoreError::ElementNotFound(format!("select_option {selector}: {e}")))?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, CoreError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| CoreError::Internal(format!("screenshot: {e}")))
    }

    async fn html(&self) -> Result<String, CoreError> {
        self.page
            .content()
            .await
            .map_err(|e| CoreError::Internal(format!("content: {e}")))
    }

    async fn url(&self) -> Result<String, CoreError> {
        self.page
            .url()
            .await
            .map_err(|e| CoreError::Internal(format!("url: {e}")))?
            .ok_or_else(|| CoreError::Internal("page has no url".into()))
    }

    async fn visible_text(&self) -> Result<String, CoreError> {
        let value: serde_json::Value = self
            .page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .map_err(|e| CoreError::Internal(format!("visible_text evaluate: {e}")))?
            .into_value()
            .map_err(|e| CoreError::Internal(format!("visible_text decode: {e}")))?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn accessibility_tree(&self) -> Result<String, CoreError> {
        use chromiumoxide::cdp::browser_protocol::accessibility::GetFullAxTreeParams;
        match self.page.execute(GetFullAxTreeParams::default()).await {
            Ok(result) => {
                let value = serde_json::to_value(&result.result.nodes)
                    .unwrap_or_else(|_| serde_json::json!([]));
                Ok(value.to_string())
            }
            // Absent snapshot is not an error per spec.md §4.4.
            Err(_) => Ok("{}".to_string()),
        }
    }

    async fn viewport(&self) -> Result<Viewport, CoreError> {
        let value: serde_json::Value = self
            .page
            .evaluate("({width: window.innerWidth, height: window.innerHeight})")
            .await
            .map_err(|e| CoreError::Internal(format!("viewport evaluate: {e}")))?
            .into_value()
            .map_err(|e| CoreError::Internal(format!("viewport decode: {e}")))?;
        Ok(Viewport {
            width: value.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            height: value.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        })
    }

    async fn scroll_position(&self) -> Result<ScrollPosition, CoreError> {
        let value: serde_json::Value = self
            .page
            .evaluate("({x: window.scrollX, y: window.scrollY})")
            .await
            .map_err(|e| CoreError::Internal(format!("scroll evaluate: {e}")))?
            .into_value()
            .map_err(|e| CoreError::Internal(format!("scroll decode: {e}")))?;
        Ok(ScrollPosition {
            x: value.get("x").and_then(|v| v.as_i64()).unwrap_or(0),
            y: value.get("y").and_then(|v| v.as_i64()).unwrap_or(0),
        })
    }

    async fn evaluate(&self, js: &str) -> Result<serde_json::Value, CoreError> {
        self.page
            .evaluate(js)
            .await
            .map_err(|e| CoreError::Transient(format!("evaluate: {e}")))?
            .into_value()
            .map_err(|e| CoreError::Transient(format!("evaluate decode: {e}")))
    }

    async fn close(&self) -> Result<(), CoreError> {
        // Idempotent: a browser already closed returns an error we swallow.
        let _ = self.page.close().await;
        let mut browser = self.browser.clone();
        let _ = browser.close().await;
        Ok(())
    }
}
