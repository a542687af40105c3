//! In-memory driver used by `--target mock` CLI runs and by tests (spec.md
//! §6's CLI surface names `--target live|mock` as an external interface).
//!
//! Models a tiny scripted site: a current "page" (url, visible text, html)
//! and a set of registered transitions keyed by the targeting strategy that
//! would trigger them. This lets tests exercise the full agent loop and
//! orchestrator (S1-S3 of spec.md §8) without a real browser.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use subterm_error::CoreError;

use crate::{BrowserDriver, DriverCapabilities, ScrollPosition, Viewport};

#[derive(Debug, Clone)]
pub struct MockPage {
    pub url: String,
    pub text: String,
    pub html: String,
}

impl MockPage {
    pub fn new(url: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        MockPage {
            url: url.into(),
            html: format!("<body>{text}</body>"),
            text,
        }
    }
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
enum Trigger {
    Selector(String),
    Text(String),
    Role(String, Option<String>),
}

pub struct MockDriver {
    current: RwLock<MockPage>,
    transitions: HashMap<Trigger, MockPage>,
    capabilities: DriverCapabilities,
    click_log: RwLock<Vec<String>>,
}

impl MockDriver {
    pub fn new(initial: MockPage) -> Self {
        MockDriver {
            current: RwLock::new(initial),
            transitions: HashMap::new(),
            capabilities: DriverCapabilities::default(),
            click_log: RwLock::new(Vec::new()),
        }
    }

    pub fn on_selector(mut self, selector: impl Into<String>, next: MockPage) -> Self {
        self.transitions.insert(Trigger::Selector(selector.into()), next);
        self
    }

    pub fn on_text(mut self, text: impl Into<String>, next: MockPage) -> Self {
        self.transitions.insert(Trigger::Text(text.into()), next);
        self
    }

    pub fn on_role(mut self, role: impl Into<String>, name: Option<String>, next: MockPage) -> Self {
        self.transitions.insert(Trigger::Role(role.into(), name), next);
        self
    }

    /// The ordered list of click descriptions performed so far, for
    /// assertions like S1's "no click recorded on the final-confirm button".
    pub fn click_log(&self) -> Vec<String> {
        self.click_log.read().unwrap().clone()
    }

    fn apply(&self, trigger: &Trigger, description: &str) -> Result<(), CoreError> {
        match self.transitions.get(trigger) {
            Some(next) => {
                *self.current.write().unwrap() = next.clone();
                self.click_log.write().unwrap().push(description.to_string());
                Ok(())
            }
            None => Err(CoreError::ElementNotFound(format!(
                "mock driver has no transition for {description}"
            ))),
        }
    }
}

#[async_trait::async_trait]
impl BrowserDriver for MockDriver {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), CoreError> {
        self.current.write().unwrap().url = url.to_string();
        Ok(())
    }

    async fn click(&self, selectors: &[&str]) -> Result<(), CoreError> {
        for selector in selectors {
            if self
                .apply(&Trigger::Selector(selector.to_string()), &format!("css:{selector}"))
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(CoreError::ElementNotFound(format!(
            "mock: none of {selectors:?} matched"
        )))
    }

    async fn click_by_role(&self, role: &str, name: Option<&str>) -> Result<(), CoreError> {
        self.apply(
            &Trigger::Role(role.to_string(), name.map(|n| n.to_string())),
            &format!("role:{role}/{name:?}"),
        )
    }

    async fn click_by_text(&self, text: &str, _exact: bool) -> Result<(), CoreError> {
        self.apply(&Trigger::Text(text.to_string()), &format!("text:{text}"))
    }

    async fn click_at_coordinates(&self, x: f64, y: f64) -> Result<(), CoreError> {
        if x < 0.0 || y < 0.0 {
            return Err(CoreError::InputValidation(format!(
                "coordinates must be non-negative, got ({x}, {y})"
            )));
        }
        self.click_log
            .write()
            .unwrap()
            .push(format!("coordinates:({x},{y})"));
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), CoreError> {
        self.click_log
            .write()
            .unwrap()
            .push(format!("fill:{selector}={value}"));
        Ok(())
    }

    async fn select_option(&self, selector: &str, value: Option<&str>) -> Result<(), CoreError> {
        self.click_log
            .write()
            .unwrap()
            .push(format!("select:{selector}={value:?}"));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, CoreError> {
        // A minimal valid 1x1 PNG so downstream consumers that check for a
        // non-empty byte string / parse a PNG header still succeed.
        Ok(vec![
            0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D,
        ])
    }

    async fn html(&self) -> Result<String, CoreError> {
        Ok(self.current.read().unwrap().html.clone())
    }

    async fn url(&self) -> Result<String, CoreError> {
        Ok(self.current.read().unwrap().url.clone())
    }

    async fn visible_text(&self) -> Result<String, CoreError> {
        Ok(self.current.read().unwrap().text.clone())
    }

    async fn accessibility_tree(&self) -> Result<String, CoreError> {
        Ok("{}".to_string())
    }

    async fn viewport(&self) -> Result<Viewport, CoreError> {
        Ok(Viewport {
            width: 1280,
            height: 800,
        })
    }

    async fn scroll_position(&self) -> Result<ScrollPosition, CoreError> {
        Ok(ScrollPosition { x: 0, y: 0 })
    }

    async fn evaluate(&self, _js: &str) -> Result<serde_json::Value, CoreError> {
        Ok(serde_json::Value::Null)
    }

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
