//! Thin wrapper over a headless-browser automation library (spec.md §4.4).
//!
//! [`BrowserDriver`] is the capability-set trait the agent loop and the
//! orchestrator depend on; [`ChromiumDriver`] is the real `chromiumoxide`
//! implementation (grounded in the `cyrup-ai-kodegen-tools-browser`
//! manifest, the only browser-automation dependency stack in the retrieval
//! pack), and [`MockDriver`] is an in-memory stand-in for tests and for a
//! `--target mock` CLI run. This mirrors the teacher's "capability set as a
//! trait with pluggable implementations" shape (`LlmClient`, `ToolSource`).

mod chromium;
mod mock;

pub use chromium::ChromiumDriver;
pub use mock::MockDriver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subterm_error::CoreError;

/// Which optional operations a concrete driver implementation supports.
/// The planner and orchestrator consult this to skip targeting strategies
/// (e.g. `coordinates` needs `evaluate`-free mouse dispatch; a minimal mock
/// may not implement every method) rather than calling and failing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriverCapabilities {
    pub css: bool,
    pub aria: bool,
    pub text: bool,
    pub coordinates: bool,
    pub evaluate: bool,
    pub accessibility_tree: bool,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        DriverCapabilities {
            css: true,
            aria: true,
            text: true,
            coordinates: true,
            evaluate: true,
            accessibility_tree: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollPosition {
    pub x: i64,
    pub y: i64,
}

/// Launch vs. attach-to-running-browser (CDP) mode (spec.md §4.4 "Stealth").
#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// Launch a fresh headless (or headful) Chromium process.
    Launch { headless: bool },
    /// Attach to an already-running browser over its CDP WebSocket URL.
    Attach { ws_url: String },
}

/// Browser automation capability set. All operations are async and may
/// suspend on network/render I/O; every suspension point is a cooperative
/// scheduling point for the agent loop (spec.md §5).
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn capabilities(&self) -> DriverCapabilities;

    async fn navigate(&self, url: &str, timeout: std::time::Duration) -> Result<(), CoreError>;

    /// `selectors` are tried in order; the first that matches is clicked.
    async fn click(&self, selectors: &[&str]) -> Result<(), CoreError>;

    async fn click_by_role(&self, role: &str, name: Option<&str>) -> Result<(), CoreError>;

    async fn click_by_text(&self, text: &str, exact: bool) -> Result<(), CoreError>;

    async fn click_at_coordinates(&self, x: f64, y: f64) -> Result<(), CoreError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), CoreError>;

    async fn select_option(&self, selector: &str, value: Option<&str>) -> Result<(), CoreError>;

    /// Full-page PNG screenshot.
    async fn screenshot(&self) -> Result<Vec<u8>, CoreError>;

    async fn html(&self) -> Result<String, CoreError>;

    async fn url(&self) -> Result<String, CoreError>;

    async fn visible_text(&self) -> Result<String, CoreError>;

    /// Best-effort: returns `"{}"` rather than an error when no accessibility
    /// snapshot is available (spec.md §4.4).
    async fn accessibility_tree(&self) -> Result<String, CoreError>;

    async fn viewport(&self) -> Result<Viewport, CoreError>;

    async fn scroll_position(&self) -> Result<ScrollPosition, CoreError>;

    async fn evaluate(&self, js: &str) -> Result<serde_json::Value, CoreError>;

    /// Releases all browser resources (closes pages, disconnects/kills the
    /// process). Idempotent; called on every termination path including
    /// panics (via the orchestrator's `Drop`/finally handling).
    async fn close(&self) -> Result<(), CoreError>;
}

/// Prunes a raw accessibility-tree JSON value to `{role, name[:100], children}`
/// down to `max_depth`, per spec.md §4.3's pruning rules. Shared by both
/// driver implementations so the planner always sees the same shape
/// regardless of which driver produced the raw snapshot.
pub fn prune_accessibility_tree(raw: &serde_json::Value, max_depth: usize) -> serde_json::Value {
    fn prune(node: &serde_json::Value, depth: usize, max_depth: usize) -> Option<serde_json::Value> {
        let role = node.get("role").and_then(|v| v.as_str())?;
        let name = node
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.chars().take(100).collect::<String>())
            .unwrap_or_default();
        let children: Vec<serde_json::Value> = if depth >= max_depth {
            Vec::new()
        } else {
            node.get("children")
                .and_then(|c| c.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|child| prune(child, depth + 1, max_depth))
                        .collect()
                })
                .unwrap_or_default()
        };
        Some(serde_json::json!({"role": role, "name": name, "children": children}))
    }
    prune(raw, 0, max_depth).unwrap_or_else(|| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_truncates_name_and_depth() {
        let raw = serde_json::json!({
            "role": "main",
            "name": "x".repeat(200),
            "children": [
                {"role": "button", "name": "Cancel", "children": [
                    {"role": "text", "name": "deep", "children": []}
                ]}
            ]
        });
        let pruned = prune_accessibility_tree(&raw, 1);
        assert_eq!(pruned["name"].as_str().unwrap().len(), 100);
        let child = &pruned["children"][0];
        assert_eq!(child["role"], "button");
        // depth 1 reached at the button node: its own children are dropped.
        assert_eq!(child["children"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn prune_on_missing_role_returns_empty_object() {
        let raw = serde_json::json!({"no_role": true});
        assert_eq!(prune_accessibility_tree(&raw, 5), serde_json::json!({}));
    }
}
