//! The agent loop (spec.md §4.2): perceive -> plan -> execute (with strategy
//! fallback) -> validate -> self-correct, bounded by `maxRetries`.
//!
//! Mirrors the teacher's ReAct-style runner loop (`agent/react/runner`):
//! a bounded retry loop around perceive/act/observe, generalized here to
//! browser targeting-strategy fallback instead of tool-call retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use subterm_browser::{prune_accessibility_tree, BrowserDriver};
use subterm_error::CoreError;
use subterm_heuristic::{HeuristicInterpreter, State};
use subterm_planner::{ActionPlan, ActionPlanner, ActionRecord, AgentContext, ErrorRecord, TargetStrategy};
use tokio::sync::Mutex;

use crate::results::{matches_expected, ExecutionResult, ValidationResult};

/// Per-strategy execution timeout (spec.md §4.2 "Execute contract").
const STRATEGY_TIMEOUT: Duration = Duration::from_millis(3_000);
/// Settle delay after a successful action, before the post-action screenshot.
const SETTLE_DELAY: Duration = Duration::from_millis(1_000);

/// Append-only, per-flow history: cleared once by the orchestrator at flow
/// start (spec.md "Ownership and lifecycle": "it owns its action/error
/// history only until the orchestrator clears it at flow start").
#[derive(Default)]
struct History {
    actions: Vec<ActionRecord>,
    errors: Vec<ErrorRecord>,
}

/// Drives one non-gated, non-terminal state to completion by delegating
/// page-level decisions to the planner. Holds borrowed-for-the-session
/// references to the browser, planner, and heuristic (spec.md §9: "agent
/// depends on browser; history is owned by agent only").
pub struct Agent {
    browser: Arc<dyn BrowserDriver>,
    planner: Option<Arc<ActionPlanner>>,
    heuristic: HeuristicInterpreter,
    max_retries: u32,
    history: Mutex<History>,
}

impl Agent {
    pub fn new(
        browser: Arc<dyn BrowserDriver>,
        planner: Option<Arc<ActionPlanner>>,
        heuristic: HeuristicInterpreter,
        max_retries: u32,
    ) -> Self {
        Agent {
            browser,
            planner,
            heuristic,
            max_retries,
            history: Mutex::new(History::default()),
        }
    }

    /// Clears the action/error history. Called once by the orchestrator at
    /// the start of a fresh cancellation flow.
    pub async fn clear_history(&self) {
        let mut h = self.history.lock().await;
        h.actions.clear();
        h.errors.clear();
    }

    /// `handleState(s) -> State` (spec.md §4.2 public operation). `goal` and
    /// `expected_next` come from the static table the orchestrator looked up
    /// (`transitions::goal_for`); the caller only invokes this for states
    /// that have an entry in that table.
    ///
    /// Returns `Err` only for an LM transport error (connection or non-2xx
    /// status) propagated up from the planner, so the orchestrator can fall
    /// back to the service's hardcoded handler for this state (spec.md §4.1
    /// "the orchestrator falls back to a service-specific hardcoded handler
    /// for that state"). Any other failure mode (targeting misses,
    /// low-confidence plans) is absorbed into the retry loop and eventually
    /// resolves to `Ok(State::Unknown)`.
    pub async fn handle_state(&self, goal: &str, expected_next: Option<State>) -> Result<State, CoreError> {
        let Some(planner) = &self.planner else {
            // No LM configured at all: the orchestrator's service fallback
            // is the only driver in this configuration, so the agent
            // cannot make progress. Return `Unknown` and let the caller
            // fall back.
            tracing::warn!("agent has no planner configured; returning UNKNOWN");
            return Ok(State::Unknown);
        };

        let mut last_validation: Option<ValidationResult> = None;
        let mut state_failed_strategies: Vec<TargetStrategy> = Vec::new();
        let mut last_error_message = String::new();

        for attempt in 1..=self.max_retries {
            let ctx = match self.perceive().await {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!("perceive failed on attempt {attempt}: {e}");
                    last_error_message = e.to_string();
                    continue;
                }
            };

            let plan = if attempt == 1 {
                planner.plan(&ctx, goal).await
            } else {
                planner
                    .self_correct(
                        &ctx,
                        goal,
                        &state_failed_strategies,
                        &last_error_message,
                        attempt,
                    )
                    .await
            };

            let plan = match plan {
                Ok(plan) => plan,
                Err(e @ (CoreError::Transient(_) | CoreError::RateLimit(_) | CoreError::Internal(_))) => {
                    // `Internal` reaches here only via the LM client's non-2xx
                    // mapping (client.rs: any non-429, non-server-error status,
                    // e.g. 401/403) — the planner's own failures (bad tool_use,
                    // low confidence) are `StateDetection`, not `Internal`. Treat
                    // it as a connection/status transport error too, per
                    // `handle_state`'s documented contract above.
                    tracing::warn!("LM transport error on attempt {attempt}: {e}");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("planner failed on attempt {attempt}: {e}");
                    last_error_message = e.to_string();
                    continue;
                }
            };

            let result = self.execute(&plan).await;
            if !result.success {
                let failed_strategy = plan.primary_target.clone();
                let message = format!("execute failed for goal {goal:?}");
                self.record_error(
                    "execute",
                    &failed_strategy.describe(),
                    "ElementNotFound",
                    &message,
                    &failed_strategy.describe(),
                )
                .await;
                state_failed_strategies.extend(plan.targets_in_priority_order().into_iter().cloned());
                last_error_message = message;
                continue;
            }

            let validation = self.validate(&result, plan.expected_state.or(expected_next)).await;
            if validation.success {
                return Ok(validation.actual_state);
            }
            last_error_message = format!(
                "validation mismatch: expected {:?}, got {}",
                validation.expected_state, validation.actual_state
            );
            last_validation = Some(validation);
        }

        tracing::warn!(
            "exhausted {} attempts for goal {:?}; last validation: {:?}",
            self.max_retries,
            goal,
            last_validation
        );
        Ok(State::Unknown)
    }

    /// Perceive contract (spec.md §4.2): gather screenshot (required),
    /// accessibility tree (best-effort), HTML snippet (best-effort), URL,
    /// visible text, viewport, scroll, plus the last 5 actions and all
    /// errors from history.
    pub async fn perceive(&self) -> Result<AgentContext, CoreError> {
        let screenshot = self.browser.screenshot().await?;

        let accessibility_tree_json = match self.browser.accessibility_tree().await {
            Ok(raw) => {
                let parsed: serde_json::Value =
                    serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}));
                prune_accessibility_tree(&parsed, 5).to_string()
            }
            Err(_) => "{}".to_string(),
        };

        let html_snippet = self.interactive_html_snippet().await.unwrap_or_default();

        let url = self.browser.url().await?;
        let visible_text = self.browser.visible_text().await?;
        let viewport = self.browser.viewport().await?;
        let scroll = self.browser.scroll_position().await?;

        let history = self.history.lock().await;
        let recent_actions = history.actions.clone();
        let errors = history.errors.clone();
        drop(history);

        Ok(AgentContext::new(
            screenshot,
            accessibility_tree_json,
            html_snippet,
            url,
            visible_text,
            (viewport.width, viewport.height),
            (scroll.x, scroll.y),
            recent_actions,
            errors,
        ))
    }

    /// Runs the HTML-extraction page script described in spec.md §4.3's
    /// pruning rules. Best-effort: any failure (e.g. `evaluate` unsupported
    /// by the driver) yields an empty snippet rather than an error.
    async fn interactive_html_snippet(&self) -> Result<String, CoreError> {
        if !self.browser.capabilities().evaluate {
            return Ok(String::new());
        }
        const EXTRACT_JS: &str = r#"
            (() => {
              const sel = "button, a, input, select, [role=button], [role=link], [role=checkbox], [role=textbox]";
              const els = Array.from(document.querySelectorAll(sel));
              const vw = window.innerWidth, vh = window.innerHeight;
              const visible = els.filter(el => {
                const r = el.getBoundingClientRect();
                return r.width > 0 && r.height > 0 && r.bottom > 0 && r.right > 0 && r.top < vh && r.left < vw;
              }).slice(0, 50);
              return visible.map(el => el.outerHTML.slice(0, 500)).join("\n");
            })()
        "#;
        let value = self.browser.evaluate(EXTRACT_JS).await?;
        let text = value.as_str().unwrap_or_default().to_string();
        Ok(if text.len() > 5_000 {
            text.chars().take(5_000).collect()
        } else {
            text
        })
    }

    /// Execute contract (spec.md §4.2): try each strategy in priority order
    /// with a 3s per-strategy timeout; on first success, settle 1s, capture
    /// a post-action screenshot, append an `ActionRecord`.
    pub async fn execute(&self, plan: &ActionPlan) -> ExecutionResult {
        let started = Instant::now();

        for strategy in plan.targets_in_priority_order() {
            let outcome = tokio::time::timeout(STRATEGY_TIMEOUT, self.dispatch(plan, strategy)).await;
            let succeeded = matches!(outcome, Ok(Ok(())));
            if succeeded {
                tokio::time::sleep(SETTLE_DELAY).await;
                let screenshot = self.browser.screenshot().await.ok();
                self.record_action(action_type_name(plan), &strategy.describe(), true).await;
                return ExecutionResult {
                    success: true,
                    strategy_used: Some(strategy.clone()),
                    post_action_screenshot: screenshot,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
            }
        }

        self.record_action(action_type_name(plan), "all", false).await;
        ExecutionResult {
            success: false,
            strategy_used: None,
            post_action_screenshot: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn dispatch(&self, plan: &ActionPlan, strategy: &TargetStrategy) -> Result<(), CoreError> {
        use subterm_planner::ActionType;

        match (plan.action_type, strategy) {
            (ActionType::Fill, TargetStrategy::Css { selector }) => {
                let value = plan
                    .value
                    .as_deref()
                    .ok_or_else(|| CoreError::StateDetection("fill action missing value".into()))?;
                self.browser.fill(selector, value).await
            }
            (ActionType::Select, TargetStrategy::Css { selector }) => {
                self.browser.select_option(selector, plan.value.as_deref()).await
            }
            (ActionType::Navigate, _) => {
                let url = plan
                    .value
                    .as_deref()
                    .ok_or_else(|| CoreError::StateDetection("navigate action missing value".into()))?;
                self.browser.navigate(url, STRATEGY_TIMEOUT).await
            }
            (_, TargetStrategy::Css { selector }) => self.browser.click(&[selector.as_str()]).await,
            (_, TargetStrategy::Aria { role, name }) => {
                self.browser.click_by_role(role, name.as_deref()).await
            }
            (_, TargetStrategy::Text { text }) => self.browser.click_by_text(text, false).await,
            (_, TargetStrategy::Coordinates { x, y }) => {
                self.browser.click_at_coordinates(*x, *y).await
            }
        }
    }

    /// Validate contract (spec.md §4.2): query URL + visible text, classify
    /// with the heuristic, and accept either an exact match or a
    /// skip-a-state progression.
    pub async fn validate(&self, result: &ExecutionResult, expected: Option<State>) -> ValidationResult {
        let (url, text) = match (self.browser.url().await, self.browser.visible_text().await) {
            (Ok(u), Ok(t)) => (u, t),
            _ => {
                return ValidationResult {
                    success: false,
                    expected_state: expected,
                    actual_state: State::Unknown,
                    confidence: 0.0,
                    reasoning: "failed to query browser for url/text".to_string(),
                }
            }
        };
        let _ = result; // kept in the signature per spec.md's ExecutionResult -> ValidationResult shape
        let classification = self.heuristic.classify(&url, &text);
        ValidationResult {
            success: matches_expected(classification.state, expected),
            expected_state: expected,
            actual_state: classification.state,
            confidence: classification.confidence,
            reasoning: classification.reason,
        }
    }

    async fn record_action(&self, action_type: &str, target_description: &str, success: bool) {
        let mut history = self.history.lock().await;
        history.actions.push(ActionRecord {
            action_type: action_type.to_string(),
            target_description: target_description.to_string(),
            success,
            timestamp: chrono::Utc::now(),
        });
    }

    async fn record_error(
        &self,
        action_type: &str,
        target_description: &str,
        error_kind: &str,
        message: &str,
        strategy_attempted: &str,
    ) {
        let mut history = self.history.lock().await;
        history.errors.push(ErrorRecord {
            action_type: action_type.to_string(),
            target_description: target_description.to_string(),
            error_kind: error_kind.to_string(),
            message: message.to_string(),
            strategy_attempted: strategy_attempted.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }
}

fn action_type_name(plan: &ActionPlan) -> &'static str {
    use subterm_planner::ActionType;
    match plan.action_type {
        ActionType::Click => "click",
        ActionType::Fill => "fill",
        ActionType::Select => "select",
        ActionType::Scroll => "scroll",
        ActionType::Wait => "wait",
        ActionType::Navigate => "navigate",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use subterm_browser::{MockDriver, MockPage};
    use subterm_lm::{CompletionRequest, LmResponse, LmUsage, ResponseBlock};

    struct StubLm {
        plan: serde_json::Value,
    }

    #[async_trait]
    impl subterm_lm::LmClient for StubLm {
        async fn complete(&self, _req: &CompletionRequest) -> Result<LmResponse, CoreError> {
            Ok(LmResponse {
                content: vec![ResponseBlock::ToolUse {
                    id: "t1".into(),
                    name: "browser_action".into(),
                    input: self.plan.clone(),
                }],
                stop_reason: "tool_use".into(),
                usage: LmUsage::default(),
            })
        }
    }

    fn planner_with(plan: serde_json::Value) -> ActionPlanner {
        ActionPlanner::new(Arc::new(StubLm { plan }), "claude-sonnet-4-5-20250929")
    }

    #[tokio::test]
    async fn handle_state_succeeds_on_first_attempt() {
        let driver: Arc<dyn BrowserDriver> = Arc::new(
            MockDriver::new(MockPage::new("https://netflix.com/account", "cancel membership"))
                .on_selector("#cancel", MockPage::new("https://netflix.com/cancel", "special offer")),
        );
        let planner = planner_with(serde_json::json!({
            "action_type": "click",
            "targets": [{"method": "css", "selector": "#cancel"}],
            "reasoning": "go",
            "confidence": 0.9
        }));
        let agent = Agent::new(driver, Some(Arc::new(planner)), HeuristicInterpreter::default_rules(), 3);
        let next = agent.handle_state("Click the cancel membership link", Some(State::RetentionOffer)).await.unwrap();
        assert_eq!(next, State::RetentionOffer);
    }

    #[tokio::test]
    async fn handle_state_returns_unknown_without_planner() {
        let driver: Arc<dyn BrowserDriver> =
            Arc::new(MockDriver::new(MockPage::new("https://netflix.com/account", "cancel membership")));
        let agent = Agent::new(driver, None, HeuristicInterpreter::default_rules(), 3);
        let next = agent.handle_state("goal", Some(State::RetentionOffer)).await.unwrap();
        assert_eq!(next, State::Unknown);
    }

    #[tokio::test]
    async fn handle_state_gives_up_after_max_retries_on_bad_selector() {
        let driver: Arc<dyn BrowserDriver> =
            Arc::new(MockDriver::new(MockPage::new("https://netflix.com/account", "cancel membership")));
        let planner = planner_with(serde_json::json!({
            "action_type": "click",
            "targets": [{"method": "css", "selector": "#does-not-exist"}],
            "reasoning": "go",
            "confidence": 0.9
        }));
        let agent = Agent::new(driver, Some(Arc::new(planner)), HeuristicInterpreter::default_rules(), 2);
        let next = agent.handle_state("goal", Some(State::RetentionOffer)).await.unwrap();
        assert_eq!(next, State::Unknown);
    }

    struct FailingLm(CoreError);

    #[async_trait]
    impl subterm_lm::LmClient for FailingLm {
        async fn complete(&self, _req: &CompletionRequest) -> Result<LmResponse, CoreError> {
            Err(self.0.clone())
        }
    }

    /// A non-2xx LM response (e.g. 401/403) is mapped to `CoreError::Internal`
    /// by the HTTP client, not `Transient`/`RateLimit` — `handle_state` must
    /// still propagate it as `Err` so the orchestrator falls back to the
    /// service's hardcoded handler, instead of absorbing it into `Unknown`.
    #[tokio::test]
    async fn handle_state_propagates_internal_lm_transport_error() {
        let driver: Arc<dyn BrowserDriver> =
            Arc::new(MockDriver::new(MockPage::new("https://netflix.com/account", "cancel membership")));
        let planner = ActionPlanner::new(
            Arc::new(FailingLm(CoreError::Internal("LM endpoint returned 401 Unauthorized".into()))),
            "claude-sonnet-4-5-20250929",
        );
        let agent = Agent::new(driver, Some(Arc::new(planner)), HeuristicInterpreter::default_rules(), 3);
        let err = agent.handle_state("goal", Some(State::RetentionOffer)).await.unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
    }
}
