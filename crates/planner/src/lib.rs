//! Action planner (spec.md §4.3): `AgentContext`/`ActionPlan`/`TargetStrategy`
//! types plus the vision-capable structured tool-use call that turns a
//! perceived page into a next action.
//!
//! `TargetStrategy` and `ActionType` are closed tagged enums validated at
//! construction, per spec.md §9 ("prefer a sealed tagged enum with
//! per-variant payload validation at construction time"); this follows the
//! teacher's `ToolCall`/`Message` shape (plain Rust enums, not open
//! dictionaries) generalized to carry a constructor that can fail.

mod context;
mod plan;
mod prompt;

pub use context::{ActionRecord, AgentContext, ErrorRecord};
pub use plan::{ActionPlan, ActionType, TargetStrategy};

use std::sync::Arc;

use subterm_error::CoreError;
use subterm_heuristic::State;
use subterm_lm::{CompletionRequest, ContentBlock, LmClient, Message, Role, ToolChoiceMode, ToolSpec};

/// Confidence below this threshold triggers exactly one retry before the
/// planner gives up (spec.md §4.3 "Confidence gate").
const CONFIDENCE_THRESHOLD: f64 = 0.6;
const BROWSER_ACTION_TOOL: &str = "browser_action";

pub struct ActionPlanner {
    lm: Arc<dyn LmClient>,
    model: String,
}

impl ActionPlanner {
    pub fn new(lm: Arc<dyn LmClient>, model: impl Into<String>) -> Self {
        ActionPlanner {
            lm,
            model: model.into(),
        }
    }

    /// First attempt at a state: builds the goal prompt and calls the model,
    /// retrying once on a low-confidence plan.
    pub async fn plan(&self, ctx: &AgentContext, goal: &str) -> Result<ActionPlan, CoreError> {
        self.plan_with_extra(ctx, goal, None).await
    }

    /// Rebuilds the prompt with a "previous attempt failed" section listing
    /// the failed strategy and error, directing the model to use a different
    /// targeting method than any prior attempt in this state (spec.md §4.2
    /// "Self-correct contract").
    pub async fn self_correct(
        &self,
        ctx: &AgentContext,
        goal: &str,
        failed_strategies: &[TargetStrategy],
        last_error: &str,
        attempt: u32,
    ) -> Result<ActionPlan, CoreError> {
        let methods: Vec<&'static str> = failed_strategies.iter().map(|s| s.method_name()).collect();
        let extra = format!(
            "PREVIOUS ATTEMPT FAILED (attempt {attempt}):\n\
             - error: {last_error}\n\
             - strategies already tried and failed in this state: {methods:?}\n\
             Your next plan MUST use at least one targeting method not in that list.",
        );
        self.plan_with_extra(ctx, goal, Some(&extra)).await
    }

    async fn plan_with_extra(
        &self,
        ctx: &AgentContext,
        goal: &str,
        extra: Option<&str>,
    ) -> Result<ActionPlan, CoreError> {
        let request = self.build_request(ctx, goal, extra);
        let plan = self.call_and_parse(request.clone()).await?;

        if plan.confidence >= CONFIDENCE_THRESHOLD {
            return Ok(plan);
        }

        tracing::warn!(
            confidence = plan.confidence,
            "low-confidence plan, retrying once with a sharper-analysis instruction"
        );
        let retry_extra = match extra {
            Some(e) => format!(
                "{e}\n\nYour previous response had low confidence ({:.2}); analyse more \
                 carefully, or explain in `reasoning` why the action is impossible.",
                plan.confidence
            ),
            None => format!(
                "Your previous response had low confidence ({:.2}); analyse more carefully, \
                 or explain in `reasoning` why the action is impossible.",
                plan.confidence
            ),
        };
        let retry_request = self.build_request(ctx, goal, Some(&retry_extra));
        let retry_plan = self.call_and_parse(retry_request).await?;

        if retry_plan.confidence >= CONFIDENCE_THRESHOLD {
            Ok(retry_plan)
        } else {
            Err(CoreError::StateDetection(format!(
                "planner confidence {:.2} remained below {CONFIDENCE_THRESHOLD} after retry",
                retry_plan.confidence
            )))
        }
    }

    async fn call_and_parse(&self, request: CompletionRequest) -> Result<ActionPlan, CoreError> {
        let response = self.lm.complete(&request).await?;
        let (_, _, input) = response
            .tool_uses()
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::StateDetection("planner returned no tool_use block".into()))?;
        ActionPlan::from_tool_input(input)
    }

    fn build_request(&self, ctx: &AgentContext, goal: &str, extra: Option<&str>) -> CompletionRequest {
        let system = prompt::system_prompt();
        let user_text = prompt::user_text_block(ctx, goal, extra);

        let mut content = vec![ContentBlock::png_image(&ctx.screenshot)];
        content.push(ContentBlock::text(user_text));

        let mut request = CompletionRequest::new(
            self.model.clone(),
            vec![Message {
                role: Role::User,
                content,
            }],
        );
        request.system = Some(system);
        request.tools = vec![browser_action_tool_spec()];
        request.tool_choice = ToolChoiceMode::Tool(BROWSER_ACTION_TOOL.to_string());
        request.timeout = std::time::Duration::from_secs(30);
        request
    }
}

fn browser_action_tool_spec() -> ToolSpec {
    let states: Vec<&str> = [
        State::Start,
        State::LoginRequired,
        State::AccountActive,
        State::AccountCancelled,
        State::ThirdPartyBilling,
        State::RetentionOffer,
        State::ExitSurvey,
        State::FinalConfirmation,
        State::Complete,
        State::Aborted,
        State::Failed,
        State::Unknown,
    ]
    .iter()
    .map(|s| state_name(*s))
    .collect();

    ToolSpec {
        name: BROWSER_ACTION_TOOL.to_string(),
        description:
            "Report the current page state and the next browser action to take, with up to 4 \
             targeting strategies in priority order (css > aria > text > coordinates)."
                .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "state": {"type": "string", "enum": states},
                "expected_next_state": {"type": "string", "enum": states},
                "action_type": {"type": "string", "enum": ["click", "fill", "select", "scroll", "wait", "navigate"]},
                "targets": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": 4,
                    "items": {
                        "type": "object",
                        "properties": {
                            "method": {"type": "string", "enum": ["css", "aria", "text", "coordinates"]},
                            "selector": {"type": "string"},
                            "role": {"type": "string"},
                            "name": {"type": "string"},
                            "text": {"type": "string"},
                            "x": {"type": "number"},
                            "y": {"type": "number"},
                        },
                        "required": ["method"],
                    },
                },
                "value": {"type": "string"},
                "reasoning": {"type": "string"},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            },
            "required": ["action_type", "targets", "reasoning", "confidence"],
        }),
    }
}

fn state_name(state: State) -> &'static str {
    match state {
        State::Start => "START",
        State::LoginRequired => "LOGIN_REQUIRED",
        State::AccountActive => "ACCOUNT_ACTIVE",
        State::AccountCancelled => "ACCOUNT_CANCELLED",
        State::ThirdPartyBilling => "THIRD_PARTY_BILLING",
        State::RetentionOffer => "RETENTION_OFFER",
        State::ExitSurvey => "EXIT_SURVEY",
        State::FinalConfirmation => "FINAL_CONFIRMATION",
        State::Complete => "COMPLETE",
        State::Aborted => "ABORTED",
        State::Failed => "FAILED",
        State::Unknown => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use subterm_lm::{LmResponse, LmUsage, ResponseBlock};

    struct StubLm {
        responses: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl LmClient for StubLm {
        async fn complete(&self, _req: &CompletionRequest) -> Result<LmResponse, CoreError> {
            let input = self.responses.lock().unwrap().remove(0);
            Ok(LmResponse {
                content: vec![ResponseBlock::ToolUse {
                    id: "t1".into(),
                    name: BROWSER_ACTION_TOOL.into(),
                    input,
                }],
                stop_reason: "tool_use".into(),
                usage: LmUsage::default(),
            })
        }
    }

    fn sample_ctx() -> AgentContext {
        AgentContext::new(
            vec![0x89, 0x50, 0x4E, 0x47],
            "{}".into(),
            "<button>Cancel</button>".into(),
            "https://netflix.com/account".into(),
            "cancel membership".into(),
            (1280, 800),
            (0, 0),
            Vec::new(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn plan_accepts_high_confidence_first_try() {
        let lm = StubLm {
            responses: Mutex::new(vec![serde_json::json!({
                "action_type": "click",
                "targets": [{"method": "css", "selector": "#cancel"}],
                "reasoning": "cancel button is visible",
                "confidence": 0.9
            })]),
        };
        let planner = ActionPlanner::new(Arc::new(lm), "claude-sonnet-4-5-20250929");
        let plan = planner.plan(&sample_ctx(), "Click the cancel membership link").await.unwrap();
        assert_eq!(plan.confidence, 0.9);
        assert_eq!(plan.action_type, ActionType::Click);
    }

    #[tokio::test]
    async fn plan_retries_once_on_low_confidence_then_succeeds() {
        let lm = StubLm {
            responses: Mutex::new(vec![
                serde_json::json!({
                    "action_type": "click",
                    "targets": [{"method": "text", "text": "Cancel"}],
                    "reasoning": "unsure",
                    "confidence": 0.3
                }),
                serde_json::json!({
                    "action_type": "click",
                    "targets": [{"method": "text", "text": "Cancel"}],
                    "reasoning": "more sure now",
                    "confidence": 0.8
                }),
            ]),
        };
        let planner = ActionPlanner::new(Arc::new(lm), "claude-sonnet-4-5-20250929");
        let plan = planner.plan(&sample_ctx(), "goal").await.unwrap();
        assert_eq!(plan.confidence, 0.8);
    }

    #[tokio::test]
    async fn plan_fails_after_two_low_confidence_attempts() {
        let low = serde_json::json!({
            "action_type": "click",
            "targets": [{"method": "text", "text": "Cancel"}],
            "reasoning": "unsure",
            "confidence": 0.1
        });
        let lm = StubLm {
            responses: Mutex::new(vec![low.clone(), low]),
        };
        let planner = ActionPlanner::new(Arc::new(lm), "claude-sonnet-4-5-20250929");
        let err = planner.plan(&sample_ctx(), "goal").await.unwrap_err();
        assert!(matches!(err, CoreError::StateDetection(_)));
    }
}
