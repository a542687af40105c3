//! `TargetStrategy`/`ActionType`/`ActionPlan`: closed tagged enums and a
//! validated-at-construction struct (spec.md §3 data model, §9 "tagged
//! variants").

use subterm_error::CoreError;
use subterm_heuristic::State;

/// A way to locate the element an action targets. Payload fields are
/// validated against the method discriminant at construction (spec.md §3
/// invariant: "A strategy's payload matches its method discriminant;
/// validated at construction").
#[derive(Debug, Clone, PartialEq)]
pub enum TargetStrategy {
    Css { selector: String },
    Aria { role: String, name: Option<String> },
    Text { text: String },
    Coordinates { x: f64, y: f64 },
}

impl TargetStrategy {
    pub fn css(selector: impl Into<String>) -> Result<Self, CoreError> {
        let selector = selector.into();
        if selector.trim().is_empty() {
            return Err(CoreError::InputValidation("css strategy requires a non-empty selector".into()));
        }
        Ok(TargetStrategy::Css { selector })
    }

    pub fn aria(role: impl Into<String>, name: Option<String>) -> Result<Self, CoreError> {
        let role = role.into();
        if role.trim().is_empty() {
            return Err(CoreError::InputValidation("aria strategy requires a non-empty role".into()));
        }
        Ok(TargetStrategy::Aria { role, name })
    }

    pub fn text(text: impl Into<String>) -> Result<Self, CoreError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(CoreError::InputValidation("text strategy requires non-empty text".into()));
        }
        Ok(TargetStrategy::Text { text })
    }

    pub fn coordinates(x: f64, y: f64) -> Result<Self, CoreError> {
        if x < 0.0 || y < 0.0 {
            return Err(CoreError::InputValidation(format!(
                "coordinates strategy requires a non-negative pair, got ({x}, {y})"
            )));
        }
        Ok(TargetStrategy::Coordinates { x, y })
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            TargetStrategy::Css { .. } => "css",
            TargetStrategy::Aria { .. } => "aria",
            TargetStrategy::Text { .. } => "text",
            TargetStrategy::Coordinates { .. } => "coordinates",
        }
    }

    /// Human-readable description for `ActionRecord`/`ErrorRecord` target
    /// fields; deterministic for equal inputs (spec.md §8 round-trip
    /// property).
    pub fn describe(&self) -> String {
        match self {
            TargetStrategy::Css { selector } => format!("css:{selector}"),
            TargetStrategy::Aria { role, name: Some(n) } => format!("aria:{role}[name={n}]"),
            TargetStrategy::Aria { role, name: None } => format!("aria:{role}"),
            TargetStrategy::Text { text } => format!("text:{text}"),
            TargetStrategy::Coordinates { x, y } => format!("coordinates:({x},{y})"),
        }
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, CoreError> {
        let method = value
            .get("method")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::StateDetection("target missing method".into()))?;
        match method {
            "css" => {
                let selector = value
                    .get("selector")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::StateDetection("css target missing selector".into()))?;
                TargetStrategy::css(selector)
            }
            "aria" => {
                let role = value
                    .get("role")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::StateDetection("aria target missing role".into()))?;
                let name = value.get("name").and_then(|v| v.as_str()).map(|s| s.to_string());
                TargetStrategy::aria(role, name)
            }
            "text" => {
                let text = value
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::StateDetection("text target missing text".into()))?;
                TargetStrategy::text(text)
            }
            "coordinates" => {
                let x = value.get("x").and_then(|v| v.as_f64()).ok_or_else(|| {
                    CoreError::StateDetection("coordinates target missing x".into())
                })?;
                let y = value.get("y").and_then(|v| v.as_f64()).ok_or_else(|| {
                    CoreError::StateDetection("coordinates target missing y".into())
                })?;
                TargetStrategy::coordinates(x, y)
            }
            other => Err(CoreError::StateDetection(format!("unknown target method {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Click,
    Fill,
    Select,
    Scroll,
    Wait,
    Navigate,
}

impl ActionType {
    fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "click" => Ok(ActionType::Click),
            "fill" => Ok(ActionType::Fill),
            "select" => Ok(ActionType::Select),
            "scroll" => Ok(ActionType::Scroll),
            "wait" => Ok(ActionType::Wait),
            "navigate" => Ok(ActionType::Navigate),
            other => Err(CoreError::StateDetection(format!("unknown action_type {other:?}"))),
        }
    }

    fn requires_value(self) -> bool {
        matches!(self, ActionType::Fill | ActionType::Select)
    }
}

/// The planner's structured output: a primary target, up to 3 fallbacks, and
/// the action to perform. Immutable after construction; every invariant in
/// spec.md §3 is checked once, here.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPlan {
    pub primary_target: TargetStrategy,
    pub fallback_targets: Vec<TargetStrategy>,
    pub action_type: ActionType,
    pub value: Option<String>,
    pub reasoning: String,
    pub confidence: f64,
    pub expected_state: Option<State>,
}

impl ActionPlan {
    pub fn new(
        primary_target: TargetStrategy,
        fallback_targets: Vec<TargetStrategy>,
        action_type: ActionType,
        value: Option<String>,
        reasoning: impl Into<String>,
        confidence: f64,
        expected_state: Option<State>,
    ) -> Result<Self, CoreError> {
        if fallback_targets.len() > 3 {
            return Err(CoreError::StateDetection(format!(
                "fallback_targets must have length <= 3, got {}",
                fallback_targets.len()
            )));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(CoreError::StateDetection(format!(
                "confidence must be in [0,1], got {confidence}"
            )));
        }
        if action_type.requires_value() && value.is_none() {
            return Err(CoreError::StateDetection(format!(
                "action_type {action_type:?} requires a value"
            )));
        }
        Ok(ActionPlan {
            primary_target,
            fallback_targets,
            action_type,
            value,
            reasoning: reasoning.into(),
            confidence,
            expected_state,
        })
    }

    /// All targets in priority order: primary first, then fallbacks.
    pub fn targets_in_priority_order(&self) -> Vec<&TargetStrategy> {
        std::iter::once(&self.primary_target)
            .chain(self.fallback_targets.iter())
            .collect()
    }

    pub(crate) fn from_tool_input(input: serde_json::Value) -> Result<Self, CoreError> {
        let targets = input
            .get("targets")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CoreError::StateDetection("browser_action missing targets array".into()))?;
        if targets.is_empty() {
            return Err(CoreError::StateDetection("browser_action targets array is empty".into()));
        }
        if targets.len() > 4 {
            return Err(CoreError::StateDetection(format!(
                "browser_action targets array has {} entries, max is 4",
                targets.len()
            )));
        }

        let mut parsed: Vec<TargetStrategy> = Vec::with_capacity(targets.len());
        for t in targets {
            parsed.push(TargetStrategy::from_json(t)?);
        }
        let primary = parsed.remove(0);

        let action_type = input
            .get("action_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::StateDetection("browser_action missing action_type".into()))?;
        let action_type = ActionType::from_str(action_type)?;

        let value = input.get("value").and_then(|v| v.as_str()).map(|s| s.to_string());
        let reasoning = input
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let confidence = input
            .get("confidence")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| CoreError::StateDetection("browser_action missing confidence".into()))?;
        let expected_state = input
            .get("expected_next_state")
            .and_then(|v| v.as_str())
            .and_then(parse_state_name);

        ActionPlan::new(primary, parsed, action_type, value, reasoning, confidence, expected_state)
    }
}

fn parse_state_name(s: &str) -> Option<State> {
    Some(match s {
        "START" => State::Start,
        "LOGIN_REQUIRED" => State::LoginRequired,
        "ACCOUNT_ACTIVE" => State::AccountActive,
        "ACCOUNT_CANCELLED" => State::AccountCancelled,
        "THIRD_PARTY_BILLING" => State::ThirdPartyBilling,
        "RETENTION_OFFER" => State::RetentionOffer,
        "EXIT_SURVEY" => State::ExitSurvey,
        "FINAL_CONFIRMATION" => State::FinalConfirmation,
        "COMPLETE" => State::Complete,
        "ABORTED" => State::Aborted,
        "FAILED" => State::Failed,
        "UNKNOWN" => State::Unknown,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn css_strategy_rejects_empty_selector() {
        assert!(TargetStrategy::css("").is_err());
        assert!(TargetStrategy::css("#ok").is_ok());
    }

    #[test]
    fn coordinates_strategy_rejects_negative() {
        assert!(TargetStrategy::coordinates(-1.0, 0.0).is_err());
        assert!(TargetStrategy::coordinates(0.0, 0.0).is_ok());
    }

    #[test]
    fn action_plan_rejects_more_than_three_fallbacks() {
        let primary = TargetStrategy::css("#a").unwrap();
        let fallbacks = vec![
            TargetStrategy::css("#b").unwrap(),
            TargetStrategy::css("#c").unwrap(),
            TargetStrategy::css("#d").unwrap(),
            TargetStrategy::css("#e").unwrap(),
        ];
        let err = ActionPlan::new(primary, fallbacks, ActionType::Click, None, "x", 0.9, None).unwrap_err();
        assert!(matches!(err, CoreError::StateDetection(_)));
    }

    #[test]
    fn action_plan_rejects_confidence_out_of_range() {
        let primary = TargetStrategy::css("#a").unwrap();
        let err = ActionPlan::new(primary, vec![], ActionType::Click, None, "x", 1.5, None).unwrap_err();
        assert!(matches!(err, CoreError::StateDetection(_)));
    }

    #[test]
    fn fill_requires_value() {
        let primary = TargetStrategy::css("#a").unwrap();
        let err = ActionPlan::new(primary.clone(), vec![], ActionType::Fill, None, "x", 0.9, None).unwrap_err();
        assert!(matches!(err, CoreError::StateDetection(_)));
        assert!(ActionPlan::new(primary, vec![], ActionType::Fill, Some("v".into()), "x", 0.9, None).is_ok());
    }

    #[test]
    fn describe_is_deterministic() {
        let t = TargetStrategy::aria("button", Some("Cancel".into())).unwrap();
        assert_eq!(t.describe(), "aria:button[name=Cancel]");
        assert_eq!(t.describe(), TargetStrategy::aria("button", Some("Cancel".into())).unwrap().describe());
    }

    #[test]
    fn from_tool_input_parses_primary_and_fallbacks() {
        let input = serde_json::json!({
            "action_type": "click",
            "targets": [
                {"method": "css", "selector": "#cancel"},
                {"method": "text", "text": "Cancel"},
            ],
            "reasoning": "go",
            "confidence": 0.8,
            "expected_next_state": "RETENTION_OFFER",
        });
        let plan = ActionPlan::from_tool_input(input).unwrap();
        assert_eq!(plan.primary_target, TargetStrategy::css("#cancel").unwrap());
        assert_eq!(plan.fallback_targets.len(), 1);
        assert_eq!(plan.expected_state, Some(State::RetentionOffer));
    }

    #[test]
    fn from_tool_input_rejects_more_than_four_targets() {
        let targets: Vec<_> = (0..5)
            .map(|i| serde_json::json!({"method": "css", "selector": format!("#{i}")}))
            .collect();
        let input = serde_json::json!({
            "action_type": "click",
            "targets": targets,
            "reasoning": "go",
            "confidence": 0.8,
        });
        assert!(ActionPlan::from_tool_input(input).is_err());
    }
}
