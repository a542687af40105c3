//! `AgentContext` and the append-only `ActionRecord`/`ErrorRecord` history
//! rows (spec.md §3).

/// One row in the agent's action history: append-only, owned by the agent
/// until the orchestrator clears it at flow start (spec.md "Ownership and
/// lifecycle").
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub action_type: String,
    pub target_description: String,
    pub success: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// One row in the agent's error history: all of these are kept (not just
/// the last 5, unlike `ActionRecord`) for the current flow.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub action_type: String,
    pub target_description: String,
    pub error_kind: String,
    pub message: String,
    pub strategy_attempted: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A snapshot of one perceive step: everything the planner needs to decide
/// the next action (spec.md §3 `AgentContext`).
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub screenshot: Vec<u8>,
    pub accessibility_tree_json: String,
    pub html_snippet: String,
    pub url: String,
    pub visible_text: String,
    pub viewport: (u32, u32),
    pub scroll_position: (i64, i64),
    pub recent_actions: Vec<ActionRecord>,
    pub errors: Vec<ErrorRecord>,
}

/// HTML snippet cap from spec.md §3's `AgentContext` invariant.
const HTML_SNIPPET_MAX_CHARS: usize = 5_000;
/// How many recent actions the planner's prompt carries (spec.md §4.2
/// "Perceive contract": "Uses the last 5 ActionRecords").
const RECENT_ACTIONS_LIMIT: usize = 5;

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        screenshot: Vec<u8>,
        accessibility_tree_json: String,
        html_snippet: String,
        url: String,
        visible_text: String,
        viewport: (u32, u32),
        scroll_position: (i64, i64),
        recent_actions: Vec<ActionRecord>,
        errors: Vec<ErrorRecord>,
    ) -> Self {
        let html_snippet = if html_snippet.len() > HTML_SNIPPET_MAX_CHARS {
            html_snippet.chars().take(HTML_SNIPPET_MAX_CHARS).collect()
        } else {
            html_snippet
        };
        let recent_actions = if recent_actions.len() > RECENT_ACTIONS_LIMIT {
            recent_actions[recent_actions.len() - RECENT_ACTIONS_LIMIT..].to_vec()
        } else {
            recent_actions
        };
        AgentContext {
            screenshot,
            accessibility_tree_json,
            html_snippet,
            url,
            visible_text,
            viewport,
            scroll_position,
            recent_actions,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(n: u32) -> ActionRecord {
        ActionRecord {
            action_type: "click".into(),
            target_description: format!("css:#{n}"),
            success: true,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn caps_recent_actions_to_last_five() {
        let actions: Vec<_> = (0..8).map(action).collect();
        let ctx = AgentContext::new(
            vec![],
            "{}".into(),
            "".into(),
            "https://x".into(),
            "".into(),
            (1280, 800),
            (0, 0),
            actions,
            vec![],
        );
        assert_eq!(ctx.recent_actions.len(), 5);
        assert_eq!(ctx.recent_actions[0].target_description, "css:#3");
        assert_eq!(ctx.recent_actions[4].target_description, "css:#7");
    }

    #[test]
    fn truncates_html_snippet_to_cap() {
        let huge = "a".repeat(10_000);
        let ctx = AgentContext::new(
            vec![],
            "{}".into(),
            huge,
            "https://x".into(),
            "".into(),
            (1280, 800),
            (0, 0),
            vec![],
            vec![],
        );
        assert_eq!(ctx.html_snippet.len(), HTML_SNIPPET_MAX_CHARS);
    }
}
