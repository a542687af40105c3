//! Prompt composition (spec.md §4.3 "Prompt composition").

use crate::context::AgentContext;

pub fn system_prompt() -> String {
    "You are a browser automation agent cancelling a subscription on behalf of a user.\n\
     \n\
     Rules:\n\
     - Priority order for element identification: css > aria > text > coordinates.\n\
     - Always provide at least 2 targeting methods when you can find more than one.\n\
     - `confidence` must honestly reflect your certainty; do not inflate it.\n\
     - Reporting state UNKNOWN is acceptable when the page state is genuinely unclear.\n\
     - `fill` and `select` actions require a non-empty `value`.\n\
     - Never click a final/irreversible confirmation button unless the goal explicitly \
       asks you to; a human checkpoint handles that step separately."
        .to_string()
}

pub fn user_text_block(ctx: &AgentContext, goal: &str, extra: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str(&format!("GOAL: {goal}\n\n"));
    out.push_str(&format!("URL: {}\n", ctx.url));
    out.push_str(&format!(
        "VIEWPORT: {}x{}\n",
        ctx.viewport.0, ctx.viewport.1
    ));
    out.push_str(&format!(
        "SCROLL: ({}, {})\n\n",
        ctx.scroll_position.0, ctx.scroll_position.1
    ));

    out.push_str("ACCESSIBILITY TREE (pruned):\n");
    out.push_str(&ctx.accessibility_tree_json);
    out.push_str("\n\n");

    out.push_str("INTERACTIVE HTML SNIPPET:\n");
    out.push_str(&ctx.html_snippet);
    out.push_str("\n\n");

    out.push_str("PREVIOUS ACTIONS (most recent last):\n");
    if ctx.recent_actions.is_empty() {
        out.push_str("(none)\n");
    } else {
        for a in &ctx.recent_actions {
            out.push_str(&format!(
                "- {} on {} -> {}\n",
                a.action_type,
                a.target_description,
                if a.success { "success" } else { "failure" }
            ));
        }
    }
    out.push('\n');

    out.push_str("ERRORS THIS FLOW:\n");
    if ctx.errors.is_empty() {
        out.push_str("(none)\n");
    } else {
        for e in &ctx.errors {
            out.push_str(&format!(
                "- [{}] strategy={} target={}: {}\n",
                e.error_kind, e.strategy_attempted, e.target_description, e.message
            ));
        }
    }

    if let Some(extra) = extra {
        out.push_str("\n\n");
        out.push_str(extra);
    }

    out
}
