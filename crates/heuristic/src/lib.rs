//! Deterministic URL+text state classifier (spec.md §4.5).
//!
//! Pure, no I/O: rules are evaluated in order and the first match wins. Used
//! both as a fast detector (`START`'s initial classification) and as the
//! post-action validator in the agent loop's `validate` step, which is why
//! it lives below `browser-driver`/`lm-client` in the dependency order (§2):
//! neither the planner nor the orchestrator can validate without it, and it
//! depends on nothing else in the workspace.

use serde::{Deserialize, Serialize};

/// Closed enumeration of cancellation-flow states (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Start,
    LoginRequired,
    AccountActive,
    AccountCancelled,
    ThirdPartyBilling,
    RetentionOffer,
    ExitSurvey,
    FinalConfirmation,
    Complete,
    Aborted,
    Failed,
    Unknown,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Complete | State::Aborted | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
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
        };
        f.write_str(s)
    }
}

/// One ordered rule: `matcher` sees the raw URL and the lower-cased visible
/// text. Rules are plain function pointers rather than `Box<dyn Fn>` since
/// every rule set this workspace ships is known at compile time (spec.md's
/// Open Questions ask that per-service rule sets be additive/configurable,
/// not that rules become dynamically loaded).
#[derive(Clone, Copy)]
pub struct Rule {
    pub description: &'static str,
    pub state: State,
    pub confidence: f64,
    matcher: fn(url: &str, text_lower: &str) -> bool,
}

/// A pure URL+text classifier: an ordered list of rules, first match wins.
#[derive(Clone)]
pub struct HeuristicInterpreter {
    rules: Vec<Rule>,
}

/// Result of classifying one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub state: State,
    pub confidence: f64,
    pub reason: String,
}

impl HeuristicInterpreter {
    pub fn new(rules: Vec<Rule>) -> Self {
        HeuristicInterpreter { rules }
    }

    /// The default rule table from spec.md §4.5 (the only service-specific
    /// table present in the retrieval pack's source material is Netflix's;
    /// this is that table, used as the workspace default and overridable by
    /// constructing a `HeuristicInterpreter` with a different rule vector).
    pub fn default_rules() -> Self {
        HeuristicInterpreter::new(default_rule_table())
    }

    pub fn classify(&self, url: &str, text: &str) -> Classification {
        let text_lower = text.to_lowercase();
        for rule in &self.rules {
            if (rule.matcher)(url, &text_lower) {
                return Classification {
                    state: rule.state,
                    confidence: rule.confidence,
                    reason: rule.description.to_string(),
                };
            }
        }
        Classification {
            state: State::Unknown,
            confidence: 0.0,
            reason: "no rule matched".to_string(),
        }
    }
}

impl Default for HeuristicInterpreter {
    fn default() -> Self {
        Self::default_rules()
    }
}

fn default_rule_table() -> Vec<Rule> {
    vec![
        Rule {
            description: "URL contains /login",
            state: State::LoginRequired,
            confidence: 0.95,
            matcher: |url, _| url.contains("/login"),
        },
        Rule {
            description: "URL contains account and text contains cancel membership",
            state: State::AccountActive,
            confidence: 0.85,
            matcher: |url, text| url.contains("account") && text.contains("cancel membership"),
        },
        Rule {
            description: "text contains restart membership",
            state: State::AccountCancelled,
            confidence: 0.85,
            matcher: |_, text| text.contains("restart membership"),
        },
        Rule {
            description: "text names a third-party billing provider",
            state: State::ThirdPartyBilling,
            confidence: 0.80,
            matcher: |_, text| {
                ["billed through", "itunes", "google play", "t-mobile"]
                    .iter()
                    .any(|needle| text.contains(needle))
            },
        },
        Rule {
            description: "text contains before you go / special offer",
            state: State::RetentionOffer,
            confidence: 0.75,
            matcher: |_, text| text.contains("before you go") || text.contains("special offer"),
        },
        Rule {
            description: "text contains why are you leaving / reason for cancelling",
            state: State::ExitSurvey,
            confidence: 0.75,
            matcher: |_, text| {
                text.contains("why are you leaving") || text.contains("reason for cancelling")
            },
        },
        Rule {
            description: "text contains finish cancellation",
            state: State::FinalConfirmation,
            confidence: 0.80,
            matcher: |_, text| text.contains("finish cancellation"),
        },
        Rule {
            description: "text contains cancelled and subscription",
            state: State::Complete,
            confidence: 0.80,
            matcher: |_, text| text.contains("cancelled") && text.contains("subscription"),
        },
    ]
}

/// Identifies which third-party provider's billing instructions to print
/// (spec.md §7 "a provider-specific instruction block"). Pure text match,
/// reusing the same provider needles as the `ThirdPartyBilling` rule.
pub fn identify_third_party_provider(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    if lower.contains("itunes") {
        Some("iTunes")
    } else if lower.contains("google play") {
        Some("Google Play")
    } else if lower.contains("t-mobile") {
        Some("T-Mobile")
    } else if lower.contains("billed through") {
        Some("a third-party biller")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_url_wins_over_everything_else() {
        let h = HeuristicInterpreter::default_rules();
        let c = h.classify("https://netflix.com/login", "cancel membership");
        assert_eq!(c.state, State::LoginRequired);
        assert!((c.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn account_active_requires_both_url_and_text() {
        let h = HeuristicInterpreter::default_rules();
        let miss = h.classify("https://netflix.com/account", "nothing relevant here");
        assert_eq!(miss.state, State::Unknown);
        let hit = h.classify("https://netflix.com/account", "Cancel Membership");
        assert_eq!(hit.state, State::AccountActive);
    }

    #[test]
    fn third_party_billing_detects_itunes() {
        let h = HeuristicInterpreter::default_rules();
        let c = h.classify("https://netflix.com/account", "Billed through iTunes");
        assert_eq!(c.state, State::ThirdPartyBilling);
        assert_eq!(identify_third_party_provider("Billed through iTunes"), Some("iTunes"));
    }

    #[test]
    fn unmatched_page_is_unknown_with_zero_confidence() {
        let h = HeuristicInterpreter::default_rules();
        let c = h.classify("https://netflix.com/help", "Contact support");
        assert_eq!(c.state, State::Unknown);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn terminal_states_are_exactly_complete_aborted_failed() {
        assert!(State::Complete.is_terminal());
        assert!(State::Aborted.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(!State::RetentionOffer.is_terminal());
        assert!(!State::Unknown.is_terminal());
    }

    #[test]
    fn custom_rule_table_overrides_default() {
        let custom = HeuristicInterpreter::new(vec![Rule {
            description: "always complete",
            state: State::Complete,
            confidence: 1.0,
            matcher: |_, _| true,
        }]);
        assert_eq!(custom.classify("anything", "anything").state, State::Complete);
    }
}
