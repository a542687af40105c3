//! The allowed-transition graph (spec.md §4.1) and the static
//! `(goal, expected_next)` table the agent loop looks up per state
//! (spec.md §4.2 step 1).

use subterm_heuristic::State;

/// True iff `to` is a legal transition target from `from` (spec.md §3
/// invariant: "A state transition from s to s' is allowed only if
/// s' in allowed(s). Any other attempt is a fatal orchestrator error.").
pub fn is_allowed(from: State, to: State) -> bool {
    allowed(from).contains(&to)
}

/// The §4.1 transition table, verbatim.
pub fn allowed(from: State) -> &'static [State] {
    use State::*;
    match from {
        Start => &[
            LoginRequired,
            AccountActive,
            AccountCancelled,
            ThirdPartyBilling,
            Failed,
            Unknown,
        ],
        LoginRequired => &[
            AccountActive,
            AccountCancelled,
            ThirdPartyBilling,
            Aborted,
            Failed,
            Unknown,
        ],
        AccountActive => &[RetentionOffer, ExitSurvey, FinalConfirmation, Failed, Unknown],
        RetentionOffer => &[RetentionOffer, ExitSurvey, FinalConfirmation, Failed, Unknown],
        ExitSurvey => &[RetentionOffer, FinalConfirmation, Failed, Unknown],
        FinalConfirmation => &[Complete, Failed, Aborted],
        // `Unknown` may transition to any non-terminal state or to `Failed`;
        // enumerated explicitly here rather than computed, so the table
        // stays a flat match like every other arm.
        Unknown => &[
            LoginRequired,
            AccountActive,
            AccountCancelled,
            ThirdPartyBilling,
            RetentionOffer,
            ExitSurvey,
            FinalConfirmation,
            Unknown,
            Failed,
        ],
        AccountCancelled => &[Complete],
        ThirdPartyBilling => &[Failed],
        // Terminal states have no outgoing transitions.
        Complete | Aborted | Failed => &[],
    }
}

/// Goal text and expected next state the agent loop looks up for a
/// non-terminal, non-gated state (spec.md §4.2 step 1's example:
/// `ACCOUNT_ACTIVE -> ("Click the cancel membership link", RETENTION_OFFER)`).
///
/// `UNKNOWN` also delegates to the agent (it is one of the "other states"
/// of spec.md §4.1 that are not handled directly) but has no single
/// expected next state to validate against; `None` there means "accept any
/// classification other than UNKNOWN" (spec.md §4.2 `matches_expected`'s
/// no-expectation branch).
pub fn goal_for(state: State) -> Option<(&'static str, Option<State>)> {
    use State::*;
    match state {
        AccountActive => Some(("Click the cancel membership link", Some(RetentionOffer))),
        RetentionOffer => Some(("Decline the retention offer and continue cancelling", Some(ExitSurvey))),
        ExitSurvey => Some(("Complete the exit survey and proceed to cancellation", Some(FinalConfirmation))),
        Unknown => Some(("Assess the current page and make progress toward cancelling the subscription", None)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use State::*;

    #[test]
    fn terminal_states_have_no_allowed_targets() {
        assert!(allowed(Complete).is_empty());
        assert!(allowed(Aborted).is_empty());
        assert!(allowed(Failed).is_empty());
    }

    #[test]
    fn account_active_to_retention_offer_is_allowed() {
        assert!(is_allowed(AccountActive, RetentionOffer));
        assert!(!is_allowed(AccountActive, LoginRequired));
    }

    #[test]
    fn account_cancelled_only_goes_to_complete() {
        assert_eq!(allowed(AccountCancelled), &[Complete]);
    }

    #[test]
    fn third_party_billing_only_fails() {
        assert_eq!(allowed(ThirdPartyBilling), &[Failed]);
    }

    #[test]
    fn goal_table_has_no_entry_for_gated_or_terminal_states() {
        assert!(goal_for(Start).is_none());
        assert!(goal_for(LoginRequired).is_none());
        assert!(goal_for(FinalConfirmation).is_none());
        assert!(goal_for(Complete).is_none());
    }

    #[test]
    fn goal_table_matches_spec_example() {
        assert_eq!(
            goal_for(AccountActive),
            Some(("Click the cancel membership link", Some(RetentionOffer)))
        );
    }

    #[test]
    fn unknown_delegates_to_agent_with_no_fixed_expectation() {
        let (_, expected) = goal_for(Unknown).unwrap();
        assert_eq!(expected, None);
    }
}
