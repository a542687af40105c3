//! `Service`: the per-site configuration surface spec.md's Open Questions
//! ask to be treated as additive/configurable rather than hard-coded, since
//! only Netflix's hardcoded fallback table is present in the source
//! material. Implementations supply the entry URL, the heuristic rule set,
//! and a hardcoded per-state handler used when the LM is unavailable
//! (spec.md §4.1 "the orchestrator falls back to a service-specific
//! hardcoded handler for that state").

use async_trait::async_trait;
use subterm_browser::BrowserDriver;
use subterm_error::CoreError;
use subterm_heuristic::{HeuristicInterpreter, State};

#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    fn entry_url(&self) -> &str;
    fn heuristic(&self) -> HeuristicInterpreter;

    /// Drives one non-gated state without calling the language model at
    /// all. Used as a fallback when the planner raises an LM transport
    /// error, and as the sole driver when no `agent` was configured
    /// (`CancellationEngine`'s `agent?` slot is absent).
    async fn hardcoded_handle(&self, state: State, browser: &dyn BrowserDriver) -> Result<State, CoreError>;
}

/// The one service present in the source material (spec.md's Open
/// Questions). Selectors are illustrative Netflix markup from the original
/// cancellation flow's documented DOM.
pub struct NetflixService;

#[async_trait]
impl Service for NetflixService {
    fn name(&self) -> &str {
        "netflix"
    }

    fn entry_url(&self) -> &str {
        "https://www.netflix.com/youraccount"
    }

    fn heuristic(&self) -> HeuristicInterpreter {
        HeuristicInterpreter::default_rules()
    }

    async fn hardcoded_handle(&self, state: State, browser: &dyn BrowserDriver) -> Result<State, CoreError> {
        match state {
            State::AccountActive => {
                browser
                    .click(&["[data-uia='action-cancel-membership']", "a[href*='cancelplan']"])
                    .await?;
                Ok(State::RetentionOffer)
            }
            State::RetentionOffer => {
                browser
                    .click(&["[data-uia='action-finish-cancellation']", "button:contains('No thanks')"])
                    .await?;
                Ok(State::ExitSurvey)
            }
            State::ExitSurvey => {
                browser
                    .click(&["[data-uia='action-continue-cancellation']"])
                    .await?;
                Ok(State::FinalConfirmation)
            }
            // The irreversible click itself: only ever invoked by the
            // orchestrator after the human checkpoint has approved it
            // (spec.md §4.1 "FINAL_CONFIRMATION raises a second human
            // checkpoint"); never reached through ordinary agent planning.
            State::FinalConfirmation => {
                browser
                    .click(&["[data-uia='action-finish-cancellation-flow']", "button:contains('Finish Cancellation')"])
                    .await?;
                Ok(State::Complete)
            }
            other => Err(CoreError::StateDetection(format!(
                "netflix hardcoded fallback has no handler for {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subterm_browser::{MockDriver, MockPage};

    #[tokio::test]
    async fn account_active_fallback_clicks_known_selector_and_advances() {
        let driver = MockDriver::new(MockPage::new("https://netflix.com/account", "cancel membership"))
            .on_selector(
                "[data-uia='action-cancel-membership']",
                MockPage::new("https://netflix.com/cancel", "special offer"),
            );
        let next = NetflixService.hardcoded_handle(State::AccountActive, &driver).await.unwrap();
        assert_eq!(next, State::RetentionOffer);
    }

    #[tokio::test]
    async fn final_confirmation_fallback_clicks_known_selector_and_completes() {
        let driver = MockDriver::new(MockPage::new("https://netflix.com/cancel/confirm", "finish cancellation"))
            .on_selector(
                "[data-uia='action-finish-cancellation-flow']",
                MockPage::new("https://netflix.com/cancelled", "cancelled your subscription"),
            );
        let next = NetflixService.hardcoded_handle(State::FinalConfirmation, &driver).await.unwrap();
        assert_eq!(next, State::Complete);
    }

    #[tokio::test]
    async fn unhandled_state_is_an_error() {
        let driver = MockDriver::new(MockPage::new("https://netflix.com", ""));
        let err = NetflixService
            .hardcoded_handle(State::ThirdPartyBilling, &driver)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StateDetection(_)));
    }
}
