//! The cancellation orchestrator (spec.md §4.1): drives a fresh browser
//! from the service entry URL to a terminal state, delegating page-level
//! decisions to the agent and enforcing human gates at login and final
//! confirmation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use subterm_browser::BrowserDriver;
use subterm_error::CoreError;
use subterm_heuristic::{identify_third_party_provider, HeuristicInterpreter, State};
use subterm_lm::{retry_with_backoff, RetryPolicy};

use crate::agent::Agent;
use crate::service::Service;
use crate::session_log::{AiCallLogRow, SessionLog, TransitionLogRow};
use crate::transitions;

/// Hard cap on state transitions per run (spec.md §4.1 "Bounds"): the 11th
/// attempt terminates in `FAILED`.
const MAX_TRANSITIONS: u32 = 10;

/// A human checkpoint: suspends the automated loop awaiting an operator
/// action, bounded by a timeout (spec.md glossary). Implementations read
/// from a terminal prompt, a web UI, or (in tests) resolve immediately.
#[async_trait]
pub trait HumanCheckpoint: Send + Sync {
    /// Waits for the operator to finish authenticating manually. `Ok(())`
    /// on success; `Err(CoreError::UserAborted)` on timeout.
    async fn wait_for_authentication(&self, timeout: Duration) -> Result<(), CoreError>;

    /// Waits for the operator to approve the irreversible final step.
    /// `Ok(true)` to proceed, `Ok(false)` if the operator declines,
    /// `Err(CoreError::UserAborted)` on timeout.
    async fn wait_for_confirmation(&self, timeout: Duration) -> Result<bool, CoreError>;
}

/// Always approves immediately; used by `--dry-run` callers and tests.
/// Never used for a real final-confirmation click in production, since
/// `dry_run` short-circuits before this would matter.
pub struct AutoApproveCheckpoint;

#[async_trait]
impl HumanCheckpoint for AutoApproveCheckpoint {
    async fn wait_for_authentication(&self, _timeout: Duration) -> Result<(), CoreError> {
        Ok(())
    }

    async fn wait_for_confirmation(&self, _timeout: Duration) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// Where the orchestrator's step-by-step progress printer writes (spec.md
/// §7 "a step-by-step progress printer plus a final summary"). The
/// `outputCallback?` slot of the closed config options table.
pub trait OutputSink: Send + Sync {
    fn write(&self, line: &str);
}

pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, line: &str) {
        println!("{line}");
    }
}

/// Final outcome of a cancellation run: exit-code mapping stays with the
/// out-of-scope CLI collaborator (spec.md §1), but is provided here as the
/// pure function `exit_code_for` since it derives directly from the state
/// machine this crate owns.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: &'static str,
    pub final_state: State,
    pub output_dir: PathBuf,
}

/// Exit codes from spec.md §6's CLI surface: 0 success, 1 failed, 2
/// aborted, 4 third-party billing. (3, configuration error, is raised
/// before a run starts and is not a function of `State`.)
pub fn exit_code_for(outcome: &RunOutcome, was_third_party_billing: bool) -> i32 {
    match outcome.final_state {
        State::Complete => 0,
        State::Aborted => 2,
        _ if was_third_party_billing => 4,
        _ => 1,
    }
}

/// One cancellation session: owns the browser, the session logger, the
/// agent, and all history (spec.md "Ownership and lifecycle"). Created per
/// CLI invocation; destroyed on terminal state.
pub struct CancellationOrchestrator {
    service: Arc<dyn Service>,
    browser: Arc<dyn BrowserDriver>,
    heuristic: HeuristicInterpreter,
    agent: Option<Arc<Agent>>,
    checkpoint: Arc<dyn HumanCheckpoint>,
    output: Arc<dyn OutputSink>,
    session_log: SessionLog,
    dry_run: bool,
    max_retries: u32,
    auth_timeout: Duration,
    confirm_timeout: Duration,
}

impl CancellationOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: Arc<dyn Service>,
        browser: Arc<dyn BrowserDriver>,
        heuristic: HeuristicInterpreter,
        session_log: SessionLog,
        agent: Option<Arc<Agent>>,
        output: Arc<dyn OutputSink>,
        checkpoint: Arc<dyn HumanCheckpoint>,
        dry_run: bool,
    ) -> Self {
        CancellationOrchestrator {
            service,
            browser,
            heuristic,
            agent,
            checkpoint,
            output,
            session_log,
            dry_run,
            max_retries: 3,
            auth_timeout: Duration::from_secs(300),
            confirm_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeouts(mut self, auth_timeout: Duration, confirm_timeout: Duration) -> Self {
        self.auth_timeout = auth_timeout;
        self.confirm_timeout = confirm_timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Drives the session from `START` to a terminal state. Finalizes the
    /// session log and closes the browser on every exit path, including the
    /// early-return error paths below (spec.md §4.1 "Side effects").
    pub async fn run(mut self) -> RunOutcome {
        if let Some(agent) = &self.agent {
            agent.clear_history().await;
        }

        let mut current = State::Start;
        let mut transitions_done: u32 = 0;
        let mut third_party = false;
        let mut terminal_error: Option<String> = None;

        loop {
            if current.is_terminal() {
                break;
            }
            if transitions_done >= MAX_TRANSITIONS {
                self.output.write("transition cap exceeded; aborting run");
                terminal_error = Some("transition cap exceeded".to_string());
                current = State::Failed;
                break;
            }

            let from = current;
            let step = self.step(from, &mut third_party).await;
            let next = match step {
                Ok(next) => next,
                Err(e) => {
                    self.output.write(&format!("fatal error handling {from}: {e}"));
                    terminal_error = Some(e.to_string());
                    State::Failed
                }
            };

            if !transitions::is_allowed(from, next) {
                self.output
                    .write(&format!("orchestrator error: {from} -> {next} is not an allowed transition"));
                terminal_error = Some(format!("illegal transition {from} -> {next}"));
                current = State::Failed;
                self.log_transition(from, current, "illegal-transition-guard").await;
                break;
            }

            self.log_transition(from, next, "step").await;
            transitions_done += 1;
            current = next;
        }

        let result = match current {
            State::Complete => "success",
            State::Aborted => "aborted",
            _ => "failed",
        };
        self.output
            .write(&format!("cancellation run finished: result={result} final_state={current}"));

        let _ = self.session_log.finalize(result, current, terminal_error.as_deref());
        let _ = self.browser.close().await;

        RunOutcome {
            result,
            final_state: current,
            output_dir: self.session_log.dir().to_path_buf(),
        }
    }

    async fn log_transition(&mut self, from: State, to: State, trigger: &str) {
        let url = self.browser.url().await.unwrap_or_default();
        let screenshot = self.browser.screenshot().await.unwrap_or_default();
        let screenshot_path = self.session_log.save_screenshot(to, &screenshot).ok().flatten();
        let classification = self
            .browser
            .visible_text()
            .await
            .map(|text| self.heuristic.classify(&url, &text))
            .unwrap_or(subterm_heuristic::Classification {
                state: to,
                confidence: 0.0,
                reason: "unavailable".to_string(),
            });
        self.session_log.record_transition(TransitionLogRow {
            index: self.session_log.transition_count() as u32,
            from: from.to_string(),
            to: to.to_string(),
            trigger: trigger.to_string(),
            url,
            screenshot_path,
            detection_method: "heuristic".to_string(),
            detector_confidence: classification.confidence,
        });
    }

    /// One state-handling step; does not itself validate the transition
    /// against the allowed-transition graph (the caller does that
    /// uniformly, per spec.md's "any other attempt is a fatal orchestrator
    /// error").
    async fn step(&mut self, state: State, third_party: &mut bool) -> Result<State, CoreError> {
        match state {
            State::Start => self.handle_start().await,
            State::LoginRequired => self.handle_login_required().await,
            State::AccountCancelled => {
                self.output.write("account already cancelled");
                Ok(State::Complete)
            }
            State::ThirdPartyBilling => {
                *third_party = true;
                let text = self.browser.visible_text().await.unwrap_or_default();
                let provider = identify_third_party_provider(&text).unwrap_or("a third-party biller");
                self.output.write(&format!(
                    "this subscription is billed through {provider}; cancel it directly with {provider} instead"
                ));
                Ok(State::Failed)
            }
            State::FinalConfirmation => self.handle_final_confirmation().await,
            State::AccountActive | State::RetentionOffer | State::ExitSurvey | State::Unknown => {
                self.handle_delegated(state).await
            }
            State::Complete | State::Aborted | State::Failed => {
                unreachable!("terminal states never reach step()")
            }
        }
    }

    async fn handle_start(&mut self) -> Result<State, CoreError> {
        let entry_url = self.service.entry_url().to_string();
        let browser = Arc::clone(&self.browser);
        let policy = RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        };
        retry_with_backoff(policy, || {
            let browser = Arc::clone(&browser);
            let url = entry_url.clone();
            async move { browser.navigate(&url, Duration::from_secs(30)).await }
        })
        .await?;

        let url = self.browser.url().await?;
        let text = self.browser.visible_text().await?;
        let classification = self.heuristic.classify(&url, &text);
        Ok(classification.state)
    }

    async fn handle_login_required(&mut self) -> Result<State, CoreError> {
        self.output.write("waiting for operator to authenticate manually...");
        self.checkpoint
            .wait_for_authentication(self.auth_timeout)
            .await
            .map_err(|_| CoreError::UserAborted("authentication checkpoint timed out".to_string()))?;

        let url = self.browser.url().await?;
        let text = self.browser.visible_text().await?;
        Ok(self.heuristic.classify(&url, &text).state)
    }

    async fn handle_final_confirmation(&mut self) -> Result<State, CoreError> {
        if self.dry_run {
            self.output.write("dry run: short-circuiting final confirmation without clicking");
            return Ok(State::Complete);
        }

        self.output.write("waiting for operator to approve the final, irreversible step...");
        let approved = self
            .checkpoint
            .wait_for_confirmation(self.confirm_timeout)
            .await
            .map_err(|_| CoreError::UserAborted("final confirmation checkpoint timed out".to_string()))?;

        if !approved {
            return Ok(State::Aborted);
        }

        self.service.hardcoded_handle(State::FinalConfirmation, self.browser.as_ref()).await
    }

    async fn handle_delegated(&mut self, state: State) -> Result<State, CoreError> {
        if let Some((goal, expected_next)) = transitions::goal_for(state) {
            if let Some(agent) = self.agent.clone() {
                match agent.handle_state(goal, expected_next).await {
                    Ok(next) => return Ok(next),
                    Err(e) => {
                        tracing::warn!("agent raised LM transport error for {state}, falling back: {e}");
                        self.session_log.record_ai_call(AiCallLogRow {
                            state: state.to_string(),
                            attempt: 0,
                            confidence: 0.0,
                            reasoning: format!("LM transport error: {e}"),
                        });
                    }
                }
            }
        }
        self.service.hardcoded_handle(state, self.browser.as_ref()).await
    }
}
