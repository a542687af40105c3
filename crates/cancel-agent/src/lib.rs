//! Core A: the agent loop plus the cancellation orchestrator that drives a
//! browser through a subscription-cancellation state machine (spec.md §4.1,
//! §4.2).

mod agent;
mod orchestrator;
mod results;
mod service;
mod session_log;
mod transitions;

pub use agent::Agent;
pub use orchestrator::{
    exit_code_for, AutoApproveCheckpoint, CancellationOrchestrator, HumanCheckpoint, OutputSink,
    RunOutcome, StdoutSink,
};
pub use results::{matches_expected, valid_progressions, ExecutionResult, ValidationResult};
pub use service::{NetflixService, Service};
pub use session_log::{AiCallLogRow, SessionLog, SessionMetadata, TransitionLogRow};
pub use transitions::{allowed, goal_for, is_allowed};

pub use subterm_heuristic::State;
