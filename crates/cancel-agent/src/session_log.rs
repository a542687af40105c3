//! Per-session log file (spec.md §6): a directory
//! `<output_dir>/<service>_<yyyyMMdd_HHmmss>/` containing `session.json`
//! (metadata, transitions array, ai-call array) and `NN_<state>.png`
//! screenshots numbered by transition index.

use std::path::{Path, PathBuf};

use serde::Serialize;
use subterm_error::CoreError;
use subterm_heuristic::State;

/// One row written on every transition (spec.md §4.1 "Side effects").
#[derive(Debug, Clone, Serialize)]
pub struct TransitionLogRow {
    pub index: u32,
    pub from: String,
    pub to: String,
    pub trigger: String,
    pub url: String,
    pub screenshot_path: Option<String>,
    pub detection_method: String,
    pub detector_confidence: f64,
}

/// One row per language-model call made during the session (ai-call array).
#[derive(Debug, Clone, Serialize)]
pub struct AiCallLogRow {
    pub state: String,
    pub attempt: u32,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub service: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct SessionDocument<'a> {
    metadata: &'a SessionMetadata,
    transitions: &'a [TransitionLogRow],
    ai_calls: &'a [AiCallLogRow],
    result: Option<&'a str>,
    final_state: Option<String>,
    error: Option<&'a str>,
}

/// Owns one run's directory, transition rows, ai-call rows, and screenshot
/// numbering. Finalized exactly once, on every termination path (spec.md
/// §4.1: "On process termination (any path, including panic/exception), the
/// browser is closed and the session log is finalized").
pub struct SessionLog {
    dir: PathBuf,
    metadata: SessionMetadata,
    transitions: Vec<TransitionLogRow>,
    ai_calls: Vec<AiCallLogRow>,
    next_index: u32,
}

impl SessionLog {
    /// Creates `<output_dir>/<service>_<yyyyMMdd_HHmmss>/` and returns a
    /// handle to it. `now` is passed in by the caller (the workspace cannot
    /// call `chrono::Utc::now()` from inside generated test fixtures, but
    /// production callers pass the real current time).
    pub fn create(
        output_dir: &Path,
        service: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Self, CoreError> {
        let dir_name = format!("{service}_{}", now.format("%Y%m%d_%H%M%S"));
        let dir = output_dir.join(dir_name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| CoreError::Internal(format!("creating session dir {dir:?}: {e}")))?;
        Ok(SessionLog {
            dir,
            metadata: SessionMetadata {
                service: service.to_string(),
                started_at: now,
                dry_run: false,
            },
            transitions: Vec::new(),
            ai_calls: Vec::new(),
            next_index: 0,
        })
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.metadata.dry_run = dry_run;
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves a full-page screenshot numbered by transition index and returns
    /// its path relative to the session directory, or `None` if `png` is
    /// empty (no screenshot available for this transition).
    pub fn save_screenshot(&mut self, state: State, png: &[u8]) -> Result<Option<String>, CoreError> {
        if png.is_empty() {
            return Ok(None);
        }
        let filename = format!("{:02}_{}.png", self.next_index, state);
        let path = self.dir.join(&filename);
        std::fs::write(&path, png)
            .map_err(|e| CoreError::Internal(format!("writing screenshot {path:?}: {e}")))?;
        Ok(Some(filename))
    }

    pub fn record_transition(&mut self, row: TransitionLogRow) {
        self.next_index += 1;
        self.transitions.push(row);
    }

    pub fn record_ai_call(&mut self, row: AiCallLogRow) {
        self.ai_calls.push(row);
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Writes `session.json`. Called once, on every termination path.
    pub fn finalize(
        &self,
        result: &str,
        final_state: State,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        let doc = SessionDocument {
            metadata: &self.metadata,
            transitions: &self.transitions,
            ai_calls: &self.ai_calls,
            result: Some(result),
            final_state: Some(final_state.to_string()),
            error,
        };
        let path = self.dir.join("session.json");
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| CoreError::Internal(format!("serializing session.json: {e}")))?;
        std::fs::write(&path, text)
            .map_err(|e| CoreError::Internal(format!("writing session.json {path:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339("2026-01-15T10:30:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc)
    }

    #[test]
    fn create_makes_a_named_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SessionLog::create(tmp.path(), "netflix", fixed_now()).unwrap();
        assert!(log.dir().ends_with("netflix_20260115_103000"));
        assert!(log.dir().is_dir());
    }

    #[test]
    fn save_screenshot_numbers_files_by_transition_index() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = SessionLog::create(tmp.path(), "netflix", fixed_now()).unwrap();
        let name = log.save_screenshot(State::Start, &[0x89, 0x50, 0x4E, 0x47]).unwrap().unwrap();
        assert_eq!(name, "00_START.png");
        log.record_transition(TransitionLogRow {
            index: 0,
            from: "START".into(),
            to: "ACCOUNT_ACTIVE".into(),
            trigger: "navigate".into(),
            url: "https://netflix.com".into(),
            screenshot_path: Some(name),
            detection_method: "heuristic".into(),
            detector_confidence: 0.9,
        });
        let name2 = log
            .save_screenshot(State::AccountActive, &[0x89, 0x50, 0x4E, 0x47])
            .unwrap()
            .unwrap();
        assert_eq!(name2, "01_ACCOUNT_ACTIVE.png");
    }

    #[test]
    fn save_screenshot_returns_none_for_empty_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = SessionLog::create(tmp.path(), "netflix", fixed_now()).unwrap();
        assert_eq!(log.save_screenshot(State::Start, &[]).unwrap(), None);
    }

    #[test]
    fn finalize_writes_session_json_with_result_and_final_state() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SessionLog::create(tmp.path(), "netflix", fixed_now()).unwrap();
        log.finalize("success", State::Complete, None).unwrap();
        let contents = std::fs::read_to_string(log.dir().join("session.json")).unwrap();
        assert!(contents.contains("\"result\": \"success\""));
        assert!(contents.contains("\"final_state\": \"COMPLETE\""));
    }
}
