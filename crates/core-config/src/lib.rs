//! Loads the fixed set of environment keys for each core into an immutable
//! config value, validated at construction. Generalizes the teacher's
//! `config` crate (env precedence loading) to a closed, explicit key set
//! rather than an XDG/dotenv merge, since spec.md §6 names every key.

use std::path::PathBuf;
use std::time::Duration;

use subterm_error::CoreError;

/// One log-sink mode for Core B's audit logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

impl std::str::FromStr for LogOutput {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(LogOutput::Stdout),
            "file" => Ok(LogOutput::File),
            "both" => Ok(LogOutput::Both),
            other => Err(CoreError::Configuration(format!(
                "CLAUDE_DA_LOG_OUTPUT must be one of stdout|file|both, got {other:?}"
            ))),
        }
    }
}

/// Immutable configuration for Core B (the analyst gateway), read once at
/// process startup from the environment keys in spec.md §6.
#[derive(Debug, Clone)]
pub struct CoreBConfig {
    pub anthropic_api_key: String,
    pub db_path: PathBuf,
    pub model: String,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub input_max_chars: usize,
    pub log_output: LogOutput,
    pub log_file: PathBuf,
    pub log_verbose: bool,
    /// Hard-coded per spec.md §4.7; not configurable by environment but kept
    /// here so every downstream crate reads one immutable value.
    pub agent_deadline: Duration,
    /// Tool name prefix (e.g. `mcp__sqlite__`); spec.md's Open Questions ask
    /// that this be treated as configuration rather than hard-coded.
    pub tool_prefix: String,
    /// Subprocess command for the database tool server (spec.md §4.7:
    /// "one subprocess tool server configured by name (sqlite) with
    /// command, args, and database file path").
    pub tool_command: String,
    pub tool_args: Vec<String>,
}

impl CoreBConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let anthropic_api_key = require_env("ANTHROPIC_API_KEY")?;

        let db_path = env_or("CLAUDE_DA_DB_PATH", "./demo.db").into();
        let model = env_or("CLAUDE_DA_MODEL", "claude-sonnet-4-5-20250929");

        let max_turns = parse_env_or("CLAUDE_DA_MAX_TURNS", 10u32)?;
        let max_budget_usd = parse_env_or("CLAUDE_DA_MAX_BUDGET_USD", 0.50f64)?;
        let input_max_chars = parse_env_or("CLAUDE_DA_INPUT_MAX_CHARS", 10_000usize)?;

        let log_output: LogOutput = env_or("CLAUDE_DA_LOG_OUTPUT", "stdout").parse()?;
        let log_file = env_or("CLAUDE_DA_LOG_FILE", "./claude-da-audit.jsonl").into();
        let log_verbose = parse_env_or("CLAUDE_DA_LOG_VERBOSE", false)?;

        let tool_prefix = env_or("CLAUDE_DA_TOOL_PREFIX", "mcp__sqlite__");
        let tool_command = env_or("CLAUDE_DA_TOOL_COMMAND", "mcp-server-sqlite");
        let tool_args: Vec<String> = env_or("CLAUDE_DA_TOOL_ARGS", "")
            .split_whitespace()
            .map(String::from)
            .collect();

        if max_turns == 0 {
            return Err(CoreError::Configuration(
                "CLAUDE_DA_MAX_TURNS must be >= 1".into(),
            ));
        }
        if max_budget_usd <= 0.0 {
            return Err(CoreError::Configuration(
                "CLAUDE_DA_MAX_BUDGET_USD must be > 0".into(),
            ));
        }

        Ok(CoreBConfig {
            anthropic_api_key,
            db_path,
            model,
            max_turns,
            max_budget_usd,
            input_max_chars,
            log_output,
            log_file,
            log_verbose,
            agent_deadline: Duration::from_secs(240),
            tool_prefix,
            tool_command,
            tool_args,
        })
    }
}

/// Immutable configuration for Core A (the cancellation agent), read once
/// per CLI invocation from the environment keys in spec.md §6.
#[derive(Debug, Clone)]
pub struct CoreAConfig {
    /// Optional: absent means heuristic-only (no planner) runs.
    pub anthropic_api_key: Option<String>,
    pub output_dir: PathBuf,
    pub page_timeout: Duration,
    pub element_timeout: Duration,
}

impl CoreAConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        let output_dir = env_or("SUBTERMINATOR_OUTPUT", "./output").into();
        let page_timeout_ms: u64 = parse_env_or("SUBTERMINATOR_PAGE_TIMEOUT", 30_000u64)?;
        let element_timeout_ms: u64 = parse_env_or("SUBTERMINATOR_ELEMENT_TIMEOUT", 10_000u64)?;

        Ok(CoreAConfig {
            anthropic_api_key,
            output_dir,
            page_timeout: Duration::from_millis(page_timeout_ms),
            element_timeout: Duration::from_millis(element_timeout_ms),
        })
    }
}

fn require_env(key: &str) -> Result<String, CoreError> {
    std::env::var(key)
        .map_err(|_| CoreError::Configuration(format!("missing required env var {key}")))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|e| CoreError::Configuration(format!("invalid {key}={v:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that touch process env must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_core_b_env() {
        for key in [
            "ANTHROPIC_API_KEY",
            "CLAUDE_DA_DB_PATH",
            "CLAUDE_DA_MODEL",
            "CLAUDE_DA_MAX_TURNS",
            "CLAUDE_DA_MAX_BUDGET_USD",
            "CLAUDE_DA_INPUT_MAX_CHARS",
            "CLAUDE_DA_LOG_OUTPUT",
            "CLAUDE_DA_LOG_FILE",
            "CLAUDE_DA_LOG_VERBOSE",
            "CLAUDE_DA_TOOL_PREFIX",
            "CLAUDE_DA_TOOL_COMMAND",
            "CLAUDE_DA_TOOL_ARGS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn core_b_requires_api_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_core_b_env();
        let err = CoreBConfig::from_env().unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn core_b_applies_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_core_b_env();
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test");
        let cfg = CoreBConfig::from_env().unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("./demo.db"));
        assert_eq!(cfg.max_turns, 10);
        assert!((cfg.max_budget_usd - 0.50).abs() < f64::EPSILON);
        assert_eq!(cfg.input_max_chars, 10_000);
        assert_eq!(cfg.log_output, LogOutput::Stdout);
        assert_eq!(cfg.tool_prefix, "mcp__sqlite__");
        assert_eq!(cfg.tool_command, "mcp-server-sqlite");
        assert!(cfg.tool_args.is_empty());
        clear_core_b_env();
    }

    #[test]
    fn core_b_rejects_zero_max_turns() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_core_b_env();
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test");
        std::env::set_var("CLAUDE_DA_MAX_TURNS", "0");
        let err = CoreBConfig::from_env().unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
        clear_core_b_env();
    }

    #[test]
    fn core_a_works_without_api_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("ANTHROPIC_API_KEY");
        std::env::remove_var("SUBTERMINATOR_OUTPUT");
        let cfg = CoreAConfig::from_env().unwrap();
        assert!(cfg.anthropic_api_key.is_none());
        assert_eq!(cfg.output_dir, PathBuf::from("./output"));
        assert_eq!(cfg.page_timeout, Duration::from_millis(30_000));
    }
}
