//! Provider bridge (spec.md §4.9): a process-wide singleton that lazily
//! discovers the database schema, verifies it is read-only, builds the
//! system prompt, and holds the language-model client and audit logger.
//! First request pays initialization; concurrent first requests observe
//! exactly one init (spec.md §8 testable property #7); a failed init is
//! cached so subsequent requests fail fast without retrying (§4.9).

use std::sync::Arc;

use subterm_audit::AuditLogger;
use subterm_config::CoreBConfig;
use subterm_error::CoreError;
use subterm_lm::{ClaudeHttpClient, LmClient};
use tokio::sync::Mutex;

/// Immutable, process-wide state built once from the environment and the
/// database file. Everything here is read-only after construction; the
/// only other process-wide state is [`Provider`]'s own init cache.
pub struct ProviderInner {
    pub config: CoreBConfig,
    pub system_prompt: String,
    pub lm: Arc<dyn LmClient>,
    pub audit: AuditLogger,
}

/// The lazily-initialized singleton. One instance lives for the process
/// lifetime (owned by the axum `AppState`); `get` is safe to call from
/// any number of concurrent request handlers.
pub struct Provider {
    // `None` until the first call to `get`; afterward holds the init
    // result (`Ok` or a cached `Err`) so later callers never re-attempt
    // initialization on failure.
    state: Mutex<Option<Result<Arc<ProviderInner>, CoreError>>>,
}

impl Default for Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider {
    pub fn new() -> Self {
        Provider {
            state: Mutex::new(None),
        }
    }

    /// Returns the initialized provider, running initialization exactly
    /// once across however many requests race to call this concurrently:
    /// the `Mutex` serializes the first caller's init against everyone
    /// else, who then observe the cached result instead of re-running it.
    pub async fn get(&self) -> Result<Arc<ProviderInner>, CoreError> {
        let mut guard = self.state.lock().await;
        if let Some(cached) = guard.as_ref() {
            return cached.clone();
        }
        tracing::info!("provider: first request, initializing");
        let result = Self::init().await;
        if let Err(e) = &result {
            tracing::error!("provider: initialization failed, caching error: {e}");
        }
        *guard = Some(result.clone());
        result
    }

    async fn init() -> Result<Arc<ProviderInner>, CoreError> {
        let config = CoreBConfig::from_env()?;

        let db_path = config.db_path.clone();
        let schema = tokio::task::spawn_blocking(move || claude_da_schema::discover_schema(&db_path))
            .await
            .map_err(|e| CoreError::Internal(format!("schema discovery task join: {e}")))??;

        let probe_path = config.db_path.clone();
        tokio::task::spawn_blocking(move || claude_da_schema::verify_read_only(&probe_path))
            .await
            .map_err(|e| CoreError::Internal(format!("read-only probe task join: {e}")))??;

        let system_prompt = claude_da_schema::build_system_prompt(&schema.to_prompt_text())?;
        let lm: Arc<dyn LmClient> = Arc::new(ClaudeHttpClient::new(config.anthropic_api_key.clone()));
        let audit = AuditLogger::new(config.log_output, config.log_file.clone());

        Ok(Arc::new(ProviderInner {
            config,
            system_prompt,
            lm,
            audit,
        }))
    }
}
