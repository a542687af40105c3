//! axum app: shared state and router (spec.md §4.6 "HTTP surface").

use std::sync::Arc;

use axum::routing::post;
use axum::Router;

use crate::handlers::chat_completions;
use crate::provider::Provider;

/// Process-wide app state: one [`Provider`] shared across every request
/// (spec.md §5 "there is no shared mutable state across requests other
/// than the provider singleton").
pub struct AppState {
    pub provider: Provider,
}

impl Default for AppState {
    fn default() -> Self {
        AppState {
            provider: Provider::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}
