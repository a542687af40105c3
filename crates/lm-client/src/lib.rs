//! Shared language-model client: wraps an HTTP+SSE connection to a
//! Claude-compatible `/v1/messages` endpoint. Supports vision content blocks,
//! streaming, structured tool-use responses, retries on transient failures,
//! and a per-request timeout and token budget (spec.md §2, shared components).
//!
//! The trait shape (`invoke` + `invoke_stream` with a default streaming
//! fallback) follows the teacher's `loom::llm::LlmClient`; the retry/backoff
//! policy and the choice of `reqwest` + `eventsource-stream` for SSE parsing
//! follow the `open-agent-sdk-rust` stack, which declares `eventsource-stream`
//! for exactly this purpose.

mod client;
mod retry;

pub use client::ClaudeHttpClient;
pub use retry::{retry_with_backoff, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subterm_error::CoreError;
use tokio::sync::mpsc;

/// One block of message content: text or a base64-encoded image (vision).
///
/// This is the client's internal representation; [`ClaudeHttpClient`] maps
/// it to and from the wire shape of the Messages API (which nests image
/// bytes under a `source` object) rather than deriving serde directly on
/// this type, so the wire format can evolve independently.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text { text: String },
    Image { media_type: String, data: String },
    /// A tool result fed back to the model (role: user) after a tool call.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// A tool-use block echoed back into history (role: assistant).
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        ContentBlock::Text { text: s.into() }
    }

    /// Builds an image block from raw PNG bytes (base64-encodes internally).
    pub fn png_image(bytes: &[u8]) -> Self {
        use base64::Engine;
        ContentBlock::Image {
            media_type: "image/png".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// One message in the conversation sent to the model.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A tool the model may call, described by JSON Schema input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Controls whether/which tool the model must use.
#[derive(Debug, Clone, Default)]
pub enum ToolChoiceMode {
    #[default]
    Auto,
    None,
    Required,
    /// Force a specific named tool (used by the planner to force `browser_action`).
    Tool(String),
}

/// A request for one completion turn.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoiceMode,
    pub max_tokens: u32,
    /// Per-call wall-clock timeout; elapsing maps to `CoreError::Transient`
    /// so orchestrating callers can retry (spec.md §4.3: 30s per call).
    pub timeout: std::time::Duration,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        CompletionRequest {
            model: model.into(),
            system: None,
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoiceMode::Auto,
            max_tokens: 4096,
            timeout: std::time::Duration::from_secs(30),
        }
    }
}

/// One block of the model's response.
#[derive(Debug, Clone)]
pub enum ResponseBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LmUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct LmResponse {
    pub content: Vec<ResponseBlock>,
    pub stop_reason: String,
    pub usage: LmUsage,
}

impl LmResponse {
    /// Concatenates all `Text` blocks, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ResponseBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All `ToolUse` blocks, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ResponseBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// One incremental event during a streamed completion.
#[derive(Debug, Clone)]
pub enum LmStreamEvent {
    TextDelta(String),
    ToolUseStart { id: String, name: String },
    ToolUseInputDelta { id: String, partial_json: String },
    Usage(LmUsage),
}

/// Language-model client: given a request, returns the assistant's response.
///
/// Implementations: [`ClaudeHttpClient`] (real HTTP+SSE client). Mirrors the
/// teacher's `LlmClient` trait shape, including the default `invoke_stream`
/// that degrades to one full chunk when a real implementation has nothing
/// better to offer.
#[async_trait]
pub trait LmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<LmResponse, CoreError>;

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        chunk_tx: Option<mpsc::Sender<LmStreamEvent>>,
    ) -> Result<LmResponse, CoreError> {
        let response = self.complete(request).await?;
        if let Some(tx) = chunk_tx {
            let text = response.text();
            if !text.is_empty() {
                let _ = tx.send(LmStreamEvent::TextDelta(text)).await;
            }
            let _ = tx.send(LmStreamEvent::Usage(response.usage)).await;
        }
        Ok(response)
    }
}

/// Best-effort USD cost estimate; returns `None` for unknown models rather
/// than guessing (spec.md: `cost_estimate_usd` is "a positive float or null").
pub fn estimate_cost_usd(model: &str, usage: LmUsage) -> Option<f64> {
    // Per-million-token prices (USD), input/output, for the models this
    // workspace is configured to talk to by default.
    let (input_per_m, output_per_m) = match model {
        "claude-sonnet-4-5-20250929" => (3.0, 15.0),
        "claude-opus-4-20250514" => (15.0, 75.0),
        "claude-haiku-4-20250514" => (0.80, 4.0),
        _ => return None,
    };
    let input_cost = (usage.input_tokens as f64 / 1_000_000.0) * input_per_m;
    let output_cost = (usage.output_tokens as f64 / 1_000_000.0) * output_per_m;
    Some(input_cost + output_cost)
}
