//! `ClaudeHttpClient`: real HTTP+SSE implementation of [`crate::LmClient`]
//! against a Claude-compatible `/v1/messages` endpoint.
//!
//! Wire mapping follows the Anthropic Messages API shape: content blocks
//! nest image bytes under `{"type": "image", "source": {...}}`, tool results
//! are `{"type": "tool_result", "tool_use_id", "content"}`, and streaming
//! uses `event:`/`data:` SSE frames (`content_block_delta`, `message_delta`,
//! `message_stop`). `eventsource-stream` turns the response byte stream into
//! typed SSE events, the same crate the agent-SDK corpus (`open-agent-sdk-rust`)
//! declares for this purpose.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};
use subterm_error::CoreError;
use tokio::sync::mpsc;

use crate::{
    CompletionRequest, ContentBlock, LmClient, LmResponse, LmStreamEvent, LmUsage, Message,
    ResponseBlock, ToolChoiceMode,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// HTTP client against the Claude Messages API.
pub struct ClaudeHttpClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ClaudeHttpClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// For tests: point at a `wiremock` server instead of the real endpoint.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        ClaudeHttpClient {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn build_body(request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(message_to_wire)
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });

        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);

            body["tool_choice"] = match &request.tool_choice {
                ToolChoiceMode::Auto => json!({"type": "auto"}),
                ToolChoiceMode::None => json!({"type": "none"}),
                ToolChoiceMode::Required => json!({"type": "any"}),
                ToolChoiceMode::Tool(name) => json!({"type": "tool", "name": name}),
            };
        }

        body
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response, CoreError> {
        let mut body = Self::build_body(request);
        body["stream"] = json!(stream);

        let resp = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CoreError::Transient(format!("LM request failed: {e}"))
                } else {
                    CoreError::Transient(format!("LM request error: {e}"))
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CoreError::RateLimit("LM endpoint returned 429".to_string()));
        }
        if status.is_server_error() {
            return Err(CoreError::Transient(format!(
                "LM endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::Internal(format!(
                "LM endpoint returned {status}: {text}"
            )));
        }
        Ok(resp)
    }
}

fn message_to_wire(m: &Message) -> Value {
    json!({
        "role": m.role.as_str(),
        "content": m.content.iter().map(content_block_to_wire).collect::<Vec<_>>(),
    })
}

fn content_block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image { media_type, data } => json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
    }
}

fn parse_non_streaming_body(value: &Value) -> Result<LmResponse, CoreError> {
    let content = value
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| CoreError::Internal("LM response missing content array".into()))?;

    let mut blocks = Vec::with_capacity(content.len());
    for block in content {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                blocks.push(ResponseBlock::Text(text.to_string()));
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(json!({}));
                blocks.push(ResponseBlock::ToolUse { id, name, input });
            }
            _ => {}
        }
    }

    let stop_reason = value
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("end_turn")
        .to_string();

    let usage = value
        .get("usage")
        .map(|u| LmUsage {
            input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        })
        .unwrap_or_default();

    Ok(LmResponse {
        content: blocks,
        stop_reason,
        usage,
    })
}

#[async_trait::async_trait]
impl LmClient for ClaudeHttpClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<LmResponse, CoreError> {
        let resp = self.send(request, false).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Internal(format!("LM response decode: {e}")))?;
        parse_non_streaming_body(&value)
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        chunk_tx: Option<mpsc::Sender<LmStreamEvent>>,
    ) -> Result<LmResponse, CoreError> {
        let Some(chunk_tx) = chunk_tx else {
            return self.complete(request).await;
        };

        let resp = self.send(request, true).await?;
        let mut events = resp.bytes_stream().eventsource();

        let mut text_blocks: Vec<String> = Vec::new();
        let mut current_text = String::new();
        let mut tool_uses: Vec<(String, String, String)> = Vec::new(); // id, name, accumulated json
        let mut current_tool: Option<(String, String, String)> = None;
        let mut stop_reason = "end_turn".to_string();
        let mut usage = LmUsage::default();

        while let Some(event) = events.next().await {
            let event = event.map_err(|e| CoreError::Transient(format!("LM SSE error: {e}")))?;
            let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
                continue;
            };
            match event.event.as_str() {
                "content_block_start" => {
                    if let Some(block) = payload.get("content_block") {
                        if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                            let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                            let name = block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string();
                            let _ = chunk_tx
                                .send(LmStreamEvent::ToolUseStart {
                                    id: id.clone(),
                                    name: name.clone(),
                                })
                                .await;
                            current_tool = Some((id, name, String::new()));
                        }
                    }
                }
                "content_block_delta" => {
                    if let Some(delta) = payload.get("delta") {
                        match delta.get("type").and_then(|t| t.as_str()) {
                            Some("text_delta") => {
                                let text = delta.get("text").and_then(|v| v.as_str()).unwrap_or("");
                                current_text.push_str(text);
                                let _ = chunk_tx
                                    .send(LmStreamEvent::TextDelta(text.to_string()))
                                    .await;
                            }
                            Some("input_json_delta") => {
                                let partial = delta
                                    .get("partial_json")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("");
                                if let Some((id, _, acc)) = current_tool.as_mut() {
                                    acc.push_str(partial);
                                    let _ = chunk_tx
                                        .send(LmStreamEvent::ToolUseInputDelta {
                                            id: id.clone(),
                                            partial_json: partial.to_string(),
                                        })
                                        .await;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                "content_block_stop" => {
                    if !current_text.is_empty() {
                        text_blocks.push(std::mem::take(&mut current_text));
                    }
                    if let Some(tool) = current_tool.take() {
                        tool_uses.push(tool);
                    }
                }
                "message_delta" => {
                    if let Some(sr) = payload
                        .get("delta")
                        .and_then(|d| d.get("stop_reason"))
                        .and_then(|s| s.as_str())
                    {
                        stop_reason = sr.to_string();
                    }
                    if let Some(u) = payload.get("usage") {
                        usage.output_tokens =
                            u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    }
                }
                "message_start" => {
                    if let Some(u) = payload.get("message").and_then(|m| m.get("usage")) {
                        usage.input_tokens =
                            u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    }
                }
                "message_stop" => {
                    let _ = chunk_tx.send(LmStreamEvent::Usage(usage)).await;
                    break;
                }
                "error" => {
                    return Err(CoreError::Transient(format!(
                        "LM stream error event: {}",
                        event.data
                    )));
                }
                _ => {}
            }
        }

        let mut content = Vec::new();
        for text in text_blocks {
            content.push(ResponseBlock::Text(text));
        }
        for (id, name, acc) in tool_uses {
            let input = serde_json::from_str(&acc).unwrap_or(json!({}));
            content.push(ResponseBlock::ToolUse { id, name, input });
        }

        Ok(LmResponse {
            content,
            stop_reason,
            usage,
        })
    }
}

/// Wraps [`ClaudeHttpClient::complete`]/[`complete_stream`] with a per-call
/// wall-clock cap distinct from the request's own `timeout` field — used by
/// the planner to bound the total of its (at most two) sequential calls
/// (spec.md §4.3: "total per plan <= 60s").
pub async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Result<T, CoreError>
where
    F: std::future::Future<Output = Result<T, CoreError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| CoreError::Transient("LM call exceeded deadline".into()))?
}
