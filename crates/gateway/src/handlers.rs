//! `POST /v1/chat/completions` (spec.md §4.6): validates input length,
//! reduces the request to a single question, runs a fresh analyst agent
//! session, and renders either a `ChatCompletion` body or an SSE stream of
//! `ChatCompletionChunk`s, writing the audit entry fire-and-forget either
//! way (spec.md glossary "Fire-and-forget audit").

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use claude_da_analyst::{AnalystAgentSession, AnalystStreamEvent};
use subterm_error::CoreError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::app::AppState;
use crate::dto::{
    reduce_to_prompt, total_input_chars, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest,
    Choice, ResponseMessage, Usage,
};
use crate::error::GatewayError;

const REQUIRED_MODEL: &str = "claude-da/analyst";

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, GatewayError> {
    let provider = state.provider.get().await?;

    if request.model != REQUIRED_MODEL {
        return Err(CoreError::UnsupportedModel(format!(
            "model must be {REQUIRED_MODEL:?}, got {:?}",
            request.model
        ))
        .into());
    }

    let input_chars = total_input_chars(&request.messages);
    if input_chars > provider.config.input_max_chars {
        return Err(CoreError::InputValidation(format!(
            "input is {input_chars} chars, exceeds the {}-char limit",
            provider.config.input_max_chars
        ))
        .into());
    }

    let question = reduce_to_prompt(&request.messages);
    let stream = request.stream;

    let session = AnalystAgentSession::spawn(&provider.config, provider.system_prompt.clone(), provider.lm.clone())
        .await?;

    if stream {
        Ok(stream_response(state, session, question).await)
    } else {
        Ok(non_streaming_response(state, session, question, provider.config.model.clone()).await?)
    }
}

async fn non_streaming_response(
    state: Arc<AppState>,
    session: AnalystAgentSession,
    question: String,
    model: String,
) -> Result<Response, GatewayError> {
    let entry = session.run(&question, None).await?;

    let usage = Usage {
        prompt_tokens: entry.metadata.prompt_tokens,
        completion_tokens: entry.metadata.completion_tokens,
        total_tokens: entry.metadata.prompt_tokens + entry.metadata.completion_tokens,
    };

    let response = ChatCompletion {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: ChatCompletion::OBJECT,
        created: now_secs(),
        model,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant",
                content: entry.final_response.clone(),
            },
            finish_reason: "stop".to_string(),
        }],
        usage,
    };

    dispatch_audit(&state, entry).await;

    Ok(Json(response).into_response())
}

/// Drives the session in one task: a nested task forwards each
/// `AnalystStreamEvent::Token` onto the SSE line channel as it is produced,
/// and once `session.run` resolves we join that forwarder — guaranteeing
/// every token line has been written — before emitting the final chunk and
/// dispatching the audit entry (spec.md §4.6: "the audit is written after
/// the final chunk is yielded").
async fn stream_response(state: Arc<AppState>, session: AnalystAgentSession, question: String) -> Response {
    let (event_tx, event_rx) = mpsc::channel::<AnalystStreamEvent>(64);
    let (line_tx, line_rx) = mpsc::channel::<String>(64);

    tokio::spawn(async move {
        let forward_tx = line_tx.clone();
        let forward = tokio::spawn(async move {
            let mut rx = event_rx;
            while let Some(event) = rx.recv().await {
                if let AnalystStreamEvent::Token(text) = event {
                    if !text.is_empty() {
                        let chunk = ChatCompletionChunk::token(text);
                        if forward_tx
                            .send(serde_json::to_string(&chunk).unwrap_or_default())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        let entry_result = session.run(&question, Some(event_tx)).await;
        let _ = forward.await;

        match entry_result {
            Ok(entry) => {
                let usage = Usage {
                    prompt_tokens: entry.metadata.prompt_tokens,
                    completion_tokens: entry.metadata.completion_tokens,
                    total_tokens: entry.metadata.prompt_tokens + entry.metadata.completion_tokens,
                };
                let _ = line_tx
                    .send(serde_json::to_string(&ChatCompletionChunk::done(usage)).unwrap_or_default())
                    .await;
                dispatch_audit(&state, entry).await;
            }
            Err(e) => {
                tracing::error!("analyst session streaming failed: {e}");
                let _ = line_tx
                    .send(serde_json::to_string(&ChatCompletionChunk::done(Usage::default())).unwrap_or_default())
                    .await;
            }
        }
        // spec.md §6 "HTTP wire format": "stream terminates with `data: [DONE]`".
        let _ = line_tx.send("[DONE]".to_string()).await;
    });

    let stream = ReceiverStream::new(line_rx).map(|line| Ok::<_, Infallible>(Event::default().data(line)));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn dispatch_audit(state: &Arc<AppState>, entry: claude_da_analyst::AuditEntry) {
    if let Ok(provider) = state.provider.get().await {
        provider.audit.dispatch_fire_and_forget(entry);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
