//! OpenAI-compatible wire DTOs for `/v1/chat/completions` (spec.md §4.6,
//! §6 "HTTP wire format").
//!
//! Request shape follows the teacher's `openai_sse::ChatCompletionRequest`
//! (`loom::openai_sse::request`); the non-streaming `ChatCompletion`
//! response and the `ChatCompletionChunk` streaming shape follow
//! `loom::openai_sse::chunk`, generalized from a fixed ReAct single-choice
//! response to this gateway's own usage/finish-reason fields.

use serde::{Deserialize, Serialize};

/// Chat completion request body. Only `model`, `messages`, and `stream`
/// are consumed (spec.md §4.6); any other field is accepted and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Message content: a plain string, or an OpenAI multimodal parts array,
/// accepted so clients sending either shape never hit a deserialize error.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentPart>),
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::String(s) => s.clone(),
            MessageContent::Array(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn len_chars(&self) -> usize {
        self.as_text().chars().count()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: Option<String>,
    pub text: Option<String>,
}

/// Non-streaming response (spec.md §6 "Success, non-streaming").
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatCompletion {
    pub const OBJECT: &'static str = "chat.completion";
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One SSE chunk of a streamed chat completion (spec.md §4.6 "Streaming
/// contract"). Non-terminal chunks carry `text`/`is_finished: false`;
/// the final chunk carries `is_finished: true`, `finish_reason: "stop"`,
/// and `usage`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub text: String,
    pub is_finished: bool,
    pub finish_reason: String,
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionChunk {
    pub fn token(text: String) -> Self {
        ChatCompletionChunk {
            text,
            is_finished: false,
            finish_reason: String::new(),
            index: 0,
            usage: None,
        }
    }

    pub fn done(usage: Usage) -> Self {
        ChatCompletionChunk {
            text: String::new(),
            is_finished: true,
            finish_reason: "stop".to_string(),
            index: 0,
            usage: Some(usage),
        }
    }
}

/// Reduces a chat request's messages to the single text the agent session
/// consumes (spec.md §4.6 "Message → prompt reduction"): system messages
/// are dropped (the system prompt is built from schema at startup), a
/// single user message is forwarded as-is, and multi-turn history is
/// flattened into `Role: content` blocks. No history is carried across
/// requests.
pub fn reduce_to_prompt(messages: &[ChatMessage]) -> String {
    let user_turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();
    if user_turns.len() == 1 {
        return user_turns[0]
            .content
            .as_ref()
            .map(MessageContent::as_text)
            .unwrap_or_default();
    }
    user_turns
        .iter()
        .map(|m| {
            let text = m.content.as_ref().map(MessageContent::as_text).unwrap_or_default();
            format!("{}: {}", m.role, text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sum of all message content lengths, for the input-length validation
/// gate (spec.md §4.6 "Input validation").
pub fn total_input_chars(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| m.content.as_ref().map(MessageContent::len_chars).unwrap_or(0))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_single_user_message_is_forwarded_as_is() {
        let messages = vec![ChatMessage {
            role: "user".into(),
            content: Some(MessageContent::String("how many customers?".into())),
        }];
        assert_eq!(reduce_to_prompt(&messages), "how many customers?");
    }

    #[test]
    fn reduce_multi_turn_flattens_into_role_blocks() {
        let messages = vec![
            ChatMessage {
                role: "user".into(),
                content: Some(MessageContent::String("first".into())),
            },
            ChatMessage {
                role: "assistant".into(),
                content: Some(MessageContent::String("reply".into())),
            },
            ChatMessage {
                role: "user".into(),
                content: Some(MessageContent::String("second".into())),
            },
        ];
        let prompt = reduce_to_prompt(&messages);
        assert!(prompt.contains("user: first"));
        assert!(prompt.contains("assistant: reply"));
        assert!(prompt.contains("user: second"));
    }

    #[test]
    fn system_messages_are_dropped_from_the_reduction() {
        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: Some(MessageContent::String("ignored".into())),
            },
            ChatMessage {
                role: "user".into(),
                content: Some(MessageContent::String("question".into())),
            },
        ];
        assert_eq!(reduce_to_prompt(&messages), "question");
    }

    #[test]
    fn total_input_chars_sums_all_messages() {
        let messages = vec![
            ChatMessage {
                role: "user".into(),
                content: Some(MessageContent::String("abc".into())),
            },
            ChatMessage {
                role: "assistant".into(),
                content: Some(MessageContent::String("de".into())),
            },
        ];
        assert_eq!(total_input_chars(&messages), 5);
    }

    #[test]
    fn array_content_concatenates_text_parts_only() {
        let content = MessageContent::Array(vec![
            ContentPart {
                part_type: Some("text".into()),
                text: Some("hello ".into()),
            },
            ContentPart {
                part_type: Some("image_url".into()),
                text: None,
            },
            ContentPart {
                part_type: Some("text".into()),
                text: Some("world".into()),
            },
        ]);
        assert_eq!(content.as_text(), "hello world");
    }
}
