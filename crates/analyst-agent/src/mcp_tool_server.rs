//! Subprocess database tool server (spec.md §4.7, §6 "Subprocess tool
//! server"): spawns `<command> <args...> <db_path>` over MCP stdio,
//! performs the `initialize` handshake, and exposes `tools/list` /
//! `tools/call`.
//!
//! Grounded on `loom::tool_source::mcp::{McpSession, McpToolSource}`: the
//! spawn-then-initialize sequence, the `roots/list` auto-reply, and the
//! `task::block_in_place` bridge from the session's synchronous
//! request/response API into this crate's async call sites are all copied
//! from that file. Unlike the teacher, there is no HTTP transport variant
//! here — spec.md's subprocess tool server is stdio-only.

use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use mcp_client::stdio::{
    JsonRpcMessage, StdioClientTransport, StdioServerParameters, StdioStream,
};
use mcp_core::{MessageId, NotificationMessage, RequestMessage, ResultMessage};
use serde_json::{json, Value};
use subterm_error::CoreError;
use tokio::task;

const PROTOCOL_VERSION: &str = "2025-11-25";
const INITIALIZE_REQUEST_ID: &str = "claude-da-initialize";
const RESULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One tool advertised by the subprocess server.
#[derive(Debug, Clone)]
pub struct ToolSummary {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// The subprocess server's answer to one `tools/call`.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub text: String,
}

/// Owns the subprocess and the MCP session; one per analyst request
/// (spec.md §5: "the subprocess tool server is owned exclusively by one
/// agent session ... and is terminated when the session ends").
pub struct SqlToolServer {
    session: Mutex<Session>,
}

struct Session {
    transport: StdioClientTransport,
    receiver: mpsc::Receiver<JsonRpcMessage>,
}

impl SqlToolServer {
    /// Spawns `command args... db_path` and completes the MCP initialize
    /// handshake. The database path is appended as the final argument,
    /// matching the "command, args, and database file path" shape of
    /// spec.md §4.7.
    pub fn spawn(command: &str, args: &[String], db_path: &Path) -> Result<Self, CoreError> {
        let mut full_args = args.to_vec();
        full_args.push(db_path.display().to_string());

        let (tx, rx) = mpsc::channel();
        let params = StdioServerParameters::new(command.to_string())
            .args(full_args)
            .stderr(StdioStream::Null);

        let mut transport = StdioClientTransport::new(params);
        transport.on_message(move |msg| {
            let _ = tx.send(msg);
        });
        transport.on_error(|e| {
            tracing::warn!("sql tool server transport error: {e}");
        });
        transport
            .start()
            .map_err(|e| CoreError::DatabaseUnavailable(format!("spawn tool server: {e}")))?;

        let mut session = Session {
            transport,
            receiver: rx,
        };
        session.initialize()?;
        Ok(SqlToolServer {
            session: Mutex::new(session),
        })
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSummary>, CoreError> {
        task::block_in_place(|| {
            let mut session = self.session.lock().unwrap();
            session.list_tools()
        })
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutcome, CoreError> {
        let name = name.to_string();
        task::block_in_place(move || {
            let mut session = self.session.lock().unwrap();
            session.call_tool(&name, arguments)
        })
    }
}

impl Session {
    fn initialize(&mut self) -> Result<(), CoreError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": { "name": "claude-da", "version": env!("CARGO_PKG_VERSION") },
        });
        self.send_request(INITIALIZE_REQUEST_ID, "initialize", params)?;

        match self.wait_for_result(INITIALIZE_REQUEST_ID, RESULT_WAIT_TIMEOUT)? {
            Some(result) => {
                if let Some(err) = result.error {
                    return Err(CoreError::DatabaseUnavailable(format!(
                        "tool server initialize failed: {}",
                        err.message
                    )));
                }
                let notification = JsonRpcMessage::Notification(NotificationMessage::new(
                    "notifications/initialized",
                    Some(json!({})),
                ));
                self.transport
                    .send(&notification)
                    .map_err(|e| CoreError::DatabaseUnavailable(format!("send initialized: {e}")))
            }
            None => Err(CoreError::DatabaseUnavailable(
                "timeout waiting for tool server initialize".into(),
            )),
        }
    }

    fn send_request(&mut self, id: &str, method: &str, params: Value) -> Result<(), CoreError> {
        let request = RequestMessage::new(id, method, params);
        self.transport
            .send(&JsonRpcMessage::Request(request))
            .map_err(|e| CoreError::DatabaseUnavailable(format!("send {method}: {e}")))
    }

    /// Blocks waiting for a result matching `request_id`; answers any
    /// `roots/list` request from the server with empty roots in the
    /// meantime, exactly like the teacher's `McpSession::wait_for_result`.
    fn wait_for_result(
        &mut self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<Option<ResultMessage>, CoreError> {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .min(Duration::from_secs(1));

            match self.receiver.recv_timeout(remaining) {
                Ok(JsonRpcMessage::Result(msg)) if message_id_matches(&msg.id, request_id) => {
                    return Ok(Some(msg));
                }
                Ok(JsonRpcMessage::Request(req)) if req.method == "roots/list" => {
                    let result = ResultMessage::success(req.id.clone(), json!({ "roots": [] }));
                    self.transport
                        .send(&JsonRpcMessage::Result(result))
                        .map_err(|e| CoreError::DatabaseUnavailable(format!("roots/list reply: {e}")))?;
                }
                Ok(JsonRpcMessage::Request(_)) | Ok(JsonRpcMessage::Result(_)) => {}
                Ok(JsonRpcMessage::Notification(_)) => {}
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(None)
    }

    fn list_tools(&mut self) -> Result<Vec<ToolSummary>, CoreError> {
        let id = "claude-da-tools-list";
        self.send_request(id, "tools/list", Value::Object(serde_json::Map::new()))?;
        let result = self
            .wait_for_result(id, RESULT_WAIT_TIMEOUT)?
            .ok_or_else(|| CoreError::DatabaseUnavailable("timeout waiting for tools/list".into()))?;
        parse_list_tools_result(result)
    }

    fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolCallOutcome, CoreError> {
        let id = format!("claude-da-call-{name}");
        let params = json!({ "name": name, "arguments": arguments });
        self.send_request(&id, "tools/call", params)?;
        let result = self
            .wait_for_result(&id, RESULT_WAIT_TIMEOUT)?
            .ok_or_else(|| CoreError::DatabaseUnavailable("timeout waiting for tools/call".into()))?;
        parse_call_tool_result(result)
    }
}

fn message_id_matches(id: &MessageId, expected: &str) -> bool {
    id.as_str() == Some(expected)
}

fn parse_list_tools_result(result: ResultMessage) -> Result<Vec<ToolSummary>, CoreError> {
    if let Some(err) = result.error {
        return Err(CoreError::DatabaseUnavailable(format!("tools/list: {}", err.message)));
    }
    let tools_value = result
        .result
        .and_then(|r| r.get("tools").cloned())
        .ok_or_else(|| CoreError::DatabaseUnavailable("tools/list: no tools in response".into()))?;
    let tools_array = tools_value
        .as_array()
        .ok_or_else(|| CoreError::DatabaseUnavailable("tools/list: tools is not an array".into()))?;

    let mut out = Vec::with_capacity(tools_array.len());
    for t in tools_array {
        let obj = t
            .as_object()
            .ok_or_else(|| CoreError::DatabaseUnavailable("tools/list: tool item is not an object".into()))?;
        out.push(ToolSummary {
            name: obj.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            description: obj.get("description").and_then(|v| v.as_str()).map(String::from),
            input_schema: obj
                .get("inputSchema")
                .cloned()
                .unwrap_or(Value::Object(serde_json::Map::new())),
        });
    }
    Ok(out)
}

fn parse_call_tool_result(result: ResultMessage) -> Result<ToolCallOutcome, CoreError> {
    if let Some(err) = result.error {
        return Err(CoreError::DatabaseUnavailable(format!("tools/call: {}", err.message)));
    }
    let value = result
        .result
        .ok_or_else(|| CoreError::DatabaseUnavailable("tools/call: no result".into()))?;

    if value.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
        let msg = value
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|b| b.get("text").and_then(|t| t.as_str()))
            .unwrap_or("tool returned error")
            .to_string();
        return Err(CoreError::DatabaseUnavailable(msg));
    }

    let mut text_parts = Vec::new();
    if let Some(content) = value.get("content").and_then(|c| c.as_array()) {
        for block in content {
            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t);
                }
            }
        }
    }
    let mut text = text_parts.join("\n").trim().to_string();
    if text.is_empty() {
        if let Some(structured) = value.get("structuredContent") {
            text = serde_json::to_string(structured).unwrap_or_default();
        }
    }
    if text.is_empty() {
        return Err(CoreError::DatabaseUnavailable(
            "tools/call: no text or structuredContent in response".into(),
        ));
    }
    Ok(ToolCallOutcome { text })
}
