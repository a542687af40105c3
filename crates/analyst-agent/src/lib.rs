//! Per-request analyst agent session (Core B, spec.md §4.7): a fresh
//! tool-use loop against the language model, backed by a subprocess MCP
//! tool server, bounded by a per-turn cap, a per-session USD budget cap,
//! and a 240s wall-clock deadline. The message-stream extractor (§4.7)
//! accumulates assistant text and captures SQL/result summaries for the
//! audit trail as the stream is observed — no SQL is synthesized outside
//! what the model actually requested through a tool call.
//!
//! Grounded on the teacher's ReAct tool_use/tool_result turn loop
//! (`loom::agent::react`) and on `openai_sse`'s chunk/usage DTOs for the
//! shape of the events this crate emits upstream to the gateway.

mod mcp_tool_server;

pub use mcp_tool_server::{SqlToolServer, ToolCallOutcome, ToolSummary};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subterm_config::CoreBConfig;
use subterm_error::CoreError;
use subterm_lm::{
    estimate_cost_usd, CompletionRequest, ContentBlock, LmClient, LmStreamEvent, LmUsage, Message,
    Role, ToolChoiceMode, ToolSpec,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Tool names a subprocess tool server must never be allowed to expose,
/// enforced defensively even though the sqlite server this workspace talks
/// to has no reason to advertise them (spec.md §4.7 "tool deny-list").
const DENY_LIST: &[&str] = &["Bash", "Write", "Edit"];

/// One row of `query_results_summary`: row counts + column names by default,
/// or full rows when the session is configured verbose (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultSummary {
    Counts {
        row_count: usize,
        columns: Vec<String>,
    },
    Rows {
        rows: Vec<serde_json::Value>,
    },
}

/// Metadata sub-record of an [`AuditEntry`] (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditMetadata {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_estimate_usd: Option<f64>,
    pub duration_seconds: f64,
    pub tool_call_count: u32,
}

/// One request's audit record (spec.md §3, §6 "Audit JSON-lines").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: Uuid,
    pub timestamp: String,
    pub user_question: String,
    pub sql_queries_executed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_results_summary: Option<Vec<ResultSummary>>,
    pub final_response: String,
    pub metadata: AuditMetadata,
}

/// Internal stream events fed to the gateway's SSE writer as the session's
/// tool-use loop runs, grounded on the teacher's `StreamEvent`/`ChunkMeta`
/// shape (spec.md's SPEC_FULL "typed stream events" supplement).
#[derive(Debug, Clone)]
pub enum AnalystStreamEvent {
    Token(String),
    ToolUse { name: String, sql: Option<String> },
    Usage(LmUsage),
}

/// Abstraction over the subprocess tool server so the turn loop can be unit
/// tested without spawning a real process.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSummary>, CoreError>;
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallOutcome, CoreError>;
}

#[async_trait]
impl ToolBackend for SqlToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolSummary>, CoreError> {
        SqlToolServer::list_tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallOutcome, CoreError> {
        SqlToolServer::call_tool(self, name, arguments).await
    }
}

/// One bounded, stateless agent session for a single analyst request
/// (spec.md §4.7, §5 "Core B: ... each request allocates a fresh agent
/// session ... that dies with the request").
pub struct AnalystAgentSession {
    lm: Arc<dyn LmClient>,
    tools: Arc<dyn ToolBackend>,
    system_prompt: String,
    model: String,
    tool_prefix: String,
    max_turns: u32,
    max_budget_usd: f64,
    deadline: Duration,
    log_verbose: bool,
}

impl AnalystAgentSession {
    /// Spawns the configured subprocess tool server and builds a session
    /// bound by `config`'s turn cap, budget cap, and the fixed 240s
    /// deadline (spec.md §4.7).
    pub async fn spawn(
        config: &CoreBConfig,
        system_prompt: String,
        lm: Arc<dyn LmClient>,
    ) -> Result<Self, CoreError> {
        let tools = SqlToolServer::spawn(&config.tool_command, &config.tool_args, &config.db_path)?;
        Ok(AnalystAgentSession::new(
            lm,
            Arc::new(tools),
            system_prompt,
            config.model.clone(),
            config.tool_prefix.clone(),
            config.max_turns,
            config.max_budget_usd,
            config.agent_deadline,
            config.log_verbose,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lm: Arc<dyn LmClient>,
        tools: Arc<dyn ToolBackend>,
        system_prompt: String,
        model: String,
        tool_prefix: String,
        max_turns: u32,
        max_budget_usd: f64,
        deadline: Duration,
        log_verbose: bool,
    ) -> Self {
        AnalystAgentSession {
            lm,
            tools,
            system_prompt,
            model,
            tool_prefix,
            max_turns,
            max_budget_usd,
            deadline,
            log_verbose,
        }
    }

    /// Runs the turn loop under the session deadline, forwarding stream
    /// events to `chunk_tx` as they are produced, and returns the
    /// completed [`AuditEntry`]. Deadline expiry maps to
    /// `CoreError::AgentTimeout` (spec.md §4.7 "Timeout handling").
    pub async fn run(
        &self,
        question: &str,
        chunk_tx: Option<mpsc::Sender<AnalystStreamEvent>>,
    ) -> Result<AuditEntry, CoreError> {
        match tokio::time::timeout(self.deadline, self.run_inner(question, chunk_tx)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::AgentTimeout(format!(
                "analyst session exceeded {:?} deadline",
                self.deadline
            ))),
        }
    }

    async fn run_inner(
        &self,
        question: &str,
        chunk_tx: Option<mpsc::Sender<AnalystStreamEvent>>,
    ) -> Result<AuditEntry, CoreError> {
        let start = Instant::now();
        let session_id = Uuid::new_v4();

        let tool_specs = self.lm_tool_specs().await?;

        let mut messages = vec![Message::user_text(question)];
        let mut response_text = String::new();
        let mut sql_queries = Vec::new();
        let mut result_summaries: Vec<ResultSummary> = Vec::new();
        let mut usage = LmUsage::default();
        let mut tool_call_count: u32 = 0;
        let mut cumulative_cost = 0.0f64;

        for _turn in 0..self.max_turns {
            let mut request = CompletionRequest::new(self.model.clone(), messages.clone());
            request.system = Some(self.system_prompt.clone());
            request.tools = tool_specs.clone();
            request.tool_choice = ToolChoiceMode::Auto;

            let response = self.call_turn(&request, chunk_tx.as_ref()).await?;

            usage.input_tokens += response.usage.input_tokens;
            usage.output_tokens += response.usage.output_tokens;
            if let Some(cost) = estimate_cost_usd(&self.model, response.usage) {
                cumulative_cost += cost;
            }

            let text = response.text();
            if !text.is_empty() {
                response_text.push_str(&text);
            }

            let tool_uses: Vec<(String, String, serde_json::Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            messages.push(Message {
                role: Role::Assistant,
                content: tool_uses
                    .iter()
                    .map(|(id, name, input)| ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    })
                    .chain(if text.is_empty() {
                        None
                    } else {
                        Some(ContentBlock::text(text.clone()))
                    })
                    .collect(),
            });

            if tool_uses.is_empty() {
                break;
            }

            let mut tool_results = Vec::with_capacity(tool_uses.len());
            for (id, name, input) in &tool_uses {
                tool_call_count += 1;
                let sql = extract_sql(input);
                if let Some(sql) = &sql {
                    sql_queries.push(sql.clone());
                }
                if let Some(tx) = &chunk_tx {
                    let _ = tx
                        .send(AnalystStreamEvent::ToolUse {
                            name: name.clone(),
                            sql: sql.clone(),
                        })
                        .await;
                }

                let raw_name = name
                    .strip_prefix(&self.tool_prefix)
                    .unwrap_or(name.as_str());
                let outcome = self.tools.call_tool(raw_name, input.clone()).await;
                let (content, is_error) = match outcome {
                    Ok(outcome) => {
                        if let Some(summary) = summarize_result(&outcome.text, self.log_verbose) {
                            result_summaries.push(summary);
                        }
                        (outcome.text, false)
                    }
                    Err(e) => (e.to_string(), true),
                };
                tool_results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content,
                    is_error,
                });
            }
            messages.push(Message {
                role: Role::User,
                content: tool_results,
            });

            if cumulative_cost >= self.max_budget_usd {
                tracing::warn!(
                    cumulative_cost,
                    budget = self.max_budget_usd,
                    "analyst session hit its budget cap; returning a best-effort response"
                );
                break;
            }
        }

        if let Some(tx) = &chunk_tx {
            let _ = tx.send(AnalystStreamEvent::Usage(usage)).await;
        }

        let duration_seconds = start.elapsed().as_secs_f64();
        let cost_estimate_usd = estimate_cost_usd(&self.model, usage);

        Ok(AuditEntry {
            session_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            user_question: question.to_string(),
            sql_queries_executed: sql_queries,
            query_results_summary: if result_summaries.is_empty() {
                None
            } else {
                Some(result_summaries)
            },
            final_response: response_text,
            metadata: AuditMetadata {
                model: self.model.clone(),
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
                cost_estimate_usd,
                duration_seconds,
                tool_call_count,
            },
        })
    }

    async fn call_turn(
        &self,
        request: &CompletionRequest,
        chunk_tx: Option<&mpsc::Sender<AnalystStreamEvent>>,
    ) -> Result<subterm_lm::LmResponse, CoreError> {
        match chunk_tx {
            None => self.lm.complete(request).await,
            Some(tx) => {
                let (inner_tx, mut inner_rx) = mpsc::channel(32);
                let forward_tx = tx.clone();
                let forward = tokio::spawn(async move {
                    while let Some(event) = inner_rx.recv().await {
                        if let LmStreamEvent::TextDelta(text) = event {
                            let _ = forward_tx.send(AnalystStreamEvent::Token(text)).await;
                        }
                    }
                });
                let response = self.lm.complete_stream(request, Some(inner_tx)).await;
                let _ = forward.await;
                response
            }
        }
    }

    /// Lists the subprocess tool server's tools and namespaces each name
    /// under `tool_prefix` (spec.md Open Questions: "the tool-server
    /// prefix is hard-coded in several places; treat it as configuration")
    /// so every SQL in the audit trail is traceable to a prefixed tool call
    /// (spec.md invariant: "every SQL string ... was produced by an
    /// assistant tool call whose name begins with the configured prefix").
    async fn lm_tool_specs(&self) -> Result<Vec<ToolSpec>, CoreError> {
        let tools = self.tools.list_tools().await?;
        Ok(tools
            .into_iter()
            .filter(|t| !DENY_LIST.contains(&t.name.as_str()))
            .map(|t| ToolSpec {
                name: format!("{}{}", self.tool_prefix, t.name),
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
            })
            .collect())
    }
}

/// Pulls the SQL text out of a tool call's input, if present under the
/// conventional `query` field used by the sqlite MCP tool server.
fn extract_sql(input: &serde_json::Value) -> Option<String> {
    input
        .get("query")
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Builds a `query_results_summary` row from a tool result's text, if it
/// parses as a JSON array of row objects; returns `None` for non-tabular
/// results (e.g. `list_tables`) rather than guessing a shape.
fn summarize_result(text: &str, verbose: bool) -> Option<ResultSummary> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let rows = value.as_array()?;
    if verbose {
        return Some(ResultSummary::Rows { rows: rows.clone() });
    }
    let columns = rows
        .first()
        .and_then(|r| r.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();
    Some(ResultSummary::Counts {
        row_count: rows.len(),
        columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use subterm_lm::{LmResponse, ResponseBlock};

    struct StubTools {
        tools: Vec<ToolSummary>,
        outcomes: Mutex<Vec<Result<ToolCallOutcome, CoreError>>>,
    }

    #[async_trait]
    impl ToolBackend for StubTools {
        async fn list_tools(&self) -> Result<Vec<ToolSummary>, CoreError> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, _name: &str, _args: serde_json::Value) -> Result<ToolCallOutcome, CoreError> {
            self.outcomes.lock().unwrap().remove(0)
        }
    }

    struct StubLm {
        turns: Mutex<Vec<LmResponse>>,
    }

    #[async_trait]
    impl LmClient for StubLm {
        async fn complete(&self, _req: &CompletionRequest) -> Result<LmResponse, CoreError> {
            Ok(self.turns.lock().unwrap().remove(0))
        }
    }

    fn read_query_tool() -> ToolSummary {
        ToolSummary {
            name: "read_query".into(),
            description: Some("run a read-only SQL query".into()),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn happy_path_captures_one_sql_query_and_final_text() {
        let lm = StubLm {
            turns: Mutex::new(vec![
                LmResponse {
                    content: vec![ResponseBlock::ToolUse {
                        id: "t1".into(),
                        name: "mcp__sqlite__read_query".into(),
                        input: serde_json::json!({"query": "SELECT tier, COUNT(*) FROM customers GROUP BY tier"}),
                    }],
                    stop_reason: "tool_use".into(),
                    usage: LmUsage {
                        input_tokens: 100,
                        output_tokens: 20,
                    },
                },
                LmResponse {
                    content: vec![ResponseBlock::Text("There are three tiers.".into())],
                    stop_reason: "end_turn".into(),
                    usage: LmUsage {
                        input_tokens: 120,
                        output_tokens: 15,
                    },
                },
            ]),
        };
        let tools = StubTools {
            tools: vec![read_query_tool()],
            outcomes: Mutex::new(vec![Ok(ToolCallOutcome {
                text: r#"[{"tier":"gold","n":3},{"tier":"silver","n":5}]"#.into(),
            })]),
        };
        let session = AnalystAgentSession::new(
            Arc::new(lm),
            Arc::new(tools),
            "system prompt".into(),
            "claude-sonnet-4-5-20250929".into(),
            "mcp__sqlite__".into(),
            10,
            0.50,
            Duration::from_secs(240),
            false,
        );

        let entry = session.run("How many customers per tier?", None).await.unwrap();
        assert_eq!(entry.sql_queries_executed.len(), 1);
        assert!(entry.sql_queries_executed[0].starts_with("SELECT tier"));
        assert_eq!(entry.final_response, "There are three tiers.");
        assert_eq!(entry.metadata.tool_call_count, 1);
        match entry.query_results_summary.as_ref().unwrap().first().unwrap() {
            ResultSummary::Counts { row_count, columns } => {
                assert_eq!(*row_count, 2);
                assert!(columns.contains(&"tier".to_string()));
            }
            ResultSummary::Rows { .. } => panic!("expected counts summary in non-verbose mode"),
        }
    }

    #[tokio::test]
    async fn no_tool_use_returns_text_only_with_empty_sql_list() {
        let lm = StubLm {
            turns: Mutex::new(vec![LmResponse {
                content: vec![ResponseBlock::Text("I can't answer that.".into())],
                stop_reason: "end_turn".into(),
                usage: LmUsage::default(),
            }]),
        };
        let tools = StubTools {
            tools: vec![],
            outcomes: Mutex::new(vec![]),
        };
        let session = AnalystAgentSession::new(
            Arc::new(lm),
            Arc::new(tools),
            "system prompt".into(),
            "claude-sonnet-4-5-20250929".into(),
            "mcp__sqlite__".into(),
            10,
            0.50,
            Duration::from_secs(240),
            false,
        );
        let entry = session.run("What's the weather?", None).await.unwrap();
        assert!(entry.sql_queries_executed.is_empty());
        assert_eq!(entry.final_response, "I can't answer that.");
    }

    #[tokio::test]
    async fn turn_cap_terminates_with_best_effort_response() {
        let looping_turn = LmResponse {
            content: vec![ResponseBlock::ToolUse {
                id: "loop".into(),
                name: "mcp__sqlite__read_query".into(),
                input: serde_json::json!({"query": "SELECT 1"}),
            }],
            stop_reason: "tool_use".into(),
            usage: LmUsage::default(),
        };
        let lm = StubLm {
            turns: Mutex::new(vec![looping_turn.clone(), looping_turn.clone(), looping_turn]),
        };
        let tools = StubTools {
            tools: vec![read_query_tool()],
            outcomes: Mutex::new(vec![
                Ok(ToolCallOutcome { text: "[]".into() }),
                Ok(ToolCallOutcome { text: "[]".into() }),
                Ok(ToolCallOutcome { text: "[]".into() }),
            ]),
        };
        let session = AnalystAgentSession::new(
            Arc::new(lm),
            Arc::new(tools),
            "system prompt".into(),
            "claude-sonnet-4-5-20250929".into(),
            "mcp__sqlite__".into(),
            3,
            0.50,
            Duration::from_secs(240),
            false,
        );
        let entry = session.run("loop forever", None).await.unwrap();
        assert_eq!(entry.metadata.tool_call_count, 3);
        assert_eq!(entry.sql_queries_executed.len(), 3);
    }

    #[tokio::test]
    async fn verbose_mode_captures_full_rows() {
        let lm = StubLm {
            turns: Mutex::new(vec![
                LmResponse {
                    content: vec![ResponseBlock::ToolUse {
                        id: "t1".into(),
                        name: "mcp__sqlite__read_query".into(),
                        input: serde_json::json!({"query": "SELECT * FROM customers LIMIT 1"}),
                    }],
                    stop_reason: "tool_use".into(),
                    usage: LmUsage::default(),
                },
                LmResponse {
                    content: vec![ResponseBlock::Text("done".into())],
                    stop_reason: "end_turn".into(),
                    usage: LmUsage::default(),
                },
            ]),
        };
        let tools = StubTools {
            tools: vec![read_query_tool()],
            outcomes: Mutex::new(vec![Ok(ToolCallOutcome {
                text: r#"[{"id":1,"name":"Ada"}]"#.into(),
            })]),
        };
        let session = AnalystAgentSession::new(
            Arc::new(lm),
            Arc::new(tools),
            "system prompt".into(),
            "claude-sonnet-4-5-20250929".into(),
            "mcp__sqlite__".into(),
            10,
            0.50,
            Duration::from_secs(240),
            true,
        );
        let entry = session.run("show a customer", None).await.unwrap();
        match entry.query_results_summary.unwrap().first().unwrap() {
            ResultSummary::Rows { rows } => assert_eq!(rows.len(), 1),
            ResultSummary::Counts { .. } => panic!("expected full rows in verbose mode"),
        }
    }

    #[tokio::test]
    async fn deny_listed_tool_names_are_never_exposed_to_the_model() {
        let tools = StubTools {
            tools: vec![
                read_query_tool(),
                ToolSummary {
                    name: "Bash".into(),
                    description: None,
                    input_schema: serde_json::json!({}),
                },
            ],
            outcomes: Mutex::new(vec![]),
        };
        let lm = StubLm {
            turns: Mutex::new(vec![LmResponse {
                content: vec![ResponseBlock::Text("ok".into())],
                stop_reason: "end_turn".into(),
                usage: LmUsage::default(),
            }]),
        };
        let session = AnalystAgentSession::new(
            Arc::new(lm),
            Arc::new(tools),
            "system prompt".into(),
            "claude-sonnet-4-5-20250929".into(),
            "mcp__sqlite__".into(),
            10,
            0.50,
            Duration::from_secs(240),
            false,
        );
        let specs = session.lm_tool_specs().await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "mcp__sqlite__read_query");
    }
}
