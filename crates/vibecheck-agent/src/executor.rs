//! Single-flight query executor.
//!
//! Drives one assistant query end to end: assembles SDK options, iterates
//! the event stream, translates events into outbound UI messages, and
//! collects the terminal result. Overlap prevention lives at the caller;
//! this type assumes at most one `execute` is in progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vibecheck_shared::labels::{self, tool_status_label};
use vibecheck_shared::protocol::{AgentDef, AgentMessage, TokenUsage, ToolPhase};
use vibecheck_shared::skills::Skill;

use crate::config::AgentConfig;
use crate::connection::Outbound;
use crate::sdk::query::{spawn_query, ControlHandle, SdkQuery};
use crate::sdk::types::{PermissionResult, QueryOptions, SdkMessage, SdkUsage};
use crate::security::SecurityMediator;
use crate::session::SessionStore;

/// Tools available when the active skill does not narrow the list.
const GLOBAL_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Glob",
    "Grep",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "NotebookEdit",
];

/// How long an interrupted stream may keep unwinding before the child is
/// killed outright.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Arguments for one query.
#[derive(Debug, Clone, Default)]
pub struct ExecuteParams {
    pub message: String,
    pub model: Option<String>,
    pub skill: Option<&'static Skill>,
    pub system_prompt: Option<String>,
    pub agents: Option<HashMap<String, AgentDef>>,
}

/// Outcome of a completed query.
#[derive(Debug, Clone, Default)]
pub struct ExecuteResult {
    pub text: String,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The query was interrupted; the interrupt handler already responded.
    #[error("query aborted")]
    Aborted,
    /// The SDK failed outside the normal result path.
    #[error("{0}")]
    Sdk(String),
}

#[derive(Clone)]
struct CurrentQuery {
    control: ControlHandle,
    abort: CancellationToken,
}

pub struct QueryExecutor {
    config: Arc<AgentConfig>,
    store: Arc<SessionStore>,
    security: Arc<SecurityMediator>,
    outbound: Outbound,
    current: Mutex<Option<CurrentQuery>>,
}

impl QueryExecutor {
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<SessionStore>,
        security: Arc<SecurityMediator>,
        outbound: Outbound,
    ) -> Self {
        Self {
            config,
            store,
            security,
            outbound,
            current: Mutex::new(None),
        }
    }

    /// Run one query to completion, recovering once from a stale stored
    /// session id.
    pub async fn execute(&self, params: &ExecuteParams) -> Result<ExecuteResult, ExecuteError> {
        let had_session = self.store.session_id().is_some();
        match self.run_once(params).await {
            Err(ExecuteError::Sdk(message)) if had_session && is_stale_session(&message) => {
                warn!(error = %message, "stored session looks stale, retrying fresh");
                self.store.clear();
                self.run_once(params).await
            }
            other => other,
        }
    }

    /// Stop the in-flight query, if any. Returns whether something was
    /// actually aborted.
    pub fn interrupt(&self) -> bool {
        let Some(current) = self.current.lock().unwrap().clone() else {
            return false;
        };
        if !current.control.interrupt() {
            debug!("interrupt control frame not deliverable, child presumed dead");
        }
        current.abort.cancel();
        true
    }

    async fn run_once(&self, params: &ExecuteParams) -> Result<ExecuteResult, ExecuteError> {
        let options = self.build_options(params);
        let abort = CancellationToken::new();

        let mut query = spawn_query(&params.message, &options)
            .map_err(|e| ExecuteError::Sdk(e.to_string()))?;

        *self.current.lock().unwrap() = Some(CurrentQuery {
            control: query.control(),
            abort: abort.clone(),
        });

        let outcome = self.demux(&mut query, &abort).await;
        *self.current.lock().unwrap() = None;

        if abort.is_cancelled() {
            return Err(ExecuteError::Aborted);
        }

        let (result, captured_session) = outcome;
        let result = match result {
            Some(r) => r,
            None => {
                let message = query
                    .exit_error()
                    .await
                    .unwrap_or_else(|| "assistant stream ended without a result".to_string());
                return Err(ExecuteError::Sdk(message));
            }
        };

        if let Some(session_id) = captured_session {
            if self.store.session_id().as_deref() != Some(session_id.as_str()) {
                info!(session_id = %session_id, "new assistant session");
                self.store.save(&session_id);
                self.outbound.send(&AgentMessage::SessionUpdate {
                    work_dir: self.config.work_dir_str(),
                    session_id,
                });
            }
        }
        self.store.mark_started();

        Ok(result)
    }

    fn build_options(&self, params: &ExecuteParams) -> QueryOptions {
        let allowed_tools = params
            .skill
            .and_then(|s| s.allowed_tools)
            .map(|tools| tools.iter().map(|t| t.to_string()).collect())
            .unwrap_or_else(|| {
                GLOBAL_ALLOWED_TOOLS
                    .iter()
                    .map(|t| t.to_string())
                    .collect()
            });

        let mut prompt_parts: Vec<&str> = Vec::new();
        if let Some(skill) = params.skill {
            if let Some(sp) = skill.system_prompt {
                prompt_parts.push(sp);
            }
        }
        if let Some(ref sp) = params.system_prompt {
            prompt_parts.push(sp);
        }
        let append_system_prompt = if prompt_parts.is_empty() {
            None
        } else {
            Some(prompt_parts.join("\n\n"))
        };

        let resume = self.store.session_id();
        let continue_conversation = resume.is_none() && self.store.started();

        QueryOptions {
            cwd: self.config.work_dir_str(),
            model: params.model.clone(),
            append_system_prompt,
            allowed_tools,
            resume,
            continue_conversation,
            agents: params.agents.clone(),
        }
    }

    /// Iterate the event stream to completion, emitting UI messages as
    /// events arrive. Returns the terminal result (if one was seen) and the
    /// first session id the stream reported.
    async fn demux(
        &self,
        query: &mut SdkQuery,
        abort: &CancellationToken,
    ) -> (Option<ExecuteResult>, Option<String>) {
        let mut chunk_index: u32 = 0;
        let mut tool_names: HashMap<String, String> = HashMap::new();
        let mut captured_session: Option<String> = None;
        let mut result: Option<ExecuteResult> = None;

        enum Next {
            Msg(Option<SdkMessage>),
            Interrupted,
        }

        loop {
            let next = tokio::select! {
                m = query.next_message() => Next::Msg(m),
                _ = abort.cancelled() => Next::Interrupted,
            };
            let msg = match next {
                Next::Msg(m) => m,
                // Interrupted: let the stream unwind on its own for a
                // bounded time per event, then hard-stop the child.
                Next::Interrupted => {
                    match time::timeout(INTERRUPT_GRACE, query.next_message()).await {
                        Ok(m) => m,
                        Err(_) => {
                            query.kill();
                            None
                        }
                    }
                }
            };
            let Some(msg) = msg else { break };

            if captured_session.is_none() {
                if let Some(id) = msg.session_id() {
                    captured_session = Some(id.to_string());
                }
            }

            match msg {
                SdkMessage::System { subtype, model, .. } => {
                    if subtype == "init" {
                        debug!(model = ?model, "assistant session initialized");
                    }
                }
                SdkMessage::StreamEvent { event, .. } => {
                    if let Some(delta) = text_delta(&event) {
                        self.outbound.send(&AgentMessage::StreamingChunk {
                            delta: delta.to_string(),
                            index: chunk_index,
                        });
                        chunk_index += 1;
                    }
                }
                SdkMessage::Assistant { message, .. } => {
                    for block in &message.content {
                        if block.get("type").and_then(|v| v.as_str()) != Some("tool_use") {
                            continue;
                        }
                        let Some(name) = block.get("name").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        if let Some(id) = block.get("id").and_then(|v| v.as_str()) {
                            tool_names.insert(id.to_string(), name.to_string());
                        }
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        self.outbound.send(&AgentMessage::ToolStatus {
                            tool: name.to_string(),
                            status: ToolPhase::Start,
                            label: tool_status_label(name, ToolPhase::Start),
                            detail: tool_detail(name, &input),
                        });
                    }
                }
                SdkMessage::User { message, .. } => {
                    if let Some(blocks) = message.content.as_array() {
                        for block in blocks {
                            if block.get("type").and_then(|v| v.as_str()) != Some("tool_result") {
                                continue;
                            }
                            let Some(id) = block.get("tool_use_id").and_then(|v| v.as_str())
                            else {
                                continue;
                            };
                            if let Some(name) = tool_names.get(id) {
                                self.outbound.send(&AgentMessage::ToolStatus {
                                    tool: name.clone(),
                                    status: ToolPhase::End,
                                    label: tool_status_label(name, ToolPhase::End),
                                    detail: None,
                                });
                            }
                        }
                    }
                }
                SdkMessage::ControlRequest { request_id, request } => {
                    if request.subtype == "can_use_tool" {
                        let security = self.security.clone();
                        let control = query.control();
                        let abort = abort.clone();
                        let tool = request.tool_name.unwrap_or_default();
                        let input = request.input.unwrap_or(Value::Null);
                        tokio::spawn(async move {
                            let decision = security.can_use_tool(&tool, &input, abort).await;
                            control.respond_permission(&request_id, &decision);
                        });
                    } else {
                        debug!(subtype = %request.subtype, "unhandled control request");
                    }
                }
                SdkMessage::Result {
                    subtype,
                    result: result_text,
                    num_turns,
                    usage,
                    total_cost_usd,
                    errors,
                    ..
                } => {
                    result = Some(build_result(
                        &subtype,
                        result_text,
                        num_turns,
                        usage,
                        total_cost_usd,
                        errors,
                    ));
                }
                SdkMessage::ControlResponse { .. } => {}
            }

            // The CLI keeps its stdin open for further turns after the
            // terminal result; one query is one turn, so stop here.
            if result.is_some() {
                break;
            }
        }

        (result, captured_session)
    }
}

fn is_stale_session(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("session") || lower.contains("not found")
}

/// Text delta carried by a partial-message stream event, if any.
fn text_delta(event: &Value) -> Option<&str> {
    if event.get("type")?.as_str()? != "content_block_delta" {
        return None;
    }
    let delta = event.get("delta")?;
    if delta.get("type")?.as_str()? != "text_delta" {
        return None;
    }
    delta.get("text")?.as_str()
}

/// Short human-readable summary of a tool invocation.
fn tool_detail(tool: &str, input: &Value) -> Option<String> {
    match tool {
        "Read" | "Write" | "Edit" => input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        "Bash" => input
            .get("command")
            .and_then(|v| v.as_str())
            .map(|c| c.chars().take(80).collect()),
        "Glob" | "Grep" => input
            .get("pattern")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        "WebFetch" | "WebSearch" => input
            .get("url")
            .or_else(|| input.get("query"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

fn build_result(
    subtype: &str,
    result_text: Option<String>,
    num_turns: Option<u32>,
    usage: Option<SdkUsage>,
    total_cost_usd: Option<f64>,
    errors: Option<Vec<String>>,
) -> ExecuteResult {
    let text = if subtype == "success" {
        result_text.unwrap_or_default()
    } else {
        let reason = match errors {
            Some(list) if !list.is_empty() => list.join(", "),
            _ => result_text.unwrap_or_else(|| subtype.to_string()),
        };
        format!("{}: {}", labels::ERROR_PREFIX, reason)
    };

    ExecuteResult {
        text,
        cost_usd: total_cost_usd,
        num_turns,
        usage: usage.map(|u| TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_input_tokens: u.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: u.cache_creation_input_tokens.unwrap_or(0),
        }),
    }
}
