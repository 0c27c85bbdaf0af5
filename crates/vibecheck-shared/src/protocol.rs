//! WebSocket wire protocol between the agent and the relay server.
//!
//! Every frame is a UTF-8 JSON object with a mandatory `type` discriminator.
//! Outbound optional fields are omitted entirely when absent; the UI schema
//! treats a missing key and an explicit `null` differently.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Messages received from the relay server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Query {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skill_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agents: Option<HashMap<String, AgentDef>>,
    },
    Approval {
        approved: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        permanent: Option<bool>,
    },
    AddTrustedPath {
        path: String,
    },
    Interrupt,
    Ping,
    Pong,
    SessionInfo {
        #[serde(default)]
        session_id: Option<String>,
        source: String,
    },
    SkillList,
    ScheduleAdd {
        cron: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        skill_id: Option<String>,
    },
    ScheduleRemove {
        id: String,
    },
    ScheduleToggle {
        id: String,
        enabled: bool,
    },
    ScheduleList,
    Error {
        message: String,
    },
    /// Forward compatibility: frames with an unrecognized `type` are dropped
    /// without logging.
    #[serde(other)]
    Unknown,
}

/// Messages sent to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Ping,
    Pong,
    Response {
        result: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImageData>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    StreamingChunk {
        delta: String,
        index: u32,
    },
    ToolStatus {
        tool: String,
        status: ToolPhase,
        label: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ApprovalRequired {
        paths: Vec<String>,
        message: String,
    },
    /// Sent once per connection; `session_id` is declared nullable in the UI
    /// schema, so `None` serializes as an explicit `null`.
    SessionSync {
        work_dir: String,
        session_id: Option<String>,
    },
    SessionUpdate {
        work_dir: String,
        session_id: String,
    },
    SkillListResponse {
        skills: Vec<SkillInfo>,
    },
    ScheduleListResponse {
        tasks: Vec<ScheduledTask>,
    },
    ScheduleAddResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<ScheduledTask>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AgentMessage {
    /// A `response` frame carrying only text.
    pub fn text_response(result: impl Into<String>) -> Self {
        AgentMessage::Response {
            result: result.into(),
            images: None,
            cost_usd: None,
            num_turns: None,
            usage: None,
        }
    }
}

/// Lifecycle phase of one tool use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolPhase {
    Start,
    End,
}

/// An image attached to a `response`, base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageData {
    pub filename: String,
    pub data: String,
}

/// Token breakdown reported by the terminal result event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

/// A custom sub-agent definition passed through to the assistant SDK.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDef {
    pub description: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A cron-scheduled prompt, persisted as part of the schedule file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    pub id: String,
    pub cron: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
    pub enabled: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
}

/// Skill entry as serialized in `skill_list_response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillInfo {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_roundtrip() {
        let msg = ServerMessage::Query {
            message: "hello".into(),
            model: Some("opus".into()),
            skill_id: None,
            system_prompt: None,
            agents: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let back: ServerMessage =
            serde_json::from_str(r#"{"type":"shiny_new_feature","x":1}"#).unwrap();
        assert_eq!(back, ServerMessage::Unknown);
    }

    #[test]
    fn interrupt_decodes_from_bare_object() {
        let back: ServerMessage = serde_json::from_str(r#"{"type":"interrupt"}"#).unwrap();
        assert_eq!(back, ServerMessage::Interrupt);
    }

    #[test]
    fn response_omits_absent_fields() {
        let value = serde_json::to_value(AgentMessage::text_response("hi")).unwrap();
        assert_eq!(value, json!({"type": "response", "result": "hi"}));
    }

    #[test]
    fn response_roundtrip_with_usage() {
        let msg = AgentMessage::Response {
            result: "done".into(),
            images: Some(vec![ImageData {
                filename: "a.png".into(),
                data: "aGk=".into(),
            }]),
            cost_usd: Some(0.001),
            num_turns: Some(1),
            usage: Some(TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
                cache_read_input_tokens: 0,
                cache_creation_input_tokens: 0,
            }),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn session_sync_keeps_explicit_null() {
        let value = serde_json::to_value(AgentMessage::SessionSync {
            work_dir: "/work".into(),
            session_id: None,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "session_sync", "work_dir": "/work", "session_id": null})
        );
    }

    #[test]
    fn streaming_chunk_shape() {
        let value = serde_json::to_value(AgentMessage::StreamingChunk {
            delta: "hi".into(),
            index: 0,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "streaming_chunk", "delta": "hi", "index": 0})
        );
    }

    #[test]
    fn schedule_add_response_variants() {
        let ok = serde_json::to_value(AgentMessage::ScheduleAddResponse {
            success: true,
            task: Some(ScheduledTask {
                id: "t1".into(),
                cron: "* * * * *".into(),
                message: "ping".into(),
                skill_id: None,
                enabled: true,
                created_at: "2025-01-01T00:00:00Z".into(),
                last_run: None,
                last_result: None,
            }),
            error: None,
        })
        .unwrap();
        assert!(ok.get("task").is_some());
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(AgentMessage::ScheduleAddResponse {
            success: false,
            task: None,
            error: Some("invalid cron expression".into()),
        })
        .unwrap();
        assert!(err.get("task").is_none());
        assert_eq!(err["error"], "invalid cron expression");
    }
}
