//! Messages exchanged with the assistant CLI over stream-json.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use vibecheck_shared::protocol::AgentDef;

/// One line of CLI stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkMessage {
    System {
        subtype: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Vec<String>>,
    },
    Assistant {
        message: AssistantBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    User {
        message: UserBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    StreamEvent {
        event: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    Result {
        subtype: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_turns: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<SdkUsage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<String>>,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: Value,
    },
}

impl SdkMessage {
    /// Session id carried by this event, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SdkMessage::System { session_id, .. }
            | SdkMessage::Assistant { session_id, .. }
            | SdkMessage::User { session_id, .. }
            | SdkMessage::StreamEvent { session_id, .. }
            | SdkMessage::Result { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantBody {
    #[serde(default)]
    pub content: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBody {
    #[serde(default)]
    pub content: Value,
}

/// Token breakdown as reported by the CLI.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SdkUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

/// Inbound control request (tool-permission gate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequestBody {
    pub subtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Decision returned through the permission callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionResult {
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    Deny {
        message: String,
    },
}

impl PermissionResult {
    pub fn allow(input: &Value) -> Self {
        PermissionResult::Allow {
            updated_input: input.clone(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResult::Deny {
            message: message.into(),
        }
    }
}

/// Options for one spawned query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub cwd: String,
    pub model: Option<String>,
    /// Appended to the fixed `claude_code` system-prompt preset.
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub resume: Option<String>,
    pub continue_conversation: bool,
    pub agents: Option<HashMap<String, AgentDef>>,
}

/// stdin frame answering a `can_use_tool` control request.
pub fn permission_response_frame(request_id: &str, result: &PermissionResult) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": result,
        },
    })
}

/// stdin frame asking the CLI to stop the current turn.
pub fn interrupt_frame(request_id: u64) -> Value {
    json!({
        "type": "control_request",
        "request_id": format!("req_{request_id}"),
        "request": { "subtype": "interrupt" },
    })
}

/// stdin frame carrying the user prompt.
pub fn user_prompt_frame(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [ { "type": "text", "text": prompt } ],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_success_line() {
        let line = r#"{"type":"result","subtype":"success","result":"hi","num_turns":1,
            "total_cost_usd":0.001,"is_error":false,"session_id":"s1",
            "usage":{"input_tokens":5,"output_tokens":7},"duration_ms":10,"duration_api_ms":8}"#;
        let msg: SdkMessage = serde_json::from_str(line).unwrap();
        match msg {
            SdkMessage::Result {
                subtype,
                result,
                num_turns,
                total_cost_usd,
                ..
            } => {
                assert_eq!(subtype, "success");
                assert_eq!(result.as_deref(), Some("hi"));
                assert_eq!(num_turns, Some(1));
                assert_eq!(total_cost_usd, Some(0.001));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_can_use_tool_request() {
        let line = r#"{"type":"control_request","request_id":"r1",
            "request":{"subtype":"can_use_tool","tool_name":"Write","input":{"file_path":"/x"}}}"#;
        let msg: SdkMessage = serde_json::from_str(line).unwrap();
        match msg {
            SdkMessage::ControlRequest { request_id, request } => {
                assert_eq!(request_id, "r1");
                assert_eq!(request.subtype, "can_use_tool");
                assert_eq!(request.tool_name.as_deref(), Some("Write"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn permission_result_wire_shape() {
        let allow = serde_json::to_value(PermissionResult::allow(&json!({"a": 1}))).unwrap();
        assert_eq!(allow["behavior"], "allow");
        assert_eq!(allow["updatedInput"]["a"], 1);

        let deny = serde_json::to_value(PermissionResult::deny("nope")).unwrap();
        assert_eq!(deny["behavior"], "deny");
        assert_eq!(deny["message"], "nope");
    }

    #[test]
    fn stream_event_session_id_is_surfaced() {
        let line = r#"{"type":"stream_event","session_id":"s9","event":{"type":"message_start"}}"#;
        let msg: SdkMessage = serde_json::from_str(line).unwrap();
        assert_eq!(msg.session_id(), Some("s9"));
    }
}
