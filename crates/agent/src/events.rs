//! Agent-level events for the renderer.
//!
//! `AgentEvent` wraps provider chunks and tool activity into higher-level
//! events a terminal (or any other front end) draws as they arrive.

use meshtalk_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// Events emitted by the agent loop while a round runs.
///
/// - `text_delta`: partial text from the model
/// - `tool_call`: the model asked for a tool
/// - `approval_requested`: a call is parked until the user decides
/// - `tool_result`: a call resolved (success or error)
/// - `done`: the round finished
/// - `cancelled`: the user cancelled the round
/// - `error`: the round failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TextDelta { content: String },

    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ApprovalRequested {
        id: String,
        name: String,
        input: serde_json::Value,
        /// `known-safe` or `unreviewed` for shell commands
        #[serde(default, skip_serializing_if = "Option::is_none")]
        framing: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    Done {
        usage: Option<Usage>,
        rounds: u32,
        tool_calls_made: usize,
    },

    Cancelled,

    Error { message: String },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ApprovalRequested { .. } => "approval_requested",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Cancelled => "cancelled",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the round.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Cancelled | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_text_delta() {
        let event = AgentEvent::TextDelta {
            content: "Hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"text_delta""#));
        assert!(json.contains(r#""content":"Hello""#));
    }

    #[test]
    fn approval_request_omits_missing_framing() {
        let event = AgentEvent::ApprovalRequested {
            id: "call_1".into(),
            name: "read_file".into(),
            input: serde_json::json!({"path": "a"}),
            framing: None,
            reason: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "approval_requested");
        assert!(json.get("framing").is_none());
    }

    #[test]
    fn event_serialization_done() {
        let event = AgentEvent::Done {
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
                ..Usage::default()
            }),
            rounds: 2,
            tool_calls_made: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"done""#));
        assert!(json.contains(r#""rounds":2"#));
        assert!(event.is_terminal());
    }

    #[test]
    fn event_deserialization() {
        let event: AgentEvent = serde_json::from_str(r#"{"type":"cancelled"}"#).unwrap();
        assert_eq!(event, AgentEvent::Cancelled);
        assert_eq!(event.event_type(), "cancelled");
    }
}
