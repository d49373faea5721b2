use serde::{Deserialize, Serialize};

use crate::events::ToolResultStatus;
use crate::ids::ToolCallId;

/// A tool invocation requested by the oracle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Conversation message handed to the oracle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: ToolCallId,
        name: String,
        content: String,
        status: ToolResultStatus,
    },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(
        tool_call_id: ToolCallId,
        name: impl Into<String>,
        content: impl Into<String>,
        status: ToolResultStatus,
    ) -> Self {
        Self::Tool {
            tool_call_id,
            name: name.into(),
            content: content.into(),
            status,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_tag_on_wire() {
        let msg = Message::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");
    }

    #[test]
    fn assistant_without_calls_omits_field() {
        let json = serde_json::to_value(Message::assistant_text("done")).unwrap();
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn tool_message_carries_status() {
        let msg = Message::tool_result(
            ToolCallId::from_raw("call_9"),
            "write_file",
            "skipped",
            ToolResultStatus::Skipped,
        );
        assert_eq!(msg.role(), "tool");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["tool_call_id"], "call_9");
    }
}
