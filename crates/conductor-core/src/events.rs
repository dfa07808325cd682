use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of live progress events relayed to stream subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    ToolCall,
    ToolResult,
    Transfer,
    Error,
    Complete,
    Ping,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Transfer => "transfer",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Ping => "ping",
        };
        f.write_str(s)
    }
}

/// Wire schema of a live event. Advisory only: delivery is at-most-once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl StreamEvent {
    fn bare(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            agent_name: None,
            content: None,
            error: None,
            data: None,
        }
    }

    pub fn message(agent_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            content: Some(content.into()),
            ..Self::bare(EventType::Message)
        }
    }

    pub fn tool_call(
        agent_name: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            data: Some(serde_json::json!({
                "tool_name": tool_name.into(),
                "arguments": arguments,
            })),
            ..Self::bare(EventType::ToolCall)
        }
    }

    pub fn tool_result(
        agent_name: impl Into<String>,
        tool_name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            data: Some(serde_json::json!({
                "tool_name": tool_name.into(),
                "result": result.into(),
            })),
            ..Self::bare(EventType::ToolResult)
        }
    }

    pub fn transfer(from_agent: impl Into<String>, to_agent: impl Into<String>) -> Self {
        Self {
            agent_name: Some(from_agent.into()),
            data: Some(serde_json::json!({ "to_agent": to_agent.into() })),
            ..Self::bare(EventType::Transfer)
        }
    }

    pub fn error(agent_name: Option<String>, message: impl Into<String>) -> Self {
        Self {
            agent_name,
            error: Some(message.into()),
            ..Self::bare(EventType::Error)
        }
    }

    pub fn complete(content: Option<String>) -> Self {
        Self {
            content,
            ..Self::bare(EventType::Complete)
        }
    }

    pub fn ping() -> Self {
        Self::bare(EventType::Ping)
    }

    /// True for the events that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::Complete | EventType::Error)
    }
}
