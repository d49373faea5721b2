//! Journal event taxonomy.
//!
//! Every entry in a run's journal carries exactly one [`JournalEvent`]. The
//! store persists the discriminant in its own column and the variant fields
//! as a JSON payload; [`JournalEvent::from_parts`] reverses that split.

use serde::{Deserialize, Serialize};

use crate::ids::{ApprovalId, RunId, ToolCallId};
use crate::run::{Awaiting, RunStatus};
use crate::tools::ToolClassification;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Success,
    Error,
    Skipped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => f.write_str("approved"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemErrorKind {
    OracleFailure,
    ApprovalTimeout,
    StepBudgetExceeded,
    OrphanedRun,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalEvent {
    RunStarted {
        task: String,
        agent_kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<RunId>,
    },
    AgentThought {
        text: String,
        step: u32,
    },
    ToolProposed {
        tool_call_id: ToolCallId,
        tool_name: String,
        arguments: serde_json::Value,
        classification: ToolClassification,
        step: u32,
    },
    RunSuspended {
        tool_call_id: ToolCallId,
        tool_name: String,
        awaiting: Awaiting,
        reason: String,
    },
    RunResumed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decision: Option<Decision>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval_id: Option<ApprovalId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<ToolCallId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child_run_id: Option<RunId>,
    },
    ToolResult {
        tool_call_id: ToolCallId,
        tool_name: String,
        status: ToolResultStatus,
        content: String,
        #[serde(default)]
        duration_ms: u64,
    },
    RunCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    SystemError {
        kind: SystemErrorKind,
        message: String,
    },
    ChildRunStarted {
        child_run_id: RunId,
        agent_kind: String,
        task: String,
        tool_call_id: ToolCallId,
    },
    ChildRunCompleted {
        child_run_id: RunId,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    RunCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Discriminant of a [`JournalEvent`], as stored in `journal_entries.event_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    RunStarted,
    AgentThought,
    ToolProposed,
    RunSuspended,
    RunResumed,
    ToolResult,
    RunCompleted,
    SystemError,
    ChildRunStarted,
    ChildRunCompleted,
    RunCancelled,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::AgentThought => "AGENT_THOUGHT",
            Self::ToolProposed => "TOOL_PROPOSED",
            Self::RunSuspended => "RUN_SUSPENDED",
            Self::RunResumed => "RUN_RESUMED",
            Self::ToolResult => "TOOL_RESULT",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::SystemError => "SYSTEM_ERROR",
            Self::ChildRunStarted => "CHILD_RUN_STARTED",
            Self::ChildRunCompleted => "CHILD_RUN_COMPLETED",
            Self::RunCancelled => "RUN_CANCELLED",
        }
    }

    /// Events that close a run. A subscriber stream ends after one of these.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RunCompleted | Self::SystemError | Self::RunCancelled)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "RUN_STARTED" => Self::RunStarted,
            "AGENT_THOUGHT" => Self::AgentThought,
            "TOOL_PROPOSED" => Self::ToolProposed,
            "RUN_SUSPENDED" => Self::RunSuspended,
            "RUN_RESUMED" => Self::RunResumed,
            "TOOL_RESULT" => Self::ToolResult,
            "RUN_COMPLETED" => Self::RunCompleted,
            "SYSTEM_ERROR" => Self::SystemError,
            "CHILD_RUN_STARTED" => Self::ChildRunStarted,
            "CHILD_RUN_COMPLETED" => Self::ChildRunCompleted,
            "RUN_CANCELLED" => Self::RunCancelled,
            other => return Err(format!("unknown event type: {other}")),
        })
    }
}

impl JournalEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted { .. } => EventType::RunStarted,
            Self::AgentThought { .. } => EventType::AgentThought,
            Self::ToolProposed { .. } => EventType::ToolProposed,
            Self::RunSuspended { .. } => EventType::RunSuspended,
            Self::RunResumed { .. } => EventType::RunResumed,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::RunCompleted { .. } => EventType::RunCompleted,
            Self::SystemError { .. } => EventType::SystemError,
            Self::ChildRunStarted { .. } => EventType::ChildRunStarted,
            Self::ChildRunCompleted { .. } => EventType::ChildRunCompleted,
            Self::RunCancelled { .. } => EventType::RunCancelled,
        }
    }

    /// The variant fields as a standalone JSON object.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::Value::Object(Default::default())))
    }

    /// Rebuild an event from its stored discriminant and payload.
    pub fn from_parts(
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": event_type.as_str(),
            "payload": payload,
        }))
    }
}
