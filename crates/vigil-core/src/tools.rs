use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::{RunId, ToolCallId};

/// Whether a tool may run inline or needs a human decision first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClassification {
    /// Executed inline during a checkpoint.
    Safe,
    /// Proposal-only until approved.
    Dangerous,
}

/// Context available to tools during execution.
#[derive(Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub agent_kind: String,
    pub tool_call_id: ToolCallId,
    pub step: u32,
    pub working_directory: PathBuf,
    pub cancel: CancellationToken,
    /// Present when the engine can spawn child runs on behalf of this tool.
    pub delegator: Option<Arc<dyn Delegator>>,
}

/// Output returned by a tool execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition sent to the oracle. Carries no executable form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub classification: ToolClassification,
}

impl ToolDefinition {
    pub fn requires_approval(&self) -> bool {
        self.classification == ToolClassification::Dangerous
    }
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    fn classification(&self) -> ToolClassification {
        ToolClassification::Safe
    }

    /// Whether the engine should bound this tool with its default timeout.
    /// Tools that enforce their own deadlines return false.
    fn bounded(&self) -> bool {
        true
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
            classification: self.classification(),
        }
    }
}

/// A request to run a task under another agent kind as a child run.
#[derive(Clone, Debug)]
pub struct DelegationRequest {
    pub parent_run_id: RunId,
    pub tool_call_id: ToolCallId,
    pub agent_kind: String,
    pub task: String,
}

/// Seam through which a tool hands work to a child run.
#[async_trait]
pub trait Delegator: Send + Sync {
    async fn delegate(&self, request: DelegationRequest) -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("delegation failed: {0}")]
    Delegation(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}
