use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::RunId;
use crate::messages::{Message, ToolCall};
use crate::tools::ToolDefinition;

/// Everything the oracle sees for one reasoning call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleRequest {
    pub run_id: RunId,
    pub agent_kind: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// A single reasoning turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleTurn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// The oracle considers the task done.
    #[serde(default)]
    pub finished: bool,
}

impl OracleTurn {
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Single-turn reasoning call. Implementations never loop internally.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &OracleRequest) -> Result<OracleTurn, OracleError>;
}

/// Failures surfaced by an oracle. None of them are retried by the engine.
#[derive(Clone, Debug, thiserror::Error)]
pub enum OracleError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("context window exceeded: {actual} > {limit}")]
    ContextWindowExceeded { limit: usize, actual: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl OracleError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidResponse(_) => "invalid_response",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
        }
    }
}
