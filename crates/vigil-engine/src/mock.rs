//! Deterministic oracle for tests and demos.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use vigil_core::ids::ToolCallId;
use vigil_core::messages::ToolCall;
use vigil_core::oracle::{OracleError, OracleRequest, OracleTurn, ReasoningOracle};

/// One pre-programmed oracle reply.
pub enum ScriptedTurn {
    Reply(OracleTurn),
    Error(OracleError),
    /// Wait, then produce the inner reply.
    Delay(Duration, Box<ScriptedTurn>),
}

impl ScriptedTurn {
    /// Text only, signalling the task is done.
    pub fn finish(text: &str) -> Self {
        Self::Reply(OracleTurn {
            text: Some(text.to_string()),
            tool_calls: Vec::new(),
            finished: true,
        })
    }

    /// A single tool call with fresh call id.
    pub fn call(name: &str, arguments: serde_json::Value) -> Self {
        Self::calls(None, vec![(name, arguments)])
    }

    /// Several tool calls in order, optionally preceded by text.
    pub fn calls(text: Option<&str>, calls: Vec<(&str, serde_json::Value)>) -> Self {
        Self::Reply(OracleTurn {
            text: text.map(str::to_string),
            tool_calls: calls
                .into_iter()
                .map(|(name, arguments)| ToolCall {
                    id: ToolCallId::new(),
                    name: name.to_string(),
                    arguments,
                })
                .collect(),
            finished: false,
        })
    }

    pub fn delayed(delay: Duration, inner: ScriptedTurn) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Oracle that replays queued turns per agent kind and records every request.
///
/// An agent kind with an exhausted queue gets `OracleError::InvalidRequest`.
#[derive(Default)]
pub struct ScriptedOracle {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedTurn>>>,
    requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue turns for an agent kind.
    pub fn script(self, agent_kind: &str, turns: Vec<ScriptedTurn>) -> Self {
        self.push_all(agent_kind, turns);
        self
    }

    pub fn push(&self, agent_kind: &str, turn: ScriptedTurn) {
        self.push_all(agent_kind, vec![turn]);
    }

    fn push_all(&self, agent_kind: &str, turns: Vec<ScriptedTurn>) {
        self.scripts
            .lock()
            .entry(agent_kind.to_string())
            .or_default()
            .extend(turns);
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, agent_kind: &str) -> Vec<OracleRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.agent_kind == agent_kind)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn remaining(&self, agent_kind: &str) -> usize {
        self.scripts.lock().get(agent_kind).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &OracleRequest) -> Result<OracleTurn, OracleError> {
        self.requests.lock().push(request.clone());

        let next = self
            .scripts
            .lock()
            .get_mut(&request.agent_kind)
            .and_then(VecDeque::pop_front);

        let mut next = next.ok_or_else(|| {
            OracleError::InvalidRequest(format!(
                "no scripted turn left for agent kind {}",
                request.agent_kind
            ))
        })?;

        loop {
            match next {
                ScriptedTurn::Reply(turn) => return Ok(turn),
                ScriptedTurn::Error(err) => return Err(err),
                ScriptedTurn::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    next = *inner;
                }
            }
        }
    }
}
