use async_trait::async_trait;
use vigil_core::tools::{DelegationRequest, Tool, ToolContext, ToolError, ToolOutput};

/// Hands a task to another agent kind as a child run and waits for its outcome.
///
/// The tool itself is safe; any dangerous call the child makes goes through
/// the child's own approval gate.
pub struct DelegateTaskTool;

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to another agent kind and return its result"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["agent_kind", "task"],
            "properties": {
                "agent_kind": {
                    "type": "string",
                    "description": "Agent kind to run the task (e.g. 'worker')"
                },
                "task": {
                    "type": "string",
                    "description": "Complete instructions for the child agent"
                }
            }
        })
    }

    /// The broker enforces child timeouts itself.
    fn bounded(&self) -> bool {
        false
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let agent_kind = args["agent_kind"]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("agent_kind is required".into()))?;
        let task = args["task"]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("task is required".into()))?;

        let Some(delegator) = ctx.delegator.as_ref() else {
            return Ok(ToolOutput::error("Delegation is not available in this context"));
        };

        delegator
            .delegate(DelegationRequest {
                parent_run_id: ctx.run_id.clone(),
                tool_call_id: ctx.tool_call_id.clone(),
                agent_kind: agent_kind.to_string(),
                task: task.to_string(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_ctx;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use vigil_core::tools::Delegator;

    #[derive(Default)]
    struct RecordingDelegator {
        requests: Mutex<Vec<DelegationRequest>>,
    }

    #[async_trait]
    impl Delegator for RecordingDelegator {
        async fn delegate(&self, request: DelegationRequest) -> Result<ToolOutput, ToolError> {
            let reply = format!("{} did: {}", request.agent_kind, request.task);
            self.requests.lock().push(request);
            Ok(ToolOutput::text(reply))
        }
    }

    #[test]
    fn unbounded_and_safe() {
        assert!(!DelegateTaskTool.bounded());
        assert!(!DelegateTaskTool.to_definition().requires_approval());
    }

    #[tokio::test]
    async fn forwards_to_delegator() {
        let delegator = Arc::new(RecordingDelegator::default());
        let mut ctx = test_ctx(&std::env::temp_dir());
        ctx.delegator = Some(delegator.clone());

        let out = DelegateTaskTool
            .invoke(
                serde_json::json!({"agent_kind": "worker", "task": "write notes"}),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(out.content, "worker did: write notes");
        let requests = delegator.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].parent_run_id, ctx.run_id);
        assert_eq!(requests[0].tool_call_id, ctx.tool_call_id);
    }

    #[tokio::test]
    async fn without_delegator_returns_error_output() {
        let out = DelegateTaskTool
            .invoke(
                serde_json::json!({"agent_kind": "worker", "task": "x"}),
                &test_ctx(&std::env::temp_dir()),
            )
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn blank_task_is_invalid() {
        let err = DelegateTaskTool
            .invoke(
                serde_json::json!({"agent_kind": "worker", "task": "  "}),
                &test_ctx(&std::env::temp_dir()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
