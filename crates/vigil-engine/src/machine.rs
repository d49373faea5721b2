//! The run state machine.
//!
//! A checkpoint makes at most one oracle call. Everything it decides is
//! journaled before it acts, so a checkpoint interrupted at any point is
//! finished by the next one from the journal alone.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vigil_core::events::{Decision, JournalEvent, SystemErrorKind, ToolResultStatus};
use vigil_core::ids::{ApprovalId, RunId, ToolCallId};
use vigil_core::messages::Message;
use vigil_core::oracle::{OracleRequest, ReasoningOracle};
use vigil_core::run::{Awaiting, PendingTool, RunStatus};
use vigil_core::tools::{Delegator, ToolClassification, ToolContext};
use vigil_store::approvals::{ApprovalRepo, NewApproval};
use vigil_store::journal::{find_pending_tool, unresolved_proposals, JournalEntry, ProposedCall};
use vigil_store::runs::{RunRepo, RunRow, Transition};
use vigil_store::StoreError;

use crate::agents::{AgentDefinition, AgentDefinitionRegistry};
use crate::catalog::ToolCatalog;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::journal::Journal;
use crate::projection::project;

/// Where a run stands after a checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointOutcome {
    /// Still running; call `checkpoint` again.
    Continue,
    /// Parked on the given call until a decision or a child run arrives.
    Suspended(PendingTool),
    Terminal(RunStatus),
}

/// A reviewer's decision on a suspended run's pending call.
#[derive(Clone, Debug)]
pub struct ApprovalResolution {
    pub approval_id: ApprovalId,
    pub decision: Decision,
    pub feedback: Option<String>,
}

pub struct RunStateMachine {
    runs: RunRepo,
    journal: Journal,
    approvals: ApprovalRepo,
    agents: Arc<dyn AgentDefinitionRegistry>,
    oracle: Arc<dyn ReasoningOracle>,
    config: EngineConfig,
}

impl RunStateMachine {
    pub fn new(
        runs: RunRepo,
        journal: Journal,
        approvals: ApprovalRepo,
        agents: Arc<dyn AgentDefinitionRegistry>,
        oracle: Arc<dyn ReasoningOracle>,
        config: EngineConfig,
    ) -> Self {
        Self {
            runs,
            journal,
            approvals,
            agents,
            oracle,
            config,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn runs(&self) -> &RunRepo {
        &self.runs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance the run by one checkpoint.
    ///
    /// Safe to call again after any interruption. A run closed underneath
    /// the checkpoint reports its terminal status instead of an error.
    #[instrument(skip(self, cancel, delegator), fields(run_id = %run_id))]
    pub async fn checkpoint(
        &self,
        run_id: &RunId,
        cancel: &CancellationToken,
        delegator: Option<Arc<dyn Delegator>>,
    ) -> Result<CheckpointOutcome, EngineError> {
        match self.step(run_id, cancel, delegator).await {
            Err(e) if e.is_run_closed() => self.current_outcome(run_id),
            other => other,
        }
    }

    /// Record a reviewer's decision on a run suspended for approval, then
    /// settle the pending call in the same checkpoint.
    #[instrument(skip(self, resolution, cancel, delegator), fields(run_id = %run_id, decision = %resolution.decision))]
    pub async fn resume(
        &self,
        run_id: &RunId,
        resolution: &ApprovalResolution,
        cancel: &CancellationToken,
        delegator: Option<Arc<dyn Delegator>>,
    ) -> Result<CheckpointOutcome, EngineError> {
        let run = self.load(run_id)?;
        match run.status {
            status if status.is_terminal() => return Ok(CheckpointOutcome::Terminal(status)),
            RunStatus::Pending => return Err(EngineError::NoPendingApproval(run_id.clone())),
            RunStatus::Running => {
                // Decision already recorded; the checkpoint settles the call.
            }
            RunStatus::Suspended => {
                let pending = match &run.pending_tool {
                    Some(p) if p.awaiting == Awaiting::Approval => p.clone(),
                    _ => return Err(EngineError::NoPendingApproval(run_id.clone())),
                };
                // The snapshot must agree with the journal's open proposal.
                let entries = self.journal.list(run_id)?;
                match find_pending_tool(&entries) {
                    Some(call) if call.tool_call_id == pending.tool_call_id => {}
                    other => {
                        return Err(EngineError::Internal(format!(
                            "run {run_id} is suspended on {} but the journal's open proposal is {}",
                            pending.tool_call_id,
                            other.map(|c| c.tool_call_id.to_string()).unwrap_or_else(|| "none".into())
                        )));
                    }
                }
                let resumed = self.journal.append_transition(
                    run_id,
                    &JournalEvent::RunResumed {
                        decision: Some(resolution.decision),
                        feedback: resolution.feedback.clone(),
                        approval_id: Some(resolution.approval_id.clone()),
                        tool_call_id: Some(pending.tool_call_id.clone()),
                        child_run_id: None,
                    },
                    Some(&format!("resumed:{}", resolution.approval_id)),
                    &Transition::to(RunStatus::Running),
                );
                match resumed {
                    Ok(_) => info!(tool = %pending.tool_name, "run resumed"),
                    Err(e) => {
                        let err = EngineError::for_run(run_id, e);
                        if err.is_run_closed() {
                            return self.current_outcome(run_id);
                        }
                        return Err(err);
                    }
                }
            }
            _ => {}
        }

        self.checkpoint(run_id, cancel, delegator).await
    }

    /// Close the run as failed with a `SYSTEM_ERROR` entry.
    #[instrument(skip(self, message), fields(run_id = %run_id, kind = ?kind))]
    pub fn fail(
        &self,
        run_id: &RunId,
        kind: SystemErrorKind,
        message: impl Into<String>,
    ) -> Result<CheckpointOutcome, EngineError> {
        let message = message.into();
        let result = self.journal.append_transition(
            run_id,
            &JournalEvent::SystemError {
                kind,
                message: message.clone(),
            },
            Some("failed"),
            &Transition::to(RunStatus::Failed).with_message(message.clone()),
        );
        match result {
            Ok(_) => {
                warn!(run_id = %run_id, kind = ?kind, error = %message, "run failed");
                Ok(CheckpointOutcome::Terminal(RunStatus::Failed))
            }
            Err(StoreError::InvalidTransition { .. }) => self.current_outcome(run_id),
            Err(e) => Err(EngineError::for_run(run_id, e)),
        }
    }

    fn complete(&self, run_id: &RunId, summary: Option<String>) -> Result<CheckpointOutcome, EngineError> {
        let mut transition = Transition::to(RunStatus::Completed);
        if let Some(summary) = &summary {
            transition = transition.with_message(summary.clone());
        }
        self.journal.append_transition(
            run_id,
            &JournalEvent::RunCompleted { summary },
            Some("completed"),
            &transition,
        )?;
        info!(run_id = %run_id, "run completed");
        Ok(CheckpointOutcome::Terminal(RunStatus::Completed))
    }

    /// Open the approval request, then park the run on it. The request
    /// exists before the run is observed as suspended.
    fn suspend(&self, run_id: &RunId, pending: PendingTool) -> Result<CheckpointOutcome, EngineError> {
        self.approvals.open(&NewApproval {
            run_id: run_id.clone(),
            tool_call_id: pending.tool_call_id.clone(),
            tool_name: pending.tool_name.clone(),
            arguments: pending.arguments.clone(),
            step: pending.step,
        })?;
        let reason = format!("{} requires approval", pending.tool_name);
        self.journal.append_transition(
            run_id,
            &JournalEvent::RunSuspended {
                tool_call_id: pending.tool_call_id.clone(),
                tool_name: pending.tool_name.clone(),
                awaiting: Awaiting::Approval,
                reason: reason.clone(),
            },
            Some(&format!("suspended:{}", pending.tool_call_id)),
            &Transition::suspended(pending.clone(), reason),
        )?;
        info!(run_id = %run_id, tool = %pending.tool_name, "run suspended for approval");
        Ok(CheckpointOutcome::Suspended(pending))
    }

    async fn step(
        &self,
        run_id: &RunId,
        cancel: &CancellationToken,
        delegator: Option<Arc<dyn Delegator>>,
    ) -> Result<CheckpointOutcome, EngineError> {
        let mut run = self.load(run_id)?;

        match run.status {
            status if status.is_terminal() => return Ok(CheckpointOutcome::Terminal(status)),
            RunStatus::Pending => {
                self.journal.append_transition(
                    run_id,
                    &JournalEvent::RunStarted {
                        task: run.task.clone(),
                        agent_kind: run.agent_kind.clone(),
                        parent_run_id: run.parent_run_id.clone(),
                    },
                    Some("run_started"),
                    &Transition::to(RunStatus::Running),
                )?;
                debug!(agent_kind = %run.agent_kind, "run started");
                run = self.load(run_id)?;
            }
            RunStatus::Suspended => match &run.pending_tool {
                Some(pending) if pending.awaiting == Awaiting::Approval => {
                    return Ok(CheckpointOutcome::Suspended(pending.clone()));
                }
                // Blocked on a child: re-enter the delegation call below.
                Some(_) => {}
                None => {
                    return self.fail(run_id, SystemErrorKind::Internal, "suspended without a pending call");
                }
            },
            _ => {}
        }

        let Some(agent) = self.agents.get(&run.agent_kind) else {
            return self.fail(
                run_id,
                SystemErrorKind::Internal,
                format!("unknown agent kind: {}", run.agent_kind),
            );
        };

        let entries = self.journal.list(run_id)?;
        let open = unresolved_proposals(&entries);
        if !open.is_empty() {
            return self.settle_open_calls(&run, &agent, open, cancel, delegator).await;
        }

        if run.status == RunStatus::Suspended {
            return self.fail(
                run_id,
                SystemErrorKind::Internal,
                "suspended on a child run without an open delegation call",
            );
        }

        if run.current_step >= self.config.max_steps {
            return self.fail(
                run_id,
                SystemErrorKind::StepBudgetExceeded,
                format!("step budget of {} exhausted", self.config.max_steps),
            );
        }

        self.reason(&run, &agent, &entries, cancel, delegator).await
    }

    /// One oracle call and everything it proposes.
    async fn reason(
        &self,
        run: &RunRow,
        agent: &AgentDefinition,
        entries: &[JournalEntry],
        cancel: &CancellationToken,
        delegator: Option<Arc<dyn Delegator>>,
    ) -> Result<CheckpointOutcome, EngineError> {
        let run_id = &run.id;
        let step = run.current_step;

        let mut messages = vec![Message::user(run.task.clone())];
        messages.extend(project(entries));

        let (safe, dangerous) = agent.tools.partition();
        debug!(step, safe = safe.len(), dangerous = dangerous.len(), "calling oracle");
        let request = OracleRequest {
            run_id: run_id.clone(),
            agent_kind: run.agent_kind.clone(),
            system_prompt: agent.system_prompt.clone(),
            messages,
            tools: safe.into_iter().chain(dangerous).collect(),
        };

        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.current_outcome(run_id),
            turn = self.oracle.generate(&request) => turn,
        };
        let turn = match generated {
            Ok(turn) => turn,
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    oracle = self.oracle.name(),
                    error_kind = e.error_kind(),
                    error = %e,
                    "oracle call failed"
                );
                return self.fail(run_id, SystemErrorKind::OracleFailure, e.to_string());
            }
        };

        // One thought per step: a retried checkpoint keeps the first.
        if let Some(text) = turn.text() {
            self.journal.append_idempotent(
                run_id,
                &JournalEvent::AgentThought {
                    text: text.to_string(),
                    step,
                },
                &format!("thought:{step}"),
            )?;
        }

        // Every proposal is durable before anything runs.
        for call in &turn.tool_calls {
            self.journal.append_idempotent(
                run_id,
                &JournalEvent::ToolProposed {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    classification: agent.tools.classify(&call.name),
                    step,
                },
                &format!("proposed:{}", call.id),
            )?;
        }

        let mut queued: Option<PendingTool> = None;
        for call in &turn.tool_calls {
            if let Some(first) = &queued {
                self.record_skipped(run_id, &call.id, &call.name, &first.tool_name)?;
                continue;
            }
            if agent.tools.classify(&call.name) == ToolClassification::Dangerous {
                queued = Some(PendingTool {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    step,
                    awaiting: Awaiting::Approval,
                });
                continue;
            }
            let executed = self
                .execute_call(run, &agent.tools, &call.id, &call.name, &call.arguments, step, cancel, delegator.clone())
                .await?;
            if executed.is_none() {
                return self.current_outcome(run_id);
            }
        }

        self.runs.increment_step(run_id)?;

        if let Some(pending) = queued {
            return self.suspend(run_id, pending);
        }
        if turn.tool_calls.is_empty() || turn.finished {
            return self.complete(run_id, turn.text().map(str::to_string));
        }
        Ok(CheckpointOutcome::Continue)
    }

    /// Finish proposals left without a result by an interrupted checkpoint or
    /// a resumed suspension, applying the same ordering rules as a fresh turn.
    async fn settle_open_calls(
        &self,
        run: &RunRow,
        agent: &AgentDefinition,
        open: Vec<ProposedCall>,
        cancel: &CancellationToken,
        delegator: Option<Arc<dyn Delegator>>,
    ) -> Result<CheckpointOutcome, EngineError> {
        let run_id = &run.id;
        let turn_step = open.first().map(|c| c.step).unwrap_or(run.current_step);
        debug!(open = open.len(), turn_step, "settling open tool calls");

        let mut queued: Option<PendingTool> = None;
        for call in open {
            if let Some(first) = &queued {
                self.record_skipped(run_id, &call.tool_call_id, &call.tool_name, &first.tool_name)?;
                continue;
            }
            match (&call.decision, call.classification) {
                (Some((Decision::Rejected, feedback)), _) => {
                    let content = match feedback.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
                        Some(feedback) => format!("Rejected by reviewer: {feedback}"),
                        None => "Rejected by reviewer".to_string(),
                    };
                    self.record_result(
                        run_id,
                        &call.tool_call_id,
                        &call.tool_name,
                        ToolResultStatus::Error,
                        content,
                        0,
                    )?;
                }
                (None, ToolClassification::Dangerous) => {
                    queued = Some(PendingTool {
                        tool_call_id: call.tool_call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        arguments: call.arguments.clone(),
                        step: call.step,
                        awaiting: Awaiting::Approval,
                    });
                }
                (Some((Decision::Approved, _)), _) | (None, ToolClassification::Safe) => {
                    let executed = self
                        .execute_call(
                            run,
                            &agent.tools,
                            &call.tool_call_id,
                            &call.tool_name,
                            &call.arguments,
                            call.step,
                            cancel,
                            delegator.clone(),
                        )
                        .await?;
                    if executed.is_none() {
                        return self.current_outcome(run_id);
                    }
                }
            }
        }

        // The interrupted turn never reached its step increment.
        if turn_step >= run.current_step {
            self.runs.increment_step(run_id)?;
        }

        match queued {
            Some(pending) => self.suspend(run_id, pending),
            None => Ok(CheckpointOutcome::Continue),
        }
    }

    /// Run one tool and record its result. Returns `None` when interrupted by
    /// cancellation before a result was recorded.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, run, tools, arguments, cancel, delegator), fields(run_id = %run.id, tool = %name, tool_call_id = %call_id))]
    async fn execute_call(
        &self,
        run: &RunRow,
        tools: &ToolCatalog,
        call_id: &ToolCallId,
        name: &str,
        arguments: &serde_json::Value,
        step: u32,
        cancel: &CancellationToken,
        delegator: Option<Arc<dyn Delegator>>,
    ) -> Result<Option<ToolResultStatus>, EngineError> {
        let run_id = &run.id;
        if let Some(existing) = self.journal.find_by_key(run_id, &format!("result:{call_id}"))? {
            return Ok(Some(recorded_status(&existing)));
        }

        let Some(tool) = tools.get(name) else {
            warn!(tool = %name, "oracle proposed an unknown tool");
            let status = self.record_result(
                run_id,
                call_id,
                name,
                ToolResultStatus::Error,
                format!("Unknown tool: {name}"),
                0,
            )?;
            return Ok(Some(status));
        };

        let ctx = ToolContext {
            run_id: run_id.clone(),
            agent_kind: run.agent_kind.clone(),
            tool_call_id: call_id.clone(),
            step,
            working_directory: self.config.working_directory.clone(),
            cancel: cancel.child_token(),
            delegator,
        };

        let timeout = self.config.tool_timeout;
        let start = Instant::now();
        let invocation = AssertUnwindSafe(tool.invoke(arguments.clone(), &ctx)).catch_unwind();
        let bounded = tool.bounded();
        let run_tool = async move {
            if bounded {
                tokio::time::timeout(timeout, invocation).await.ok()
            } else {
                Some(invocation.await)
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("tool interrupted by cancellation");
                return Ok(None);
            }
            outcome = run_tool => outcome,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, content) = match outcome {
            Some(Ok(Ok(output))) if output.is_error => (ToolResultStatus::Error, output.content),
            Some(Ok(Ok(output))) => (ToolResultStatus::Success, output.content),
            Some(Ok(Err(e))) => {
                debug!(error = %e, "tool returned an error");
                (ToolResultStatus::Error, e.to_string())
            }
            Some(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %name, panic = %msg, "tool panicked during execution");
                (ToolResultStatus::Error, "Internal error: tool crashed".to_string())
            }
            None => {
                warn!(tool = %name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                (
                    ToolResultStatus::Error,
                    format!("Tool timed out after {timeout:?}"),
                )
            }
        };

        self.record_result(run_id, call_id, name, status, content, duration_ms)
            .map(Some)
    }

    fn record_skipped(
        &self,
        run_id: &RunId,
        call_id: &ToolCallId,
        name: &str,
        queued_tool: &str,
    ) -> Result<ToolResultStatus, EngineError> {
        self.record_result(
            run_id,
            call_id,
            name,
            ToolResultStatus::Skipped,
            format!(
                "Skipped: an earlier {queued_tool} call in this turn is awaiting approval. \
                 Propose {name} again once that call is resolved."
            ),
            0,
        )
    }

    fn record_result(
        &self,
        run_id: &RunId,
        call_id: &ToolCallId,
        name: &str,
        status: ToolResultStatus,
        content: String,
        duration_ms: u64,
    ) -> Result<ToolResultStatus, EngineError> {
        let appended = self.journal.append_idempotent(
            run_id,
            &JournalEvent::ToolResult {
                tool_call_id: call_id.clone(),
                tool_name: name.to_string(),
                status,
                content,
                duration_ms,
            },
            &format!("result:{call_id}"),
        )?;
        Ok(recorded_status(&appended.entry))
    }

    fn load(&self, run_id: &RunId) -> Result<RunRow, EngineError> {
        self.runs.get(run_id).map_err(|e| EngineError::for_run(run_id, e))
    }

    /// Outcome implied by the stored status alone.
    fn current_outcome(&self, run_id: &RunId) -> Result<CheckpointOutcome, EngineError> {
        let run = self.load(run_id)?;
        Ok(match run.status {
            status if status.is_terminal() => CheckpointOutcome::Terminal(status),
            RunStatus::Suspended => match run.pending_tool {
                Some(pending) => CheckpointOutcome::Suspended(pending),
                None => CheckpointOutcome::Continue,
            },
            _ => CheckpointOutcome::Continue,
        })
    }
}

fn recorded_status(entry: &JournalEntry) -> ToolResultStatus {
    match &entry.event {
        JournalEvent::ToolResult { status, .. } => *status,
        _ => ToolResultStatus::Error,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
