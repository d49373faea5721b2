//! Child runs started by the `delegate_task` tool.
//!
//! The broker journals the child on the parent before creating it, so a
//! restarted parent re-attaches to the same child instead of starting a new
//! one. While the child waits for a reviewer the parent is parked on it, and
//! it is resumed as soon as the child moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use vigil_core::events::{JournalEvent, SystemErrorKind};
use vigil_core::ids::{RunId, ToolCallId};
use vigil_core::run::{Awaiting, PendingTool, RunStatus};
use vigil_core::tools::{DelegationRequest, Delegator, ToolError, ToolOutput};
use vigil_store::journal::JournalEntry;
use vigil_store::runs::{NewRun, RunRow, Transition};
use vigil_store::StoreError;

use crate::agents::ORCHESTRATOR_KIND;
use crate::error::EngineError;
use crate::journal::next_entry_for;
use crate::supervisor::RunSupervisor;

const DELEGATE_TOOL: &str = "delegate_task";

/// [`Delegator`] that runs each request as a supervised child run.
pub struct DelegationBroker {
    supervisor: Arc<RunSupervisor>,
}

impl DelegationBroker {
    pub fn new(supervisor: Arc<RunSupervisor>) -> Self {
        Self { supervisor }
    }

    fn validate(&self, request: &DelegationRequest) -> Result<(), EngineError> {
        if request.agent_kind == ORCHESTRATOR_KIND {
            return Err(EngineError::DelegationRejected(format!(
                "cannot delegate to the {ORCHESTRATOR_KIND} agent"
            )));
        }
        if self.supervisor.agents().get(&request.agent_kind).is_none() {
            return Err(EngineError::UnknownAgentKind(request.agent_kind.clone()));
        }
        let max = self.supervisor.config().max_delegation_depth;
        let depth = self.supervisor.runs().depth(&request.parent_run_id)?;
        if depth + 1 > max {
            return Err(EngineError::DelegationRejected(format!(
                "delegation depth limit of {max} reached"
            )));
        }
        Ok(())
    }

    /// The child for this call, creating and journaling it on first use.
    fn attach_child(&self, request: &DelegationRequest, parent: &RunRow) -> Result<RunId, EngineError> {
        let journal = self.supervisor.journal();
        let key = format!("child:{}", request.tool_call_id);

        let entry = match journal.find_by_key(&parent.id, &key)? {
            Some(entry) => entry,
            None => {
                self.validate(request)?;
                journal
                    .append_idempotent(
                        &parent.id,
                        &JournalEvent::ChildRunStarted {
                            child_run_id: RunId::new(),
                            agent_kind: request.agent_kind.clone(),
                            task: request.task.clone(),
                            tool_call_id: request.tool_call_id.clone(),
                        },
                        &key,
                    )?
                    .entry
            }
        };
        let JournalEvent::ChildRunStarted { child_run_id, .. } = entry.event else {
            return Err(EngineError::Internal(format!(
                "journal key {key} does not record a child run"
            )));
        };

        match self.supervisor.runs().get(&child_run_id) {
            Ok(_) => debug!(child_run_id = %child_run_id, "re-attached to child run"),
            Err(StoreError::NotFound(_)) => {
                self.supervisor.runs().create_with_id(
                    &child_run_id,
                    &NewRun {
                        task: request.task.clone(),
                        agent_kind: request.agent_kind.clone(),
                        user_id: parent.user_id.clone(),
                        parent_run_id: Some(parent.id.clone()),
                    },
                )?;
                info!(
                    parent_run_id = %parent.id,
                    child_run_id = %child_run_id,
                    agent_kind = %request.agent_kind,
                    "child run created"
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(child_run_id)
    }

    /// Wait for the child to finish, mirroring its suspension onto the parent.
    async fn supervise(
        &self,
        request: &DelegationRequest,
        child_id: &RunId,
    ) -> Result<RunRow, Supervision> {
        let config = self.supervisor.config();
        let runs = self.supervisor.runs();
        let mut rx = self.supervisor.journal().bus().subscribe();

        loop {
            let child = runs.get(child_id)?;
            let parent = runs.get(&request.parent_run_id)?;
            if child.status.is_terminal() {
                return Ok(child);
            }
            if parent.status.is_terminal() {
                return Err(Supervision::ParentClosed);
            }

            self.mirror_child(&parent, &child, &request.tool_call_id)?;

            if let Some((kind, message)) = self.overrun(&child)? {
                warn!(child_run_id = %child_id, error = %message, "child run timed out");
                self.supervisor.fail_run(child_id, kind, message)?;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(config.child_poll_interval) => {}
                _ = next_entry_for(&mut rx, child_id) => {}
            }
        }
    }

    /// The failure to record if the child has used up either budget.
    ///
    /// Running time excludes suspensions, so a reviewer's wait only counts
    /// against the approval budget, and that one restarts at each suspension.
    fn overrun(&self, child: &RunRow) -> Result<Option<(SystemErrorKind, String)>, EngineError> {
        let config = self.supervisor.config();
        let entries = self.supervisor.journal().list(&child.id)?;
        let clock = ChildClock::measure(&child.created_at, &entries, Utc::now());
        Ok(match clock.waiting {
            Some(waited) if waited >= config.child_approval_timeout => Some((
                SystemErrorKind::ApprovalTimeout,
                format!(
                    "child run waited {waited:?} for approval, over its {:?} budget",
                    config.child_approval_timeout
                ),
            )),
            None if clock.running >= config.child_timeout => Some((
                SystemErrorKind::Internal,
                format!(
                    "child run ran for {:?}, over its {:?} budget",
                    clock.running, config.child_timeout
                ),
            )),
            _ => None,
        })
    }

    /// Park the parent while the child is suspended; resume it once the child moves on.
    fn mirror_child(&self, parent: &RunRow, child: &RunRow, call_id: &ToolCallId) -> Result<(), EngineError> {
        let journal = self.supervisor.journal();
        let blocked_on_child = matches!(
            &parent.pending_tool,
            Some(PendingTool { awaiting: Awaiting::ChildRun { child_run_id }, .. }) if child_run_id == &child.id
        );

        if child.status == RunStatus::Suspended && parent.status == RunStatus::Running {
            let awaiting = Awaiting::ChildRun {
                child_run_id: child.id.clone(),
            };
            let reason = format!("waiting on child run {} for approval", child.id);
            let pending = PendingTool {
                tool_call_id: call_id.clone(),
                tool_name: DELEGATE_TOOL.to_string(),
                arguments: serde_json::json!({
                    "agent_kind": child.agent_kind,
                    "task": child.task,
                }),
                step: parent.current_step,
                awaiting: awaiting.clone(),
            };
            journal.append_transition(
                &parent.id,
                &JournalEvent::RunSuspended {
                    tool_call_id: call_id.clone(),
                    tool_name: DELEGATE_TOOL.to_string(),
                    awaiting,
                    reason: reason.clone(),
                },
                None,
                &Transition::suspended(pending, reason),
            )?;
            info!(parent_run_id = %parent.id, child_run_id = %child.id, "parent suspended on child run");
        } else if child.status != RunStatus::Suspended && parent.status == RunStatus::Suspended && blocked_on_child {
            self.resume_parent(parent, child, call_id)?;
        }
        Ok(())
    }

    fn resume_parent(&self, parent: &RunRow, child: &RunRow, call_id: &ToolCallId) -> Result<(), EngineError> {
        self.supervisor.journal().append_transition(
            &parent.id,
            &JournalEvent::RunResumed {
                decision: None,
                feedback: None,
                approval_id: None,
                tool_call_id: Some(call_id.clone()),
                child_run_id: Some(child.id.clone()),
            },
            None,
            &Transition::to(RunStatus::Running),
        )?;
        info!(parent_run_id = %parent.id, child_run_id = %child.id, "parent resumed from child run");
        Ok(())
    }

    /// Record the child's end on the parent and turn it into the tool output.
    fn conclude(
        &self,
        request: &DelegationRequest,
        child: &RunRow,
    ) -> Result<ToolOutput, EngineError> {
        let parent = self.supervisor.runs().get(&request.parent_run_id)?;
        if parent.status == RunStatus::Suspended {
            self.mirror_child(&parent, child, &request.tool_call_id)?;
        }

        let output = self.child_output(&child.id)?;
        self.supervisor.journal().append_idempotent(
            &request.parent_run_id,
            &JournalEvent::ChildRunCompleted {
                child_run_id: child.id.clone(),
                status: child.status,
                output: output.clone(),
            },
            &format!("child_completed:{}", request.tool_call_id),
        )?;

        Ok(match child.status {
            RunStatus::Completed => ToolOutput::text(
                output.unwrap_or_else(|| format!("Child run {} completed without output", child.id)),
            ),
            status => {
                let detail = child
                    .status_message
                    .as_deref()
                    .map(|m| format!(": {m}"))
                    .unwrap_or_default();
                ToolOutput::error(format!("Child run {} ended as {status}{detail}", child.id))
            }
        })
    }

    /// The child's completion summary, else its last thought.
    fn child_output(&self, child_id: &RunId) -> Result<Option<String>, EngineError> {
        let entries = self.supervisor.journal().list(child_id)?;
        let summary = entries.iter().rev().find_map(|e| match &e.event {
            JournalEvent::RunCompleted { summary } => Some(summary.clone()),
            _ => None,
        });
        if let Some(Some(summary)) = summary {
            return Ok(Some(summary));
        }
        Ok(entries.iter().rev().find_map(|e| match &e.event {
            JournalEvent::AgentThought { text, .. } => Some(text.clone()),
            _ => None,
        }))
    }
}

/// Why supervising a child stopped early.
enum Supervision {
    ParentClosed,
    Failed(EngineError),
}

impl From<EngineError> for Supervision {
    fn from(err: EngineError) -> Self {
        Self::Failed(err)
    }
}

impl From<StoreError> for Supervision {
    fn from(err: StoreError) -> Self {
        Self::Failed(err.into())
    }
}

#[async_trait]
impl Delegator for DelegationBroker {
    #[instrument(skip(self, request), fields(parent_run_id = %request.parent_run_id, agent_kind = %request.agent_kind))]
    async fn delegate(&self, request: DelegationRequest) -> Result<ToolOutput, ToolError> {
        let delegation = |e: EngineError| ToolError::Delegation(e.to_string());

        let parent = self
            .supervisor
            .runs()
            .get(&request.parent_run_id)
            .map_err(|e| delegation(EngineError::for_run(&request.parent_run_id, e)))?;
        let child_id = self.attach_child(&request, &parent).map_err(delegation)?;
        self.supervisor.launch(&child_id);

        let child = match self.supervise(&request, &child_id).await {
            Ok(child) => child,
            Err(Supervision::ParentClosed) => {
                debug!(child_run_id = %child_id, "parent closed; cancelling child");
                self.supervisor
                    .cancel_run(&child_id, "parent run closed")
                    .map_err(delegation)?;
                return Err(ToolError::Cancelled);
            }
            Err(Supervision::Failed(e)) if e.is_run_closed() => {
                self.supervisor
                    .cancel_run(&child_id, "parent run closed")
                    .map_err(delegation)?;
                return Err(ToolError::Cancelled);
            }
            Err(Supervision::Failed(e)) => return Err(delegation(e)),
        };

        info!(child_run_id = %child_id, status = %child.status, "child run finished");
        self.conclude(&request, &child).map_err(delegation)
    }
}

/// A child's time split into running and waiting, read from its journal so
/// it holds across restarts.
#[derive(Debug, PartialEq)]
struct ChildClock {
    /// Time spent outside suspensions.
    running: Duration,
    /// Length of the current suspension, if the child is suspended.
    waiting: Option<Duration>,
}

impl ChildClock {
    fn measure(created_at: &str, entries: &[JournalEntry], now: DateTime<Utc>) -> Self {
        let mut running = Duration::ZERO;
        let mut since = parse_timestamp(created_at).unwrap_or(now);
        let mut suspended_at: Option<DateTime<Utc>> = None;

        for entry in entries {
            let Some(at) = parse_timestamp(&entry.created_at) else {
                continue;
            };
            match entry.event {
                JournalEvent::RunSuspended { .. } if suspended_at.is_none() => {
                    running += between(since, at);
                    suspended_at = Some(at);
                }
                JournalEvent::RunResumed { .. } if suspended_at.is_some() => {
                    suspended_at = None;
                    since = at;
                }
                _ => {}
            }
        }

        match suspended_at {
            Some(at) => Self {
                running,
                waiting: Some(between(at, now)),
            },
            None => Self {
                running: running + between(since, now),
                waiting: None,
            },
        }
    }
}

fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Zero when `to` is not after `from`.
fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
