//! RunSupervisor: owns one driver task per live run.
//!
//! A driver calls [`RunStateMachine::checkpoint`] until the run is terminal,
//! waiting on the [`ApprovalGate`] whenever the run suspends for a reviewer.
//! Drivers hold no state the journal cannot rebuild, so [`RunSupervisor::recover`]
//! can relaunch every live run after a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use vigil_core::events::{Decision, SystemErrorKind};
use vigil_core::ids::{ApprovalId, RunId};
use vigil_core::oracle::ReasoningOracle;
use vigil_core::run::{Awaiting, PendingTool};
use vigil_core::tools::Delegator;
use vigil_store::approvals::{ApprovalRepo, ApprovalStatus, NewApproval};
use vigil_store::runs::{NewRun, RunRepo, RunRow};
use vigil_store::Database;

use crate::agents::AgentDefinitionRegistry;
use crate::config::EngineConfig;
use crate::delegation::DelegationBroker;
use crate::error::EngineError;
use crate::gate::{ApprovalGate, ApprovalNotifier, ApprovalOutcome};
use crate::journal::{next_entry_for, Journal, JournalBus};
use crate::lifecycle::{cancel_tree, sweep_orphans};
use crate::machine::{ApprovalResolution, CheckpointOutcome, RunStateMachine};
use crate::stream::{self, RunStream};

struct ActiveRun {
    cancel: CancellationToken,
    generation: u64,
}

/// What [`RunSupervisor::recover`] did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Child runs failed because their parent had already finished.
    pub orphaned: Vec<RunId>,
    pub relaunched: Vec<RunId>,
}

pub struct RunSupervisor {
    runs: RunRepo,
    journal: Journal,
    approvals: ApprovalRepo,
    machine: RunStateMachine,
    gate: ApprovalGate,
    agents: Arc<dyn AgentDefinitionRegistry>,
    config: EngineConfig,
    active: DashMap<RunId, ActiveRun>,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

impl RunSupervisor {
    pub fn new(
        db: Database,
        agents: Arc<dyn AgentDefinitionRegistry>,
        oracle: Arc<dyn ReasoningOracle>,
        config: EngineConfig,
        notifier: ApprovalNotifier,
    ) -> Arc<Self> {
        let runs = RunRepo::new(db.clone());
        let journal = Journal::new(db.clone(), JournalBus::new(config.journal_bus_capacity));
        let approvals = ApprovalRepo::new(db.clone());
        let machine = RunStateMachine::new(
            runs.clone(),
            journal.clone(),
            approvals.clone(),
            Arc::clone(&agents),
            oracle,
            config.clone(),
        );
        let gate = ApprovalGate::new(db, notifier, config.approval_poll_interval);

        Arc::new(Self {
            runs,
            journal,
            approvals,
            machine,
            gate,
            agents,
            config,
            active: DashMap::new(),
            shutdown: CancellationToken::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn runs(&self) -> &RunRepo {
        &self.runs
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn approvals(&self) -> &ApprovalRepo {
        &self.approvals
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn agents(&self) -> &Arc<dyn AgentDefinitionRegistry> {
        &self.agents
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn run(&self, run_id: &RunId) -> Result<RunRow, EngineError> {
        self.runs.get(run_id).map_err(|e| EngineError::for_run(run_id, e))
    }

    /// Create a top-level run and start driving it.
    #[instrument(skip(self, task))]
    pub fn create_run(
        self: &Arc<Self>,
        task: &str,
        user_id: Option<&str>,
        agent_kind: &str,
    ) -> Result<RunId, EngineError> {
        if self.agents.get(agent_kind).is_none() {
            return Err(EngineError::UnknownAgentKind(agent_kind.to_string()));
        }
        let run = self.runs.create(&NewRun {
            task: task.to_string(),
            agent_kind: agent_kind.to_string(),
            user_id: user_id.map(str::to_string),
            parent_run_id: None,
        })?;
        info!(run_id = %run.id, agent_kind, "run created");
        let _ = self.launch(&run.id);
        Ok(run.id)
    }

    /// Resolve the run's pending approval. The waiting driver picks the
    /// decision up; a run without a driver gets one.
    #[instrument(skip(self, feedback), fields(run_id = %run_id, decision = %decision))]
    pub fn resume_run(
        self: &Arc<Self>,
        run_id: &RunId,
        decision: Decision,
        feedback: Option<&str>,
    ) -> Result<ApprovalId, EngineError> {
        self.run(run_id)?;
        let pending = self
            .approvals
            .pending_for_run(run_id)?
            .ok_or_else(|| EngineError::NoPendingApproval(run_id.clone()))?;

        let resolved = match decision {
            Decision::Approved => self.gate.approve(&pending.id)?,
            Decision::Rejected => self.gate.reject(&pending.id, feedback)?,
        };
        if !resolved {
            return Err(EngineError::NoPendingApproval(run_id.clone()));
        }

        let _ = self.launch(run_id);
        Ok(pending.id)
    }

    /// Follow the run's journal from the beginning until it finishes.
    pub fn subscribe(&self, run_id: &RunId) -> Result<RunStream, EngineError> {
        stream::subscribe(&self.journal, &self.runs, run_id, self.config.stream_poll_interval)
    }

    /// Cancel the run and its live descendants. Returns the runs cancelled.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn cancel_run(&self, run_id: &RunId, reason: &str) -> Result<Vec<RunId>, EngineError> {
        self.run(run_id)?;
        let cancelled = cancel_tree(&self.journal, &self.runs, &self.approvals, run_id, reason)?;
        for id in &cancelled {
            self.stop_driver(id);
        }
        Ok(cancelled)
    }

    /// Fail the run from outside its driver, closing its approvals and
    /// cancelling any live descendants.
    pub fn fail_run(
        &self,
        run_id: &RunId,
        kind: SystemErrorKind,
        message: impl Into<String>,
    ) -> Result<(), EngineError> {
        let message = message.into();
        self.machine.fail(run_id, kind, message.clone())?;

        let status = match kind {
            SystemErrorKind::ApprovalTimeout => ApprovalStatus::Timeout,
            _ => ApprovalStatus::Rejected,
        };
        self.approvals.close_pending_for_run(run_id, status, &message)?;

        for child in self.runs.children(run_id)? {
            if !child.status.is_terminal() {
                for id in cancel_tree(&self.journal, &self.runs, &self.approvals, &child.id, "parent run failed")? {
                    self.stop_driver(&id);
                }
            }
        }
        self.stop_driver(run_id);
        Ok(())
    }

    /// Fail orphaned children, then relaunch a driver for every live run.
    #[instrument(skip(self))]
    pub fn recover(self: &Arc<Self>) -> Result<RecoveryReport, EngineError> {
        let orphaned = sweep_orphans(&self.journal, &self.runs, &self.approvals)?;
        let mut relaunched = Vec::new();
        for run in self.runs.live()? {
            if self.launch(&run.id) {
                relaunched.push(run.id);
            }
        }
        info!(
            orphaned = orphaned.len(),
            relaunched = relaunched.len(),
            "recovery complete"
        );
        Ok(RecoveryReport { orphaned, relaunched })
    }

    /// Start a driver for the run unless one is already active.
    pub fn launch(self: &Arc<Self>, run_id: &RunId) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = match self.active.entry(run_id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                let cancel = self.shutdown.child_token();
                slot.insert(ActiveRun {
                    cancel: cancel.clone(),
                    generation,
                });
                cancel
            }
        };

        let this = Arc::clone(self);
        let run_id = run_id.clone();
        let span = info_span!("run_driver", run_id = %run_id, agent_kind = tracing::field::Empty);
        if let Ok(run) = self.runs.get(&run_id) {
            span.record("agent_kind", run.agent_kind.as_str());
        }
        tokio::spawn(
            async move {
                this.drive(&run_id, &cancel).await;
                this.active.remove_if(&run_id, |_, active| active.generation == generation);
            }
            .instrument(span),
        );
        true
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active.contains_key(run_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Stop every driver. Runs stay in their stored status for the next `recover`.
    pub fn shutdown(&self) {
        info!(active = self.active.len(), "stopping run drivers");
        self.shutdown.cancel();
    }

    /// Wait until the run satisfies `done`, re-reading it on every journal
    /// write and at the stream poll interval.
    pub async fn wait_until(
        &self,
        run_id: &RunId,
        timeout: Duration,
        done: impl Fn(&RunRow) -> bool,
    ) -> Result<RunRow, EngineError> {
        let mut rx = self.journal.bus().subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.run(run_id)?;
            if done(&run) {
                return Ok(run);
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(EngineError::Internal(format!(
                        "run {run_id} still {} after {}ms",
                        run.status,
                        timeout.as_millis()
                    )));
                }
                _ = tokio::time::sleep(self.config.stream_poll_interval) => {}
                _ = next_entry_for(&mut rx, run_id) => {}
            }
        }
    }

    pub async fn wait_for_terminal(&self, run_id: &RunId, timeout: Duration) -> Result<RunRow, EngineError> {
        self.wait_until(run_id, timeout, |run| run.status.is_terminal()).await
    }

    fn stop_driver(&self, run_id: &RunId) {
        if let Some(active) = self.active.get(run_id) {
            active.cancel.cancel();
        }
    }

    async fn drive(self: &Arc<Self>, run_id: &RunId, cancel: &CancellationToken) {
        debug!("driver started");
        while !cancel.is_cancelled() {
            match self.advance(run_id, cancel).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) if e.is_run_closed() => {
                    debug!(error = %e, "run closed under its driver");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "run driver stopped");
                    break;
                }
            }
        }
        debug!("driver stopped");
    }

    /// One checkpoint plus any wait it ends in. `Ok(false)` stops the driver.
    async fn advance(self: &Arc<Self>, run_id: &RunId, cancel: &CancellationToken) -> Result<bool, EngineError> {
        let delegator: Arc<dyn Delegator> = Arc::new(DelegationBroker::new(Arc::clone(self)));

        match self.machine.checkpoint(run_id, cancel, Some(Arc::clone(&delegator))).await? {
            CheckpointOutcome::Continue => Ok(true),
            CheckpointOutcome::Terminal(status) => {
                debug!(status = %status, "run reached terminal status");
                Ok(false)
            }
            CheckpointOutcome::Suspended(pending) => match &pending.awaiting {
                Awaiting::Approval => self.await_approval(run_id, &pending, cancel, delegator).await,
                Awaiting::ChildRun { child_run_id } => {
                    debug!(child_run_id = %child_run_id, "run blocked on child");
                    tokio::select! {
                        _ = cancel.cancelled() => Ok(false),
                        _ = tokio::time::sleep(self.config.child_poll_interval) => Ok(true),
                    }
                }
            },
        }
    }

    async fn await_approval(
        &self,
        run_id: &RunId,
        pending: &PendingTool,
        cancel: &CancellationToken,
        delegator: Arc<dyn Delegator>,
    ) -> Result<bool, EngineError> {
        let request = NewApproval {
            run_id: run_id.clone(),
            tool_call_id: pending.tool_call_id.clone(),
            tool_name: pending.tool_name.clone(),
            arguments: pending.arguments.clone(),
            step: pending.step,
        };
        let (row, outcome) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            waited = self.gate.request_approval(&request, self.config.approval_timeout) => waited?,
        };

        let resolution = match outcome {
            ApprovalOutcome::Approved => ApprovalResolution {
                approval_id: row.id,
                decision: Decision::Approved,
                feedback: None,
            },
            ApprovalOutcome::Rejected { reason } => ApprovalResolution {
                approval_id: row.id,
                decision: Decision::Rejected,
                feedback: reason,
            },
            ApprovalOutcome::TimedOut => {
                warn!(tool = %pending.tool_name, "approval timed out");
                self.machine.fail(
                    run_id,
                    SystemErrorKind::ApprovalTimeout,
                    format!(
                        "approval for {} timed out after {:?}",
                        pending.tool_name, self.config.approval_timeout
                    ),
                )?;
                return Ok(false);
            }
            ApprovalOutcome::Abandoned => return Ok(false),
        };

        match self.machine.resume(run_id, &resolution, cancel, Some(delegator)).await? {
            CheckpointOutcome::Terminal(_) => Ok(false),
            CheckpointOutcome::Continue | CheckpointOutcome::Suspended(_) => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use vigil_core::run::RunStatus;

    use crate::agents::demo_registry;
    use crate::mock::{ScriptedOracle, ScriptedTurn};

    fn config() -> EngineConfig {
        EngineConfig {
            approval_poll_interval: Duration::from_millis(20),
            child_poll_interval: Duration::from_millis(20),
            stream_poll_interval: Duration::from_millis(20),
            working_directory: std::env::temp_dir(),
            ..EngineConfig::default()
        }
    }

    fn supervisor(oracle: ScriptedOracle) -> Arc<RunSupervisor> {
        RunSupervisor::new(
            Database::in_memory().unwrap(),
            Arc::new(demo_registry()),
            Arc::new(oracle),
            config(),
            ApprovalNotifier::default(),
        )
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn unknown_agent_kind_is_rejected() {
        let sup = supervisor(ScriptedOracle::new());
        assert!(matches!(
            sup.create_run("t", None, "auditor"),
            Err(EngineError::UnknownAgentKind(kind)) if kind == "auditor"
        ));
    }

    #[tokio::test]
    async fn created_run_is_driven_to_completion() {
        let sup = supervisor(ScriptedOracle::new().script("worker", vec![ScriptedTurn::finish("nothing to do")]));
        let run_id = sup.create_run("say hi", Some("u1"), "worker").unwrap();

        let run = sup.wait_for_terminal(&run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.user_id.as_deref(), Some("u1"));
        assert_eq!(run.status_message.as_deref(), Some("nothing to do"));
    }

    #[tokio::test]
    async fn resume_without_pending_approval_is_error() {
        let sup = supervisor(ScriptedOracle::new().script("worker", vec![ScriptedTurn::finish("done")]));
        let run_id = sup.create_run("t", None, "worker").unwrap();
        sup.wait_for_terminal(&run_id, WAIT).await.unwrap();

        assert!(matches!(
            sup.resume_run(&run_id, Decision::Approved, None),
            Err(EngineError::NoPendingApproval(_))
        ));
        assert!(matches!(
            sup.resume_run(&RunId::new(), Decision::Approved, None),
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_closes_suspended_run() {
        let oracle = ScriptedOracle::new().script(
            "worker",
            vec![ScriptedTurn::call("write_file", json!({"path": "x.txt", "content": "x"}))],
        );
        let sup = supervisor(oracle);
        let run_id = sup.create_run("write", None, "worker").unwrap();
        let suspended = sup
            .wait_until(&run_id, WAIT, |r| r.status == RunStatus::Suspended)
            .await
            .unwrap();
        let call_id = suspended.pending_tool.unwrap().tool_call_id;

        let cancelled = sup.cancel_run(&run_id, "operator stop").unwrap();
        assert_eq!(cancelled, vec![run_id.clone()]);

        let run = sup.wait_for_terminal(&run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        let approval = sup.approvals().find_by_tool_call(&run_id, &call_id).unwrap().unwrap();
        assert_eq!(approval.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn approval_timeout_fails_run() {
        let oracle = ScriptedOracle::new().script(
            "worker",
            vec![ScriptedTurn::call("write_file", json!({"path": "x.txt", "content": "x"}))],
        );
        let sup = RunSupervisor::new(
            Database::in_memory().unwrap(),
            Arc::new(demo_registry()),
            Arc::new(oracle),
            EngineConfig {
                approval_timeout: Duration::from_millis(100),
                ..config()
            },
            ApprovalNotifier::default(),
        );
        let run_id = sup.create_run("write", None, "worker").unwrap();

        let run = sup.wait_for_terminal(&run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(
            run.status_message.as_deref(),
            Some("approval for write_file timed out after 100ms")
        );
        assert!(sup.approvals().list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn launch_is_idempotent() {
        let oracle = ScriptedOracle::new().script(
            "worker",
            vec![ScriptedTurn::call("write_file", json!({"path": "x.txt", "content": "x"}))],
        );
        let sup = supervisor(oracle);
        let run_id = sup.create_run("write", None, "worker").unwrap();
        sup.wait_until(&run_id, WAIT, |r| r.status == RunStatus::Suspended)
            .await
            .unwrap();

        assert!(sup.is_active(&run_id));
        assert!(!sup.launch(&run_id));
        assert_eq!(sup.active_count(), 1);
        sup.shutdown();
    }
}
