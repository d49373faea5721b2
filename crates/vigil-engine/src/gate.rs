//! Human approval gate.
//!
//! A waiting run wakes on whichever comes first: an in-process notification,
//! a poll of the persisted request, or its deadline. Polling alone is enough
//! for correctness, so a decision recorded by another process (or before a
//! restart) is always observed; notifications only shorten the wait.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use vigil_core::ids::{ApprovalId, RunId};
use vigil_store::approvals::{ApprovalRepo, ApprovalRow, ApprovalStatus, NewApproval};
use vigil_store::runs::RunRepo;
use vigil_store::{Database, StoreError};

/// In-process wake-up channel for resolved approvals, scoped to one server.
#[derive(Clone)]
pub struct ApprovalNotifier {
    tx: broadcast::Sender<ApprovalId>,
}

impl ApprovalNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn notify(&self, id: &ApprovalId) {
        let _ = self.tx.send(id.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalId> {
        self.tx.subscribe()
    }
}

impl Default for ApprovalNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

/// How a wait on an approval request ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected { reason: Option<String> },
    TimedOut,
    /// The run reached a terminal status while waiting.
    Abandoned,
}

impl ApprovalOutcome {
    fn from_row(row: &ApprovalRow) -> Option<Self> {
        match row.status {
            ApprovalStatus::Pending => None,
            ApprovalStatus::Approved => Some(Self::Approved),
            ApprovalStatus::Rejected => Some(Self::Rejected {
                reason: row.reason.clone(),
            }),
            ApprovalStatus::Timeout => Some(Self::TimedOut),
        }
    }
}

pub struct ApprovalGate {
    approvals: ApprovalRepo,
    runs: RunRepo,
    notifier: ApprovalNotifier,
    poll_interval: Duration,
}

impl ApprovalGate {
    pub fn new(db: Database, notifier: ApprovalNotifier, poll_interval: Duration) -> Self {
        Self {
            approvals: ApprovalRepo::new(db.clone()),
            runs: RunRepo::new(db),
            notifier,
            poll_interval,
        }
    }

    pub fn approvals(&self) -> &ApprovalRepo {
        &self.approvals
    }

    /// Open (or re-attach to) the request for a call and wait for its resolution.
    pub async fn request_approval(
        &self,
        request: &NewApproval,
        timeout: Duration,
    ) -> Result<(ApprovalRow, ApprovalOutcome), StoreError> {
        let row = self.approvals.open(request)?;
        let outcome = self.wait(&row, timeout).await?;
        Ok((row, outcome))
    }

    /// Wait until the request is resolved, its run closes, or `timeout` has
    /// elapsed since the request was created.
    #[instrument(skip(self, row), fields(run_id = %row.run_id, approval_id = %row.id))]
    pub async fn wait(&self, row: &ApprovalRow, timeout: Duration) -> Result<ApprovalOutcome, StoreError> {
        let deadline = deadline_for(&row.created_at, timeout);
        let mut rx = Some(self.notifier.subscribe());

        loop {
            let current = self.approvals.get(&row.id)?;
            if let Some(outcome) = ApprovalOutcome::from_row(&current) {
                debug!(status = %current.status, "approval resolved");
                return Ok(outcome);
            }

            if self.runs.get(&row.run_id)?.status.is_terminal() {
                return Ok(ApprovalOutcome::Abandoned);
            }

            if Instant::now() >= deadline {
                if self
                    .approvals
                    .resolve(&row.id, ApprovalStatus::Timeout, Some("approval timed out"))?
                    .is_some()
                {
                    warn!(timeout_ms = timeout.as_millis() as u64, "approval timed out");
                    self.notifier.notify(&row.id);
                    return Ok(ApprovalOutcome::TimedOut);
                }
                // Resolved concurrently; the next read reports it.
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = next_wake(&mut rx, &row.id) => {}
            }
        }
    }

    /// Approve a pending request. False if it was already resolved or its run closed.
    pub fn approve(&self, id: &ApprovalId) -> Result<bool, StoreError> {
        self.resolve(id, ApprovalStatus::Approved, None)
    }

    /// Reject a pending request. False if it was already resolved or its run closed.
    pub fn reject(&self, id: &ApprovalId, reason: Option<&str>) -> Result<bool, StoreError> {
        self.resolve(id, ApprovalStatus::Rejected, reason)
    }

    pub fn pending_for_run(&self, run_id: &RunId) -> Result<Option<ApprovalRow>, StoreError> {
        self.approvals.pending_for_run(run_id)
    }

    fn resolve(
        &self,
        id: &ApprovalId,
        status: ApprovalStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        match self.approvals.resolve(id, status, reason)? {
            Some(row) => {
                info!(approval_id = %id, run_id = %row.run_id, status = %status, "approval resolved");
                self.notifier.notify(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Deadline on the tokio clock for a request created at `created_at`.
fn deadline_for(created_at: &str, timeout: Duration) -> Instant {
    let elapsed = DateTime::parse_from_rfc3339(created_at)
        .ok()
        .and_then(|created| (Utc::now() - created.with_timezone(&Utc)).to_std().ok())
        .unwrap_or_default();
    Instant::now() + timeout.saturating_sub(elapsed)
}

/// Resolves when a notification for `id` arrives or the channel lags.
/// Never resolves once the channel is closed.
async fn next_wake(rx: &mut Option<broadcast::Receiver<ApprovalId>>, id: &ApprovalId) {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match inner.recv().await {
            Ok(woken) if &woken == id => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    *rx = None;
    std::future::pending().await
}
