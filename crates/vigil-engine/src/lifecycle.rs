//! Run-closing operations shared by the supervisor and the operator CLI.

use tracing::{info, instrument, warn};

use vigil_core::events::{JournalEvent, SystemErrorKind};
use vigil_core::ids::RunId;
use vigil_core::run::RunStatus;
use vigil_store::approvals::{ApprovalRepo, ApprovalStatus};
use vigil_store::runs::{RunRepo, Transition};
use vigil_store::StoreError;

use crate::journal::Journal;

/// Cancel a run and every live descendant. Returns the runs actually cancelled.
#[instrument(skip(journal, runs, approvals), fields(run_id = %run_id))]
pub fn cancel_tree(
    journal: &Journal,
    runs: &RunRepo,
    approvals: &ApprovalRepo,
    run_id: &RunId,
    reason: &str,
) -> Result<Vec<RunId>, StoreError> {
    let mut cancelled = Vec::new();
    let mut stack = vec![run_id.clone()];

    while let Some(id) = stack.pop() {
        let run = runs.get(&id)?;
        if !run.status.is_terminal() && cancel_one(journal, approvals, &id, reason)? {
            cancelled.push(id.clone());
        }
        stack.extend(
            runs.children(&id)?
                .into_iter()
                .filter(|child| !child.status.is_terminal())
                .map(|child| child.id),
        );
    }

    Ok(cancelled)
}

fn cancel_one(
    journal: &Journal,
    approvals: &ApprovalRepo,
    run_id: &RunId,
    reason: &str,
) -> Result<bool, StoreError> {
    let result = journal.append_transition(
        run_id,
        &JournalEvent::RunCancelled {
            reason: Some(reason.to_string()),
        },
        Some("cancelled"),
        &Transition::to(RunStatus::Cancelled).with_message(reason),
    );
    match result {
        Ok(appended) => {
            approvals.close_pending_for_run(run_id, ApprovalStatus::Rejected, "run cancelled")?;
            if appended.inserted {
                info!(run_id = %run_id, reason, "run cancelled");
            }
            Ok(appended.inserted)
        }
        // Finished on its own in the meantime.
        Err(StoreError::InvalidTransition { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Fail every live child whose parent has already finished, repeating until
/// no orphans remain so whole abandoned subtrees are closed.
#[instrument(skip_all)]
pub fn sweep_orphans(
    journal: &Journal,
    runs: &RunRepo,
    approvals: &ApprovalRepo,
) -> Result<Vec<RunId>, StoreError> {
    let mut failed = Vec::new();

    loop {
        let orphans = runs.orphaned()?;
        let mut progressed = false;

        for orphan in orphans {
            let parent = orphan
                .parent_run_id
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default();
            let message = format!("parent run {parent} finished before this child run");

            let result = journal.append_transition(
                &orphan.id,
                &JournalEvent::SystemError {
                    kind: SystemErrorKind::OrphanedRun,
                    message: message.clone(),
                },
                Some("failed"),
                &Transition::to(RunStatus::Failed).with_message(message),
            );
            match result {
                Ok(_) => {
                    approvals.close_pending_for_run(
                        &orphan.id,
                        ApprovalStatus::Rejected,
                        "parent run closed",
                    )?;
                    warn!(run_id = %orphan.id, parent_run_id = %parent, "orphaned child run failed");
                    failed.push(orphan.id);
                    progressed = true;
                }
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if !progressed {
            break;
        }
    }

    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalBus;
    use vigil_core::ids::ToolCallId;
    use vigil_store::approvals::NewApproval;
    use vigil_store::runs::NewRun;
    use vigil_store::Database;

    struct Fixture {
        journal: Journal,
        runs: RunRepo,
        approvals: ApprovalRepo,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        Fixture {
            journal: Journal::new(db.clone(), JournalBus::new(64)),
            runs: RunRepo::new(db.clone()),
            approvals: ApprovalRepo::new(db),
        }
    }

    fn create(f: &Fixture, parent: Option<&RunId>) -> RunId {
        f.runs
            .create(&NewRun {
                task: "t".into(),
                agent_kind: "worker".into(),
                user_id: None,
                parent_run_id: parent.cloned(),
            })
            .unwrap()
            .id
    }

    #[test]
    fn cancel_cascades_to_live_descendants() {
        let f = fixture();
        let root = create(&f, None);
        let child = create(&f, Some(&root));
        let grandchild = create(&f, Some(&child));

        let cancelled = cancel_tree(&f.journal, &f.runs, &f.approvals, &root, "operator").unwrap();
        assert_eq!(cancelled.len(), 3);
        for id in [&root, &child, &grandchild] {
            let run = f.runs.get(id).unwrap();
            assert_eq!(run.status, RunStatus::Cancelled);
            assert!(f.journal.find_by_key(id, "cancelled").unwrap().is_some());
        }
    }

    #[test]
    fn cancel_rejects_pending_approval() {
        let f = fixture();
        let run = create(&f, None);
        let approval = f
            .approvals
            .open(&NewApproval {
                run_id: run.clone(),
                tool_call_id: ToolCallId::new(),
                tool_name: "write_file".into(),
                arguments: serde_json::json!({}),
                step: 0,
            })
            .unwrap();

        cancel_tree(&f.journal, &f.runs, &f.approvals, &run, "stop").unwrap();
        let closed = f.approvals.get(&approval.id).unwrap();
        assert_eq!(closed.status, ApprovalStatus::Rejected);
        assert_eq!(closed.reason.as_deref(), Some("run cancelled"));
    }

    #[test]
    fn cancelling_finished_run_is_noop() {
        let f = fixture();
        let run = create(&f, None);
        cancel_tree(&f.journal, &f.runs, &f.approvals, &run, "first").unwrap();
        let again = cancel_tree(&f.journal, &f.runs, &f.approvals, &run, "second").unwrap();
        assert!(again.is_empty());
        assert_eq!(f.journal.list(&run).unwrap().len(), 1);
    }

    #[test]
    fn sweep_fails_orphaned_subtree() {
        let f = fixture();
        let root = create(&f, None);
        let child = create(&f, Some(&root));
        let grandchild = create(&f, Some(&child));
        f.runs
            .update_status(&root, &Transition::to(RunStatus::Failed))
            .unwrap();

        let failed = sweep_orphans(&f.journal, &f.runs, &f.approvals).unwrap();
        assert_eq!(failed, vec![child.clone(), grandchild.clone()]);

        let entries = f.journal.list(&grandchild).unwrap();
        assert!(matches!(
            entries[0].event,
            JournalEvent::SystemError {
                kind: SystemErrorKind::OrphanedRun,
                ..
            }
        ));
        assert!(f.runs.orphaned().unwrap().is_empty());
    }

    #[test]
    fn sweep_without_orphans_does_nothing() {
        let f = fixture();
        let root = create(&f, None);
        create(&f, Some(&root));
        assert!(sweep_orphans(&f.journal, &f.runs, &f.approvals).unwrap().is_empty());
    }
}
