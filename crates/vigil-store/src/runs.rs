use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use vigil_core::ids::RunId;
use vigil_core::run::{PendingTool, RunStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const RUN_COLUMNS: &str = "id, parent_run_id, agent_kind, task, user_id, status, current_step,
     pending_tool, status_message, created_at, updated_at, finished_at";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    pub id: RunId,
    pub parent_run_id: Option<RunId>,
    pub agent_kind: String,
    pub task: String,
    pub user_id: Option<String>,
    pub status: RunStatus,
    pub current_step: u32,
    pub pending_tool: Option<PendingTool>,
    /// Human-readable reason for the current status (suspension cause, failure message).
    pub status_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

/// Parameters for a new run.
#[derive(Clone, Debug)]
pub struct NewRun {
    pub task: String,
    pub agent_kind: String,
    pub user_id: Option<String>,
    pub parent_run_id: Option<RunId>,
}

/// A requested status change. Applied only if the current status permits it.
#[derive(Clone, Debug)]
pub struct Transition {
    pub to: RunStatus,
    pub message: Option<String>,
    pub pending_tool: Option<PendingTool>,
}

impl Transition {
    pub fn to(status: RunStatus) -> Self {
        Self {
            to: status,
            message: None,
            pending_tool: None,
        }
    }

    pub fn suspended(pending: PendingTool, message: impl Into<String>) -> Self {
        Self {
            to: RunStatus::Suspended,
            message: Some(message.into()),
            pending_tool: Some(pending),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Clone)]
pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a run in `pending`.
    pub fn create(&self, new: &NewRun) -> Result<RunRow, StoreError> {
        self.create_with_id(&RunId::new(), new)
    }

    /// Create a run under an id reserved earlier, e.g. one already named in a parent's journal.
    #[instrument(skip(self, new), fields(run_id = %id, agent_kind = %new.agent_kind))]
    pub fn create_with_id(&self, id: &RunId, new: &NewRun) -> Result<RunRow, StoreError> {
        let id = id.clone();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, parent_run_id, agent_kind, task, user_id, status, current_step, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
                rusqlite::params![
                    id.as_str(),
                    new.parent_run_id.as_ref().map(RunId::as_str),
                    new.agent_kind,
                    new.task,
                    new.user_id,
                    now,
                ],
            )?;

            Ok(RunRow {
                id,
                parent_run_id: new.parent_run_id.clone(),
                agent_kind: new.agent_kind.clone(),
                task: new.task.clone(),
                user_id: new.user_id.clone(),
                status: RunStatus::Pending,
                current_step: 0,
                pending_tool: None,
                status_message: None,
                created_at: now.clone(),
                updated_at: now,
                finished_at: None,
            })
        })
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get(&self, id: &RunId) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| get_in(conn, id))
    }

    /// List runs, newest first.
    #[instrument(skip(self))]
    pub fn list(&self, status: Option<RunStatus>, limit: u32) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| match status {
            Some(status) => query_runs(
                conn,
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE status = ?1 ORDER BY id DESC LIMIT ?2"),
                rusqlite::params![status.as_str(), limit],
            ),
            None => query_runs(
                conn,
                &format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"),
                rusqlite::params![limit],
            ),
        })
    }

    /// Child runs of `parent`, oldest first.
    #[instrument(skip(self), fields(run_id = %parent))]
    pub fn children(&self, parent: &RunId) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            query_runs(
                conn,
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE parent_run_id = ?1 ORDER BY id ASC"),
                rusqlite::params![parent.as_str()],
            )
        })
    }

    /// Every run not yet in a terminal status, oldest first.
    pub fn live(&self) -> Result<Vec<RunRow>, StoreError> {
        let live = row_helpers::sql_in_list(&live_statuses());
        self.db.with_conn(|conn| {
            query_runs(
                conn,
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE status IN ({live}) ORDER BY id ASC"),
                [],
            )
        })
    }

    /// Non-terminal child runs whose parent has already reached a terminal status.
    pub fn orphaned(&self) -> Result<Vec<RunRow>, StoreError> {
        let live = row_helpers::sql_in_list(&live_statuses());
        let columns = RUN_COLUMNS
            .split(',')
            .map(|c| format!("c.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        self.db.with_conn(|conn| {
            query_runs(
                conn,
                &format!(
                    "SELECT {columns} FROM runs c JOIN runs p ON c.parent_run_id = p.id
                     WHERE c.status IN ({live}) AND p.status NOT IN ({live})
                     ORDER BY c.id ASC"
                ),
                [],
            )
        })
    }

    /// Number of ancestors above `id` (0 for a top-level run).
    pub fn depth(&self, id: &RunId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let depth: i64 = conn.query_row(
                "WITH RECURSIVE chain(id, parent) AS (
                     SELECT id, parent_run_id FROM runs WHERE id = ?1
                     UNION ALL
                     SELECT r.id, r.parent_run_id FROM runs r JOIN chain ON r.id = chain.parent
                 )
                 SELECT COUNT(*) - 1 FROM chain",
                [id.as_str()],
                |row| row.get(0),
            )?;
            if depth < 0 {
                return Err(StoreError::NotFound(format!("run {id}")));
            }
            Ok(depth as u32)
        })
    }

    /// Apply a guarded status change without journaling it.
    #[instrument(skip(self, transition), fields(run_id = %id, to = %transition.to))]
    pub fn update_status(&self, id: &RunId, transition: &Transition) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| {
            let tx = rusqlite::Transaction::new_unchecked(
                conn,
                rusqlite::TransactionBehavior::Immediate,
            )?;
            apply_transition(&tx, id, transition)?;
            tx.commit()?;
            get_in(conn, id)
        })
    }

    /// Bump the step counter of a live run and return the new value.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn increment_step(&self, id: &RunId) -> Result<u32, StoreError> {
        let live = row_helpers::sql_in_list(&live_statuses());
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE runs SET current_step = current_step + 1, updated_at = ?1
                     WHERE id = ?2 AND status IN ({live})"
                ),
                rusqlite::params![now, id.as_str()],
            )?;
            let run = get_in(conn, id)?;
            if changed == 0 {
                return Err(StoreError::RunClosed {
                    run_id: id.to_string(),
                    status: run.status.to_string(),
                });
            }
            Ok(run.current_step)
        })
    }
}

fn live_statuses() -> Vec<&'static str> {
    RunStatus::ALL
        .iter()
        .filter(|s| !s.is_terminal())
        .map(|s| s.as_str())
        .collect()
}

pub(crate) fn get_in(conn: &Connection, id: &RunId) -> Result<RunRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_run(row),
        None => Err(StoreError::NotFound(format!("run {id}"))),
    }
}

pub(crate) fn status_in(conn: &Connection, id: &RunId) -> Result<RunStatus, StoreError> {
    let raw: Option<String> = conn
        .query_row("SELECT status FROM runs WHERE id = ?1", [id.as_str()], |row| row.get(0))
        .optional()?;
    match raw {
        Some(raw) => row_helpers::parse_enum(&raw, "runs", "status"),
        None => Err(StoreError::NotFound(format!("run {id}"))),
    }
}

/// Check the transition table and write the new status. Caller owns the transaction.
pub(crate) fn apply_transition(
    conn: &Connection,
    id: &RunId,
    transition: &Transition,
) -> Result<RunStatus, StoreError> {
    let current = status_in(conn, id)?;
    if !current.can_transition_to(transition.to) {
        return Err(StoreError::InvalidTransition {
            run_id: id.to_string(),
            from: current.to_string(),
            to: transition.to.to_string(),
        });
    }

    let now = Utc::now().to_rfc3339();
    let pending_tool = transition
        .pending_tool
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let finished_at = transition.to.is_terminal().then(|| now.clone());

    conn.execute(
        "UPDATE runs SET status = ?1, pending_tool = ?2, status_message = ?3, updated_at = ?4,
                finished_at = COALESCE(?5, finished_at)
         WHERE id = ?6 AND status = ?7",
        rusqlite::params![
            transition.to.as_str(),
            pending_tool,
            transition.message,
            now,
            finished_at,
            id.as_str(),
            current.as_str(),
        ],
    )?;
    Ok(current)
}

fn query_runs<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<RunRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_run(row)?);
    }
    Ok(results)
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    let status: String = row_helpers::get(row, 5, "runs", "status")?;
    let step: i64 = row_helpers::get(row, 6, "runs", "current_step")?;
    let pending_tool = row_helpers::get_opt::<String>(row, 7, "runs", "pending_tool")?
        .map(|raw| row_helpers::parse_json(&raw, "runs", "pending_tool"))
        .transpose()?;

    Ok(RunRow {
        id: RunId::from_raw(row_helpers::get::<String>(row, 0, "runs", "id")?),
        parent_run_id: row_helpers::get_opt::<String>(row, 1, "runs", "parent_run_id")?
            .map(RunId::from_raw),
        agent_kind: row_helpers::get(row, 2, "runs", "agent_kind")?,
        task: row_helpers::get(row, 3, "runs", "task")?,
        user_id: row_helpers::get_opt(row, 4, "runs", "user_id")?,
        status: row_helpers::parse_enum(&status, "runs", "status")?,
        current_step: u32::try_from(step).map_err(|_| StoreError::CorruptRow {
            table: "runs",
            column: "current_step",
            detail: format!("out of range: {step}"),
        })?,
        pending_tool,
        status_message: row_helpers::get_opt(row, 8, "runs", "status_message")?,
        created_at: row_helpers::get(row, 9, "runs", "created_at")?,
        updated_at: row_helpers::get(row, 10, "runs", "updated_at")?,
        finished_at: row_helpers::get_opt(row, 11, "runs", "finished_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::ids::ToolCallId;
    use vigil_core::run::Awaiting;

    fn setup() -> (Database, RunRepo) {
        let db = Database::in_memory().unwrap();
        let repo = RunRepo::new(db.clone());
        (db, repo)
    }

    fn new_run(parent: Option<&RunId>) -> NewRun {
        NewRun {
            task: "list files".into(),
            agent_kind: "worker".into(),
            user_id: Some("user_1".into()),
            parent_run_id: parent.cloned(),
        }
    }

    fn pending_tool() -> PendingTool {
        PendingTool {
            tool_call_id: ToolCallId::from_raw("call_1"),
            tool_name: "write_file".into(),
            arguments: serde_json::json!({"path": "out.txt"}),
            step: 0,
            awaiting: Awaiting::Approval,
        }
    }

    #[test]
    fn create_and_get() {
        let (_db, repo) = setup();
        let run = repo.create(&new_run(None)).unwrap();
        assert!(run.id.as_str().starts_with("run_"));
        assert_eq!(run.status, RunStatus::Pending);

        let fetched = repo.get(&run.id).unwrap();
        assert_eq!(fetched.task, "list files");
        assert_eq!(fetched.user_id.as_deref(), Some("user_1"));
        assert_eq!(fetched.current_step, 0);
        assert!(fetched.pending_tool.is_none());
    }

    #[test]
    fn create_with_reserved_id() {
        let (_db, repo) = setup();
        let id = RunId::new();
        let run = repo.create_with_id(&id, &new_run(None)).unwrap();
        assert_eq!(run.id, id);
        assert!(repo.create_with_id(&id, &new_run(None)).is_err());
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_db, repo) = setup();
        let err = repo.get(&RunId::from_raw("run_nope")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn suspend_stores_snapshot_and_resume_clears_it() {
        let (_db, repo) = setup();
        let run = repo.create(&new_run(None)).unwrap();
        repo.update_status(&run.id, &Transition::to(RunStatus::Running)).unwrap();

        let suspended = repo
            .update_status(&run.id, &Transition::suspended(pending_tool(), "awaiting approval"))
            .unwrap();
        assert_eq!(suspended.status, RunStatus::Suspended);
        assert_eq!(suspended.pending_tool, Some(pending_tool()));
        assert_eq!(suspended.status_message.as_deref(), Some("awaiting approval"));

        let resumed = repo.update_status(&run.id, &Transition::to(RunStatus::Running)).unwrap();
        assert!(resumed.pending_tool.is_none());
        assert!(resumed.status_message.is_none());
    }

    #[test]
    fn illegal_transition_rejected() {
        let (_db, repo) = setup();
        let run = repo.create(&new_run(None)).unwrap();
        let err = repo
            .update_status(&run.id, &Transition::to(RunStatus::Completed))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(repo.get(&run.id).unwrap().status, RunStatus::Pending);
    }

    #[test]
    fn terminal_sets_finished_at() {
        let (_db, repo) = setup();
        let run = repo.create(&new_run(None)).unwrap();
        let failed = repo
            .update_status(&run.id, &Transition::to(RunStatus::Failed).with_message("boom"))
            .unwrap();
        assert!(failed.finished_at.is_some());
        assert!(repo
            .update_status(&run.id, &Transition::to(RunStatus::Cancelled))
            .is_err());
    }

    #[test]
    fn increment_step_counts_and_stops_at_terminal() {
        let (_db, repo) = setup();
        let run = repo.create(&new_run(None)).unwrap();
        assert_eq!(repo.increment_step(&run.id).unwrap(), 1);
        assert_eq!(repo.increment_step(&run.id).unwrap(), 2);

        repo.update_status(&run.id, &Transition::to(RunStatus::Cancelled)).unwrap();
        assert!(matches!(
            repo.increment_step(&run.id),
            Err(StoreError::RunClosed { .. })
        ));
        assert_eq!(repo.get(&run.id).unwrap().current_step, 2);
    }

    #[test]
    fn list_filters_by_status() {
        let (_db, repo) = setup();
        let a = repo.create(&new_run(None)).unwrap();
        let _b = repo.create(&new_run(None)).unwrap();
        repo.update_status(&a.id, &Transition::to(RunStatus::Running)).unwrap();

        assert_eq!(repo.list(None, 10).unwrap().len(), 2);
        let running = repo.list(Some(RunStatus::Running), 10).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
    }

    #[test]
    fn orphaned_children_detected() {
        let (_db, repo) = setup();
        let parent = repo.create(&new_run(None)).unwrap();
        let live_child = repo.create(&new_run(Some(&parent.id))).unwrap();
        let done_child = repo.create(&new_run(Some(&parent.id))).unwrap();
        repo.update_status(&done_child.id, &Transition::to(RunStatus::Failed)).unwrap();

        assert!(repo.orphaned().unwrap().is_empty());

        repo.update_status(&parent.id, &Transition::to(RunStatus::Cancelled)).unwrap();
        let orphans = repo.orphaned().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, live_child.id);
        assert_eq!(repo.children(&parent.id).unwrap().len(), 2);
    }

    #[test]
    fn depth_walks_parent_chain() {
        let (_db, repo) = setup();
        let root = repo.create(&new_run(None)).unwrap();
        let child = repo.create(&new_run(Some(&root.id))).unwrap();
        let grandchild = repo.create(&new_run(Some(&child.id))).unwrap();

        assert_eq!(repo.depth(&root.id).unwrap(), 0);
        assert_eq!(repo.depth(&child.id).unwrap(), 1);
        assert_eq!(repo.depth(&grandchild.id).unwrap(), 2);
        assert!(repo.depth(&RunId::from_raw("run_missing")).is_err());
    }

    #[test]
    fn live_excludes_terminal() {
        let (_db, repo) = setup();
        let a = repo.create(&new_run(None)).unwrap();
        let b = repo.create(&new_run(None)).unwrap();
        repo.update_status(&b.id, &Transition::to(RunStatus::Cancelled)).unwrap();
        let live = repo.live().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, a.id);
    }
}
