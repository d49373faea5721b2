use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use vigil_core::ids::{ApprovalId, RunId, ToolCallId};

use crate::database::Database;
use crate::error::{is_unique_violation, StoreError};
use crate::row_helpers;
use crate::runs;

const APPROVAL_COLUMNS: &str =
    "id, run_id, tool_call_id, tool_name, arguments, step, status, reason, created_at, resolved_at";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_resolved(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// A human review request for one dangerous tool call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRow {
    pub id: ApprovalId,
    pub run_id: RunId,
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub step: u32,
    pub status: ApprovalStatus,
    pub reason: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewApproval {
    pub run_id: RunId,
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub step: u32,
}

#[derive(Clone)]
pub struct ApprovalRepo {
    db: Database,
}

impl ApprovalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Return the request for `(run_id, tool_call_id)`, creating it if absent.
    ///
    /// Fails with `Conflict` if the run already has a different pending request.
    #[instrument(skip(self, new), fields(run_id = %new.run_id, tool_call_id = %new.tool_call_id))]
    pub fn open(&self, new: &NewApproval) -> Result<ApprovalRow, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(existing) = find_in(conn, &new.run_id, &new.tool_call_id)? {
                return Ok(existing);
            }

            let id = ApprovalId::new();
            let now = Utc::now().to_rfc3339();
            let inserted = conn.execute(
                "INSERT INTO approval_requests (id, run_id, tool_call_id, tool_name, arguments, step, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                rusqlite::params![
                    id.as_str(),
                    new.run_id.as_str(),
                    new.tool_call_id.as_str(),
                    new.tool_name,
                    serde_json::to_string(&new.arguments)?,
                    new.step,
                    now,
                ],
            );

            match inserted {
                Ok(_) => {
                    debug!(approval_id = %id, "approval request opened");
                    get_in(conn, &id)
                }
                Err(e) if is_unique_violation(&e) => {
                    // Same call opened by another process, or another call already pending.
                    match find_in(conn, &new.run_id, &new.tool_call_id)? {
                        Some(existing) => Ok(existing),
                        None => Err(StoreError::Conflict(format!(
                            "run {} already has a pending approval",
                            new.run_id
                        ))),
                    }
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get(&self, id: &ApprovalId) -> Result<ApprovalRow, StoreError> {
        self.db.with_conn(|conn| get_in(conn, id))
    }

    pub fn find_by_tool_call(
        &self,
        run_id: &RunId,
        tool_call_id: &ToolCallId,
    ) -> Result<Option<ApprovalRow>, StoreError> {
        self.db.with_conn(|conn| find_in(conn, run_id, tool_call_id))
    }

    /// The single pending request of a run, if any.
    pub fn pending_for_run(&self, run_id: &RunId) -> Result<Option<ApprovalRow>, StoreError> {
        self.db.with_conn(|conn| {
            let rows = query_approvals(
                conn,
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approval_requests
                     WHERE run_id = ?1 AND status = 'pending'"
                ),
                [run_id.as_str()],
            )?;
            Ok(rows.into_iter().next())
        })
    }

    /// Every pending request, oldest first.
    pub fn list_pending(&self) -> Result<Vec<ApprovalRow>, StoreError> {
        self.db.with_conn(|conn| {
            query_approvals(
                conn,
                &format!(
                    "SELECT {APPROVAL_COLUMNS} FROM approval_requests
                     WHERE status = 'pending' ORDER BY created_at ASC, id ASC"
                ),
                [],
            )
        })
    }

    /// Resolve a pending request. Returns `None` if it was already resolved
    /// or its run is terminal; the first resolution wins.
    #[instrument(skip(self, reason), fields(approval_id = %id, status = %status))]
    pub fn resolve(
        &self,
        id: &ApprovalId,
        status: ApprovalStatus,
        reason: Option<&str>,
    ) -> Result<Option<ApprovalRow>, StoreError> {
        if !status.is_resolved() {
            return Err(StoreError::Conflict(format!(
                "cannot resolve approval {id} to pending"
            )));
        }

        self.db.with_conn(|conn| {
            let current = get_in(conn, id)?;
            let run_status = runs::status_in(conn, &current.run_id)?;
            if current.status.is_resolved() || run_status.is_terminal() {
                return Ok(None);
            }

            let live = row_helpers::sql_in_list(
                &vigil_core::run::RunStatus::ALL
                    .iter()
                    .filter(|s| !s.is_terminal())
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>(),
            );
            let changed = conn.execute(
                &format!(
                    "UPDATE approval_requests SET status = ?1, reason = ?2, resolved_at = ?3
                     WHERE id = ?4 AND status = 'pending'
                       AND run_id IN (SELECT id FROM runs WHERE status IN ({live}))"
                ),
                rusqlite::params![status.as_str(), reason, Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            get_in(conn, id).map(Some)
        })
    }

    /// Resolve every pending request of a run regardless of run status.
    /// Used when the run itself is being closed.
    #[instrument(skip(self, reason), fields(run_id = %run_id))]
    pub fn close_pending_for_run(
        &self,
        run_id: &RunId,
        status: ApprovalStatus,
        reason: &str,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE approval_requests SET status = ?1, reason = ?2, resolved_at = ?3
                 WHERE run_id = ?4 AND status = 'pending'",
                rusqlite::params![status.as_str(), reason, Utc::now().to_rfc3339(), run_id.as_str()],
            )?)
        })
    }
}

fn get_in(conn: &Connection, id: &ApprovalId) -> Result<ApprovalRow, StoreError> {
    let rows = query_approvals(
        conn,
        &format!("SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?1"),
        [id.as_str()],
    )?;
    rows.into_iter()
        .next()
        .ok_or_else(|| StoreError::NotFound(format!("approval {id}")))
}

fn find_in(
    conn: &Connection,
    run_id: &RunId,
    tool_call_id: &ToolCallId,
) -> Result<Option<ApprovalRow>, StoreError> {
    let rows = query_approvals(
        conn,
        &format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE run_id = ?1 AND tool_call_id = ?2"
        ),
        [run_id.as_str(), tool_call_id.as_str()],
    )?;
    Ok(rows.into_iter().next())
}

fn query_approvals<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ApprovalRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_approval(row)?);
    }
    Ok(results)
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> Result<ApprovalRow, StoreError> {
    let raw_args: String = row_helpers::get(row, 4, "approval_requests", "arguments")?;
    let step: i64 = row_helpers::get(row, 5, "approval_requests", "step")?;
    let raw_status: String = row_helpers::get(row, 6, "approval_requests", "status")?;

    Ok(ApprovalRow {
        id: ApprovalId::from_raw(row_helpers::get::<String>(row, 0, "approval_requests", "id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, "approval_requests", "run_id")?),
        tool_call_id: ToolCallId::from_raw(row_helpers::get::<String>(
            row,
            2,
            "approval_requests",
            "tool_call_id",
        )?),
        tool_name: row_helpers::get(row, 3, "approval_requests", "tool_name")?,
        arguments: row_helpers::parse_json(&raw_args, "approval_requests", "arguments")?,
        step: u32::try_from(step).map_err(|_| StoreError::CorruptRow {
            table: "approval_requests",
            column: "step",
            detail: format!("negative step {step}"),
        })?,
        status: row_helpers::parse_enum(&raw_status, "approval_requests", "status")?,
        reason: row_helpers::get_opt(row, 7, "approval_requests", "reason")?,
        created_at: row_helpers::get(row, 8, "approval_requests", "created_at")?,
        resolved_at: row_helpers::get_opt(row, 9, "approval_requests", "resolved_at")?,
    })
}
