use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use vigil_core::events::{Decision, EventType, JournalEvent, ToolResultStatus};
use vigil_core::ids::{EntryId, RunId, ToolCallId};
use vigil_core::tools::ToolClassification;

use crate::database::Database;
use crate::error::{is_unique_violation, StoreError};
use crate::row_helpers;
use crate::runs::{self, Transition};

const ENTRY_COLUMNS: &str = "id, run_id, sequence, event_type, payload, idempotency_key, created_at";

/// A stored journal entry. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    pub run_id: RunId,
    pub sequence: i64,
    pub event: JournalEvent,
    pub idempotency_key: Option<String>,
    pub created_at: String,
}

impl JournalEntry {
    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }
}

/// Result of an idempotent write.
#[derive(Clone, Debug)]
pub struct Appended {
    pub entry: JournalEntry,
    /// False when the key had already been recorded and `entry` is the earlier write.
    pub inserted: bool,
}

/// Append-only event log, one gapless sequence per run.
///
/// Sequence assignment and the insert run inside one IMMEDIATE transaction,
/// so writers in this process serialize on the connection mutex and writers
/// in other processes serialize on the SQLite write lock.
#[derive(Clone)]
pub struct JournalRepo {
    db: Database,
}

impl JournalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append with no deduplication.
    #[instrument(skip(self, event), fields(run_id = %run_id, event_type = %event.event_type()))]
    pub fn append(&self, run_id: &RunId, event: &JournalEvent) -> Result<JournalEntry, StoreError> {
        self.write(run_id, event, None, None).map(|a| a.entry)
    }

    /// Append at most once per `(run_id, key)`. A repeated key returns the
    /// entry recorded by the first call and writes nothing.
    #[instrument(skip(self, event), fields(run_id = %run_id, event_type = %event.event_type(), key))]
    pub fn append_idempotent(
        &self,
        run_id: &RunId,
        event: &JournalEvent,
        key: &str,
    ) -> Result<Appended, StoreError> {
        self.write(run_id, event, Some(key), None)
    }

    /// Append a lifecycle entry and move the run to a new status in the same
    /// transaction. If the transition is illegal nothing is written.
    #[instrument(
        skip(self, event, transition),
        fields(run_id = %run_id, event_type = %event.event_type(), to = %transition.to)
    )]
    pub fn append_transition(
        &self,
        run_id: &RunId,
        event: &JournalEvent,
        key: Option<&str>,
        transition: &Transition,
    ) -> Result<Appended, StoreError> {
        self.write(run_id, event, key, Some(transition))
    }

    fn write(
        &self,
        run_id: &RunId,
        event: &JournalEvent,
        key: Option<&str>,
        transition: Option<&Transition>,
    ) -> Result<Appended, StoreError> {
        let result = self.db.with_conn(|conn| {
            let tx = rusqlite::Transaction::new_unchecked(
                conn,
                rusqlite::TransactionBehavior::Immediate,
            )?;

            if let Some(key) = key {
                if let Some(existing) = find_by_key_in(&tx, run_id, key)? {
                    return Ok(Appended {
                        entry: existing,
                        inserted: false,
                    });
                }
            }

            match transition {
                Some(transition) => {
                    runs::apply_transition(&tx, run_id, transition)?;
                }
                None => {
                    let status = runs::status_in(&tx, run_id)?;
                    if status.is_terminal() {
                        return Err(StoreError::RunClosed {
                            run_id: run_id.to_string(),
                            status: status.to_string(),
                        });
                    }
                }
            }

            let entry = insert_in(&tx, run_id, event, key)?;
            tx.commit()?;
            Ok(Appended {
                entry,
                inserted: true,
            })
        });

        match (result, key) {
            // Another process won the race on the same key between our lookup and insert.
            (Err(err @ StoreError::Database(_)), Some(key)) => {
                match self.find_by_key(run_id, key)? {
                    Some(entry) => {
                        debug!(run_id = %run_id, key, "idempotency key recorded concurrently");
                        Ok(Appended {
                            entry,
                            inserted: false,
                        })
                    }
                    None => Err(err),
                }
            }
            (other, _) => other,
        }
    }

    /// Full ordered replay of a run.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn list(&self, run_id: &RunId) -> Result<Vec<JournalEntry>, StoreError> {
        self.db.with_conn(|conn| {
            query_entries(
                conn,
                &format!("SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE run_id = ?1 ORDER BY sequence ASC"),
                rusqlite::params![run_id.as_str()],
            )
        })
    }

    /// Entries strictly after `after_sequence`.
    #[instrument(skip(self), fields(run_id = %run_id, after_sequence))]
    pub fn list_after_sequence(
        &self,
        run_id: &RunId,
        after_sequence: i64,
        limit: u32,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        self.db.with_conn(|conn| {
            query_entries(
                conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE run_id = ?1 AND sequence > ?2
                     ORDER BY sequence ASC LIMIT ?3"
                ),
                rusqlite::params![run_id.as_str(), after_sequence, limit],
            )
        })
    }

    pub fn find_by_key(&self, run_id: &RunId, key: &str) -> Result<Option<JournalEntry>, StoreError> {
        self.db.with_conn(|conn| find_by_key_in(conn, run_id, key))
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn count(&self, run_id: &RunId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM journal_entries WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn insert_in(
    conn: &Connection,
    run_id: &RunId,
    event: &JournalEvent,
    key: Option<&str>,
) -> Result<JournalEntry, StoreError> {
    let max_seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), -1) FROM journal_entries WHERE run_id = ?1",
        [run_id.as_str()],
        |row| row.get(0),
    )?;

    let id = EntryId::new();
    let sequence = max_seq + 1;
    let now = Utc::now().to_rfc3339();
    let event_type = event.event_type();
    let payload = event.payload()?;

    conn.execute(
        "INSERT INTO journal_entries (id, run_id, sequence, event_type, payload, idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            id.as_str(),
            run_id.as_str(),
            sequence,
            event_type.as_str(),
            serde_json::to_string(&payload)?,
            key,
            now,
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Database(format!("journal constraint: {e}"))
        } else {
            StoreError::from(e)
        }
    })?;

    Ok(JournalEntry {
        id,
        run_id: run_id.clone(),
        sequence,
        event: event.clone(),
        idempotency_key: key.map(str::to_owned),
        created_at: now,
    })
}

fn find_by_key_in(
    conn: &Connection,
    run_id: &RunId,
    key: &str,
) -> Result<Option<JournalEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM journal_entries WHERE run_id = ?1 AND idempotency_key = ?2"
    ))?;
    let mut rows = stmt.query(rusqlite::params![run_id.as_str(), key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_entry(row)?)),
        None => Ok(None),
    }
}

fn query_entries<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<JournalEntry>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_entry(row)?);
    }
    Ok(results)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<JournalEntry, StoreError> {
    let raw_type: String = row_helpers::get(row, 3, "journal_entries", "event_type")?;
    let event_type: EventType = row_helpers::parse_enum(&raw_type, "journal_entries", "event_type")?;
    let raw_payload: String = row_helpers::get(row, 4, "journal_entries", "payload")?;
    let payload: serde_json::Value =
        row_helpers::parse_json(&raw_payload, "journal_entries", "payload")?;
    let event = JournalEvent::from_parts(event_type, payload).map_err(|e| StoreError::CorruptRow {
        table: "journal_entries",
        column: "payload",
        detail: format!("{event_type}: {e}"),
    })?;

    Ok(JournalEntry {
        id: EntryId::from_raw(row_helpers::get::<String>(row, 0, "journal_entries", "id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, "journal_entries", "run_id")?),
        sequence: row_helpers::get(row, 2, "journal_entries", "sequence")?,
        event,
        idempotency_key: row_helpers::get_opt(row, 5, "journal_entries", "idempotency_key")?,
        created_at: row_helpers::get(row, 6, "journal_entries", "created_at")?,
    })
}

/// A `TOOL_PROPOSED` entry as seen during replay.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedCall {
    pub sequence: i64,
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub classification: ToolClassification,
    pub step: u32,
    /// The approval decision recorded for this call, if a `RUN_RESUMED` names it.
    pub decision: Option<(Decision, Option<String>)>,
}

/// Every proposal without a matching `TOOL_RESULT`, in journal order.
pub fn unresolved_proposals(entries: &[JournalEntry]) -> Vec<ProposedCall> {
    let mut open: Vec<ProposedCall> = Vec::new();
    for entry in entries {
        match &entry.event {
            JournalEvent::ToolProposed {
                tool_call_id,
                tool_name,
                arguments,
                classification,
                step,
            } => open.push(ProposedCall {
                sequence: entry.sequence,
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                arguments: arguments.clone(),
                classification: *classification,
                step: *step,
                decision: None,
            }),
            JournalEvent::RunResumed {
                decision: Some(decision),
                feedback,
                tool_call_id: Some(call_id),
                ..
            } => {
                if let Some(call) = open.iter_mut().find(|c| &c.tool_call_id == call_id) {
                    call.decision = Some((*decision, feedback.clone()));
                }
            }
            JournalEvent::ToolResult { tool_call_id, .. } => {
                open.retain(|c| &c.tool_call_id != tool_call_id);
            }
            _ => {}
        }
    }
    open
}

/// The most recent proposal lacking a matching `TOOL_RESULT`.
pub fn find_pending_tool(entries: &[JournalEntry]) -> Option<ProposedCall> {
    unresolved_proposals(entries).pop()
}

/// Whether a `TOOL_RESULT` with the given status exists for `call_id`.
pub fn result_status(entries: &[JournalEntry], call_id: &ToolCallId) -> Option<ToolResultStatus> {
    entries.iter().rev().find_map(|e| match &e.event {
        JournalEvent::ToolResult {
            tool_call_id,
            status,
            ..
        } if tool_call_id == call_id => Some(*status),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::{NewRun, RunRepo};
    use serde_json::json;
    use std::sync::Arc;
    use vigil_core::run::RunStatus;

    fn setup() -> (Database, RunId) {
        let db = Database::in_memory().unwrap();
        let run = RunRepo::new(db.clone())
            .create(&NewRun {
                task: "list files".into(),
                agent_kind: "worker".into(),
                user_id: None,
                parent_run_id: None,
            })
            .unwrap();
        (db, run.id)
    }

    fn thought(text: &str) -> JournalEvent {
        JournalEvent::AgentThought {
            text: text.into(),
            step: 0,
        }
    }

    fn proposed(id: &str, name: &str) -> JournalEvent {
        JournalEvent::ToolProposed {
            tool_call_id: ToolCallId::from_raw(id),
            tool_name: name.into(),
            arguments: json!({}),
            classification: ToolClassification::Safe,
            step: 0,
        }
    }

    fn result(id: &str, name: &str) -> JournalEvent {
        JournalEvent::ToolResult {
            tool_call_id: ToolCallId::from_raw(id),
            tool_name: name.into(),
            status: ToolResultStatus::Success,
            content: "ok".into(),
            duration_ms: 1,
        }
    }

    #[test]
    fn first_entry_has_sequence_zero() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        let entry = repo.append(&run_id, &thought("hi")).unwrap();
        assert!(entry.id.as_str().starts_with("jrn_"));
        assert_eq!(entry.sequence, 0);
        assert_eq!(entry.event_type(), EventType::AgentThought);
    }

    #[test]
    fn list_replays_in_order() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        for i in 0..5 {
            repo.append(&run_id, &thought(&format!("t{i}"))).unwrap();
        }
        let all = repo.list(&run_id).unwrap();
        assert_eq!(all.len(), 5);
        for (i, entry) in all.iter().enumerate() {
            assert_eq!(entry.sequence, i as i64);
            assert_eq!(entry.event, thought(&format!("t{i}")));
        }
    }

    #[test]
    fn list_after_sequence() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        for i in 0..5 {
            repo.append(&run_id, &thought(&format!("t{i}"))).unwrap();
        }
        let after_2 = repo.list_after_sequence(&run_id, 2, 100).unwrap();
        assert_eq!(after_2.len(), 2);
        assert_eq!(after_2[0].sequence, 3);
        assert_eq!(after_2[1].sequence, 4);
    }

    #[test]
    fn idempotent_append_records_once() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);

        let first = repo
            .append_idempotent(&run_id, &result("call_1", "find_files"), "result:call_1")
            .unwrap();
        let second = repo
            .append_idempotent(&run_id, &result("call_1", "find_files"), "result:call_1")
            .unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.entry.id, second.entry.id);
        assert_eq!(repo.count(&run_id).unwrap(), 1);
    }

    #[test]
    fn keys_are_scoped_per_run() {
        let (db, run_a) = setup();
        let run_b = RunRepo::new(db.clone())
            .create(&NewRun {
                task: "other".into(),
                agent_kind: "worker".into(),
                user_id: None,
                parent_run_id: None,
            })
            .unwrap()
            .id;
        let repo = JournalRepo::new(db);
        assert!(repo.append_idempotent(&run_a, &thought("a"), "k").unwrap().inserted);
        assert!(repo.append_idempotent(&run_b, &thought("b"), "k").unwrap().inserted);
    }

    #[test]
    fn entries_without_key_are_unconstrained() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        repo.append(&run_id, &thought("same")).unwrap();
        repo.append(&run_id, &thought("same")).unwrap();
        assert_eq!(repo.count(&run_id).unwrap(), 2);
    }

    #[test]
    fn transition_and_entry_commit_together() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db.clone());
        let runs = RunRepo::new(db);

        let started = JournalEvent::RunStarted {
            task: "list files".into(),
            agent_kind: "worker".into(),
            parent_run_id: None,
        };
        repo.append_transition(&run_id, &started, Some("run_started"), &Transition::to(RunStatus::Running))
            .unwrap();
        assert_eq!(runs.get(&run_id).unwrap().status, RunStatus::Running);

        // Replaying the same keyed transition is a no-op, not an illegal running -> running.
        let again = repo
            .append_transition(&run_id, &started, Some("run_started"), &Transition::to(RunStatus::Running))
            .unwrap();
        assert!(!again.inserted);
        assert_eq!(repo.count(&run_id).unwrap(), 1);
    }

    #[test]
    fn illegal_transition_writes_nothing() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        let err = repo
            .append_transition(
                &run_id,
                &JournalEvent::RunCompleted { summary: None },
                None,
                &Transition::to(RunStatus::Completed),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(repo.count(&run_id).unwrap(), 0);
    }

    #[test]
    fn terminal_run_rejects_appends() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        repo.append_transition(
            &run_id,
            &JournalEvent::RunCancelled { reason: None },
            None,
            &Transition::to(RunStatus::Cancelled),
        )
        .unwrap();

        let err = repo.append(&run_id, &thought("late")).unwrap_err();
        assert!(matches!(err, StoreError::RunClosed { .. }));
        assert_eq!(repo.count(&run_id).unwrap(), 1);
    }

    #[test]
    fn append_to_missing_run_is_not_found() {
        let db = Database::in_memory().unwrap();
        let repo = JournalRepo::new(db);
        let err = repo.append(&RunId::from_raw("run_ghost"), &thought("x")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn concurrent_appends_are_gapless() {
        let (db, run_id) = setup();
        let repo = Arc::new(JournalRepo::new(db));

        let mut handles = vec![];
        for i in 0..10 {
            let repo = repo.clone();
            let run_id = run_id.clone();
            handles.push(std::thread::spawn(move || {
                repo.append(&run_id, &thought(&format!("thread {i}"))).unwrap()
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let seqs: Vec<i64> = repo.list(&run_id).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<i64>>());
    }

    #[test]
    fn concurrent_idempotent_appends_record_once() {
        let (db, run_id) = setup();
        let repo = Arc::new(JournalRepo::new(db));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                let run_id = run_id.clone();
                std::thread::spawn(move || {
                    repo.append_idempotent(&run_id, &result("call_7", "find_files"), "result:call_7")
                        .unwrap()
                })
            })
            .collect();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| a.inserted)
            .count();

        assert_eq!(inserted, 1);
        assert_eq!(repo.count(&run_id).unwrap(), 1);
    }

    #[test]
    fn malformed_payload_returns_error() {
        let (db, run_id) = setup();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO journal_entries (id, run_id, sequence, event_type, payload, created_at)
                 VALUES (?1, ?2, 0, 'AGENT_THOUGHT', 'not valid json', datetime('now'))",
                rusqlite::params![EntryId::new().as_str(), run_id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = JournalRepo::new(db);
        assert!(matches!(repo.list(&run_id), Err(StoreError::CorruptRow { .. })));
    }

    #[test]
    fn unknown_event_type_is_corrupt() {
        let (db, run_id) = setup();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO journal_entries (id, run_id, sequence, event_type, payload, created_at)
                 VALUES (?1, ?2, 0, 'TURN_END', '{}', datetime('now'))",
                rusqlite::params![EntryId::new().as_str(), run_id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = JournalRepo::new(db);
        assert!(matches!(
            repo.list(&run_id),
            Err(StoreError::CorruptRow { column: "event_type", .. })
        ));
    }

    #[test]
    fn pending_tool_is_latest_unanswered_proposal() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        repo.append(&run_id, &proposed("call_1", "find_files")).unwrap();
        repo.append(&run_id, &proposed("call_2", "write_file")).unwrap();
        repo.append(&run_id, &result("call_1", "find_files")).unwrap();

        let entries = repo.list(&run_id).unwrap();
        let pending = find_pending_tool(&entries).unwrap();
        assert_eq!(pending.tool_call_id.as_str(), "call_2");
        assert_eq!(unresolved_proposals(&entries).len(), 1);

        repo.append(&run_id, &result("call_2", "write_file")).unwrap();
        assert!(find_pending_tool(&repo.list(&run_id).unwrap()).is_none());
    }

    #[test]
    fn resumed_decision_attaches_to_proposal() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        repo.append(&run_id, &proposed("call_1", "write_file")).unwrap();
        repo.append(
            &run_id,
            &JournalEvent::RunResumed {
                decision: Some(Decision::Rejected),
                feedback: Some("no".into()),
                approval_id: None,
                tool_call_id: Some(ToolCallId::from_raw("call_1")),
                child_run_id: None,
            },
        )
        .unwrap();

        let pending = find_pending_tool(&repo.list(&run_id).unwrap()).unwrap();
        assert_eq!(pending.decision, Some((Decision::Rejected, Some("no".into()))));
    }

    #[test]
    fn result_status_lookup() {
        let (db, run_id) = setup();
        let repo = JournalRepo::new(db);
        repo.append(&run_id, &result("call_1", "find_files")).unwrap();
        let entries = repo.list(&run_id).unwrap();
        assert_eq!(
            result_status(&entries, &ToolCallId::from_raw("call_1")),
            Some(ToolResultStatus::Success)
        );
        assert_eq!(result_status(&entries, &ToolCallId::from_raw("call_2")), None);
    }
}
