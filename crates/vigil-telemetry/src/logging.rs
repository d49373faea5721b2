//! Warn+ events persisted per run.
//!
//! Events are tagged with the run, agent kind and tool call they happened
//! under, taken from the event itself or from the nearest enclosing span
//! that carries them, so `vigil logs --run-id` can pull one run's trouble.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS run_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        at TEXT NOT NULL,
        severity INTEGER NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        run_id TEXT,
        agent_kind TEXT,
        tool TEXT,
        tool_call_id TEXT,
        detail TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_run_logs_run ON run_logs(run_id, id);";

/// One persisted event.
#[derive(Clone, Debug, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub run_id: Option<String>,
    pub agent_kind: Option<String>,
    pub tool: Option<String>,
    pub tool_call_id: Option<String>,
    /// Remaining event fields as a JSON object.
    pub detail: Option<String>,
}

/// Filters for [`RunLogStore::query`]; newest records first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Minimum level, e.g. `warn` also returns errors.
    pub level: Option<String>,
    pub run_id: Option<String>,
    pub tool: Option<String>,
    pub limit: Option<u32>,
}

/// 1 for ERROR through 5 for TRACE.
fn severity(level: Level) -> i64 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        Level::TRACE => 5,
    }
}

pub struct RunLogStore {
    conn: Mutex<Connection>,
}

impl RunLogStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_schema(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(&self, level: Level, target: &str, tags: RunTags, detail: Option<String>) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO run_logs
                 (at, severity, level, target, message, run_id, agent_kind, tool, tool_call_id, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                Utc::now().to_rfc3339(),
                severity(level),
                level.as_str(),
                target,
                tags.message.unwrap_or_default(),
                tags.run_id,
                tags.agent_kind,
                tags.tool,
                tags.tool_call_id,
                detail,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let max_severity = q
            .level
            .as_deref()
            .and_then(|l| l.parse::<Level>().ok())
            .map(severity);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, at, level, target, message, run_id, agent_kind, tool, tool_call_id, detail
             FROM run_logs
             WHERE (?1 IS NULL OR severity <= ?1)
               AND (?2 IS NULL OR run_id = ?2)
               AND (?3 IS NULL OR tool = ?3)
             ORDER BY id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![max_severity, q.run_id, q.tool, q.limit.unwrap_or(100)],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    at: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    run_id: row.get(5)?,
                    agent_kind: row.get(6)?,
                    tool: row.get(7)?,
                    tool_call_id: row.get(8)?,
                    detail: row.get(9)?,
                })
            },
        )?;
        rows.collect()
    }
}

/// Correlation fields gathered from an event or span.
#[derive(Clone, Debug, Default)]
struct RunTags {
    message: Option<String>,
    run_id: Option<String>,
    agent_kind: Option<String>,
    tool: Option<String>,
    tool_call_id: Option<String>,
}

impl RunTags {
    fn is_empty(&self) -> bool {
        self.run_id.is_none() && self.agent_kind.is_none() && self.tool.is_none() && self.tool_call_id.is_none()
    }

    /// Claim a correlation field; false for anything else.
    fn take(&mut self, name: &str, value: &str) -> bool {
        let slot = match name {
            "message" => &mut self.message,
            "run_id" => &mut self.run_id,
            "agent_kind" => &mut self.agent_kind,
            "tool" => &mut self.tool,
            "tool_call_id" => &mut self.tool_call_id,
            _ => return false,
        };
        *slot = Some(value.to_string());
        true
    }

    /// Fill gaps from an enclosing span.
    fn inherit(&mut self, outer: &RunTags) {
        for (mine, theirs) in [
            (&mut self.run_id, &outer.run_id),
            (&mut self.agent_kind, &outer.agent_kind),
            (&mut self.tool, &outer.tool),
            (&mut self.tool_call_id, &outer.tool_call_id),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }
}

impl Visit for RunTags {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.take(field.name(), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.take(field.name(), &format!("{value:?}"));
    }
}

/// Event visitor: correlation fields into tags, the rest into `detail`.
#[derive(Default)]
struct EventFields {
    tags: RunTags,
    detail: serde_json::Map<String, serde_json::Value>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if !self.tags.take(field.name(), value) {
            self.detail.insert(field.name().into(), value.into());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record_str(field, &format!("{value:?}"));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.detail.insert(field.name().into(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.detail.insert(field.name().into(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.detail.insert(field.name().into(), value.into());
    }
}

/// Layer persisting WARN and ERROR events into a [`RunLogStore`].
pub struct RunLogLayer {
    store: Arc<RunLogStore>,
}

impl RunLogLayer {
    pub fn new(store: Arc<RunLogStore>) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for RunLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut tags = RunTags::default();
        attrs.record(&mut tags);
        if tags.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(tags);
        }
    }

    // `agent_kind` on the driver span is recorded after creation.
    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<RunTags>() {
            Some(tags) => values.record(tags),
            None => {
                let mut tags = RunTags::default();
                values.record(&mut tags);
                if !tags.is_empty() {
                    extensions.insert(tags);
                }
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<RunTags>() {
                    fields.tags.inherit(outer);
                }
            }
        }

        let detail = (!fields.detail.is_empty())
            .then(|| serde_json::to_string(&fields.detail).ok())
            .flatten();
        self.store.write(level, event.metadata().target(), fields.tags, detail);
    }
}
