//! # vigil
//!
//! Operator CLI for the run store. Approvals and cancellations written here
//! are picked up by a serving process through its store polling.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_stream::StreamExt;

use vigil_core::events::Decision;
use vigil_core::ids::RunId;
use vigil_core::run::RunStatus;
use vigil_engine::agents::demo_registry;
use vigil_engine::gate::ApprovalNotifier;
use vigil_engine::journal::{Journal, JournalBus};
use vigil_engine::lifecycle::{cancel_tree, sweep_orphans};
use vigil_engine::mock::{ScriptedOracle, ScriptedTurn};
use vigil_engine::stream::RunStreamItem;
use vigil_engine::{EngineConfig, RunSupervisor};
use vigil_settings::{EngineSettings, VigilSettings};
use vigil_store::approvals::{ApprovalRepo, ApprovalStatus};
use vigil_store::journal::JournalEntry;
use vigil_store::runs::{RunRepo, RunRow};
use vigil_store::Database;
use vigil_telemetry::{LogQuery, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "vigil", about = "Inspect and steer durable agent runs")]
struct Cli {
    /// Settings file (defaults to ~/.vigil/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Run database, overriding settings.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List runs, newest first.
    Runs {
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show one run and its children.
    Show { run_id: RunId },
    /// Print a run's journal.
    Journal {
        run_id: RunId,
        /// Only entries after this sequence number.
        #[arg(long, default_value_t = -1)]
        after: i64,
    },
    /// List pending approval requests.
    Approvals,
    /// Approve a run's pending tool call.
    Approve { run_id: RunId },
    /// Reject a run's pending tool call.
    Reject {
        run_id: RunId,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Cancel a run and its live children.
    Cancel {
        run_id: RunId,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Fail child runs whose parent already finished.
    Recover,
    /// Query persisted warn+ logs.
    Logs {
        /// Minimum level.
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        tool: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Drive a scripted worker run in-process and stream its journal.
    Demo {
        #[arg(default_value = "list the text files here")]
        task: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => vigil_settings::load_settings_from_path(path),
        None => vigil_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let home = vigil_settings::vigil_dir();
    let telemetry = vigil_telemetry::init_telemetry(telemetry_config(&settings, &home));

    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| settings.database.resolve(&home));
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open run database at {}", db_path.display()))?;

    match cli.command {
        Command::Runs { status, limit } => {
            for run in RunRepo::new(db).list(status, limit)? {
                print_run(&run);
            }
        }
        Command::Show { run_id } => {
            let runs = RunRepo::new(db);
            let run = runs.get(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            for child in runs.children(&run_id)? {
                print!("  child ");
                print_run(&child);
            }
        }
        Command::Journal { run_id, after } => {
            let repo = vigil_store::journal::JournalRepo::new(db);
            for entry in repo.list_after_sequence(&run_id, after, u32::MAX)? {
                print_entry(&entry)?;
            }
        }
        Command::Approvals => {
            for approval in ApprovalRepo::new(db).list_pending()? {
                println!(
                    "{}  run={}  tool={}  step={}  args={}  since={}",
                    approval.id,
                    approval.run_id,
                    approval.tool_name,
                    approval.step,
                    approval.arguments,
                    approval.created_at
                );
            }
        }
        Command::Approve { run_id } => resolve(db, &run_id, Decision::Approved, None)?,
        Command::Reject { run_id, reason } => resolve(db, &run_id, Decision::Rejected, reason.as_deref())?,
        Command::Cancel { run_id, reason } => {
            let journal = Journal::new(db.clone(), JournalBus::new(1));
            let runs = RunRepo::new(db.clone());
            runs.get(&run_id)?;
            let cancelled = cancel_tree(&journal, &runs, &ApprovalRepo::new(db), &run_id, &reason)?;
            if cancelled.is_empty() {
                println!("{run_id} had already finished");
            }
            for id in cancelled {
                println!("cancelled {id}");
            }
        }
        Command::Recover => {
            let journal = Journal::new(db.clone(), JournalBus::new(1));
            let orphaned = sweep_orphans(&journal, &RunRepo::new(db.clone()), &ApprovalRepo::new(db))?;
            println!("failed {} orphaned run(s)", orphaned.len());
            for id in orphaned {
                println!("  {id}");
            }
        }
        Command::Logs { level, run_id, tool, limit } => {
            let Some(store) = telemetry.logs() else {
                bail!("log persistence is disabled (logging.persist = false)");
            };
            let records = store.query(&LogQuery {
                level,
                run_id,
                tool,
                limit: Some(limit),
            })?;
            for record in records {
                let call = match (&record.tool, &record.tool_call_id) {
                    (Some(tool), Some(id)) => format!(" {tool}#{id}"),
                    (Some(tool), None) => format!(" {tool}"),
                    _ => String::new(),
                };
                println!(
                    "{} {:5} {}{}{} {}",
                    record.at,
                    record.level,
                    record.run_id.as_deref().unwrap_or("-"),
                    record.agent_kind.map(|k| format!("({k})")).unwrap_or_default(),
                    call,
                    record.message
                );
            }
        }
        Command::Demo { task } => demo(db, &settings.engine, &task).await?,
    }

    Ok(())
}

fn telemetry_config(settings: &VigilSettings, home: &std::path::Path) -> TelemetryConfig {
    TelemetryConfig {
        log_level: settings.logging.level.parse().unwrap_or(tracing::Level::INFO),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist,
        log_db_path: settings.logging.resolve_db_path(home),
        ..TelemetryConfig::default()
    }
}

fn engine_config(engine: &EngineSettings) -> EngineConfig {
    let ms = Duration::from_millis;
    EngineConfig {
        max_steps: engine.max_steps,
        tool_timeout: ms(engine.tool_timeout_ms),
        approval_timeout: ms(engine.approval_timeout_ms),
        approval_poll_interval: ms(engine.approval_poll_ms),
        child_timeout: ms(engine.child_timeout_ms),
        child_approval_timeout: ms(engine.child_approval_timeout_ms),
        child_poll_interval: ms(engine.child_poll_ms),
        max_delegation_depth: engine.max_delegation_depth,
        stream_poll_interval: ms(engine.stream_poll_ms),
        journal_bus_capacity: engine.journal_bus_capacity,
        ..EngineConfig::default()
    }
}

/// Resolve the run's pending approval directly in the store.
fn resolve(db: Database, run_id: &RunId, decision: Decision, reason: Option<&str>) -> Result<()> {
    let approvals = ApprovalRepo::new(db);
    let Some(pending) = approvals.pending_for_run(run_id)? else {
        bail!("run {run_id} has no pending approval");
    };
    let status = match decision {
        Decision::Approved => ApprovalStatus::Approved,
        Decision::Rejected => ApprovalStatus::Rejected,
    };
    match approvals.resolve(&pending.id, status, reason)? {
        Some(row) => println!("{} {} ({} on {})", row.status, row.id, row.tool_name, run_id),
        None => bail!("approval {} was resolved concurrently", pending.id),
    }
    Ok(())
}

async fn demo(db: Database, engine: &EngineSettings, task: &str) -> Result<()> {
    let oracle = ScriptedOracle::new().script(
        "worker",
        vec![
            ScriptedTurn::calls(
                Some("Looking for text files."),
                vec![("find_files", json!({"pattern": "*.txt"}))],
            ),
            ScriptedTurn::finish("Listed the text files."),
        ],
    );
    let supervisor = RunSupervisor::new(
        db,
        Arc::new(demo_registry()),
        Arc::new(oracle),
        engine_config(engine),
        ApprovalNotifier::default(),
    );

    let run_id = supervisor.create_run(task, None, "worker")?;
    let mut stream = supervisor.subscribe(&run_id)?;
    while let Some(item) = stream.next().await {
        match item {
            RunStreamItem::Entry(entry) => print_entry(&entry)?,
            RunStreamItem::Closed { status } => println!("run {run_id} {status}"),
        }
    }
    supervisor.shutdown();
    Ok(())
}

fn print_run(run: &RunRow) {
    println!(
        "{}  {:9}  {:12}  step={}  {}{}",
        run.id,
        run.status.as_str(),
        run.agent_kind,
        run.current_step,
        run.task,
        run.status_message
            .as_deref()
            .map(|m| format!("  ({m})"))
            .unwrap_or_default()
    );
}

fn print_entry(entry: &JournalEntry) -> Result<()> {
    println!(
        "{:>4}  {}  {:20}  {}",
        entry.sequence,
        entry.created_at,
        entry.event_type().as_str(),
        serde_json::to_string(&entry.event)?
    );
    Ok(())
}
