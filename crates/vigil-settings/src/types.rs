//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a partial file
//! only needs the keys it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "database": { "path": "/var/lib/vigil/vigil.db" },
///   "engine": { "maxSteps": 20, "approvalTimeoutMs": 60000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VigilSettings {
    pub database: DatabaseSettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
}

impl VigilSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let e = &self.engine;
        if e.max_steps == 0 {
            return Err(SettingsError::InvalidValue("engine.maxSteps must be at least 1".into()));
        }
        for (name, value) in [
            ("engine.toolTimeoutMs", e.tool_timeout_ms),
            ("engine.approvalTimeoutMs", e.approval_timeout_ms),
            ("engine.approvalPollMs", e.approval_poll_ms),
            ("engine.childTimeoutMs", e.child_timeout_ms),
            ("engine.childApprovalTimeoutMs", e.child_approval_timeout_ms),
            ("engine.childPollMs", e.child_poll_ms),
            ("engine.streamPollMs", e.stream_poll_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be positive")));
            }
        }
        if e.journal_bus_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "engine.journalBusCapacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Durable store location.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite file. Relative paths resolve against `~/.vigil`.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "vigil.db".to_string(),
        }
    }
}

impl DatabaseSettings {
    pub fn resolve(&self, base: &Path) -> PathBuf {
        resolve_path(base, &self.path)
    }
}

/// Run engine limits and timers. Durations are milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Oracle calls allowed per run before it fails.
    pub max_steps: u32,
    pub tool_timeout_ms: u64,
    /// How long a suspended run waits for a reviewer.
    pub approval_timeout_ms: u64,
    /// How often a waiting run re-reads its approval from the store.
    pub approval_poll_ms: u64,
    pub child_timeout_ms: u64,
    /// Child wait budget while the child itself awaits approval.
    pub child_approval_timeout_ms: u64,
    pub child_poll_ms: u64,
    pub max_delegation_depth: u32,
    pub stream_poll_ms: u64,
    pub journal_bus_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps: 50,
            tool_timeout_ms: 120_000,
            approval_timeout_ms: 300_000,
            approval_poll_ms: 1_000,
            child_timeout_ms: 600_000,
            child_approval_timeout_ms: 1_800_000,
            child_poll_ms: 1_000,
            max_delegation_depth: 2,
            stream_poll_ms: 500,
            journal_bus_capacity: 1024,
        }
    }
}

/// Logging output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` wins when set.
    pub level: String,
    /// JSON lines instead of compact text.
    pub json: bool,
    /// Persist warn+ events to a SQLite log database.
    pub persist: bool,
    /// Log database file. Relative paths resolve against `~/.vigil`.
    pub db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            persist: true,
            db_path: "logs.db".to_string(),
        }
    }
}

impl LoggingSettings {
    pub fn resolve_db_path(&self, base: &Path) -> PathBuf {
        resolve_path(base, &self.db_path)
    }
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
