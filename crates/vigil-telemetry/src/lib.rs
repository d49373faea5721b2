mod logging;

pub use logging::{LogQuery, LogRecord, RunLogLayer, RunLogStore};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "vigil_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; compact text otherwise.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: vigil_home().join("logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// The `EnvFilter` directive string for the configured levels.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the run log store alive for querying.
pub struct TelemetryGuard {
    log_store: Option<Arc<RunLogStore>>,
}

impl TelemetryGuard {
    /// Persisted warn+ records, when persistence is on.
    pub fn logs(&self) -> Option<&RunLogStore> {
        self.log_store.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .boxed()
    };

    let (run_log_layer, log_store) = if config.log_to_sqlite {
        match RunLogStore::open(&config.log_db_path) {
            Ok(store) => {
                let store = Arc::new(store);
                (Some(RunLogLayer::new(store.clone())), Some(store))
            }
            Err(e) => {
                eprintln!("vigil-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(run_log_layer)
        .try_init()
    {
        eprintln!("vigil-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard { log_store }
}

/// `~/.vigil`, or `/tmp/.vigil` without a home directory.
pub fn vigil_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".vigil")
}
