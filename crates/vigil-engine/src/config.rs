use std::path::PathBuf;
use std::time::Duration;

/// Limits and timers for the run engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Oracle calls allowed per run.
    pub max_steps: u32,
    pub tool_timeout: Duration,
    pub approval_timeout: Duration,
    /// Store re-read interval while waiting on an approval. Correctness rests on this path.
    pub approval_poll_interval: Duration,
    pub child_timeout: Duration,
    /// Replaces `child_timeout` while the child itself waits for a reviewer.
    pub child_approval_timeout: Duration,
    pub child_poll_interval: Duration,
    pub max_delegation_depth: u32,
    pub stream_poll_interval: Duration,
    pub journal_bus_capacity: usize,
    pub working_directory: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            tool_timeout: Duration::from_secs(120),
            approval_timeout: Duration::from_secs(300),
            approval_poll_interval: Duration::from_secs(1),
            child_timeout: Duration::from_secs(600),
            child_approval_timeout: Duration::from_secs(1800),
            child_poll_interval: Duration::from_secs(1),
            max_delegation_depth: 2,
            stream_poll_interval: Duration::from_millis(500),
            journal_bus_capacity: 1024,
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}
