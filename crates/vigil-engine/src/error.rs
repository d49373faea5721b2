use vigil_core::ids::RunId;
use vigil_core::oracle::OracleError;
use vigil_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {0} has no pending approval")]
    NoPendingApproval(RunId),

    #[error("delegation rejected: {0}")]
    DelegationRejected(String),

    #[error("unknown agent kind: {0}")]
    UnknownAgentKind(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Lift a store error, naming the run when the row is missing.
    pub fn for_run(run_id: &RunId, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::RunNotFound(run_id.clone()),
            other => Self::Store(other),
        }
    }

    /// The run reached a terminal status underneath the caller.
    pub fn is_run_closed(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::RunClosed { .. }) | Self::Store(StoreError::InvalidTransition { .. })
        )
    }
}
