use thiserror::Error;

use crate::run::{RunId, RunStatus};

/// Errors surfaced by a [`RunStore`](crate::store::RunStore).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No run with this identifier exists.
    #[error("run {0} not found")]
    NotFound(RunId),

    /// The requested status change breaks the run lifecycle.
    #[error("run {run_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    /// The backing store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the orchestration core.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The submission was rejected before a run record was created.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// The controller has been stopped and accepts no new work.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// The supervisor already tracks a live process for this run.
    #[error("run {0} is already running")]
    AlreadyRunning(RunId),

    /// The external tool could not be started.
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// No contiguous block of endpoint ports is free.
    #[error("no available ports in pool: need {needed} contiguous ports in [{start}, {end})")]
    Capacity { needed: u16, start: u16, end: u16 },

    #[error("unknown run {0}")]
    UnknownRun(RunId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
