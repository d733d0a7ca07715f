//! Typed errors for the flow engine.
//!
//! The store and worker layers use `anyhow` internally (with context); the
//! controller and HTTP surface translate failures into [`FlowError`] so
//! callers can distinguish admission conflicts from infrastructure faults.

use thiserror::Error;

use crate::store::RunStatus;

/// Core error type for flow orchestration operations.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Flow definition failed eager validation. Fatal at startup.
    #[error("invalid flow definition: {0}")]
    InvalidDefinition(String),

    /// No flow definition registered for the requested type.
    #[error("unknown flow type: {0}")]
    UnknownFlowType(String),

    /// Run lookup failed.
    #[error("flow run '{0}' not found")]
    RunNotFound(String),

    /// Resume was attempted on a run retired by a newer sibling.
    #[error("flow run '{run_id}' was superseded by '{superseded_by}'")]
    Superseded {
        run_id: String,
        superseded_by: String,
    },

    /// Another run of the same flow type is currently running.
    #[error("flow type '{flow_type}' is already active in run '{active_run_id}'")]
    AlreadyActive {
        flow_type: String,
        active_run_id: String,
    },

    /// The run's status does not permit resuming.
    #[error("flow run '{run_id}' is {status} and cannot be resumed")]
    NotResumable { run_id: String, status: RunStatus },

    /// The backing store is structurally corrupt and recovery did not help.
    #[error("Flows database unavailable: {0}")]
    StoreUnavailable(String),

    /// No worker command configured for out-of-process execution.
    #[error("worker launch failed for run '{run_id}': {reason}")]
    WorkerLaunch { run_id: String, reason: String },

    /// Everything else (store I/O, serialization, task join).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for flow operations.
pub type FlowResult<T> = Result<T, FlowError>;

impl FlowError {
    /// True when the underlying cause is structural SQLite corruption.
    ///
    /// The HTTP layer uses this to decide whether to run the
    /// rotate-and-reinitialize recovery procedure before retrying once.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            Self::Other(err) => crate::store::is_corruption_error(err),
            _ => false,
        }
    }
}
