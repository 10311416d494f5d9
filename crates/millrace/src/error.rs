//! Error types for millrace.

use thiserror::Error;

use crate::record::RunState;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in millrace operations.
///
/// Each variant carries its own identity across interface boundaries so that
/// callers can match on the failure kind rather than parse messages.
#[derive(Debug, Error)]
pub enum Error {
    /// The workflow has not been started with `run` yet, so no background
    /// processors exist to make progress on the requested operation.
    #[error("workflow is not running")]
    WorkflowNotRunning,

    /// A trigger was blocked by an existing non-terminal record for the same
    /// foreign id.
    #[error("workflow already in progress for foreign id")]
    WorkflowInProgress,

    /// No record exists for the requested run or foreign id.
    #[error("record not found")]
    RecordNotFound,

    /// The record's run state does not admit handler activity (paused,
    /// cancelled, completed, or deleted), so the operation cannot observe
    /// it. Distinct from [`Error::WorkflowNotRunning`], which is about the
    /// workflow handle, not an individual record.
    #[error("run is inactive: run state is {run_state}")]
    RunInactive {
        /// The record's current run state.
        run_state: RunState,
    },

    /// The status is not part of the workflow's transition graph.
    #[error("status {status} is not configured for workflow {workflow}")]
    StatusNotConfigured {
        /// The workflow name.
        workflow: String,
        /// The unconfigured status code.
        status: i32,
    },

    /// A handler returned a destination that the transition graph does not
    /// allow from the record's current status.
    #[error("invalid transition from {from} to {to} in workflow {workflow}")]
    InvalidTransition {
        /// The workflow name.
        workflow: String,
        /// The current status code.
        from: i32,
        /// The rejected destination status code.
        to: i32,
    },

    /// A run-state change that would move backwards over the lifecycle
    /// lattice.
    #[error("invalid run state transition from {from} to {to}")]
    InvalidRunStateTransition {
        /// The current run state.
        from: RunState,
        /// The rejected run state.
        to: RunState,
    },

    /// The role scheduler revoked a lease mid-process.
    #[error("role lease lost")]
    LeaseLost,

    /// The surrounding context ended before the operation finished.
    #[error("cancelled")]
    Cancelled,

    /// An await call exceeded its configured deadline.
    #[error("await deadline exceeded")]
    AwaitTimeout,

    /// A cron spec could not be parsed.
    #[error("invalid cron spec: {0}")]
    InvalidCronSpec(String),

    /// Failed to serialize or deserialize a payload, outbox event, or record.
    ///
    /// This typically indicates a mismatch between the stored object bytes
    /// and the current user payload type definition.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A user handler (step, callback, timeout, connector) failed.
    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    /// A storage, streaming, or scheduling backend failed.
    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl Error {
    /// Wrap a user handler failure.
    pub fn handler(err: impl Into<anyhow::Error>) -> Self {
        Error::Handler(err.into())
    }

    /// Wrap a backend failure.
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Error::Backend(err.into())
    }

    /// Returns `true` if the error is a context cancellation or lease loss,
    /// which processors treat as a retry signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::LeaseLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_classification() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::LeaseLost.is_cancellation());
        assert!(!Error::RecordNotFound.is_cancellation());
        assert!(!Error::handler(anyhow::anyhow!("boom")).is_cancellation());
    }

    #[test]
    fn run_inactive_names_the_state() {
        let err = Error::RunInactive {
            run_state: RunState::Paused,
        };
        assert_eq!(err.to_string(), "run is inactive: run state is paused");
    }

    #[test]
    fn display_carries_identity() {
        let err = Error::InvalidTransition {
            workflow: "orders".to_owned(),
            from: 1,
            to: 9,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition from 1 to 9 in workflow orders"
        );
    }
}
