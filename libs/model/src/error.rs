//! Errors raised by the shared data model.

use thiserror::Error;

use crate::substate::ExecutorSubState;
use crate::task::TaskState;

/// Model-level validation errors.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A sub-state transition the state machine forbids.
    #[error("illegal sub-state transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutorSubState,
        to: ExecutorSubState,
    },

    /// A repair task state the contract does not cover for this operation.
    #[error("unexpected repair task state {0}")]
    UnexpectedTaskState(TaskState),

    /// A sub-state name that is not part of the contract.
    #[error("unknown sub-state: {0}")]
    UnknownSubState(String),

    /// A task id that does not follow `POS_<nodeName>_<uuid>`.
    #[error("malformed task id: {0}")]
    MalformedTaskId(String),

    /// Executor data blob that does not parse.
    #[error("invalid executor data: {0}")]
    InvalidExecutorData(String),
}
