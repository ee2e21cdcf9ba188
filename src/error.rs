//! Error types
//!
//! Centralized error handling using thiserror for type-safe errors.
//!
//! Everything here is a *usage* error: a caller driving a task or a
//! container through an invalid transition or mutation. Failures of the
//! work itself never surface as `Err` values; they travel through the
//! task lifecycle as `Errored` transitions carrying a payload and a
//! message.

use thiserror::Error;

use crate::id::TaskId;
use crate::state::TaskState;

/// Task lifecycle and container errors
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task '{id}' is already running")]
    AlreadyRunning { id: TaskId },

    #[error("invalid task state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    #[error("task '{id}' is already present in the container")]
    DuplicateTask { id: TaskId },

    #[error("task '{id}' not found in the container")]
    NotFound { id: TaskId },

    #[error("task '{id}' cannot block on itself")]
    SelfDependency { id: TaskId },

    #[error("blocker '{blocker}' of task '{id}' is not a member of the graph")]
    UnknownBlocker { id: TaskId, blocker: TaskId },

    #[error("task '{id}' still has dependents: {dependents:?}")]
    DependentsExist { id: TaskId, dependents: Vec<TaskId> },

    #[error("cannot add blockers to task '{id}' while it is running")]
    BlockedWhileRunning { id: TaskId },

    #[error("conditional has no outcomes registered")]
    NoOutcomes,

    #[error("conditional already has a default outcome")]
    DuplicateDefaultOutcome,
}

/// Result type alias for task operations
pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TaskError::InvalidStateTransition {
            from: TaskState::Initialized,
            to: TaskState::Interrupted,
        };
        assert_eq!(
            err.to_string(),
            "invalid task state transition: initialized -> interrupted"
        );
    }

    #[test]
    fn test_dependency_error_display() {
        let err = TaskError::UnknownBlocker {
            id: TaskId::from_raw(7),
            blocker: TaskId::from_raw(3),
        };
        assert_eq!(
            err.to_string(),
            "blocker 'task-3' of task 'task-7' is not a member of the graph"
        );
    }
}
