//! Task lifecycle states

use serde::{Deserialize, Serialize};

/// Task execution state
///
/// `Initialized -> Running -> {Completed | Errored | Interrupted}`.
/// `Interrupted` and `Errored` re-enter `Running` through `run()`;
/// running a `Completed` task is a successful no-op. Any non-running
/// state returns to `Initialized` through `reset()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Task has not run yet, or has been reset
    Initialized,
    /// Task is currently running
    Running,
    /// Task finished successfully
    Completed,
    /// Task finished with an error
    Errored,
    /// Task was cooperatively cancelled and may be resumed
    Interrupted,
}

impl TaskState {
    /// Check if the task finished, successfully or not
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Errored)
    }

    /// Check if the task is out of flight: finished or interrupted
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Errored | TaskState::Interrupted
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Initialized => write!(f, "initialized"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Errored => write!(f, "errored"),
            TaskState::Interrupted => write!(f, "interrupted"),
        }
    }
}
