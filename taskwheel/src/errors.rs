// Error handling framework

use thiserror::Error;
use uuid::Uuid;

/// Frequency construction and query errors
#[derive(Error, Debug)]
pub enum FrequencyError {
    #[error("Invalid frequency '{expression}': {reason}")]
    InvalidFrequency { expression: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl FrequencyError {
    /// Build an `InvalidFrequency` error from an expression and a cause
    pub fn invalid(expression: impl ToString, reason: impl ToString) -> Self {
        FrequencyError::InvalidFrequency {
            expression: expression.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Scheduler registry errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Task {task_id} is not scheduled")]
    NotScheduled { task_id: Uuid },

    #[error("Task {task_id} is already scheduled")]
    AlreadyScheduled { task_id: Uuid },
}
