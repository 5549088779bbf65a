// Scheduler lifecycle events

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::task::Task;

/// Lifecycle notifications emitted by the scheduler.
///
/// Besides direct queries (`has_task`, counts) this is the only way
/// information crosses the scheduler boundary. Delivery is fire-and-continue
/// over a broadcast channel; a lagging or absent subscriber never blocks the
/// scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The task was scheduled or re-armed to run at the given time
    Scheduled {
        task: Arc<dyn Task>,
        at: DateTime<Utc>,
    },

    /// One run of the task was started
    Run {
        task: Arc<dyn Task>,
        operation: Uuid,
    },

    /// An operation settled successfully with the task's result
    Done {
        task: Arc<dyn Task>,
        result: serde_json::Value,
    },

    /// An operation settled with a failure
    Failed {
        task: Arc<dyn Task>,
        reason: String,
    },

    /// In-flight operations were canceled because the task was removed
    Canceled {
        task: Arc<dyn Task>,
        operations: Vec<Uuid>,
    },

    /// The frequency will never be due again; the task was retired
    Expired {
        task: Arc<dyn Task>,
        at: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    /// The task this event concerns
    pub fn task(&self) -> &Arc<dyn Task> {
        match self {
            SchedulerEvent::Scheduled { task, .. }
            | SchedulerEvent::Run { task, .. }
            | SchedulerEvent::Done { task, .. }
            | SchedulerEvent::Failed { task, .. }
            | SchedulerEvent::Canceled { task, .. }
            | SchedulerEvent::Expired { task, .. } => task,
        }
    }
}
