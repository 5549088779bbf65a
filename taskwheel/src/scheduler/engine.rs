// Scheduler engine implementation

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::SchedulerError;
use crate::frequency::Frequency;
use crate::scheduler::events::SchedulerEvent;
use crate::task::Task;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { event_capacity: 128 }
    }
}

/// Bookkeeping for one scheduled task: the pending rearm timer and the set
/// of operations currently in flight for it.
///
/// The set can hold more than one handle at a time; a frequency firing
/// faster than the task's operations settle legitimately accumulates
/// overlapping runs.
#[derive(Debug)]
struct ScheduledTask {
    task: Arc<dyn Task>,
    timer: JoinHandle<()>,
    operations: Vec<OperationHandle>,
}

#[derive(Debug)]
struct OperationHandle {
    id: Uuid,
    abort: AbortHandle,
}

/// How a task leaves the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetireMode {
    /// Abort the timer and cancel in-flight operations (explicit removal)
    Cancel,
    /// Drop the bookkeeping only; operations settle on their own (expiry)
    Detach,
}

#[derive(Debug)]
struct Inner {
    tasks: Mutex<HashMap<Uuid, ScheduledTask>>,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Runs tasks when their frequency says they are due.
///
/// Every scheduled task gets a lightweight rearm timer on the Tokio runtime;
/// when it fires the task's operation is spawned, the next due time is
/// recomputed from the actual fire time (drift is accepted, not corrected)
/// and the timer re-arms, until the frequency expires or the task is
/// removed. All registry mutations go through a single lock, and settlement
/// notifications are emitted before the settled operation is deregistered.
///
/// The scheduler must be used from within a Tokio runtime. Handles are cheap
/// to clone; dropping the last one cancels all timers and requests
/// cancellation of all in-flight operations.
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Subscribe to the scheduler's lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Schedule the given task based on the specified frequency.
    ///
    /// A frequency that is due right now triggers one run on the next
    /// executor turn, never synchronously inside this call. A frequency that
    /// is already expired schedules nothing and only emits `Expired`.
    pub fn schedule<F>(&self, task: Arc<dyn Task>, frequency: F) -> Result<(), SchedulerError>
    where
        F: Frequency + 'static,
    {
        let frequency: Arc<dyn Frequency> = Arc::new(frequency);
        let task_id = task.id();
        let now = Utc::now();

        if frequency.is_expired(now) {
            warn!(task = %task.name(), "Not scheduling task, its frequency is already expired");
            let at = frequency.end().unwrap_or(now);
            self.inner.emit(SchedulerEvent::Expired { task, at });
            return Ok(());
        }

        let mut tasks = self.inner.tasks_guard();
        if tasks.contains_key(&task_id) {
            return Err(SchedulerError::AlreadyScheduled { task_id });
        }

        let due_now = frequency.is_due(now);
        if due_now {
            let weak = Arc::downgrade(&self.inner);
            let run_task = task.clone();
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    Inner::spawn_run(&inner, run_task);
                }
            });
        }

        let next_due = frequency.next_due(now);
        info!(task = %task.name(), next_due = %next_due, "Scheduling task");
        self.inner.emit(SchedulerEvent::Scheduled {
            task: task.clone(),
            at: if due_now { now } else { next_due },
        });

        let timer = Inner::spawn_rearm_timer(&self.inner, task.clone(), frequency, next_due);
        tasks.insert(task_id, ScheduledTask {
            task,
            timer,
            operations: Vec::new(),
        });

        Ok(())
    }

    /// Remove and cancel the given task.
    ///
    /// Cancels the pending rearm timer and requests cancellation of every
    /// in-flight operation; whether the underlying work actually stops
    /// depends on the operation itself. Fails with `NotScheduled` if the
    /// task id is not in the active set.
    pub fn remove(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        match self.inner.retire(task_id, RetireMode::Cancel) {
            Some(task) => {
                info!(task = %task.name(), "Removed task");
                Ok(())
            }
            None => Err(SchedulerError::NotScheduled { task_id }),
        }
    }

    /// Remove and cancel all tasks
    pub fn remove_tasks(&self) {
        info!("Removing all tasks");

        let task_ids: Vec<Uuid> = self.inner.tasks_guard().keys().copied().collect();
        for task_id in task_ids {
            let _ = self.inner.retire(task_id, RetireMode::Cancel);
        }
    }

    /// Get whether the given task id is scheduled
    pub fn has_task(&self, task_id: Uuid) -> bool {
        self.inner.tasks_guard().contains_key(&task_id)
    }

    /// Number of scheduled tasks
    pub fn task_count(&self) -> usize {
        self.inner.tasks_guard().len()
    }

    /// Number of operations currently in flight for the given task id
    pub fn operation_count(&self, task_id: Uuid) -> usize {
        self.inner
            .tasks_guard()
            .get(&task_id)
            .map_or(0, |entry| entry.operations.len())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn tasks_guard(&self) -> MutexGuard<'_, HashMap<Uuid, ScheduledTask>> {
        // A poisoned lock only means a panic elsewhere; the registry itself
        // stays usable
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SchedulerEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Arm the one-shot rearm timer for a task.
    ///
    /// The timer sleeps until the due time, spawns a run and either retires
    /// the task when its frequency has expired or re-arms itself for the
    /// next due time, computed relative to the actual fire time.
    fn spawn_rearm_timer(
        inner: &Arc<Inner>,
        task: Arc<dyn Task>,
        frequency: Arc<dyn Frequency>,
        first_due: DateTime<Utc>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);

        tokio::spawn(async move {
            let mut due = first_due;

            loop {
                let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(delay).await;

                let Some(inner) = weak.upgrade() else { break };

                Inner::spawn_run(&inner, task.clone());

                let now = Utc::now();
                if frequency.is_expired(now) {
                    let at = frequency.end().unwrap_or(now);
                    info!(task = %task.name(), expired_at = %at, "Frequency expired, retiring task");
                    inner.emit(SchedulerEvent::Expired {
                        task: task.clone(),
                        at,
                    });
                    // The timer retires itself, and in-flight operations
                    // (including the run just spawned) are left to settle;
                    // only an explicit remove() cancels them
                    inner.retire(task.id(), RetireMode::Detach);
                    break;
                }

                due = frequency.next_due(now);
                debug!(task = %task.name(), next_due = %due, "Re-arming task");
                inner.emit(SchedulerEvent::Scheduled {
                    task: task.clone(),
                    at: due,
                });
            }
        })
    }

    /// Run the task once: spawn its operation, track the handle and watch
    /// for settlement
    fn spawn_run(inner: &Arc<Inner>, task: Arc<dyn Task>) {
        let operation = Uuid::new_v4();
        let run_task = task.clone();
        let join = tokio::spawn(async move { run_task.run().await });
        let abort = join.abort_handle();

        {
            let mut tasks = inner.tasks_guard();
            let Some(entry) = tasks.get_mut(&task.id()) else {
                // Removed between the timer firing and this run registering
                debug!(task = %task.name(), "Dropping run of a task that is no longer scheduled");
                abort.abort();
                return;
            };
            entry.operations.push(OperationHandle { id: operation, abort });
        }

        debug!(task = %task.name(), %operation, "Running task");
        inner.emit(SchedulerEvent::Run {
            task: task.clone(),
            operation,
        });

        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let outcome = join.await;
            let Some(inner) = weak.upgrade() else { return };

            match outcome {
                Ok(Ok(result)) => {
                    info!(task = %task.name(), "Task finished successfully");
                    inner.emit(SchedulerEvent::Done {
                        task: task.clone(),
                        result,
                    });
                }
                Ok(Err(reason)) => {
                    error!(task = %task.name(), error = %reason, "Failed to run task");
                    inner.emit(SchedulerEvent::Failed {
                        task: task.clone(),
                        reason: reason.to_string(),
                    });
                }
                Err(join_error) if join_error.is_cancelled() => {
                    // Canceled through remove(); bookkeeping is already gone
                    return;
                }
                Err(join_error) => {
                    error!(task = %task.name(), error = %join_error, "Task run panicked");
                    inner.emit(SchedulerEvent::Failed {
                        task: task.clone(),
                        reason: join_error.to_string(),
                    });
                }
            }

            // Notify first, deregister after, so observers see a consistent
            // in-flight count at notification time
            let mut tasks = inner.tasks_guard();
            if let Some(entry) = tasks.get_mut(&task.id()) {
                entry.operations.retain(|op| op.id != operation);
            }
        });
    }

    /// Drop a task's bookkeeping.
    ///
    /// `Cancel` additionally aborts the rearm timer, requests cancellation
    /// of every in-flight operation and emits `Canceled` when any were still
    /// running; canceling an operation that already settled has no effect,
    /// settled is terminal. `Detach` (the expiry path, where the timer
    /// retires itself) leaves running operations to settle on their own.
    fn retire(&self, task_id: Uuid, mode: RetireMode) -> Option<Arc<dyn Task>> {
        let entry = self.tasks_guard().remove(&task_id)?;

        if mode == RetireMode::Detach {
            return Some(entry.task);
        }

        entry.timer.abort();

        let canceled: Vec<Uuid> = entry.operations.iter().map(|op| op.id).collect();
        for op in &entry.operations {
            op.abort.abort();
        }

        if !canceled.is_empty() {
            debug!(task = %entry.task.name(), count = canceled.len(), "Canceled in-flight operations");
            self.emit(SchedulerEvent::Canceled {
                task: entry.task.clone(),
                operations: canceled,
            });
        }

        Some(entry.task)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for entry in tasks.values() {
            entry.timer.abort();
            for op in &entry.operations {
                op.abort.abort();
            }
        }
    }
}
