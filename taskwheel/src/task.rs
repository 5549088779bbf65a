// Task contract consumed by the scheduler

use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// A unit of work the scheduler can run repeatedly.
///
/// A task carries no scheduling state of its own; the scheduler keys its
/// bookkeeping on `id()`. The returned JSON value is propagated through the
/// `Done` event, a returned error through the `Failed` event.
#[async_trait]
pub trait Task: fmt::Debug + Send + Sync {
    /// Unique identity of this task
    fn id(&self) -> Uuid;

    /// Human readable name of this task
    fn name(&self) -> &str;

    /// Optional description of this task
    fn description(&self) -> Option<&str> {
        None
    }

    /// Perform one run of this task
    async fn run(&self) -> anyhow::Result<serde_json::Value>;
}
