// Scheduler module: task lifecycle engine and event surface

pub mod engine;
pub mod events;

pub use engine::{Scheduler, SchedulerConfig};
pub use events::SchedulerEvent;
