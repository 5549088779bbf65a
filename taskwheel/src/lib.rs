// In-process recurring task scheduling library
//
// Pairs a task with a frequency (cron expression, iCalendar recurrence rule
// or one-off instant), computes when the task is next due, runs it on the
// Tokio runtime and re-arms until the frequency expires or the task is
// removed. Single process, in-memory, best effort.

pub mod errors;
pub mod frequency;
pub mod scheduler;
pub mod task;
