// Frequency contracts and implementations
//
// A frequency answers "is a task due at time t", "when is it next due after
// t" and "will it ever be due again". Three implementations are provided:
// cron expressions, iCalendar recurrence rules and one-off instants.

pub mod cron;
pub mod one_off;
pub mod rrule;

use chrono::{DateTime, Utc};
use std::fmt;

pub use self::cron::Cron;
pub use self::one_off::OneOff;
pub use self::rrule::{RRule, RRuleFrequency};

/// Canonical timestamp format used by frequency serialization.
///
/// Frequencies are second granular; serialized timestamps never carry
/// sub-second precision or a zone suffix.
pub const SERIALIZED_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Recurrence policy of a scheduled task
pub trait Frequency: fmt::Debug + Send + Sync {
    /// Get whether the frequency is due at the specified time
    fn is_due(&self, at: DateTime<Utc>) -> bool;

    /// Get the next due time relative to the given time.
    ///
    /// Never earlier than `at` for a non-expired frequency; a time before the
    /// start bound clamps up to the start bound.
    fn next_due(&self, at: DateTime<Utc>) -> DateTime<Utc>;

    /// Get whether the given time is beyond the frequency's expiry time.
    ///
    /// Monotone: once expired at `t`, expired at every later time.
    fn is_expired(&self, at: DateTime<Utc>) -> bool;

    /// Start bound of this frequency, if any
    fn start(&self) -> Option<DateTime<Utc>>;

    /// End bound of this frequency, if any
    fn end(&self) -> Option<DateTime<Utc>>;
}
