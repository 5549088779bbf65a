// Cron expression frequency with start time field alignment

use chrono::{DateTime, Datelike, Duration, SubsecRound, Timelike, Utc, Weekday};
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;

use crate::errors::FrequencyError;
use crate::frequency::Frequency;

/// Index of the minute field
pub const PART_MINUTE: usize = 0;
/// Index of the hour field
pub const PART_HOUR: usize = 1;
/// Index of the day-of-month field
pub const PART_DAY: usize = 2;
/// Index of the month field
pub const PART_MONTH: usize = 3;
/// Index of the weekday field
pub const PART_WEEKDAY: usize = 4;

/// Alias expressions, including the non-stock `@minutely` and `@quarterly`
const ALIASES: &[(&str, &str)] = &[
    ("@minutely", "* * * * *"),
    ("@hourly", "0 * * * *"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@weekly", "0 0 * * SUN"),
    ("@monthly", "0 0 1 * *"),
    ("@quarterly", "0 0 1 */3 *"),
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
];

const SECONDS_PER_DAY: i64 = 86_400;

/// Recurrence granularity of an expression, taken from its coarsest
/// constrained field before any start alignment is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CronClass {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Frequency backed by a 5-field cron expression (minute, hour, day of
/// month, month, weekday) with optional start and end bounds.
///
/// Setting a start bound rewrites unconstrained fields so the generated
/// occurrences line up with the start's wall clock components instead of the
/// evaluator's default anchors: "every 2 hours" starting at 13:00 keeps
/// firing at 13:00, 15:00, ... rather than at even hours. Interval steps
/// (`*/N`) already present are preserved, only their anchor changes.
#[derive(Debug, Clone)]
pub struct Cron {
    expression: String,
    parts: [String; 5],
    class: CronClass,
    from_alias: bool,
    schedule: CronSchedule,
    /// An hour step beyond 24 encodes a whole-day period ("every 48 hours");
    /// the step is stripped from the compiled schedule and applied as
    /// anchored day stepping in `next_due`.
    period_days: Option<i64>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl Cron {
    /// Create a frequency from the given cron expression or alias.
    ///
    /// Fails with `InvalidFrequency` if the expression is not a valid
    /// 5-field cron expression.
    pub fn new(expression: &str) -> Result<Self, FrequencyError> {
        let trimmed = expression.trim();

        let (resolved, from_alias) = if trimmed.starts_with('@') {
            let expanded = ALIASES
                .iter()
                .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
                .map(|(_, expansion)| *expansion)
                .ok_or_else(|| FrequencyError::invalid(trimmed, "unknown alias"))?;
            (expanded, true)
        } else {
            (trimmed, false)
        };

        let fields: Vec<&str> = resolved.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(FrequencyError::invalid(
                trimmed,
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }

        let mut parts: [String; 5] = [
            fields[0].to_string(),
            fields[1].to_string(),
            fields[2].to_string(),
            fields[3].to_string(),
            fields[4].to_string(),
        ];
        let class = classify(&parts);

        let mut period_days = None;
        if let Some(step) = field_step(&parts[PART_HOUR]) {
            if step > 24 {
                if step % 24 != 0 {
                    return Err(FrequencyError::invalid(
                        trimmed,
                        "an hour step beyond 24 must be a whole number of days",
                    ));
                }
                period_days = Some(i64::from(step / 24));
                parts[PART_HOUR] = field_base(&parts[PART_HOUR]).to_string();
            }
        }

        let schedule = compile(&parts, 0, trimmed)?;

        Ok(Self {
            expression: trimmed.to_string(),
            parts,
            class,
            from_alias,
            schedule,
            period_days,
            start: None,
            end: None,
        })
    }

    /// Get whether the given expression is a valid cron expression
    pub fn is_valid(expression: &str) -> bool {
        Self::new(expression).is_ok()
    }

    /// Get the expression this frequency was created from
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Get a single field of the effective expression.
    ///
    /// Fails with `InvalidArgument` if the index is not one of the `PART_*`
    /// constants.
    pub fn part(&self, index: usize) -> Result<&str, FrequencyError> {
        self.parts
            .get(index)
            .map(|part| part.as_str())
            .ok_or_else(|| {
                FrequencyError::InvalidArgument(format!("no cron part at index {index}"))
            })
    }

    /// Get all five fields of the effective expression
    pub fn parts(&self) -> &[String; 5] {
        &self.parts
    }

    /// Set the start bound and align the expression's fields to it
    pub fn start_at(mut self, start: DateTime<Utc>) -> Result<Self, FrequencyError> {
        let start = start.trunc_subsecs(0);
        self.align_to(start)?;
        self.start = Some(start);

        Ok(self)
    }

    /// Set the end bound of this frequency
    pub fn end_at(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end.trunc_subsecs(0));
        self
    }

    /// Rewrite unconstrained fields so occurrences line up with `start`.
    ///
    /// Fields the expression constrains on its own are left untouched; alias
    /// defaults (`0` hours, day `1`, Sunday) count as unconstrained. Steps
    /// keep their value, only the anchor changes.
    fn align_to(&mut self, start: DateTime<Utc>) -> Result<(), FrequencyError> {
        if self.class != CronClass::Minutely {
            self.parts[PART_MINUTE] = pin_field(&self.parts[PART_MINUTE], start.minute());
        }

        if self.class >= CronClass::Daily
            && matches!(field_base(&self.parts[PART_HOUR]), "*" | "0")
        {
            self.parts[PART_HOUR] = pin_field(&self.parts[PART_HOUR], start.hour());
        }

        if matches!(self.class, CronClass::Monthly | CronClass::Yearly) {
            let day = &self.parts[PART_DAY];
            let day_unconstrained =
                matches!(field_base(day), "*" | "0") || (self.from_alias && field_base(day) == "1");
            if field_step(day).is_none() && day_unconstrained {
                self.parts[PART_DAY] = start.day().to_string();
            }
        }

        if self.class == CronClass::Yearly {
            let month = &self.parts[PART_MONTH];
            let month_unconstrained =
                field_base(month) == "*" || (self.from_alias && field_base(month) == "1");
            if field_step(month).is_none() && month_unconstrained {
                self.parts[PART_MONTH] = start.month().to_string();
            }
        }

        if self.class == CronClass::Weekly
            && (self.parts[PART_WEEKDAY] == "*" || self.from_alias)
        {
            self.parts[PART_WEEKDAY] = weekday_name(start.weekday()).to_string();
        }

        self.schedule = compile(&self.parts, start.second(), &self.expression)?;

        Ok(())
    }
}

impl Frequency for Cron {
    fn is_due(&self, at: DateTime<Utc>) -> bool {
        if self.is_expired(at) {
            return false;
        }

        if let Some(start) = self.start {
            if at < start {
                return false;
            }

            if let Some(days) = self.period_days {
                let elapsed = (at.trunc_subsecs(0) - start).num_seconds();
                if elapsed % (days * SECONDS_PER_DAY) != 0 {
                    return false;
                }
            }
        }

        self.schedule.includes(at.trunc_subsecs(0))
    }

    fn next_due(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_expired(at) {
            // Only reachable with an end bound set
            return self.end.unwrap_or(at);
        }

        if let Some(start) = self.start {
            if at < start {
                return start;
            }

            if let Some(days) = self.period_days {
                let period = days * SECONDS_PER_DAY;
                let elapsed = (at - start).num_seconds();
                let periods = elapsed.div_euclid(period) + 1;
                return start + Duration::seconds(periods * period);
            }
        }

        match self.schedule.after(&at).next() {
            Some(next) => next,
            // The evaluator found no occurrence within its search horizon;
            // report no progress instead of failing
            None => at,
        }
    }

    fn is_expired(&self, at: DateTime<Utc>) -> bool {
        matches!(self.end, Some(end) if end < at)
    }

    fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }
}

impl fmt::Display for Cron {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Compile the five fields into the evaluator's 6-field grammar, carrying
/// the start bound's seconds component as the seconds field
fn compile(
    parts: &[String; 5],
    seconds: u32,
    expression: &str,
) -> Result<CronSchedule, FrequencyError> {
    let compiled = format!("{seconds} {}", parts.join(" "));

    CronSchedule::from_str(&compiled).map_err(|e| FrequencyError::invalid(expression, e))
}

fn classify(parts: &[String; 5]) -> CronClass {
    let constrained = |field: &str| field_base(field) != "*" || field_step(field).is_some();

    if field_base(&parts[PART_MONTH]) != "*" {
        CronClass::Yearly
    } else if field_step(&parts[PART_MONTH]).is_some() || constrained(&parts[PART_DAY]) {
        CronClass::Monthly
    } else if parts[PART_WEEKDAY] != "*" {
        CronClass::Weekly
    } else if constrained(&parts[PART_HOUR]) {
        CronClass::Daily
    } else if constrained(&parts[PART_MINUTE]) {
        CronClass::Hourly
    } else {
        CronClass::Minutely
    }
}

fn field_base(field: &str) -> &str {
    field.split('/').next().unwrap_or(field)
}

fn field_step(field: &str) -> Option<u32> {
    field.split_once('/').and_then(|(_, step)| step.parse().ok())
}

/// Replace a field's anchor with the given value, keeping any `/N` step
fn pin_field(field: &str, value: u32) -> String {
    match field.split_once('/') {
        Some((_, step)) => format!("{value}/{step}"),
        None => value.to_string(),
    }
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "MON",
        Weekday::Tue => "TUE",
        Weekday::Wed => "WED",
        Weekday::Thu => "THU",
        Weekday::Fri => "FRI",
        Weekday::Sat => "SAT",
        Weekday::Sun => "SUN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_valid_expressions() {
        assert!(Cron::is_valid("* * * * *"));
        assert!(Cron::is_valid("*/5 8-18 * * MON-FRI"));
        assert!(Cron::is_valid("0 12 1 JAN *"));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(!Cron::is_valid(""));
        assert!(!Cron::is_valid("* * * *"));
        assert!(!Cron::is_valid("61 * * * *"));
        assert!(!Cron::is_valid("not a cron"));
    }

    #[test]
    fn test_registered_custom_aliases() {
        assert!(Cron::is_valid("@minutely"));
        assert!(Cron::is_valid("@quarterly"));
        assert!(Cron::is_valid("@yearly"));
    }

    #[test]
    fn test_unknown_alias_is_rejected() {
        assert!(!Cron::is_valid("@fortnightly"));
    }

    #[test]
    fn test_part_accessors() {
        let cron = Cron::new("5 2 20 FEB SUN").unwrap();

        assert_eq!(cron.part(PART_MINUTE).unwrap(), "5");
        assert_eq!(cron.part(PART_HOUR).unwrap(), "2");
        assert_eq!(cron.part(PART_DAY).unwrap(), "20");
        assert_eq!(cron.part(PART_MONTH).unwrap(), "FEB");
        assert_eq!(cron.part(PART_WEEKDAY).unwrap(), "SUN");
    }

    #[test]
    fn test_part_with_invalid_index_fails() {
        let cron = Cron::new("* * * * *").unwrap();

        assert!(matches!(
            cron.part(1000),
            Err(FrequencyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_is_due_every_minute() {
        let cron = Cron::new("* * * * *").unwrap();

        assert!(cron.is_due(at(2024, 6, 1, 10, 5, 0)));
        assert!(!cron.is_due(at(2024, 6, 1, 10, 5, 30)));
    }

    #[test]
    fn test_is_due_before_start_time() {
        let now = at(2024, 6, 1, 10, 0, 0);
        let cron = Cron::new("* * * * *")
            .unwrap()
            .start_at(now + Duration::weeks(1))
            .unwrap();

        assert!(!cron.is_due(now));
    }

    #[test]
    fn test_is_due_after_end_time() {
        let now = at(2024, 6, 1, 10, 0, 0);
        let cron = Cron::new("* * * * *")
            .unwrap()
            .end_at(now - Duration::weeks(1));

        assert!(!cron.is_due(now));
    }

    #[test]
    fn test_next_due_every_minute() {
        let now = at(2024, 6, 1, 10, 5, 0);
        let cron = Cron::new("* * * * *").unwrap();

        assert_eq!(cron.next_due(now), now + Duration::minutes(1));
    }

    #[test]
    fn test_next_due_with_end_time_in_the_past() {
        let end = at(2024, 6, 1, 10, 0, 0);
        let cron = Cron::new("* * * * *").unwrap().end_at(end);

        assert_eq!(cron.next_due(end + Duration::hours(2)), end);
    }

    #[test]
    fn test_next_due_clamps_to_start() {
        let start = at(2024, 6, 1, 13, 45, 0);
        let cron = Cron::new("@daily").unwrap().start_at(start).unwrap();

        assert_eq!(cron.next_due(start - Duration::days(2)), start);
    }

    #[test]
    fn test_is_expired() {
        let now = at(2024, 6, 1, 10, 0, 0);

        let open_ended = Cron::new("* * * * *").unwrap();
        assert!(!open_ended.is_expired(now));

        let ended = Cron::new("* * * * *")
            .unwrap()
            .end_at(now - Duration::hours(2));
        assert!(ended.is_expired(now));
        assert!(!ended.is_expired(now - Duration::hours(3)));
    }

    #[test]
    fn test_hour_step_keeps_start_anchor() {
        // "every 2 hours" starting 13:00 must fire 13:00, 15:00, ... 23:00
        let start = at(2024, 6, 1, 13, 0, 0);
        let cron = Cron::new("0 */2 * * *").unwrap().start_at(start).unwrap();

        assert_eq!(cron.parts()[PART_HOUR], "13/2");
        assert_eq!(cron.next_due(start), at(2024, 6, 1, 15, 0, 0));
        assert_eq!(
            cron.next_due(at(2024, 6, 1, 15, 0, 0)),
            at(2024, 6, 1, 17, 0, 0)
        );
        // The hour range ends at 23; the next anchor is 13:00 the day after
        assert_eq!(
            cron.next_due(at(2024, 6, 1, 23, 0, 0)),
            at(2024, 6, 2, 13, 0, 0)
        );
    }

    #[test]
    fn test_minute_step_keeps_start_anchor() {
        let start = at(2024, 6, 1, 10, 47, 0);
        let cron = Cron::new("*/5 * * * *").unwrap().start_at(start).unwrap();

        assert_eq!(cron.parts()[PART_MINUTE], "47/5");
        assert_eq!(cron.next_due(start), at(2024, 6, 1, 10, 52, 0));
    }

    #[test]
    fn test_daily_alias_aligns_to_start_clock() {
        let start = at(2024, 6, 1, 13, 45, 0);
        let cron = Cron::new("@daily").unwrap().start_at(start).unwrap();

        assert_eq!(cron.parts()[PART_MINUTE], "45");
        assert_eq!(cron.parts()[PART_HOUR], "13");
        assert_eq!(cron.next_due(start), at(2024, 6, 2, 13, 45, 0));
    }

    #[test]
    fn test_weekly_alias_aligns_to_start_weekday() {
        // 2024-06-05 is a Wednesday
        let start = at(2024, 6, 5, 9, 15, 0);
        let cron = Cron::new("@weekly").unwrap().start_at(start).unwrap();

        assert_eq!(cron.parts()[PART_WEEKDAY], "WED");
        assert!(cron.is_due(start));
        assert_eq!(cron.next_due(start), at(2024, 6, 12, 9, 15, 0));
    }

    #[test]
    fn test_monthly_alias_aligns_to_start_day() {
        let start = at(2024, 6, 20, 8, 30, 0);
        let cron = Cron::new("@monthly").unwrap().start_at(start).unwrap();

        assert_eq!(cron.parts()[PART_DAY], "20");
        assert_eq!(cron.next_due(start), at(2024, 7, 20, 8, 30, 0));
    }

    #[test]
    fn test_quarterly_alias_keeps_month_step() {
        // Cron cannot express "every 3 months anchored at February"; the
        // month step stays on the library anchor while day and clock align
        let start = at(2024, 2, 20, 10, 0, 0);
        let cron = Cron::new("@quarterly").unwrap().start_at(start).unwrap();

        assert_eq!(cron.parts()[PART_DAY], "20");
        assert_eq!(cron.parts()[PART_MONTH], "*/3");
        assert_eq!(cron.next_due(start), at(2024, 4, 20, 10, 0, 0));
    }

    #[test]
    fn test_yearly_alias_aligns_to_start_date() {
        let start = at(2024, 6, 5, 7, 0, 0);
        let cron = Cron::new("@yearly").unwrap().start_at(start).unwrap();

        assert_eq!(cron.parts()[PART_DAY], "5");
        assert_eq!(cron.parts()[PART_MONTH], "6");
        assert_eq!(cron.next_due(start), at(2025, 6, 5, 7, 0, 0));
    }

    #[test]
    fn test_alignment_keeps_explicit_fields() {
        let start = at(2024, 6, 1, 13, 45, 0);
        let cron = Cron::new("15 7 * * *").unwrap().start_at(start).unwrap();

        // The minute is always anchored to the start, an explicit hour wins
        assert_eq!(cron.parts()[PART_MINUTE], "45");
        assert_eq!(cron.parts()[PART_HOUR], "7");
        assert_eq!(cron.next_due(start), at(2024, 6, 2, 7, 45, 0));
    }

    #[test]
    fn test_alignment_keeps_explicit_weekday() {
        let start = at(2024, 6, 5, 9, 0, 0); // Wednesday
        let cron = Cron::new("0 0 * * MON").unwrap().start_at(start).unwrap();

        assert_eq!(cron.parts()[PART_WEEKDAY], "MON");
        // Next Monday after the Wednesday start, at the aligned clock
        assert_eq!(cron.next_due(start), at(2024, 6, 10, 9, 0, 0));
    }

    #[test]
    fn test_start_seconds_are_carried() {
        let start = at(2024, 6, 1, 10, 0, 30);
        let cron = Cron::new("* * * * *").unwrap().start_at(start).unwrap();

        assert!(cron.is_due(start));
        assert_eq!(cron.next_due(start), at(2024, 6, 1, 10, 1, 30));
    }

    #[test]
    fn test_multi_day_hour_step() {
        // An hour step beyond 24 runs every step/24 days, anchored at start
        let start = at(2024, 6, 1, 6, 0, 0);
        let cron = Cron::new("0 */48 * * *").unwrap().start_at(start).unwrap();

        assert_eq!(cron.next_due(start), at(2024, 6, 3, 6, 0, 0));
        assert_eq!(cron.next_due(at(2024, 6, 2, 0, 0, 0)), at(2024, 6, 3, 6, 0, 0));
        assert!(cron.is_due(at(2024, 6, 3, 6, 0, 0)));
        assert!(!cron.is_due(at(2024, 6, 2, 6, 0, 0)));
    }

    #[test]
    fn test_multi_day_hour_step_must_be_whole_days() {
        assert!(Cron::new("0 */30 * * *").is_err());
    }

    #[test]
    fn test_display_returns_original_expression() {
        let cron = Cron::new("@monthly").unwrap();

        assert_eq!(cron.to_string(), "@monthly");
    }
}
