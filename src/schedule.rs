//! Cron schedule utilities for workflow triggers.
//!
//! Triggers use standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week) evaluated in the trigger's IANA
//! timezone. The `cron` crate wants 6 fields (with seconds), so 5-field
//! expressions are normalized by prepending "0 ".

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {message}")]
    CronInvalid { expression: String, message: String },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("cron expression '{0}' has no upcoming fire time")]
    NoUpcomingFire(String),
}

/// Convert a 5-field Unix cron expression to the 6-field form the `cron`
/// crate parses. Expressions that already carry 6+ fields pass through.
fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", cron_expr)
    } else {
        cron_expr.to_string()
    }
}

fn parse_schedule(cron_expr: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(&normalize_cron_expr(cron_expr)).map_err(|err| {
        ScheduleError::CronInvalid {
            expression: cron_expr.to_string(),
            message: err.to_string(),
        }
    })
}

fn parse_timezone(tz_name: &str) -> Result<Tz, ScheduleError> {
    tz_name
        .parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(tz_name.to_string()))
}

/// Validate a cron expression and timezone pair without computing anything.
pub fn validate_schedule(cron_expr: &str, tz_name: &str) -> Result<(), ScheduleError> {
    parse_schedule(cron_expr)?;
    parse_timezone(tz_name)?;
    Ok(())
}

/// Compute the next fire time strictly after `after`, evaluated in the
/// trigger's timezone, returned in UTC.
///
/// The scheduler passes the previous `next_run_at` (never `now()`) so
/// overlapping pollers cannot double-enqueue within the same minute.
pub fn next_fire_after(
    cron_expr: &str,
    tz_name: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse_schedule(cron_expr)?;
    let tz = parse_timezone(tz_name)?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|fire| fire.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::NoUpcomingFire(cron_expr.to_string()))
}

/// First fire time for a newly created or re-activated trigger.
pub fn first_fire(cron_expr: &str, tz_name: &str) -> Result<DateTime<Utc>, ScheduleError> {
    next_fire_after(cron_expr, tz_name, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_cron_expr() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("30 4 * * 1"), "0 30 4 * * 1");
        assert_eq!(normalize_cron_expr("0 0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn test_validate_schedule() {
        assert!(validate_schedule("*/5 * * * *", "UTC").is_ok());
        assert!(validate_schedule("0 9-17 * * 1-5", "Europe/Berlin").is_ok());
        assert!(validate_schedule("1,15,45 0 * * *", "America/New_York").is_ok());

        assert!(matches!(
            validate_schedule("not cron", "UTC"),
            Err(ScheduleError::CronInvalid { .. })
        ));
        assert!(matches!(
            validate_schedule("* * * * *", "Mars/Olympus"),
            Err(ScheduleError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_next_fire_is_strictly_after() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let next = next_fire_after("0 * * * *", "UTC", base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());

        // Asking again from the previous fire advances exactly one period.
        let after_next = next_fire_after("0 * * * *", "UTC", next).unwrap();
        assert_eq!(
            after_next,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_timezone_evaluation() {
        // 09:00 in Berlin during CEST is 07:00 UTC.
        let base = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let next = next_fire_after("0 9 * * *", "Europe/Berlin", base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 7, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_step_and_range_expressions() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 2, 0).unwrap();
        let next = next_fire_after("*/15 * * * *", "UTC", base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap());
    }
}
