//! Parses free-text and cron schedule requests into `(cron_expr, run_at,
//! is_one_time)` triples, and computes the next fire time for a cron
//! expression in a tenant's timezone (C8). Cron parsing and the
//! timezone-aware `next_after` walk are delegated to the `cron` and
//! `chrono-tz` crates rather than hand-rolled, per the ambient-stack rule:
//! date math is exactly the kind of thing the ecosystem crate gets right
//! and a bespoke version would get wrong at a DST boundary.

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSchedule {
    /// A recurring schedule, stored as a 5-field (or `cron` crate's 6/7-field)
    /// cron expression plus the timezone it should be evaluated in.
    Recurring { cron_expr: String },
    /// A one-time fire at an absolute instant.
    Once { run_at: DateTime<Utc> },
}

static EVERY_DAY_AT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^every day at (\d{1,2}):(\d{2})\s*(am|pm)?$").unwrap()
});
static EVERY_WEEKDAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^every weekday( at (\d{1,2}):(\d{2})\s*(am|pm)?)?$").unwrap());
static EVERY_N_MINUTES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^every (\d+) minutes?$").unwrap());
static IN_N_UNITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^in (\d+) (second|minute|hour|day)s?$").unwrap());
static TOMORROW_AT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^tomorrow at (\d{1,2}):(\d{2})\s*(am|pm)?$").unwrap());
static AT_ABSOLUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^at (\d{4})-(\d{2})-(\d{2}) (\d{2}):(\d{2})$").unwrap());
static CRON_FIVE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\S+\s+\S+\s+\S+\s+\S+\s+\S+$").unwrap());

fn to_24h(hour: u32, meridiem: Option<&str>) -> u32 {
    match meridiem.map(|m| m.to_lowercase()) {
        Some(ref m) if m == "pm" && hour != 12 => hour + 12,
        Some(ref m) if m == "am" && hour == 12 => 0,
        _ => hour,
    }
}

/// Parses `text` as either a cron expression or one of a fixed set of
/// natural-language patterns, evaluated against `default_tz` where a
/// timezone is implied. Returns `None` as `run_at`/`cron_expr` pairing via
/// `ParsedSchedule`.
pub fn parse(text: &str, default_tz: Tz, now: DateTime<Utc>) -> Result<ParsedSchedule, ValidationError> {
    let trimmed = text.trim();

    if let Some(caps) = EVERY_DAY_AT.captures(trimmed) {
        let hour: u32 = caps[1].parse().unwrap_or(0);
        let minute: u32 = caps[2].parse().unwrap_or(0);
        let hour = to_24h(hour, caps.get(3).map(|m| m.as_str()));
        return Ok(ParsedSchedule::Recurring {
            cron_expr: format!("0 {minute} {hour} * * *"),
        });
    }

    if let Some(caps) = EVERY_WEEKDAY.captures(trimmed) {
        let (hour, minute) = match (caps.get(2), caps.get(3)) {
            (Some(h), Some(m)) => (
                to_24h(h.as_str().parse().unwrap_or(9), caps.get(4).map(|x| x.as_str())),
                m.as_str().parse().unwrap_or(0),
            ),
            _ => (9, 0),
        };
        return Ok(ParsedSchedule::Recurring {
            cron_expr: format!("0 {minute} {hour} * * MON-FRI"),
        });
    }

    if let Some(caps) = EVERY_N_MINUTES.captures(trimmed) {
        let n: u32 = caps[1].parse().map_err(|_| ValidationError::UnparseableSchedule)?;
        if n == 0 {
            return Err(ValidationError::UnparseableSchedule);
        }
        return Ok(ParsedSchedule::Recurring {
            cron_expr: format!("0 */{n} * * * *"),
        });
    }

    if let Some(caps) = IN_N_UNITS.captures(trimmed) {
        let n: i64 = caps[1].parse().map_err(|_| ValidationError::UnparseableSchedule)?;
        let unit = &caps[2];
        let delta = match unit.to_lowercase().as_str() {
            "second" => Duration::seconds(n),
            "minute" => Duration::minutes(n),
            "hour" => Duration::hours(n),
            "day" => Duration::days(n),
            _ => return Err(ValidationError::UnparseableSchedule),
        };
        return Ok(ParsedSchedule::Once { run_at: now + delta });
    }

    if let Some(caps) = TOMORROW_AT.captures(trimmed) {
        let hour: u32 = caps[1].parse().unwrap_or(9);
        let minute: u32 = caps[2].parse().unwrap_or(0);
        let hour = to_24h(hour, caps.get(3).map(|m| m.as_str()));
        let local_now = now.with_timezone(&default_tz);
        let tomorrow = local_now.date_naive() + Duration::days(1);
        let naive = tomorrow
            .and_hms_opt(hour, minute, 0)
            .ok_or(ValidationError::UnparseableSchedule)?;
        let local = default_tz
            .from_local_datetime(&naive)
            .single()
            .ok_or(ValidationError::UnparseableSchedule)?;
        return Ok(ParsedSchedule::Once {
            run_at: local.with_timezone(&Utc),
        });
    }

    if let Some(caps) = AT_ABSOLUTE.captures(trimmed) {
        let year: i32 = caps[1].parse().unwrap_or(1970);
        let month: u32 = caps[2].parse().unwrap_or(1);
        let day: u32 = caps[3].parse().unwrap_or(1);
        let hour: u32 = caps[4].parse().unwrap_or(0);
        let minute: u32 = caps[5].parse().unwrap_or(0);
        let naive = chrono::NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .ok_or(ValidationError::UnparseableSchedule)?;
        let local = default_tz
            .from_local_datetime(&naive)
            .single()
            .ok_or(ValidationError::UnparseableSchedule)?;
        return Ok(ParsedSchedule::Once {
            run_at: local.with_timezone(&Utc),
        });
    }

    if CRON_FIVE_FIELD.is_match(trimmed) {
        let six_field = format!("0 {trimmed}");
        Schedule::from_str(&six_field).map_err(|_| ValidationError::UnparseableSchedule)?;
        return Ok(ParsedSchedule::Recurring { cron_expr: six_field });
    }

    Err(ValidationError::UnparseableSchedule)
}

/// Computes the next fire time strictly after `after`, in UTC, for a
/// (cron_expr, timezone) pair. Idempotent: calling this repeatedly with the
/// schedule's own previous result always advances monotonically.
pub fn next_fire(cron_expr: &str, tz: Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
    let schedule = Schedule::from_str(cron_expr).map_err(|_| ValidationError::UnparseableSchedule)?;
    let after_local = after.with_timezone(&tz);
    schedule
        .after(&after_local)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or(ValidationError::UnparseableSchedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_every_day_at() {
        let parsed = parse("every day at 9:00am", chrono_tz::US::Eastern, now()).unwrap();
        assert_eq!(
            parsed,
            ParsedSchedule::Recurring {
                cron_expr: "0 0 9 * * *".to_string()
            }
        );
    }

    #[test]
    fn parses_in_n_minutes() {
        let parsed = parse("in 10 minutes", chrono_tz::UTC, now()).unwrap();
        match parsed {
            ParsedSchedule::Once { run_at } => {
                assert_eq!(run_at, now() + Duration::minutes(10));
            }
            _ => panic!("expected one-time schedule"),
        }
    }

    #[test]
    fn parses_in_n_seconds() {
        let parsed = parse("in 61 seconds", chrono_tz::UTC, now()).unwrap();
        match parsed {
            ParsedSchedule::Once { run_at } => {
                assert_eq!(run_at, now() + Duration::seconds(61));
            }
            _ => panic!("expected one-time schedule"),
        }
    }

    #[test]
    fn rejects_every_zero_minutes() {
        assert!(parse("every 0 minutes", chrono_tz::UTC, now()).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("whenever the mood strikes", chrono_tz::UTC, now()).is_err());
    }

    #[test]
    fn next_fire_is_monotonic() {
        let first = next_fire("0 0 9 * * *", chrono_tz::UTC, now()).unwrap();
        let second = next_fire("0 0 9 * * *", chrono_tz::UTC, first).unwrap();
        assert!(second > first);
    }
}
