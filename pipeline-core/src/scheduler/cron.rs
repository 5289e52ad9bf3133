//! A minimal 5-field cron-subset evaluator.
//!
//! The distilled requirements left the cron dialect unspecified (an Open
//! Question, resolved here rather than guessed at): this module supports
//! `*`, comma-separated numeric lists, and `*/n` step values for each of
//! minute, hour, day-of-month, month, and day-of-week — no ranges, no
//! named months/days, no `L`/`W`/`#` extensions. Day-of-month and
//! day-of-week combine with the standard cron quirk: if both are
//! restricted (not `*`), a date matches when either field matches.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use thiserror::Error;

/// A malformed cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron expression must have exactly 5 whitespace-separated fields, found {count}")]
    FieldCount { count: usize },
    #[error("cron field {field} value {value} is out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("cron field {field} has an invalid step value")]
    InvalidStep { field: &'static str },
    #[error("cron field {field} could not be parsed: {token}")]
    InvalidToken { field: &'static str, token: String },
}

/// How far forward [`CronSchedule::next_after`] will scan before giving up
/// on an expression that can never match (e.g. day-of-month 31 in a
/// month-field restricted to February).
const MAX_LOOKAHEAD_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldMatcher {
    Any,
    List(Vec<u32>),
    Step(u32),
}

impl FieldMatcher {
    fn parse(field: &'static str, token: &str, min: u32, max: u32) -> Result<Self, CronError> {
        if token == "*" {
            return Ok(Self::Any);
        }
        if let Some(step) = token.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| CronError::InvalidStep { field })?;
            if step == 0 {
                return Err(CronError::InvalidStep { field });
            }
            return Ok(Self::Step(step));
        }
        let mut values = Vec::new();
        for part in token.split(',') {
            let value: u32 = part.parse().map_err(|_| CronError::InvalidToken {
                field,
                token: part.to_owned(),
            })?;
            if value < min || value > max {
                return Err(CronError::OutOfRange { field, value, min, max });
            }
            values.push(value);
        }
        Ok(Self::List(values))
    }

    fn matches(&self, value: u32, min: u32) -> bool {
        match self {
            Self::Any => true,
            Self::List(values) => values.contains(&value),
            Self::Step(step) => (value - min) % step == 0,
        }
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: FieldMatcher,
    hour: FieldMatcher,
    day_of_month: FieldMatcher,
    month: FieldMatcher,
    day_of_week: FieldMatcher,
}

impl CronSchedule {
    /// Parse a `minute hour day-of-month month day-of-week` expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount { count: fields.len() });
        }
        Ok(Self {
            minute: FieldMatcher::parse("minute", fields[0], 0, 59)?,
            hour: FieldMatcher::parse("hour", fields[1], 0, 23)?,
            day_of_month: FieldMatcher::parse("day_of_month", fields[2], 1, 31)?,
            month: FieldMatcher::parse("month", fields[3], 1, 12)?,
            day_of_week: FieldMatcher::parse("day_of_week", fields[4], 0, 6)?,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_wild = matches!(self.day_of_month, FieldMatcher::Any);
        let dow_wild = matches!(self.day_of_week, FieldMatcher::Any);
        let dom_match = self.day_of_month.matches(date.day(), 1);
        let dow_match = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday(), 0);
        match (dom_wild, dow_wild) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    fn minute_matches(&self, at: DateTime<Utc>) -> bool {
        self.month.matches(at.month(), 1)
            && self.day_matches(at.date_naive())
            && self.hour.matches(at.hour(), 0)
            && self.minute.matches(at.minute(), 0)
    }

    /// The next minute boundary strictly after `now` that this expression
    /// matches, or `None` if none is found within a one-year lookahead
    /// (an expression that can structurally never be satisfied, e.g.
    /// `0 0 31 2 *`).
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = truncate_to_minute(now) + Duration::minutes(1);
        (0..MAX_LOOKAHEAD_MINUTES)
            .map(|offset| start + Duration::minutes(offset))
            .find(|candidate| self.minute_matches(*candidate))
    }
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at - Duration::seconds(i64::from(at.second())) - Duration::nanoseconds(i64::from(at.nanosecond()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wildcard_expression_matches_the_next_minute() {
        let schedule = CronSchedule::parse("* * * * *").expect("parse");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 45).unwrap();
        let next = schedule.next_after(now).expect("next run");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 31, 0).unwrap());
    }

    #[test]
    fn step_value_fires_every_n_minutes() {
        let schedule = CronSchedule::parse("*/15 * * * *").expect("parse");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 0).unwrap();
        let next = schedule.next_after(now).expect("next run");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 15, 0).unwrap());
    }

    #[test]
    fn list_value_restricts_to_named_hours() {
        let schedule = CronSchedule::parse("0 6,18 * * *").expect("parse");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 7, 0, 0).unwrap();
        let next = schedule.next_after(now).expect("next run");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 18, 0, 0).unwrap());
    }

    #[test]
    fn restricted_dom_and_dow_combine_with_or() {
        // 2026-01-01 is a Thursday (weekday 4).
        let schedule = CronSchedule::parse("0 0 15 * 4").expect("parse");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.next_after(now).expect("next run");
        // The very next Thursday after Jan 1 satisfies dow, before day 15 satisfies dom.
        assert_eq!(next.weekday().num_days_from_sunday(), 4);
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert!(matches!(
            CronSchedule::parse("* * * *"),
            Err(CronError::FieldCount { count: 4 })
        ));
    }

    #[test]
    fn unsatisfiable_expression_returns_none() {
        let schedule = CronSchedule::parse("0 0 31 2 *").expect("parse");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(schedule.next_after(now).is_none());
    }
}
