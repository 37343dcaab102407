use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};

/// A validated cron schedule.
///
/// Accepts the classic five-field form (`min hour dom month dow`, seconds
/// implied as `0`), the seconds-first six/seven-field form, and the `@hourly`
/// family of shortcuts. Numeric day-of-week values in the five-field form use
/// the classic numbering (`0`/`7` = Sunday) and are translated to names.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    inner: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let invalid = |reason: String| SchedulerError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };
        if trimmed.is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let normalized = normalize(trimmed).map_err(invalid)?;
        let inner = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        if inner.upcoming(Utc).next().is_none() {
            return Err(invalid("expression never fires".to_string()));
        }

        Ok(Self {
            expression: trimmed.to_string(),
            inner,
        })
    }

    /// The expression as supplied by the caller (trimmed).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&from).next()
    }
}

/// Convert a five-field expression to the seconds-first form the `cron` crate
/// expects. Other forms pass through untouched.
fn normalize(expr: &str) -> std::result::Result<String, String> {
    if expr.starts_with('@') {
        return Ok(expr.to_string());
    }
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_day_of_week(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("expected 5, 6 or 7 fields, found {n}")),
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite numeric day-of-week items as explicit day-name lists.
///
/// Numeric ranges and steps are expanded over the classic 0-7 numbering
/// before `7` is folded onto Sunday, so `5-7` and `1-7/2` keep their classic
/// meaning. Named items and a bare `*` pass through.
fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    let mut items = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step {step:?}"))?;
                (range, Some(step))
            }
            None => (part, None),
        };

        let (first, last) = match (range, range.split_once('-')) {
            ("*", _) if step.is_none() => {
                items.push("*".to_string());
                continue;
            }
            ("*", _) => (0, 6),
            (_, Some((a, b))) => match (day_number(a)?, day_number(b)?) {
                (Some(a), Some(b)) if a <= b => (a, b),
                (Some(a), Some(b)) => return Err(format!("day-of-week range {a}-{b} is backwards")),
                _ => {
                    items.push(part.to_string());
                    continue;
                }
            },
            (single, None) => match day_number(single)? {
                // `5/2` starts at 5 and steps to the end of the week.
                Some(n) if step.is_some() => (n, 7),
                Some(n) => (n, n),
                None => {
                    items.push(part.to_string());
                    continue;
                }
            },
        };

        let mut days: Vec<usize> = (first..=last)
            .step_by(step.unwrap_or(1))
            .map(|d| d % 7)
            .collect();
        days.sort_unstable();
        days.dedup();
        items.extend(days.into_iter().map(|d| DAY_NAMES[d].to_string()));
    }
    Ok(items.join(","))
}

/// `Ok(None)` for non-numeric items such as `MON`.
fn day_number(raw: &str) -> std::result::Result<Option<usize>, String> {
    match raw.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(Some(n)),
        Ok(n) => Err(format!("day-of-week {n} out of range 0-7")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration, TimeZone, Timelike, Weekday};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2026-03-04 is a Wednesday.
        Utc.with_ymd_and_hms(2026, 3, 4, h, m, s).unwrap()
    }

    #[test]
    fn every_minute_fires_on_next_minute_boundary() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(schedule.next_after(at(12, 0, 30)), Some(at(12, 1, 0)));
        // Strictly after: an exact boundary moves to the following minute.
        assert_eq!(schedule.next_after(at(12, 1, 0)), Some(at(12, 2, 0)));
    }

    #[test]
    fn seconds_form_passes_through() {
        let schedule = CronSchedule::parse("*/15 * * * * *").unwrap();
        assert_eq!(schedule.next_after(at(8, 0, 1)), Some(at(8, 0, 15)));
    }

    #[test]
    fn shortcut_is_accepted() {
        let schedule = CronSchedule::parse("@hourly").unwrap();
        assert_eq!(schedule.next_after(at(8, 10, 0)), Some(at(9, 0, 0)));
    }

    #[test]
    fn classic_weekday_numbers_are_translated() {
        // Mon-Fri at 09:00, asked on a Saturday evening.
        let schedule = CronSchedule::parse("0 9 * * 1-5").unwrap();
        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 18, 0, 0).unwrap();
        let next = schedule.next_after(saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);

        let sunday_only = CronSchedule::parse("30 6 * * 0").unwrap();
        assert_eq!(sunday_only.next_after(saturday).unwrap().weekday(), Weekday::Sun);
        let sunday_as_seven = CronSchedule::parse("30 6 * * 7").unwrap();
        assert_eq!(sunday_as_seven.next_after(saturday).unwrap().weekday(), Weekday::Sun);
    }

    fn weekdays_within_a_week(expr: &str) -> Vec<Weekday> {
        let schedule = CronSchedule::parse(expr).unwrap();
        // 2026-03-01 is a Sunday.
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let end = start + Duration::days(7);
        let mut days = Vec::new();
        let mut cursor = start - Duration::seconds(1);
        while let Some(next) = schedule.next_after(cursor) {
            if next >= end {
                break;
            }
            days.push(next.weekday());
            cursor = next;
        }
        days
    }

    #[test]
    fn ranges_ending_in_seven_include_sunday() {
        use Weekday::*;
        assert_eq!(weekdays_within_a_week("0 9 * * 1-7"), vec![Sun, Mon, Tue, Wed, Thu, Fri, Sat]);
        assert_eq!(weekdays_within_a_week("0 9 * * 5-7"), vec![Sun, Fri, Sat]);
        assert_eq!(weekdays_within_a_week("0 9 * * 1-7/2"), vec![Sun, Mon, Wed, Fri]);
        assert_eq!(weekdays_within_a_week("0 9 * * */3"), vec![Sun, Wed, Sat]);
        assert_eq!(weekdays_within_a_week("0 9 * * 0-6"), vec![Sun, Mon, Tue, Wed, Thu, Fri, Sat]);
        assert_eq!(weekdays_within_a_week("0 9 * * MON-WED"), vec![Mon, Tue, Wed]);
        assert_eq!(weekdays_within_a_week("0 9 * * 1,3,7"), vec![Sun, Mon, Wed]);
    }

    #[test]
    fn next_is_strictly_in_future_for_many_references() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let mut reference = at(0, 0, 0);
        for _ in 0..500 {
            let next = schedule.next_after(reference).unwrap();
            assert!(next > reference);
            reference += Duration::seconds(37);
        }
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expr in ["", "   ", "* * *", "61 * * * *", "not a cron", "* * * * 9", "* * * * 5-2", "* * * * */0"] {
            let err = CronSchedule::parse(expr).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidCronExpression { .. }),
                "{expr:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn expression_is_kept_as_given() {
        let schedule = CronSchedule::parse("  0 3 * * *  ").unwrap();
        assert_eq!(schedule.expression(), "0 3 * * *");
    }
}
