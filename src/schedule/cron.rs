//! Cron handling: interval conversion, dialect normalization, next-fire times.
//!
//! Schedules are written in standard 5-field cron (`min hour dom month dow`,
//! day-of-week 0–7 with 0 and 7 both Sunday). The `cron` crate parses a
//! seconds-first dialect with 1-based day numbers, so 5-field expressions are
//! normalized before parsing. 6- and 7-field expressions pass through as-is.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ValidationError;

const DAY_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Convert a fixed interval to a cron expression.
///
/// Below an hour this is a minute step. From an hour up, the interval is
/// integer-divided into an hour step, so 90 minutes runs hourly.
pub fn interval_to_cron(minutes: u32) -> Result<String, ValidationError> {
    match minutes {
        0 => Err(ValidationError::InvalidInterval { minutes }),
        m if m < 60 => Ok(format!("*/{m} * * * *")),
        m => {
            if m % 60 != 0 {
                tracing::warn!(
                    interval_minutes = m,
                    "Interval is not a whole number of hours; truncating to {} hour(s)",
                    m / 60
                );
            }
            Ok(format!("0 */{} * * *", m / 60))
        }
    }
}

/// Rewrite a user expression into the dialect the `cron` crate parses.
pub fn normalize(expression: &str) -> Result<String, ValidationError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = normalize_day_of_week(fields[4]).map_err(|reason| {
                ValidationError::InvalidCron {
                    expression: expression.to_string(),
                    reason,
                }
            })?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ValidationError::InvalidCron {
            expression: expression.to_string(),
            reason: format!("expected 5 fields, got {n}"),
        }),
    }
}

/// Map numeric day-of-week values to names. Step values after `/` are kept.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    let mut out = String::with_capacity(field.len() + 8);
    let mut chars = field.chars().peekable();
    let mut after_slash = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            let mut number = String::from(c);
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                number.push(d);
                chars.next();
            }
            if after_slash {
                out.push_str(&number);
            } else {
                let day: usize = number
                    .parse()
                    .map_err(|_| format!("bad day-of-week '{number}'"))?;
                let name = DAY_NAMES
                    .get(day)
                    .ok_or_else(|| format!("day-of-week {day} out of range 0-7"))?;
                out.push_str(name);
            }
            after_slash = false;
        } else {
            after_slash = c == '/';
            out.push(c);
        }
    }

    Ok(out)
}

/// Parse a user expression.
pub fn parse(expression: &str) -> Result<::cron::Schedule, ValidationError> {
    let normalized = normalize(expression)?;
    ::cron::Schedule::from_str(&normalized).map_err(|e| ValidationError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

pub fn validate(expression: &str) -> Result<(), ValidationError> {
    parse(expression).map(|_| ())
}

/// First fire time strictly after `after`.
pub fn next_fire_after(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    Ok(parse(expression)?.after(&after).next())
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    use super::*;

    #[test]
    fn short_intervals_use_minute_steps() {
        assert_eq!(interval_to_cron(30).unwrap(), "*/30 * * * *");
        assert_eq!(interval_to_cron(1).unwrap(), "*/1 * * * *");
    }

    #[test]
    fn long_intervals_use_hour_steps() {
        assert_eq!(interval_to_cron(120).unwrap(), "0 */2 * * *");
        assert_eq!(interval_to_cron(60).unwrap(), "0 */1 * * *");
        // Truncated, not rounded.
        assert_eq!(interval_to_cron(90).unwrap(), "0 */1 * * *");
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert_eq!(
            interval_to_cron(0),
            Err(ValidationError::InvalidInterval { minutes: 0 })
        );
    }

    #[test]
    fn normalizes_five_fields() {
        assert_eq!(normalize("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize("0 9 * * 1-5").unwrap(), "0 0 9 * * MON-FRI");
        assert_eq!(normalize("0 9 * * 0,6").unwrap(), "0 0 9 * * SUN,SAT");
        assert_eq!(normalize("0 9 * * 7").unwrap(), "0 0 9 * * SUN");
        assert_eq!(normalize("0 9 * * */2").unwrap(), "0 0 9 * * */2");
        assert_eq!(normalize("0 9 * * MON").unwrap(), "0 0 9 * * MON");
    }

    #[test]
    fn six_fields_pass_through() {
        assert_eq!(normalize("30 0 9 * * *").unwrap(), "30 0 9 * * *");
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(validate("* * *").is_err());
        assert!(validate("0 9 * * 8").is_err());
        assert!(validate("99 * * * *").is_err());
        assert!(validate("not a cron").is_err());
    }

    #[test]
    fn accepts_interval_output() {
        for minutes in [1, 15, 30, 59, 60, 120, 180] {
            let expr = interval_to_cron(minutes).unwrap();
            assert!(validate(&expr).is_ok(), "{expr} should parse");
        }
    }

    #[test]
    fn next_fire_every_thirty_minutes() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 10, 7, 0).unwrap();
        let next = next_fire_after("*/30 * * * *", now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn next_fire_respects_weekdays() {
        // 2025-03-01 is a Saturday.
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let next = next_fire_after("0 9 * * 1-5", now).unwrap().unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn sunday_is_zero() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let next = next_fire_after("0 8 * * 0", now).unwrap().unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.day(), 2);
    }
}
