//! A hand-rolled 5-field cron expression parser: `minute hour day-of-month
//! month day-of-week`, plus the usual `@yearly`/`@monthly`/`@weekly`/
//! `@daily`/`@hourly` macros and an `@every <duration>` extension (spec
//! §4.9).
//!
//! No external cron crate is pulled in for this — the field grammar is
//! small and the search is a straightforward minute-by-minute scan, which
//! keeps the dependency list aligned with what the rest of the workspace
//! actually needs.

use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("empty cron expression")]
    Empty,
    #[error("expected 5 fields, found {0}")]
    WrongFieldCount(usize),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("@every duration must be at least 1 minute")]
    EveryTooShort,
    #[error("invalid @every duration: {0}")]
    InvalidEvery(String),
}

type Result<T> = std::result::Result<T, CronError>;

/// A single cron field's allowed values, expanded to a sorted bitset-ish
/// `Vec<u32>` at parse time so `Next` never re-parses.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSet(Vec<u32>);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.0.binary_search(&value).is_ok()
    }

    fn parse(raw: &str, min: u32, max: u32) -> Result<Self> {
        let mut values = std::collections::BTreeSet::new();
        for part in raw.split(',') {
            Self::parse_part(part, min, max, &mut values)?;
        }
        if values.is_empty() {
            return Err(CronError::InvalidField {
                field: raw.to_string(),
                reason: "no values".to_string(),
            });
        }
        Ok(Self(values.into_iter().collect()))
    }

    fn parse_part(part: &str, min: u32, max: u32, out: &mut std::collections::BTreeSet<u32>) -> Result<()> {
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| CronError::InvalidField {
                    field: part.to_string(),
                    reason: "bad step".to_string(),
                })?;
                if step == 0 {
                    return Err(CronError::InvalidField {
                        field: part.to_string(),
                        reason: "step cannot be zero".to_string(),
                    });
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let lo: u32 = a.parse().map_err(|_| CronError::InvalidField {
                field: part.to_string(),
                reason: "bad range start".to_string(),
            })?;
            let hi: u32 = b.parse().map_err(|_| CronError::InvalidField {
                field: part.to_string(),
                reason: "bad range end".to_string(),
            })?;
            (lo, hi)
        } else {
            let v: u32 = range_part.parse().map_err(|_| CronError::InvalidField {
                field: part.to_string(),
                reason: "not a number".to_string(),
            })?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            return Err(CronError::InvalidField {
                field: part.to_string(),
                reason: format!("out of range [{min}, {max}]"),
            });
        }

        let mut v = lo;
        while v <= hi {
            out.insert(v);
            v += step;
        }
        Ok(())
    }
}

/// A parsed schedule: either a classic 5-field cron expression or a fixed
/// `@every` interval.
#[derive(Debug, Clone)]
pub enum CronExpr {
    Fields {
        minute: FieldSet,
        hour: FieldSet,
        day_of_month: FieldSet,
        month: FieldSet,
        day_of_week: FieldSet,
        source: String,
    },
    Every {
        interval: Duration,
        source: String,
    },
}

impl CronExpr {
    pub fn source(&self) -> &str {
        match self {
            CronExpr::Fields { source, .. } => source,
            CronExpr::Every { source, .. } => source,
        }
    }

    /// Parse a cron expression, macro, or `@every <duration>` string.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CronError::Empty);
        }

        if let Some(duration_str) = trimmed.strip_prefix("@every ") {
            let duration = humantime_like_parse(duration_str)
                .map_err(|e| CronError::InvalidEvery(e))?;
            if duration < Duration::from_secs(60) {
                return Err(CronError::EveryTooShort);
            }
            return Ok(CronExpr::Every {
                interval: duration,
                source: trimmed.to_string(),
            });
        }

        let expanded = match trimmed {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }

        Ok(CronExpr::Fields {
            minute: FieldSet::parse(fields[0], 0, 59)?,
            hour: FieldSet::parse(fields[1], 0, 23)?,
            day_of_month: FieldSet::parse(fields[2], 1, 31)?,
            month: FieldSet::parse(fields[3], 1, 12)?,
            day_of_week: FieldSet::parse(fields[4], 0, 6)?,
            source: trimmed.to_string(),
        })
    }

    /// The next fire time strictly after `from`.
    ///
    /// For field-based expressions this scans minute-by-minute up to one
    /// year ahead (a generous bound no real schedule should ever need);
    /// if nothing matches within that horizon, `from` itself is returned
    /// unchanged as a signal the expression can never fire (e.g. Feb 30).
    ///
    /// For `@every`, a fixed interval after `from` aligned to the epoch:
    /// an `@every` schedule evaluated exactly on an interval boundary
    /// fires at `from + interval`, never at `from` itself.
    pub fn next(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            CronExpr::Every { interval, .. } => {
                from + ChronoDuration::from_std(*interval).unwrap_or(ChronoDuration::minutes(1))
            }
            CronExpr::Fields {
                minute,
                hour,
                day_of_month,
                month,
                day_of_week,
                ..
            } => {
                let mut candidate = from
                    .with_second(0)
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(from)
                    + ChronoDuration::minutes(1);

                let horizon = from + ChronoDuration::days(366);
                while candidate < horizon {
                    if month.contains(candidate.month())
                        && day_of_month.contains(candidate.day())
                        && day_of_week.contains(candidate.weekday().num_days_from_sunday())
                        && hour.contains(candidate.hour())
                        && minute.contains(candidate.minute())
                    {
                        return candidate;
                    }
                    candidate += ChronoDuration::minutes(1);
                }
                from
            }
        }
    }
}

/// Parses durations like `"30s"`, `"5m"`, `"2h"`, `"1h30m"` — the subset
/// of humantime's grammar this scheduler needs, without pulling in the
/// `humantime` crate for a single call site.
fn humantime_like_parse(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            digits.push(ch);
            continue;
        }

        let unit_secs: f64 = match ch {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86400.0,
            _ => return Err(format!("unsupported unit '{ch}' in '{raw}'")),
        };
        let n: f64 = digits
            .parse()
            .map_err(|_| format!("bad numeric component in '{raw}'"))?;
        total += Duration::from_secs_f64(n * unit_secs);
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(format!("trailing digits without a unit in '{raw}'"));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_wildcard_every_minute() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let next = expr.next(dt(2026, 1, 1, 10, 30));
        assert_eq!(next, dt(2026, 1, 1, 10, 31));
    }

    #[test]
    fn test_hourly_macro() {
        let expr = CronExpr::parse("@hourly").unwrap();
        let next = expr.next(dt(2026, 1, 1, 10, 30));
        assert_eq!(next, dt(2026, 1, 1, 11, 0));
    }

    #[test]
    fn test_daily_macro_rolls_to_next_day() {
        let expr = CronExpr::parse("@daily").unwrap();
        let next = expr.next(dt(2026, 1, 1, 23, 59));
        assert_eq!(next, dt(2026, 1, 2, 0, 0));
    }

    #[test]
    fn test_specific_minute_hour() {
        let expr = CronExpr::parse("30 14 * * *").unwrap();
        let next = expr.next(dt(2026, 3, 1, 10, 0));
        assert_eq!(next, dt(2026, 3, 1, 14, 30));
    }

    #[test]
    fn test_step_field() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        let next = expr.next(dt(2026, 3, 1, 10, 1));
        assert_eq!(next, dt(2026, 3, 1, 10, 15));
    }

    #[test]
    fn test_day_of_week_field() {
        // 2026-03-02 is a Monday; "0 9 * * 1" means Monday 09:00.
        let expr = CronExpr::parse("0 9 * * 1").unwrap();
        let next = expr.next(dt(2026, 3, 1, 0, 0));
        assert_eq!(next, dt(2026, 3, 2, 9, 0));
    }

    #[test]
    fn test_every_fires_after_not_on_boundary() {
        let expr = CronExpr::parse("@every 5m").unwrap();
        let from = dt(2026, 1, 1, 10, 0);
        assert_eq!(expr.next(from), from + ChronoDuration::minutes(5));
    }

    #[test]
    fn test_every_rejects_sub_minute() {
        assert!(matches!(CronExpr::parse("@every 30s"), Err(CronError::EveryTooShort)));
    }

    #[test]
    fn test_every_compound_duration() {
        let expr = CronExpr::parse("@every 1h30m").unwrap();
        match expr {
            CronExpr::Every { interval, .. } => assert_eq!(interval, Duration::from_secs(5400)),
            _ => panic!("expected Every"),
        }
    }

    #[test]
    fn test_wrong_field_count_is_an_error() {
        assert!(matches!(
            CronExpr::parse("* * *"),
            Err(CronError::WrongFieldCount(3))
        ));
    }

    #[test]
    fn test_out_of_range_field_is_an_error() {
        assert!(CronExpr::parse("99 * * * *").is_err());
    }
}
