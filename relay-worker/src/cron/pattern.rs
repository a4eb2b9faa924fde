//! Cron pattern grammar and translation into `cron` crate schedules.
//!
//! Patterns are written the common way: five fields (`min hour dom mon dow`),
//! optionally preceded by seconds and followed by a year. Day-of-week numbers
//! run 0-7 with both 0 and 7 meaning Sunday. When both day-of-month and
//! day-of-week are restricted, a day matching either one fires.

use std::str::FromStr;

use ::cron::Schedule;
use chrono::{DateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^((\d+,)+\d+|\d+[/#-]\d+|\d+L?|\*(/\d+)?|L(-\d+)?|\?|[A-Z]{3}(-[A-Z]{3})?)$")
        .expect("valid cron field regex")
});

#[derive(Debug, Error, PartialEq)]
pub enum PatternError {
    #[error("cron pattern {0:?} must have 5 to 7 fields")]
    FieldCount(String),

    #[error("cron pattern {pattern:?} has an invalid field {field:?}")]
    Field { pattern: String, field: String },

    #[error("cron pattern {pattern:?} is not supported: {reason}")]
    Unsupported { pattern: String, reason: String },
}

/// Whether `pattern` matches the accepted cron grammar.
pub fn is_valid_pattern(pattern: &str) -> bool {
    check_grammar(pattern).is_ok()
}

fn check_grammar(pattern: &str) -> Result<Vec<&str>, PatternError> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    if !(5..=7).contains(&fields.len()) {
        return Err(PatternError::FieldCount(pattern.to_string()));
    }
    if let Some(bad) = fields.iter().find(|f| !FIELD.is_match(f)) {
        return Err(PatternError::Field {
            pattern: pattern.to_string(),
            field: bad.to_string(),
        });
    }
    Ok(fields)
}

/// A parsed cron pattern.
///
/// Holds one `cron` crate schedule, or two when day-of-month and day-of-week
/// are both restricted: the `cron` crate requires both to match, so each is
/// evaluated separately with the other widened to `*`.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedules: Vec<Schedule>,
}

impl CronSchedule {
    /// First firing strictly after `after`.
    pub fn next_after<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Z>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }
}

/// Parse `pattern` into a schedule.
///
/// Five-field patterns fire at second zero. With six or seven fields the
/// first one is seconds.
pub fn parse_schedule(pattern: &str) -> Result<CronSchedule, PatternError> {
    let mut fields: Vec<String> = check_grammar(pattern)?
        .into_iter()
        .map(str::to_string)
        .collect();

    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    fields[5] = translate_day_of_week(&fields[5]);

    let variants = if is_restricted(&fields[3]) && is_restricted(&fields[5]) {
        let mut by_month_day = fields.clone();
        by_month_day[5] = "*".to_string();
        let mut by_week_day = fields;
        by_week_day[3] = "*".to_string();
        vec![by_month_day, by_week_day]
    } else {
        vec![fields]
    };

    let schedules = variants
        .iter()
        .map(|fields| {
            Schedule::from_str(&fields.join(" ")).map_err(|e| PatternError::Unsupported {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CronSchedule { schedules })
}

fn is_restricted(field: &str) -> bool {
    !field.starts_with('*') && field != "?"
}

/// Name of the job registered for webhook `index` of `account_id`.
pub fn job_key(account_id: &str, index: usize, pattern: &str) -> String {
    let compact: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
    format!("{}_wh{}_{}", account_id, index, compact)
}

/// Map 0-7 (Sunday = 0 or 7) onto the 1-7 (Sunday = 1) numbering of `cron`.
///
/// Names, wildcards and `L`/`#` forms are left alone.
fn translate_day_of_week(field: &str) -> String {
    if !field.starts_with(|c: char| c.is_ascii_digit()) || field.contains('#') || field.contains('L') {
        return field.to_string();
    }

    let shift = |n: &str| -> Option<u32> { n.parse::<u32>().ok().map(|n| n % 7 + 1) };

    let parts: Vec<String> = field
        .split(',')
        .map(|part| match part.split_once('-') {
            Some((start, "7")) => match shift(start) {
                Some(start) if start > 1 => format!("{}-7,1", start),
                _ => "1-7".to_string(),
            },
            Some((start, end)) => match (shift(start), shift(end)) {
                (Some(a), Some(b)) => format!("{}-{}", a, b),
                _ => part.to_string(),
            },
            None => match part.split_once('/') {
                Some((start, step)) => match shift(start) {
                    Some(start) => format!("{}/{}", start, step),
                    None => part.to_string(),
                },
                None => shift(part).map(|n| n.to_string()).unwrap_or_else(|| part.to_string()),
            },
        })
        .collect();

    parts.join(",")
}
