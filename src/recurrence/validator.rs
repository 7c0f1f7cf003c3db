//! Structured validation of user-supplied recurrence rules.
//!
//! Unlike [`CompiledRule::compile`], validation never fails: problems are
//! collected into a [`ValidationResult`] so a caller can show all of them
//! before committing the rule.

use crate::recurrence::rule::{CompiledRule, RuleFrequency, RuleParts};
use crate::recurrence::timezone::TimezoneHandler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Above this `COUNT` the rule is flagged as unusually long.
const LARGE_COUNT: i64 = 1000;

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Outcome of [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn finish(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Check `rule` as it would be evaluated from `dtstart` in `timezone`.
///
/// `dtstart` may be omitted when the rule text carries a `DTSTART` line.
pub fn validate(
    rule: &str,
    dtstart: Option<DateTime<Utc>>,
    timezone: Option<&str>,
) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if rule.trim().is_empty() {
        errors.push("Rule is empty".to_owned());
        return ValidationResult::finish(errors, warnings);
    }

    let mut tz = match timezone {
        Some(name) => match TimezoneHandler::from_name(name) {
            Ok(tz) => Some(tz),
            Err(_) => {
                errors.push(format!("Unknown timezone '{name}'"));
                None
            }
        },
        None => Some(TimezoneHandler::utc()),
    };

    let parts = match RuleParts::parse(rule) {
        Ok(parts) => parts,
        Err(e) => {
            errors.push(format!("Invalid rule syntax: {e}"));
            return ValidationResult::finish(errors, warnings);
        }
    };

    if let Some(id) = parts.dtstart.as_ref().and_then(|s| s.tzid.as_deref()) {
        match TimezoneHandler::from_name(id) {
            Ok(handler) => tz = Some(handler),
            Err(_) => {
                errors.push(format!("Unknown timezone '{id}'"));
                tz = None;
            }
        }
    }

    let start = match (&parts.dtstart, tz) {
        (Some(embedded), Some(tz)) => Some(embedded.date.resolve(&tz, false)),
        (Some(_), None) => None,
        (None, _) => {
            if dtstart.is_none() {
                errors.push("DTSTART is required".to_owned());
            }
            dtstart
        }
    };

    if parts.count.is_some() && parts.until.is_some() {
        errors.push("COUNT and UNTIL are mutually exclusive".to_owned());
    }
    if let Some(count) = parts.count.filter(|c| *c < 1) {
        errors.push(format!("COUNT must be a positive integer, got {count}"));
    }
    if let Some(interval) = parts.interval.filter(|i| *i < 1) {
        errors.push(format!("INTERVAL must be a positive integer, got {interval}"));
    }
    if let (Some(start), Some(until), Some(tz)) = (start, parts.until, tz)
        && start > until.resolve(&tz, true)
    {
        errors.push("DTSTART is after UNTIL".to_owned());
    }

    if let Some((days, months)) = impossible_month_days(&parts) {
        let days: Vec<String> = days.iter().map(i32::to_string).collect();
        warnings.push(format!(
            "BYMONTHDAY={} never occurs in {}; the rule may produce no occurrences",
            days.join(","),
            months.join(", ")
        ));
    }
    if parts.freq.is_sub_hour() {
        warnings.push(format!(
            "FREQ={} repeats more than once an hour",
            parts.freq
        ));
    }
    if let Some(count) = parts.count.filter(|c| *c > LARGE_COUNT) {
        warnings.push(format!("COUNT={count} is unusually large"));
    }
    if parts.freq == RuleFrequency::Monthly
        && parts.by_day.iter().any(|d| d.ordinal.is_none())
        && parts.by_set_pos.is_empty()
    {
        warnings.push(
            "MONTHLY rule with BYDAY but no ordinal or BYSETPOS matches every such weekday"
                .to_owned(),
        );
    }

    ValidationResult::finish(errors, warnings)
}

/// `BYMONTHDAY` values that none of the `BYMONTH` months can hold, with the
/// names of those months. February counts as 29 days.
fn impossible_month_days(parts: &RuleParts) -> Option<(Vec<i32>, Vec<&'static str>)> {
    if parts.by_month.is_empty() || parts.by_month_day.is_empty() {
        return None;
    }
    let longest = parts
        .by_month
        .iter()
        .map(|month| TimezoneHandler::days_in_month(2024, *month) as i32)
        .max()?;
    let days: Vec<i32> = parts
        .by_month_day
        .iter()
        .copied()
        .filter(|d| d.abs() > longest)
        .collect();
    if days.is_empty() {
        return None;
    }
    let months = parts
        .by_month
        .iter()
        .filter_map(|month| MONTH_NAMES.get(*month as usize - 1).copied())
        .collect();
    Some((days, months))
}

/// `true` if `rule` parses.
pub fn validate_syntax(rule: &str) -> bool {
    RuleParts::parse(rule).is_ok()
}

/// `true` when `UNTIL` lies before `as_of`, or when a `COUNT` series has
/// no occurrence left at or after `as_of`.
///
/// Unbounded or unparsable rules are never expired.
pub fn is_expired(rule: &str, dtstart: DateTime<Utc>, as_of: DateTime<Utc>) -> bool {
    let Ok(compiled) = CompiledRule::compile(rule, dtstart, None) else {
        return false;
    };
    if let Some(until) = compiled.until() {
        return until < as_of;
    }
    if compiled.count().is_none() {
        return false;
    }
    let Some(just_before) = as_of.checked_sub_signed(chrono::TimeDelta::nanoseconds(1)) else {
        return false;
    };
    matches!(compiled.next_after(just_before), Ok(None))
}
