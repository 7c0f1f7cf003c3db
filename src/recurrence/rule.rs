//! RRULE parsing and evaluation.
//!
//! Custom task frequencies are expressed as RFC 5545 recurrence rules.
//! [`RuleParts`] is the purely syntactic view of a rule (used by the
//! validator, which needs to see self-contradictory rules), while
//! [`CompiledRule`] is the checked, evaluable form that the rule cache
//! stores.
//!
//! Supported parts: `FREQ`, `INTERVAL`, `COUNT`, `UNTIL`, `BYMONTH`,
//! `BYMONTHDAY`, `BYDAY`, `BYHOUR`, `BYMINUTE`, `BYSECOND`, `BYSETPOS`
//! and `WKST`, with an optional `RRULE:` prefix and an optional
//! `DTSTART` line. Expansion follows the usual dateutil semantics: parts
//! the rule leaves out are derived from the start instant.

use crate::error::{CadenceError, Result};
use crate::recurrence::timezone::{TimezoneHandler, shift_month};
use chrono::{
    DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc, Weekday,
};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::debug;

/// Consecutive empty periods tolerated before a day-or-coarser search gives up.
const MAX_EMPTY_PERIODS_COARSE: i64 = 10_000;

/// Search spans for finer rules, in units of their frequency. Hourly covers
/// the eight-year gap between leap days, minutely a full year plus a day,
/// secondly a month.
const SEARCH_SPAN_HOURS: i64 = 24 * 366 * 9;
const SEARCH_SPAN_MINUTES: i64 = 60 * 24 * 367;
const SEARCH_SPAN_SECONDS: i64 = 60 * 60 * 24 * 31;

/// How a walk over the series stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEnd {
    /// The visitor asked to stop.
    Stopped,
    /// `COUNT` or `UNTIL` was reached.
    Ended,
    /// No occurrence within the search budget, or the calendar ran out.
    GaveUp,
}

fn rule_error(message: impl Into<String>) -> CadenceError {
    CadenceError::Rule(message.into())
}

/// `FREQ` values, ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleFrequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RuleFrequency {
    /// RFC 5545 spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Secondly => "SECONDLY",
            Self::Minutely => "MINUTELY",
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
        }
    }

    /// `true` for frequencies that repeat more than once an hour.
    #[must_use]
    pub fn is_sub_hour(self) -> bool {
        matches!(self, Self::Secondly | Self::Minutely)
    }
}

impl std::fmt::Display for RuleFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleFrequency {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SECONDLY" => Ok(Self::Secondly),
            "MINUTELY" => Ok(Self::Minutely),
            "HOURLY" => Ok(Self::Hourly),
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "MONTHLY" => Ok(Self::Monthly),
            "YEARLY" => Ok(Self::Yearly),
            other => Err(rule_error(format!("unknown FREQ '{other}'"))),
        }
    }
}

/// One `BYDAY` entry, e.g. `MO`, `2TU` or `-1FR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekdayRule {
    /// Day of the week.
    pub weekday: Weekday,
    /// Which occurrence within the month or year; `None` means every one.
    pub ordinal: Option<i32>,
}

/// A date value from `UNTIL` or `DTSTART`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDate {
    /// Date-time with a trailing `Z`.
    Utc(DateTime<Utc>),
    /// Date-time in the rule's local timezone.
    Floating(NaiveDateTime),
    /// Date without a time.
    Date(NaiveDate),
}

impl RuleDate {
    fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if let Some(stamp) = value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
            let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H%M%S")
                .map_err(|e| rule_error(format!("invalid date-time '{value}': {e}")))?;
            return Ok(Self::Utc(naive.and_utc()));
        }
        if value.contains('T') || value.contains('t') {
            let naive = NaiveDateTime::parse_from_str(&value.to_ascii_uppercase(), "%Y%m%dT%H%M%S")
                .map_err(|e| rule_error(format!("invalid date-time '{value}': {e}")))?;
            return Ok(Self::Floating(naive));
        }
        NaiveDate::parse_from_str(value, "%Y%m%d")
            .map(Self::Date)
            .map_err(|e| rule_error(format!("invalid date '{value}': {e}")))
    }

    /// Resolve to an instant. A bare date is the start of that local day,
    /// or its last second when `end_of_day` is set (inclusive `UNTIL`).
    #[must_use]
    pub fn resolve(&self, tz: &TimezoneHandler, end_of_day: bool) -> DateTime<Utc> {
        match self {
            Self::Utc(instant) => *instant,
            Self::Floating(local) => tz.from_local(*local),
            Self::Date(date) => {
                let time = if end_of_day {
                    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
                } else {
                    NaiveTime::MIN
                };
                tz.from_local(date.and_time(time))
            }
        }
    }
}

/// A `DTSTART` line embedded in the rule text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStart {
    /// Start value.
    pub date: RuleDate,
    /// `TZID` parameter, if present.
    pub tzid: Option<String>,
}

/// Syntactic view of a rule. Values are kept as written, so `COUNT=0` or
/// `COUNT` together with `UNTIL` parse fine and are left for the validator
/// or [`CompiledRule::compile`] to reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleParts {
    pub freq: RuleFrequency,
    pub interval: Option<i64>,
    pub count: Option<i64>,
    pub until: Option<RuleDate>,
    pub by_month: Vec<u32>,
    pub by_month_day: Vec<i32>,
    pub by_day: Vec<WeekdayRule>,
    pub by_hour: Vec<u32>,
    pub by_minute: Vec<u32>,
    pub by_second: Vec<u32>,
    pub by_set_pos: Vec<i32>,
    pub week_start: Weekday,
    pub dtstart: Option<RuleStart>,
}

impl RuleParts {
    /// Parse rule text.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Rule`] for empty text, unknown or duplicated
    /// parts, malformed values and a missing `FREQ`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(rule_error("rule text is empty"));
        }

        let mut body: Option<&str> = None;
        let mut dtstart = None;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if starts_with_ignore_case(line, "DTSTART") {
                dtstart = Some(parse_dtstart(line)?);
                continue;
            }
            let rule = if starts_with_ignore_case(line, "RRULE:") {
                &line["RRULE:".len()..]
            } else {
                line
            };
            if body.replace(rule).is_some() {
                return Err(rule_error("only one RRULE line is supported"));
            }
        }
        let body = body.ok_or_else(|| rule_error("missing RRULE"))?;

        let mut freq = None;
        let mut parts = Self {
            freq: RuleFrequency::Daily,
            interval: None,
            count: None,
            until: None,
            by_month: Vec::new(),
            by_month_day: Vec::new(),
            by_day: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
            by_second: Vec::new(),
            by_set_pos: Vec::new(),
            week_start: Weekday::Mon,
            dtstart,
        };

        let mut seen = HashSet::new();
        for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| rule_error(format!("malformed rule part '{part}'")))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();
            if !seen.insert(key.clone()) {
                return Err(rule_error(format!("duplicate rule part '{key}'")));
            }
            match key.as_str() {
                "FREQ" => freq = Some(value.parse::<RuleFrequency>()?),
                "INTERVAL" => parts.interval = Some(parse_integer(&key, value)?),
                "COUNT" => parts.count = Some(parse_integer(&key, value)?),
                "UNTIL" => parts.until = Some(RuleDate::parse(value)?),
                "BYMONTH" => parts.by_month = parse_unsigned_list(&key, value, 1, 12)?,
                "BYMONTHDAY" => parts.by_month_day = parse_signed_list(&key, value, 31)?,
                "BYDAY" => {
                    parts.by_day = value
                        .split(',')
                        .map(parse_weekday_rule)
                        .collect::<Result<Vec<_>>>()?;
                }
                "BYHOUR" => parts.by_hour = parse_unsigned_list(&key, value, 0, 23)?,
                "BYMINUTE" => parts.by_minute = parse_unsigned_list(&key, value, 0, 59)?,
                "BYSECOND" => parts.by_second = parse_unsigned_list(&key, value, 0, 59)?,
                "BYSETPOS" => parts.by_set_pos = parse_signed_list(&key, value, 366)?,
                "WKST" => parts.week_start = parse_weekday(value)?,
                _ => return Err(rule_error(format!("unsupported rule part '{key}'"))),
            }
        }

        parts.freq = freq.ok_or_else(|| rule_error("FREQ is required"))?;
        Ok(parts)
    }
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn parse_dtstart(line: &str) -> Result<RuleStart> {
    let (head, value) = line
        .split_once(':')
        .ok_or_else(|| rule_error(format!("malformed DTSTART line '{line}'")))?;
    let tzid = head.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("TZID")
            .then(|| value.trim().to_owned())
    });
    Ok(RuleStart {
        date: RuleDate::parse(value)?,
        tzid,
    })
}

fn parse_integer(key: &str, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|_| rule_error(format!("{key} must be an integer, got '{value}'")))
}

fn parse_unsigned_list(key: &str, value: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    value
        .split(',')
        .map(|item| {
            let item = item.trim();
            match item.parse::<u32>() {
                Ok(n) if (min..=max).contains(&n) => Ok(n),
                _ => Err(rule_error(format!(
                    "{key} value '{item}' is outside {min}-{max}"
                ))),
            }
        })
        .collect()
}

fn parse_signed_list(key: &str, value: &str, max_abs: i32) -> Result<Vec<i32>> {
    value
        .split(',')
        .map(|item| {
            let item = item.trim();
            match item.parse::<i32>() {
                Ok(n) if n != 0 && n.abs() <= max_abs => Ok(n),
                _ => Err(rule_error(format!(
                    "{key} value '{item}' must be a non-zero integer within ±{max_abs}"
                ))),
            }
        })
        .collect()
}

fn parse_weekday(value: &str) -> Result<Weekday> {
    match value.trim().to_ascii_uppercase().as_str() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(rule_error(format!("unknown weekday '{other}'"))),
    }
}

fn parse_weekday_rule(item: &str) -> Result<WeekdayRule> {
    let item = item.trim();
    let split = item
        .char_indices()
        .find(|(_, c)| c.is_ascii_alphabetic())
        .map(|(i, _)| i)
        .ok_or_else(|| rule_error(format!("invalid BYDAY value '{item}'")))?;
    let (ordinal, day) = item.split_at(split);
    let ordinal = match ordinal {
        "" => None,
        text => match text.parse::<i32>() {
            Ok(n) if n != 0 && n.abs() <= 53 => Some(n),
            _ => return Err(rule_error(format!("invalid BYDAY ordinal in '{item}'"))),
        },
    };
    Ok(WeekdayRule {
        weekday: parse_weekday(day)?,
        ordinal,
    })
}

/// A checked rule bound to a start instant and timezone.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    source: String,
    freq: RuleFrequency,
    interval: u32,
    count: Option<u32>,
    until: Option<DateTime<Utc>>,
    dtstart: DateTime<Utc>,
    start_local: NaiveDateTime,
    tz: TimezoneHandler,
    week_start: Weekday,
    by_month: Vec<u32>,
    by_month_day: Vec<i32>,
    by_weekday: Vec<Weekday>,
    by_nth_weekday: Vec<(Weekday, i32)>,
    by_hour: Vec<u32>,
    by_minute: Vec<u32>,
    by_second: Vec<u32>,
    by_set_pos: Vec<i32>,
    day_times: Vec<NaiveTime>,
}

impl CompiledRule {
    /// Parse and check `text`, anchoring the series at `dtstart` unless the
    /// text carries its own `DTSTART`.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Rule`] for unparsable or self-contradictory
    /// rules and [`CadenceError::Config`] for unknown timezones.
    pub fn compile(text: &str, dtstart: DateTime<Utc>, timezone: Option<&str>) -> Result<Self> {
        let parts = RuleParts::parse(text)?;
        let tz = match timezone {
            Some(name) => TimezoneHandler::from_name(name)?,
            None => TimezoneHandler::utc(),
        };
        Self::from_parts(text, parts, dtstart, tz)
    }

    /// Build from already parsed parts.
    ///
    /// # Errors
    ///
    /// See [`CompiledRule::compile`].
    pub fn from_parts(
        source: &str,
        parts: RuleParts,
        dtstart: DateTime<Utc>,
        tz: TimezoneHandler,
    ) -> Result<Self> {
        if parts.count.is_some() && parts.until.is_some() {
            return Err(rule_error("COUNT and UNTIL are mutually exclusive"));
        }
        let interval = match parts.interval {
            None => 1,
            Some(n) if n >= 1 => u32::try_from(n)
                .map_err(|_| rule_error(format!("INTERVAL {n} is too large")))?,
            Some(n) => return Err(rule_error(format!("INTERVAL must be positive, got {n}"))),
        };
        let count = match parts.count {
            None => None,
            Some(n) if n >= 1 => Some(
                u32::try_from(n).map_err(|_| rule_error(format!("COUNT {n} is too large")))?,
            ),
            Some(n) => return Err(rule_error(format!("COUNT must be positive, got {n}"))),
        };

        let (tz, dtstart) = match &parts.dtstart {
            Some(start) => {
                let tz = match &start.tzid {
                    Some(id) => TimezoneHandler::from_name(id)?,
                    None => tz,
                };
                (tz, start.date.resolve(&tz, false))
            }
            None => (tz, dtstart),
        };
        let until = parts.until.map(|u| u.resolve(&tz, true));
        let start_local = tz.to_local(dtstart);
        let freq = parts.freq;

        let mut by_month = parts.by_month;
        let mut by_month_day = parts.by_month_day;
        let mut by_weekday = Vec::new();
        let mut by_nth_weekday = Vec::new();
        for rule in &parts.by_day {
            match rule.ordinal {
                Some(n) if matches!(freq, RuleFrequency::Monthly | RuleFrequency::Yearly) => {
                    by_nth_weekday.push((rule.weekday, n));
                }
                _ => by_weekday.push(rule.weekday),
            }
        }

        if by_month_day.is_empty() && parts.by_day.is_empty() {
            match freq {
                RuleFrequency::Yearly => {
                    if by_month.is_empty() {
                        by_month.push(start_local.month());
                    }
                    by_month_day.push(start_local.day() as i32);
                }
                RuleFrequency::Monthly => by_month_day.push(start_local.day() as i32),
                RuleFrequency::Weekly => by_weekday.push(start_local.weekday()),
                _ => {}
            }
        }

        let mut by_hour = parts.by_hour;
        let mut by_minute = parts.by_minute;
        let mut by_second = parts.by_second;
        if by_hour.is_empty() && freq > RuleFrequency::Hourly {
            by_hour.push(start_local.hour());
        }
        if by_minute.is_empty() && freq > RuleFrequency::Minutely {
            by_minute.push(start_local.minute());
        }
        if by_second.is_empty() && freq > RuleFrequency::Secondly {
            by_second.push(start_local.second());
        }
        for list in [&mut by_month, &mut by_hour, &mut by_minute, &mut by_second] {
            list.sort_unstable();
            list.dedup();
        }

        let mut day_times = Vec::new();
        if freq >= RuleFrequency::Daily {
            for h in &by_hour {
                for m in &by_minute {
                    for s in &by_second {
                        if let Some(t) = NaiveTime::from_hms_opt(*h, *m, *s) {
                            day_times.push(t);
                        }
                    }
                }
            }
        }

        Ok(Self {
            source: source.trim().to_owned(),
            freq,
            interval,
            count,
            until,
            dtstart,
            start_local,
            tz,
            week_start: parts.week_start,
            by_month,
            by_month_day,
            by_weekday,
            by_nth_weekday,
            by_hour,
            by_minute,
            by_second,
            by_set_pos: parts.by_set_pos,
            day_times,
        })
    }

    /// Original rule text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Rule frequency.
    #[must_use]
    pub fn frequency(&self) -> RuleFrequency {
        self.freq
    }

    /// Start of the series.
    #[must_use]
    pub fn dtstart(&self) -> DateTime<Utc> {
        self.dtstart
    }

    /// Resolved `UNTIL`, if any.
    #[must_use]
    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.until
    }

    /// `COUNT`, if any.
    #[must_use]
    pub fn count(&self) -> Option<u32> {
        self.count
    }

    /// `true` when the series is bounded by `COUNT` or `UNTIL`.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.count.is_some() || self.until.is_some()
    }

    /// First occurrence strictly after `after`; `Ok(None)` once `COUNT` or
    /// `UNTIL` has run out.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Rule`] when the search gives up without
    /// reaching either bound, which says nothing about the series ending.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let mut found = None;
        let end = self.walk(Some(after), |instant| {
            if instant > after {
                found = Some(instant);
                false
            } else {
                true
            }
        });
        match (found, end) {
            (Some(instant), _) => Ok(Some(instant)),
            (None, WalkEnd::GaveUp) => Err(rule_error(format!(
                "no occurrence of '{}' found after {after} within the search limit",
                self.source
            ))),
            (None, _) => Ok(None),
        }
    }

    /// Occurrences between `start` and `end`; bounds included when `inclusive`.
    #[must_use]
    pub fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        inclusive: bool,
    ) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        self.walk(Some(start), |instant| {
            let past_end = if inclusive { instant > end } else { instant >= end };
            if past_end {
                return false;
            }
            let after_start = if inclusive {
                instant >= start
            } else {
                instant > start
            };
            if after_start {
                out.push(instant);
            }
            true
        });
        out
    }

    /// The first `limit` occurrences of the series.
    #[must_use]
    pub fn all(&self, limit: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        if limit == 0 {
            return out;
        }
        self.walk(None, |instant| {
            out.push(instant);
            out.len() < limit
        });
        out
    }

    /// Visit occurrences in order until `visit` returns `false` or the
    /// series ends. `from` lets unbounded-count rules skip whole periods.
    fn walk(
        &self,
        from: Option<DateTime<Utc>>,
        mut visit: impl FnMut(DateTime<Utc>) -> bool,
    ) -> WalkEnd {
        let budget = self.empty_period_budget();
        let mut index = from.map_or(0, |t| self.first_period_for(t));
        let mut empty_run = 0i64;
        let mut emitted = 0u32;

        loop {
            let Some((period_start, candidates)) = self.expand_period(index) else {
                return WalkEnd::GaveUp;
            };
            index += 1;
            if candidates.is_empty() {
                if self
                    .until
                    .is_some_and(|until| self.tz.from_local(period_start) > until)
                {
                    return WalkEnd::Ended;
                }
                empty_run += 1;
                if empty_run >= budget {
                    debug!(rule = %self.source, "rule produced no occurrence within search budget");
                    return WalkEnd::GaveUp;
                }
                continue;
            }
            empty_run = 0;

            for local in candidates {
                let instant = self.tz.from_local(local);
                if instant < self.dtstart {
                    continue;
                }
                if self.until.is_some_and(|until| instant > until) {
                    return WalkEnd::Ended;
                }
                if self.count.is_some_and(|count| emitted >= count) {
                    return WalkEnd::Ended;
                }
                emitted += 1;
                if !visit(instant) {
                    return WalkEnd::Stopped;
                }
            }
            if self.count.is_some_and(|count| emitted >= count) {
                return WalkEnd::Ended;
            }
        }
    }

    /// Consecutive empty periods to search before giving up.
    fn empty_period_budget(&self) -> i64 {
        let span = match self.freq {
            RuleFrequency::Hourly => SEARCH_SPAN_HOURS,
            RuleFrequency::Minutely => SEARCH_SPAN_MINUTES,
            RuleFrequency::Secondly => SEARCH_SPAN_SECONDS,
            _ => return MAX_EMPTY_PERIODS_COARSE,
        };
        (span / i64::from(self.interval)).max(1)
    }

    /// A period index at or before the one containing `from`. Rules with a
    /// `COUNT` must always be walked from the start.
    fn first_period_for(&self, from: DateTime<Utc>) -> i64 {
        if self.count.is_some() {
            return 0;
        }
        let local = self.tz.to_local(from);
        let start = self.start_local;
        if local <= start {
            return 0;
        }
        let elapsed = match self.freq {
            RuleFrequency::Yearly => i64::from(local.year() - start.year()),
            RuleFrequency::Monthly => {
                i64::from(local.year() - start.year()) * 12 + i64::from(local.month())
                    - i64::from(start.month())
            }
            RuleFrequency::Weekly => (local.date() - start.date()).num_days() / 7,
            RuleFrequency::Daily => (local.date() - start.date()).num_days(),
            RuleFrequency::Hourly => (local - start).num_hours(),
            RuleFrequency::Minutely => (local - start).num_minutes(),
            RuleFrequency::Secondly => (local - start).num_seconds(),
        };
        (elapsed / i64::from(self.interval) - 1).max(0)
    }

    /// Local start of the `index`-th period and its candidate local times,
    /// sorted, after `BYSETPOS`. `None` when the period is outside the
    /// representable range.
    fn expand_period(&self, index: i64) -> Option<(NaiveDateTime, Vec<NaiveDateTime>)> {
        let step = index.checked_mul(i64::from(self.interval))?;
        let start = self.start_local;
        let (period_start, mut out) = match self.freq {
            RuleFrequency::Yearly => {
                let year = i32::try_from(i64::from(start.year()).checked_add(step)?).ok()?;
                let first = NaiveDate::from_ymd_opt(year, 1, 1)?;
                (
                    first.and_hms_opt(0, 0, 0)?,
                    self.expand_days(first.iter_days().take_while(|d| d.year() == year)),
                )
            }
            RuleFrequency::Monthly => {
                let (year, month) = shift_month(start.year(), start.month(), step)?;
                let first = NaiveDate::from_ymd_opt(year, month, 1)?;
                (
                    first.and_hms_opt(0, 0, 0)?,
                    self.expand_days(first.iter_days().take_while(|d| d.month() == month)),
                )
            }
            RuleFrequency::Weekly => {
                let offset = i64::from(
                    (start.weekday().num_days_from_monday() + 7
                        - self.week_start.num_days_from_monday())
                        % 7,
                );
                let week = start
                    .date()
                    .checked_sub_signed(TimeDelta::try_days(offset)?)?
                    .checked_add_signed(TimeDelta::try_days(step.checked_mul(7)?)?)?;
                (
                    week.and_hms_opt(0, 0, 0)?,
                    self.expand_days(week.iter_days().take(7)),
                )
            }
            RuleFrequency::Daily => {
                let day = start.date().checked_add_signed(TimeDelta::try_days(step)?)?;
                (
                    day.and_hms_opt(0, 0, 0)?,
                    self.expand_days(std::iter::once(day)),
                )
            }
            RuleFrequency::Hourly => {
                let base = start.date().and_hms_opt(start.hour(), 0, 0)?;
                let at = base.checked_add_signed(TimeDelta::try_hours(step)?)?;
                (at, self.expand_instant(at))
            }
            RuleFrequency::Minutely => {
                let base = start.date().and_hms_opt(start.hour(), start.minute(), 0)?;
                let at = base.checked_add_signed(TimeDelta::try_minutes(step)?)?;
                (at, self.expand_instant(at))
            }
            RuleFrequency::Secondly => {
                let at = start.checked_add_signed(TimeDelta::try_seconds(step)?)?;
                (at, self.expand_instant(at))
            }
        };

        out.sort_unstable();
        out.dedup();
        if !self.by_set_pos.is_empty() {
            out = apply_set_pos(&out, &self.by_set_pos);
        }
        Some((period_start, out))
    }

    fn expand_days(&self, days: impl Iterator<Item = NaiveDate>) -> Vec<NaiveDateTime> {
        days.filter(|day| self.day_matches(*day))
            .flat_map(|day| self.day_times.iter().map(move |t| day.and_time(*t)))
            .collect()
    }

    fn expand_instant(&self, at: NaiveDateTime) -> Vec<NaiveDateTime> {
        if !self.day_matches(at.date()) {
            return Vec::new();
        }
        if !self.by_hour.is_empty() && !self.by_hour.contains(&at.hour()) {
            return Vec::new();
        }
        let date = at.date();
        match self.freq {
            RuleFrequency::Hourly => self
                .by_minute
                .iter()
                .flat_map(|m| {
                    self.by_second
                        .iter()
                        .filter_map(move |s| date.and_hms_opt(at.hour(), *m, *s))
                })
                .collect(),
            RuleFrequency::Minutely => {
                if !self.by_minute.is_empty() && !self.by_minute.contains(&at.minute()) {
                    return Vec::new();
                }
                self.by_second
                    .iter()
                    .filter_map(|s| date.and_hms_opt(at.hour(), at.minute(), *s))
                    .collect()
            }
            _ => {
                if !self.by_minute.is_empty() && !self.by_minute.contains(&at.minute()) {
                    return Vec::new();
                }
                if !self.by_second.is_empty() && !self.by_second.contains(&at.second()) {
                    return Vec::new();
                }
                vec![at]
            }
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.by_month.is_empty() && !self.by_month.contains(&date.month()) {
            return false;
        }
        if !self.by_month_day.is_empty() {
            let days = TimezoneHandler::days_in_month(date.year(), date.month()) as i32;
            let day = date.day() as i32;
            let hit = self
                .by_month_day
                .iter()
                .any(|d| *d == day || (*d < 0 && days + d + 1 == day));
            if !hit {
                return false;
            }
        }
        if self.by_weekday.is_empty() && self.by_nth_weekday.is_empty() {
            return true;
        }
        let weekday = date.weekday();
        if self.by_weekday.contains(&weekday) {
            return true;
        }
        self.by_nth_weekday
            .iter()
            .any(|(w, n)| *w == weekday && self.nth_matches(date, *n))
    }

    /// Whether `date` is the `n`-th (negative: from the end) such weekday of
    /// its month, or of its year for yearly rules without `BYMONTH`.
    fn nth_matches(&self, date: NaiveDate, n: i32) -> bool {
        let month_scope = self.freq == RuleFrequency::Monthly || !self.by_month.is_empty();
        let (position, span) = if month_scope {
            (
                date.day0() as i32,
                TimezoneHandler::days_in_month(date.year(), date.month()) as i32,
            )
        } else {
            let year_days = if NaiveDate::from_ymd_opt(date.year(), 2, 29).is_some() {
                366
            } else {
                365
            };
            (date.ordinal0() as i32, year_days)
        };
        let index = position / 7 + 1;
        let total = index + (span - 1 - position) / 7;
        if n > 0 { index == n } else { total - index + 1 == -n }
    }
}

fn apply_set_pos(sorted: &[NaiveDateTime], positions: &[i32]) -> Vec<NaiveDateTime> {
    let len = sorted.len() as i64;
    let mut picked: Vec<NaiveDateTime> = positions
        .iter()
        .filter_map(|pos| {
            let index = if *pos > 0 {
                i64::from(*pos) - 1
            } else {
                len + i64::from(*pos)
            };
            usize::try_from(index).ok().and_then(|i| sorted.get(i).copied())
        })
        .collect();
    picked.sort_unstable();
    picked.dedup();
    picked
}

/// Short BLAKE3 fingerprint of rule text, used in cache keys.
#[must_use]
pub fn rule_hash(text: &str) -> String {
    let hash = blake3::hash(text.trim().as_bytes());
    hash.to_hex()[..16].to_owned()
}
