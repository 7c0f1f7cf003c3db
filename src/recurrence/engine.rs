//! Next-occurrence computation for task frequencies.

use crate::error::{CadenceError, Result};
use crate::recurrence::cache::RuleCache;
use crate::recurrence::frequency::Frequency;
use crate::recurrence::rule::rule_hash;
use crate::recurrence::timezone::TimezoneHandler;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Iteration cap for range walks, so a misconfigured frequency cannot spin.
pub const MAX_RANGE_ITERATIONS: usize = 1000;

/// Owner prefix for rules evaluated without a task context.
const ANONYMOUS_OWNER: &str = "*";

/// Computes occurrences of [`Frequency`] values in one timezone.
#[derive(Debug, Clone)]
pub struct RecurrenceEngine {
    tz: TimezoneHandler,
    cache: Arc<RuleCache>,
}

impl RecurrenceEngine {
    /// Engine evaluating in `tz`, compiling custom rules through `cache`.
    #[must_use]
    pub fn new(tz: TimezoneHandler, cache: Arc<RuleCache>) -> Self {
        Self { tz, cache }
    }

    /// Timezone handler used for calendar arithmetic.
    #[must_use]
    pub fn timezone(&self) -> &TimezoneHandler {
        &self.tz
    }

    /// Shared rule cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<RuleCache> {
        &self.cache
    }

    /// Next occurrence after `current_due`.
    ///
    /// Returns `Ok(None)` only when a custom rule's series has ended.
    ///
    /// # Errors
    ///
    /// [`CadenceError::Config`] for an invalid frequency, [`CadenceError::Rule`]
    /// for unparsable rule text and [`CadenceError::InvalidArgument`] when the
    /// result falls outside the representable date range.
    pub fn calculate_next(
        &self,
        current_due: DateTime<Utc>,
        frequency: &Frequency,
    ) -> Result<Option<DateTime<Utc>>> {
        self.next_occurrence(None, current_due, current_due, frequency)
    }

    /// Like [`calculate_next`](Self::calculate_next), but custom rules are
    /// cached under `"<owner>:<rule hash>"` so they can be invalidated per
    /// owner. The series is anchored at the first `current_due` seen.
    ///
    /// # Errors
    ///
    /// See [`calculate_next`](Self::calculate_next).
    pub fn calculate_next_for(
        &self,
        owner: &str,
        current_due: DateTime<Utc>,
        frequency: &Frequency,
    ) -> Result<Option<DateTime<Utc>>> {
        self.next_occurrence(Some(owner), current_due, current_due, frequency)
    }

    /// Like [`calculate_next_for`](Self::calculate_next_for) with the custom
    /// series anchored at `anchor`, so a recompile after eviction yields the
    /// same series.
    ///
    /// # Errors
    ///
    /// See [`calculate_next`](Self::calculate_next).
    pub fn calculate_next_anchored(
        &self,
        owner: &str,
        anchor: DateTime<Utc>,
        current_due: DateTime<Utc>,
        frequency: &Frequency,
    ) -> Result<Option<DateTime<Utc>>> {
        self.next_occurrence(Some(owner), anchor, current_due, frequency)
    }

    fn next_occurrence(
        &self,
        owner: Option<&str>,
        anchor: DateTime<Utc>,
        current_due: DateTime<Utc>,
        frequency: &Frequency,
    ) -> Result<Option<DateTime<Utc>>> {
        frequency.check()?;

        let next = match frequency {
            Frequency::Daily { interval, .. } => Some(
                self.tz
                    .add_days(current_due, i64::from(*interval))
                    .ok_or_else(|| out_of_range(current_due, frequency))?,
            ),
            Frequency::Weekly {
                interval, weekdays, ..
            } => Some(
                self.next_weekly(current_due, *interval, weekdays)
                    .ok_or_else(|| out_of_range(current_due, frequency))?,
            ),
            Frequency::Monthly {
                interval,
                day_of_month,
                ..
            } => Some(
                self.tz
                    .add_months(current_due, *interval, *day_of_month)
                    .ok_or_else(|| out_of_range(current_due, frequency))?,
            ),
            Frequency::Custom { rule, timezone, .. } => {
                let key = match owner {
                    Some(owner) => format!("{owner}:{}", rule_hash(rule)),
                    None => format!(
                        "{ANONYMOUS_OWNER}:{}:{}",
                        rule_hash(rule),
                        anchor.timestamp()
                    ),
                };
                let tz_name = timezone
                    .clone()
                    .unwrap_or_else(|| self.tz.timezone().name().to_owned());
                let compiled = self
                    .cache
                    .get_or_parse(&key, rule, anchor, Some(&tz_name))?;
                compiled.next_after(current_due)?
            }
        };

        Ok(match (next, frequency.at()) {
            (Some(instant), Some(at)) => Some(self.tz.with_time(instant, at)),
            (next, _) => next,
        })
    }

    /// Weekly step with weeks starting on Sunday.
    fn next_weekly(
        &self,
        current_due: DateTime<Utc>,
        interval: u32,
        weekdays: &BTreeSet<u8>,
    ) -> Option<DateTime<Utc>> {
        let Some(first) = weekdays.first().copied() else {
            return self.tz.add_days(current_due, 7 * i64::from(interval));
        };
        let current = i64::from(self.tz.weekday_index(current_due));
        let later = weekdays
            .iter()
            .map(|d| i64::from(*d))
            .find(|d| *d > current);
        let days = match later {
            Some(day) => day - current,
            None => (7 - current) + 7 * (i64::from(interval) - 1) + i64::from(first),
        };
        self.tz.add_days(current_due, days)
    }

    /// Occurrences in `[start, end]`, walking forward from `first`.
    ///
    /// # Errors
    ///
    /// Propagates [`calculate_next`](Self::calculate_next) errors.
    pub fn occurrences_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        frequency: &Frequency,
        first: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.walk(first, end, frequency, |instant| instant >= start, |current| {
            self.next_occurrence(None, first, current, frequency)
        })
    }

    /// Occurrences in `(since, until]`, walking forward from `first`.
    ///
    /// # Errors
    ///
    /// Propagates [`calculate_next`](Self::calculate_next) errors.
    pub fn missed_occurrences(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        frequency: &Frequency,
        first: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.walk(first, until, frequency, |instant| instant > since, |current| {
            self.next_occurrence(None, first, current, frequency)
        })
    }

    /// [`missed_occurrences`](Self::missed_occurrences) for an owned series,
    /// sharing the owner's cached rule (see
    /// [`calculate_next_anchored`](Self::calculate_next_anchored)).
    ///
    /// # Errors
    ///
    /// Propagates [`calculate_next`](Self::calculate_next) errors.
    pub fn missed_occurrences_for(
        &self,
        owner: &str,
        anchor: DateTime<Utc>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        frequency: &Frequency,
        first: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.walk(first, until, frequency, |instant| instant > since, |current| {
            self.next_occurrence(Some(owner), anchor, current, frequency)
        })
    }

    fn walk(
        &self,
        first: DateTime<Utc>,
        end: DateTime<Utc>,
        frequency: &Frequency,
        keep: impl Fn(DateTime<Utc>) -> bool,
        step: impl Fn(DateTime<Utc>) -> Result<Option<DateTime<Utc>>>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let mut out = Vec::new();
        let mut current = first;
        for _ in 0..MAX_RANGE_ITERATIONS {
            if current > end {
                return Ok(out);
            }
            if keep(current) {
                out.push(current);
            }
            match step(current)? {
                Some(next) if next > current => current = next,
                Some(_) => {
                    warn!(%frequency, at = %current, "frequency did not advance, stopping walk");
                    return Ok(out);
                }
                None => return Ok(out),
            }
        }
        warn!(%frequency, "occurrence walk hit the iteration cap");
        Ok(out)
    }
}

fn out_of_range(current_due: DateTime<Utc>, frequency: &Frequency) -> CadenceError {
    CadenceError::InvalidArgument(format!(
        "next {frequency} occurrence after {current_due} is out of range"
    ))
}
