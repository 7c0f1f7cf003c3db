//! Local wall-clock arithmetic in a fixed IANA timezone.
//!
//! All instants are stored as UTC; every calendar operation ("same time
//! tomorrow", "the 31st of next month") is carried out on the local
//! representation and converted back. Conversions across DST transitions
//! resolve ambiguous local times to the earliest instant and shift local
//! times that fall into a gap forward by the gap's length.

use crate::error::{CadenceError, Result};
use chrono::{
    DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta,
    TimeZone, Utc,
};
use chrono_tz::Tz;

/// Date arithmetic helper bound to one timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimezoneHandler {
    tz: Tz,
}

impl Default for TimezoneHandler {
    fn default() -> Self {
        Self::utc()
    }
}

impl TimezoneHandler {
    /// Handler for the given timezone.
    #[must_use]
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Handler that performs all arithmetic in UTC.
    #[must_use]
    pub fn utc() -> Self {
        Self { tz: chrono_tz::UTC }
    }

    /// Resolve an IANA timezone name such as `"America/New_York"`.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Config`] for unknown names.
    pub fn from_name(name: &str) -> Result<Self> {
        name.trim()
            .parse::<Tz>()
            .map(Self::new)
            .map_err(|e| CadenceError::Config(format!("unknown timezone '{name}': {e}")))
    }

    /// The underlying timezone.
    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Local wall-clock representation of `instant`.
    #[must_use]
    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.tz).naive_local()
    }

    /// Convert a local wall-clock time back to an instant.
    #[must_use]
    pub fn from_local(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self.tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            LocalResult::None => {
                // Inside a DST gap: apply the offset in force before the gap.
                let before = local - TimeDelta::hours(6);
                let offset = self
                    .tz
                    .offset_from_local_datetime(&before)
                    .earliest()
                    .map(|o| o.fix().local_minus_utc())
                    .unwrap_or(0);
                Utc.from_utc_datetime(&(local - TimeDelta::seconds(i64::from(offset))))
            }
        }
    }

    /// Add whole days, keeping the local clock time.
    #[must_use]
    pub fn add_days(&self, instant: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
        let local = self.to_local(instant);
        let shifted = local.checked_add_signed(TimeDelta::try_days(days)?)?;
        Some(self.from_local(shifted))
    }

    /// Add whole months, clamping the day to the target month's length.
    ///
    /// `day_of_month` overrides the original day; `None` keeps it.
    #[must_use]
    pub fn add_months(
        &self,
        instant: DateTime<Utc>,
        months: u32,
        day_of_month: Option<u32>,
    ) -> Option<DateTime<Utc>> {
        let local = self.to_local(instant);
        let (year, month) = shift_month(local.year(), local.month(), i64::from(months))?;
        let wanted = day_of_month.unwrap_or(local.day());
        let day = wanted.clamp(1, Self::days_in_month(year, month));
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        Some(self.from_local(date.and_time(local.time())))
    }

    /// Same local date as `instant`, with the clock time replaced.
    #[must_use]
    pub fn with_time(&self, instant: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
        let date = self.to_local(instant).date();
        self.from_local(date.and_time(time))
    }

    /// Tomorrow (relative to `now`) at the local clock time of `instant`.
    #[must_use]
    pub fn tomorrow_same_time(
        &self,
        instant: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let tomorrow = self.to_local(now).date().succ_opt()?;
        Some(self.from_local(tomorrow.and_time(self.to_local(instant).time())))
    }

    /// Local weekday of `instant`, 0 = Sunday through 6 = Saturday.
    #[must_use]
    pub fn weekday_index(&self, instant: DateTime<Utc>) -> u32 {
        self.to_local(instant).weekday().num_days_from_sunday()
    }

    /// Number of days in `month` (1-12) of `year`; 0 for an invalid month.
    #[must_use]
    pub fn days_in_month(year: i32, month: u32) -> u32 {
        match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 if NaiveDate::from_ymd_opt(year, 2, 29).is_some() => 29,
            2 => 28,
            _ => 0,
        }
    }
}

/// Move `(year, month)` by `delta` months.
pub(crate) fn shift_month(year: i32, month: u32, delta: i64) -> Option<(i32, u32)> {
    let total = i64::from(year)
        .checked_mul(12)?
        .checked_add(i64::from(month) - 1)?
        .checked_add(delta)?;
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
    Some((year, month))
}
