//! Task frequency definitions.

use crate::error::{CadenceError, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const WEEKDAY_LABELS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

fn default_interval() -> u32 {
    1
}

/// How often a task repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frequency {
    /// Every `interval` days.
    Daily {
        /// Days between occurrences (>= 1).
        #[serde(default = "default_interval")]
        interval: u32,
        /// Local clock time forced onto each occurrence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<NaiveTime>,
    },
    /// On the given weekdays, every `interval` weeks.
    Weekly {
        /// Weeks between active weeks (>= 1).
        #[serde(default = "default_interval")]
        interval: u32,
        /// Active weekdays, 0 = Sunday through 6 = Saturday.
        #[serde(default)]
        weekdays: BTreeSet<u8>,
        /// Local clock time forced onto each occurrence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<NaiveTime>,
    },
    /// On a day of the month, every `interval` months.
    Monthly {
        /// Months between occurrences (>= 1).
        #[serde(default = "default_interval")]
        interval: u32,
        /// Target day (1-31), clamped for shorter months. `None` reuses the
        /// current occurrence's day.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        day_of_month: Option<u32>,
        /// Local clock time forced onto each occurrence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<NaiveTime>,
    },
    /// An RRULE evaluated by the rule engine.
    Custom {
        /// Rule text, e.g. `FREQ=MONTHLY;BYDAY=MO;BYSETPOS=1`.
        rule: String,
        /// IANA timezone the rule is evaluated in; defaults to the engine's.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        /// Local clock time forced onto each occurrence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<NaiveTime>,
    },
}

impl Frequency {
    /// Every `interval` days.
    #[must_use]
    pub fn daily(interval: u32) -> Self {
        Self::Daily { interval, at: None }
    }

    /// On `weekdays` (0 = Sunday), every `interval` weeks.
    #[must_use]
    pub fn weekly(interval: u32, weekdays: impl IntoIterator<Item = u8>) -> Self {
        Self::Weekly {
            interval,
            weekdays: weekdays.into_iter().collect(),
            at: None,
        }
    }

    /// On `day_of_month`, every `interval` months.
    #[must_use]
    pub fn monthly(interval: u32, day_of_month: Option<u32>) -> Self {
        Self::Monthly {
            interval,
            day_of_month,
            at: None,
        }
    }

    /// Custom RRULE frequency.
    #[must_use]
    pub fn custom(rule: impl Into<String>) -> Self {
        Self::Custom {
            rule: rule.into(),
            timezone: None,
            at: None,
        }
    }

    /// Attach a fixed local clock time.
    #[must_use]
    pub fn with_time(mut self, time: NaiveTime) -> Self {
        match &mut self {
            Self::Daily { at, .. }
            | Self::Weekly { at, .. }
            | Self::Monthly { at, .. }
            | Self::Custom { at, .. } => *at = Some(time),
        }
        self
    }

    /// The fixed local clock time, if any.
    #[must_use]
    pub fn at(&self) -> Option<NaiveTime> {
        match self {
            Self::Daily { at, .. }
            | Self::Weekly { at, .. }
            | Self::Monthly { at, .. }
            | Self::Custom { at, .. } => *at,
        }
    }

    /// Short tag used in logs and serialized forms.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
            Self::Monthly { .. } => "monthly",
            Self::Custom { .. } => "custom",
        }
    }

    /// Reject configurations the engine cannot evaluate.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Config`] for a zero interval, a weekday
    /// outside 0-6, a day of month outside 1-31 or an empty custom rule.
    pub fn check(&self) -> Result<()> {
        match self {
            Self::Daily { interval, .. } | Self::Monthly { interval, .. } if *interval == 0 => {
                Err(CadenceError::Config(format!(
                    "{} interval must be at least 1",
                    self.kind()
                )))
            }
            Self::Weekly { interval, .. } if *interval == 0 => Err(CadenceError::Config(
                "weekly interval must be at least 1".to_owned(),
            )),
            Self::Weekly { weekdays, .. } => match weekdays.iter().find(|d| **d > 6) {
                Some(day) => Err(CadenceError::Config(format!(
                    "weekday {day} is out of range 0-6"
                ))),
                None => Ok(()),
            },
            Self::Monthly {
                day_of_month: Some(day),
                ..
            } if !(1..=31).contains(day) => Err(CadenceError::Config(format!(
                "day of month {day} is out of range 1-31"
            ))),
            Self::Custom { rule, .. } if rule.trim().is_empty() => Err(CadenceError::Config(
                "custom frequency has an empty rule".to_owned(),
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily { interval: 1, .. } => write!(f, "daily")?,
            Self::Daily { interval, .. } => write!(f, "every {interval} days")?,
            Self::Weekly {
                interval, weekdays, ..
            } => {
                if *interval == 1 {
                    write!(f, "weekly")?;
                } else {
                    write!(f, "every {interval} weeks")?;
                }
                if !weekdays.is_empty() {
                    let labels: Vec<&str> = weekdays
                        .iter()
                        .filter_map(|d| WEEKDAY_LABELS.get(usize::from(*d)).copied())
                        .collect();
                    write!(f, " on {}", labels.join(", "))?;
                }
            }
            Self::Monthly {
                interval,
                day_of_month,
                ..
            } => {
                if *interval == 1 {
                    write!(f, "monthly")?;
                } else {
                    write!(f, "every {interval} months")?;
                }
                if let Some(day) = day_of_month {
                    write!(f, " on day {day}")?;
                }
            }
            Self::Custom { rule, .. } => write!(f, "custom ({rule})")?,
        }
        if let Some(at) = self.at() {
            write!(f, " at {}", at.format("%H:%M"))?;
        }
        Ok(())
    }
}
