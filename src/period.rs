//! Window boundaries for calendar and rolling-window quotas.
//!
//! A [`Period`] is derived from a bucket's configuration and a reference
//! instant. Calendar quotas align their windows to natural boundaries of the
//! configured [`TimeUnit`] and step forward in whole intervals. Rolling-window
//! quotas anchor the first window at the configured start time and, once it
//! has elapsed, trail the reference instant.
//!
//! All arithmetic happens in UTC. Months have no fixed length and always go
//! through calendar-aware addition.
//!
//! # Example
//!
//! ```ignore
//! use quota_bucket::period::{QuotaKind, TimeUnit};
//!
//! let unit: TimeUnit = "hour".parse()?;
//! let kind: QuotaKind = "calendar".parse()?;
//! let period = kind.initial_period(unit, 1, true, start, now)?;
//! assert!(period.is_current(now));
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Months, SubsecRound, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Granularity of a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// One second.
    Second,
    /// Sixty seconds.
    Minute,
    /// Sixty minutes.
    Hour,
    /// Twenty-four hours.
    Day,
    /// Seven days, starting on Monday.
    Week,
    /// One calendar month.
    Month,
}

impl TimeUnit {
    /// All recognized units.
    pub const ALL: [TimeUnit; 6] = [
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
        TimeUnit::Week,
        TimeUnit::Month,
    ];

    /// Get the unit name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// Check whether `name` is a recognized time unit.
    pub fn is_valid(name: &str) -> bool {
        name.parse::<TimeUnit>().is_ok()
    }

    /// Length of one unit in seconds, or `None` for months.
    pub fn fixed_seconds(&self) -> Option<i64> {
        match self {
            Self::Second => Some(1),
            Self::Minute => Some(60),
            Self::Hour => Some(3_600),
            Self::Day => Some(86_400),
            Self::Week => Some(604_800),
            Self::Month => None,
        }
    }

    /// Length of one unit, or `None` for months.
    pub fn fixed_duration(&self) -> Option<TimeDelta> {
        self.fixed_seconds().and_then(TimeDelta::try_seconds)
    }

    /// Floor `instant` to the most recent boundary of this unit.
    pub fn align(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let date = instant.date_naive();
        let aligned = match self {
            Self::Second => return instant.trunc_subsecs(0),
            Self::Minute => date.and_hms_opt(instant.hour(), instant.minute(), 0),
            Self::Hour => date.and_hms_opt(instant.hour(), 0, 0),
            Self::Day => date.and_hms_opt(0, 0, 0),
            Self::Week => date
                .checked_sub_days(Days::new(u64::from(
                    date.weekday().num_days_from_monday(),
                )))
                .and_then(|monday| monday.and_hms_opt(0, 0, 0)),
            Self::Month => date.with_day(1).and_then(|first| first.and_hms_opt(0, 0, 0)),
        };
        // Every component above is taken from a valid instant.
        aligned.map(|naive| naive.and_utc()).unwrap_or(instant)
    }

    /// Add `count` units to `instant` (negative counts subtract).
    ///
    /// Months use calendar addition, so one month after January 31st is the
    /// last day of February.
    pub fn add(&self, instant: DateTime<Utc>, count: i64) -> Result<DateTime<Utc>, ConfigError> {
        let shifted = match self.fixed_seconds() {
            Some(secs) => secs
                .checked_mul(count)
                .and_then(TimeDelta::try_seconds)
                .and_then(|delta| instant.checked_add_signed(delta)),
            None => {
                let months = u32::try_from(count.unsigned_abs()).ok().map(Months::new);
                match months {
                    Some(months) if count >= 0 => instant.checked_add_months(months),
                    Some(months) => instant.checked_sub_months(months),
                    None => None,
                }
            }
        };
        shifted.ok_or_else(|| {
            ConfigError::PeriodOutOfRange(format!("{} {}(s) from {}", count, self.name(), instant))
        })
    }

    /// Number of whole units from `from` to `to` (zero when `to` is earlier).
    fn whole_units_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        if to <= from {
            return 0;
        }
        match self.fixed_seconds() {
            Some(secs) => (to - from).num_seconds() / secs,
            None => {
                let months = i64::from(to.year() - from.year()) * 12
                    + i64::from(to.month())
                    - i64::from(from.month());
                months.max(0)
            }
        }
    }
}

impl FromStr for TimeUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => Err(ConfigError::InvalidTimeUnit(s.to_string())),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a quota lays out its windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    /// Windows aligned to calendar boundaries.
    Calendar,
    /// A window anchored at the start time, trailing "now" once elapsed.
    #[serde(rename = "rollingwindow", alias = "rolling-window")]
    RollingWindow,
}

impl QuotaKind {
    /// Get the kind name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::RollingWindow => "rollingwindow",
        }
    }

    /// Check whether `name` is a recognized quota kind.
    pub fn is_valid(name: &str) -> bool {
        name.parse::<QuotaKind>().is_ok()
    }

    /// Compute the first period of a freshly built bucket.
    pub fn initial_period(
        &self,
        unit: TimeUnit,
        interval: u32,
        precise: bool,
        input_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Period, ConfigError> {
        match self {
            Self::Calendar => calendar_period(unit, interval, precise, input_start, now),
            Self::RollingWindow => {
                let start = truncate(input_start, precise);
                let end = truncate(unit.add(start, i64::from(interval))?, precise);
                Period::new(input_start, start, end, false)
            }
        }
    }

    /// Compute the period replacing an elapsed one.
    pub fn next_period(
        &self,
        unit: TimeUnit,
        interval: u32,
        precise: bool,
        input_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Period, ConfigError> {
        match self {
            Self::Calendar => calendar_period(unit, interval, precise, input_start, now),
            Self::RollingWindow => {
                let end = truncate(now, precise);
                let start = truncate(unit.add(end, -i64::from(interval))?, precise);
                Period::new(input_start, start, end, true)
            }
        }
    }
}

impl FromStr for QuotaKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "calendar" => Ok(Self::Calendar),
            "rollingwindow" | "rolling-window" => Ok(Self::RollingWindow),
            _ => Err(ConfigError::InvalidQuotaType(s.to_string())),
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved quota window.
///
/// Periods are replaced wholesale when they expire; they are never patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    input_start: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    /// Trailing rolling windows end at the instant they were computed for and
    /// include the whole second of that instant.
    trailing: bool,
}

impl Period {
    fn new(
        input_start: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        trailing: bool,
    ) -> Result<Self, ConfigError> {
        if end <= start {
            return Err(ConfigError::PeriodOutOfRange(format!(
                "window end {} is not after window start {}",
                end, start
            )));
        }
        Ok(Self {
            input_start,
            start,
            end,
            trailing,
        })
    }

    /// The configured start time the period was derived from.
    pub fn input_start_time(&self) -> DateTime<Utc> {
        self.input_start
    }

    /// Start of the window.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    /// End of the window.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end
    }

    /// Start of the window in Unix seconds.
    pub fn start_unix(&self) -> i64 {
        self.start.timestamp()
    }

    /// End of the window in Unix seconds.
    pub fn end_unix(&self) -> i64 {
        self.end.timestamp()
    }

    /// Length of the window.
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Whether this is a trailing rolling window.
    pub fn is_trailing(&self) -> bool {
        self.trailing
    }

    /// Check whether `now` falls inside this window.
    ///
    /// A window whose input start time lies after `now` is never current.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        if self.input_start > now || self.start > now {
            return false;
        }
        if self.trailing {
            now.trunc_subsecs(0) <= self.end
        } else {
            now < self.end
        }
    }

    /// Check whether the window has fully elapsed at `now`.
    pub fn has_elapsed(&self, now: DateTime<Utc>) -> bool {
        now > self.end || (now == self.end && !self.trailing)
    }
}

/// Truncate to whole seconds when second-level precision is requested.
fn truncate(instant: DateTime<Utc>, precise: bool) -> DateTime<Utc> {
    if precise {
        instant.trunc_subsecs(0)
    } else {
        instant
    }
}

fn calendar_period(
    unit: TimeUnit,
    interval: u32,
    precise: bool,
    input_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Period, ConfigError> {
    let step = i64::from(interval);
    let mut start = unit.align(input_start);

    // Jump close to `now` in whole intervals, then walk the remainder.
    let skipped = unit.whole_units_between(start, now) / step;
    if skipped > 0 {
        start = unit.add(start, skipped * step)?;
    }
    let mut end = unit.add(start, step)?;
    while end <= now {
        start = end;
        end = unit.add(start, step)?;
    }

    Period::new(
        input_start,
        truncate(start, precise),
        truncate(end, precise),
        false,
    )
}
