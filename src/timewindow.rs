//! Multi resolution time windows.
//!
//! Every metric keeps one array of cells per granularity. Index 0 is the
//! current window, higher indices are progressively older windows kept
//! around to absorb late usage. The array lengths derive from the slack
//! configuration and must be identical for every resource instance so
//! aggregated windows stay index aligned.

use chrono::{DateTime, Datelike, Duration, DurationRound, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};

/// Window resolutions, finest first.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "D")]
    Day,
    #[serde(rename = "M")]
    Month,
}

pub const GRANULARITIES: [Granularity; 5] = [
    Granularity::Second,
    Granularity::Minute,
    Granularity::Hour,
    Granularity::Day,
    Granularity::Month,
];

impl Granularity {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn code(self) -> char {
        match self {
            Granularity::Second => 's',
            Granularity::Minute => 'm',
            Granularity::Hour => 'h',
            Granularity::Day => 'D',
            Granularity::Month => 'M',
        }
    }

    pub fn from_code(code: char) -> Option<Granularity> {
        GRANULARITIES.iter().copied().find(|g| g.code() == code)
    }

    /// Fixed length of one window. Months have none.
    fn unit(self) -> Option<Duration> {
        match self {
            Granularity::Second => Some(Duration::seconds(1)),
            Granularity::Minute => Some(Duration::minutes(1)),
            Granularity::Hour => Some(Duration::hours(1)),
            Granularity::Day => Some(Duration::days(1)),
            Granularity::Month => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Number of `granularity` windows in one `scale` unit, using a 28 day
/// month. `None` when the slack scale is coarser than the granularity.
pub fn slack_ratio(scale: Granularity, granularity: Granularity) -> Option<u64> {
    use Granularity::*;
    match (scale, granularity) {
        (Month, Month) => Some(1),
        (Day, Month) => Some(28),
        (Day, Day) => Some(1),
        (Hour, Month) => Some(672),
        (Hour, Day) => Some(24),
        (Hour, Hour) => Some(1),
        (Minute, Month) => Some(40320),
        (Minute, Day) => Some(1440),
        (Minute, Hour) => Some(60),
        (Minute, Minute) => Some(1),
        (Second, Month) => Some(2419200),
        (Second, Day) => Some(86400),
        (Second, Hour) => Some(3600),
        (Second, Minute) => Some(60),
        (Second, Second) => Some(1),
        _ => None,
    }
}

/// How late usage may arrive, e.g. `2D` for two days.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Slack {
    pub scale: Granularity,
    pub width: u32,
}

impl Slack {
    pub fn new(scale: Granularity, width: u32) -> Self {
        Self { scale, width }
    }

    /// Oldest instant still accepted when processing at `now`.
    pub fn start(&self, now: i64) -> i64 {
        shift_time(now, self.scale, -i64::from(self.width))
    }
}

impl FromStr for Slack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let code = s
            .chars()
            .last()
            .ok_or_else(|| "empty slack".to_string())?;
        let scale = Granularity::from_code(code)
            .ok_or_else(|| format!("unknown slack scale in {}", s))?;
        let width = s[..s.len() - code.len_utf8()]
            .parse::<u32>()
            .map_err(|_| format!("invalid slack width in {}", s))?;
        Ok(Slack { scale, width })
    }
}

/// Window shape configuration: an optional slack plus explicit sizes that
/// take precedence over it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindowConfig {
    #[serde(default)]
    pub slack: Option<Slack>,
    #[serde(default)]
    pub sizes: BTreeMap<Granularity, usize>,
}

impl TimeWindowConfig {
    pub fn with_slack(slack: Slack) -> Self {
        Self {
            slack: Some(slack),
            sizes: BTreeMap::new(),
        }
    }

    pub fn with_size(mut self, granularity: Granularity, size: usize) -> Self {
        self.sizes.insert(granularity, size);
        self
    }

    /// Length of the cell array for a granularity, always at least one.
    pub fn window_len(&self, granularity: Granularity) -> usize {
        if let Some(size) = self.sizes.get(&granularity) {
            return (*size).max(1);
        }
        match self.slack {
            Some(slack) => match slack_ratio(slack.scale, granularity) {
                Some(ratio) => (u64::from(slack.width).div_ceil(ratio) + 1) as usize,
                None => 1,
            },
            None => 1,
        }
    }

    /// A fresh, all empty window array for a granularity.
    pub fn get_windows<T>(&self, granularity: Granularity) -> Vec<Option<T>> {
        (0..self.window_len(granularity)).map(|_| None).collect()
    }

    /// Fresh windows for every granularity, finest first.
    pub fn empty_windows<T>(&self) -> Vec<Vec<Option<T>>> {
        GRANULARITIES
            .iter()
            .map(|g| self.get_windows(*g))
            .collect()
    }

    /// Slot that usage ending at `end` lands in when processed at `now`,
    /// or `None` if it is older than the windows (or the slack) allow.
    pub fn slot(&self, granularity: Granularity, len: usize, now: i64, end: i64) -> Option<usize> {
        let index = time_window_index(len, now, end, granularity)?;
        if let Some(slack) = self.slack {
            if window_diff(granularity, slack.start(now), end) < 0 {
                return None;
            }
        }
        Some(index)
    }
}

/// Source of processing time, in ms since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
pub(crate) struct FixedClock(pub AtomicI64);

#[cfg(test)]
impl FixedClock {
    pub fn new(t: i64) -> Self {
        FixedClock(AtomicI64::new(t))
    }

    pub fn set(&self, t: i64) {
        self.0.store(t, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Earliest instant usage can be reported for, 1970-01-01T00:00:00Z.
pub const MIN_TIME: i64 = 0;
/// Latest instant usage can be reported for, 9999-12-31T23:59:59.999Z.
pub const MAX_TIME: i64 = 253402300799999;

/// Whether window, period and id arithmetic is defined at `t`.
pub fn is_supported_time(t: i64) -> bool {
    (MIN_TIME..=MAX_TIME).contains(&t)
}

fn to_datetime(t: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(t).single()
}

/// Zeroes every time dimension finer than `granularity`, in UTC.
pub fn truncate(t: i64, granularity: Granularity) -> i64 {
    let Some(date) = to_datetime(t) else {
        return t;
    };
    let truncated = match granularity.unit() {
        Some(unit) => date.duration_trunc(unit).ok(),
        None => Utc
            .with_ymd_and_hms(date.year(), date.month(), 1, 0, 0, 0)
            .single(),
    };
    truncated.map(|d| d.timestamp_millis()).unwrap_or(t)
}

/// Moves `t` by `count` windows of `granularity`.
pub fn shift_time(t: i64, granularity: Granularity, count: i64) -> i64 {
    match granularity.unit() {
        Some(unit) => t + unit.num_milliseconds() * count,
        None => {
            let Some(date) = to_datetime(t) else {
                return t;
            };
            let months = Months::new(count.unsigned_abs() as u32);
            let shifted = if count >= 0 {
                date.checked_add_months(months)
            } else {
                date.checked_sub_months(months)
            };
            shifted.map(|d| d.timestamp_millis()).unwrap_or(t)
        }
    }
}

/// Number of whole windows between two instants, ignoring finer dimensions.
pub fn window_diff(granularity: Granularity, from: i64, to: i64) -> i64 {
    match granularity.unit() {
        Some(unit) => {
            (truncate(to, granularity) - truncate(from, granularity)) / unit.num_milliseconds()
        }
        None => match (to_datetime(from), to_datetime(to)) {
            (Some(a), Some(b)) => {
                i64::from(b.year() - a.year()) * 12 + i64::from(b.month())
                    - i64::from(a.month())
            }
            _ => 0,
        },
    }
}

/// Index of the window `time` falls in relative to `current`. Future times
/// map to the current window; times older than the array yield `None`.
pub fn time_window_index(len: usize, current: i64, time: i64, granularity: Granularity) -> Option<usize> {
    let index = window_diff(granularity, time, current);
    if index < 0 {
        Some(0)
    } else if index as u64 >= len as u64 {
        None
    } else {
        Some(index as usize)
    }
}

/// Ages a window array from `before` to `after`: empty cells enter at the
/// front and the oldest cells fall off the back.
pub fn shift_windows<T>(cells: &mut [Option<T>], before: i64, after: i64, granularity: Granularity) {
    let shift = window_diff(granularity, before, after).clamp(0, cells.len() as i64) as usize;
    if shift == 0 {
        return;
    }
    cells.rotate_right(shift);
    for cell in cells.iter_mut().take(shift) {
        *cell = None;
    }
}

/// `[from, to)` of the window `offset` positions before the one holding `now`.
pub fn window_bounds(now: i64, granularity: Granularity, offset: usize) -> (i64, i64) {
    let from = shift_time(truncate(now, granularity), granularity, -(offset as i64));
    (from, shift_time(from, granularity, 1))
}
