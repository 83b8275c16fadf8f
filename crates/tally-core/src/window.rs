//! Window computation — mapping an instant onto the half-open interval
//! `[start, end)` that accumulates consumption against a quota.
//!
//! All windows are calendar-aligned and computed in UTC. `compute_window` is
//! a pure function of its inputs: two calls with the same `(now, unit, size)`
//! yield the same window, and any two instants inside the same calendar
//! period resolve to the same window.

use chrono::{DateTime, Datelike, DurationRound, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ─── Units ───────────────────────────────────────────────────────────────────

/// The calendar unit a quota window is aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowUnit {
  Minute,
  Hour,
  Day,
  Week,
  Month,
  Lifetime,
}

impl WindowUnit {
  /// The string stored in the `window_unit` column.
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Minute => "minute",
      Self::Hour => "hour",
      Self::Day => "day",
      Self::Week => "week",
      Self::Month => "month",
      Self::Lifetime => "lifetime",
    }
  }

  /// Parse a stored unit string. Unknown units are a configuration error
  /// and fail with [`Error::InvalidWindowUnit`].
  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "minute" => Ok(Self::Minute),
      "hour" => Ok(Self::Hour),
      "day" => Ok(Self::Day),
      "week" => Ok(Self::Week),
      "month" => Ok(Self::Month),
      "lifetime" => Ok(Self::Lifetime),
      other => Err(Error::InvalidWindowUnit(other.to_owned())),
    }
  }
}

/// How a window relates to wall-clock time. `rolling` is accepted as stored
/// record metadata but only `calendar` windows are ever computed; see
/// [`Error::RollingWindowUnsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
  #[default]
  Calendar,
  Rolling,
}

impl WindowType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Calendar => "calendar",
      Self::Rolling => "rolling",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "calendar" => Ok(Self::Calendar),
      "rolling" => Ok(Self::Rolling),
      other => Err(Error::InvalidWindowUnit(other.to_owned())),
    }
  }
}

// ─── Window ──────────────────────────────────────────────────────────────────

/// A half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
  pub start: DateTime<Utc>,
  pub end:   DateTime<Utc>,
}

impl Window {
  pub fn contains(&self, at: DateTime<Utc>) -> bool {
    self.start <= at && at < self.end
  }
}

/// Sentinel end instant for lifetime windows: `9999-12-31T23:59:59Z`.
/// Lifetime windows have no practical renewal.
pub fn lifetime_end() -> DateTime<Utc> {
  DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Compute the calendar window containing `now`.
///
/// - `minute`/`hour`/`day`: truncate `now` to the unit boundary; the window
///   spans `size` units from there.
/// - `week`: starts on Monday 00:00 (ISO) of the week containing `now`.
/// - `month`: starts on the first of the month; the end respects variable
///   month lengths (`size` calendar months, not `30 * size` days).
/// - `lifetime`: `[Unix epoch, far-future sentinel)`.
pub fn compute_window(
  now: DateTime<Utc>,
  unit: WindowUnit,
  size: u32,
) -> Result<Window> {
  // A zero size would produce an empty interval; treat it like an unset rule.
  let size = size.max(1);
  let span = i64::from(size);

  let window = match unit {
    WindowUnit::Minute => {
      let start = truncate(now, TimeDelta::minutes(1))?;
      Window { start, end: offset(start, TimeDelta::minutes(span))? }
    }
    WindowUnit::Hour => {
      let start = truncate(now, TimeDelta::hours(1))?;
      Window { start, end: offset(start, TimeDelta::hours(span))? }
    }
    WindowUnit::Day => {
      let start = truncate(now, TimeDelta::days(1))?;
      Window { start, end: offset(start, TimeDelta::days(span))? }
    }
    WindowUnit::Week => {
      let midnight = truncate(now, TimeDelta::days(1))?;
      let monday_offset = i64::from(now.weekday().num_days_from_monday());
      let start = offset(midnight, TimeDelta::days(-monday_offset))?;
      Window { start, end: offset(start, TimeDelta::days(7 * span))? }
    }
    WindowUnit::Month => {
      let midnight = truncate(now, TimeDelta::days(1))?;
      let start = offset(midnight, TimeDelta::days(-i64::from(now.day0())))?;
      let end = start
        .checked_add_months(Months::new(size))
        .ok_or(Error::WindowOutOfRange)?;
      Window { start, end }
    }
    WindowUnit::Lifetime => Window {
      start: DateTime::UNIX_EPOCH,
      end:   lifetime_end(),
    },
  };

  Ok(window)
}

fn truncate(now: DateTime<Utc>, delta: TimeDelta) -> Result<DateTime<Utc>> {
  now.duration_trunc(delta).map_err(|_| Error::WindowOutOfRange)
}

fn offset(at: DateTime<Utc>, delta: TimeDelta) -> Result<DateTime<Utc>> {
  at.checked_add_signed(delta).ok_or(Error::WindowOutOfRange)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
  }

  #[test]
  fn minute_window_truncates_seconds() {
    let w =
      compute_window(at("2024-01-31T10:42:37Z"), WindowUnit::Minute, 1).unwrap();
    assert_eq!(w.start, at("2024-01-31T10:42:00Z"));
    assert_eq!(w.end, at("2024-01-31T10:43:00Z"));
  }

  #[test]
  fn hour_window_spans_size_hours() {
    let w =
      compute_window(at("2024-01-31T10:42:37Z"), WindowUnit::Hour, 6).unwrap();
    assert_eq!(w.start, at("2024-01-31T10:00:00Z"));
    assert_eq!(w.end, at("2024-01-31T16:00:00Z"));
  }

  #[test]
  fn day_window_starts_at_midnight() {
    let w =
      compute_window(at("2024-01-31T10:42:37Z"), WindowUnit::Day, 1).unwrap();
    assert_eq!(w.start, at("2024-01-31T00:00:00Z"));
    assert_eq!(w.end, at("2024-02-01T00:00:00Z"));
  }

  #[test]
  fn week_window_starts_on_monday() {
    // 2024-01-31 is a Wednesday; the ISO week starts Monday 2024-01-29.
    let w =
      compute_window(at("2024-01-31T10:00:00Z"), WindowUnit::Week, 1).unwrap();
    assert_eq!(w.start, at("2024-01-29T00:00:00Z"));
    assert_eq!(w.end, at("2024-02-05T00:00:00Z"));

    // A Monday belongs to its own week.
    let w =
      compute_window(at("2024-01-29T00:00:00Z"), WindowUnit::Week, 1).unwrap();
    assert_eq!(w.start, at("2024-01-29T00:00:00Z"));
  }

  #[test]
  fn month_window_handles_rollover() {
    // End must be the first of the following month, not start + 30 days.
    let w =
      compute_window(at("2024-01-31T10:00:00Z"), WindowUnit::Month, 1).unwrap();
    assert_eq!(w.start, at("2024-01-01T00:00:00Z"));
    assert_eq!(w.end, at("2024-02-01T00:00:00Z"));
  }

  #[test]
  fn month_window_crosses_year_boundary() {
    let w =
      compute_window(at("2023-12-15T08:00:00Z"), WindowUnit::Month, 2).unwrap();
    assert_eq!(w.start, at("2023-12-01T00:00:00Z"));
    assert_eq!(w.end, at("2024-02-01T00:00:00Z"));
  }

  #[test]
  fn lifetime_window_never_renews() {
    let w =
      compute_window(at("2024-01-31T10:00:00Z"), WindowUnit::Lifetime, 1)
        .unwrap();
    assert_eq!(w.start, DateTime::UNIX_EPOCH);
    assert_eq!(w.end, lifetime_end());
    assert!(w.contains(Utc.with_ymd_and_hms(2999, 6, 1, 0, 0, 0).unwrap()));
  }

  #[test]
  fn window_is_deterministic() {
    let now = at("2024-03-10T17:30:12Z");
    let a = compute_window(now, WindowUnit::Day, 1).unwrap();
    let b = compute_window(now, WindowUnit::Day, 1).unwrap();
    assert_eq!(a, b);

    // Two instants in the same calendar period share a window.
    let later = at("2024-03-10T23:59:59Z");
    assert_eq!(compute_window(later, WindowUnit::Day, 1).unwrap(), a);
  }

  #[test]
  fn window_contains_now() {
    let now = at("2024-03-10T17:30:12Z");
    for unit in [
      WindowUnit::Minute,
      WindowUnit::Hour,
      WindowUnit::Day,
      WindowUnit::Week,
      WindowUnit::Month,
      WindowUnit::Lifetime,
    ] {
      let w = compute_window(now, unit, 1).unwrap();
      assert!(w.contains(now), "window for {unit:?} must contain now");
    }
  }

  #[test]
  fn unknown_unit_string_is_rejected() {
    let err = WindowUnit::parse("fortnight").unwrap_err();
    assert!(matches!(err, Error::InvalidWindowUnit(_)));
  }
}
