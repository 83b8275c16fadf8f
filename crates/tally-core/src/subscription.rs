//! Subscription instances — a subject's grant of a plan, carrying an owned
//! snapshot of the plan's limits.

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  limits::LimitSnapshot,
  plan::DurationUnit,
  window::lifetime_end,
};

/// Lifecycle state of an instance. The registrar guarantees at most one
/// `active` instance per subject with an overlapping time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
  Active,
  Canceled,
  Expired,
}

impl InstanceStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Active => "active",
      Self::Canceled => "canceled",
      Self::Expired => "expired",
    }
  }
}

/// A subject's issued subscription.
///
/// `limits` is an owned deep copy of the plan's limitation tree, taken at
/// registration time. Later edits to the plan never reach an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInstance {
  pub instance_id:   Uuid,
  pub subject_id:    Uuid,
  pub plan_id:       Uuid,
  pub name:          String,
  pub price:         i64,
  pub duration:      u32,
  pub duration_unit: DurationUnit,
  pub limits:        LimitSnapshot,
  pub start_at:      DateTime<Utc>,
  pub end_at:        DateTime<Utc>,
  pub status:        InstanceStatus,
  pub created_at:    DateTime<Utc>,
}

impl SubscriptionInstance {
  /// Whether this instance grants capabilities at `at`.
  pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
    self.status == InstanceStatus::Active
      && self.start_at <= at
      && at < self.end_at
  }
}

/// How a registration names its plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRef {
  ById(Uuid),
  ByCode(String),
}

/// Input to [`SubscriptionStore::register`](crate::store::SubscriptionStore::register).
#[derive(Debug, Clone)]
pub struct NewSubscription {
  pub subject_id:        Uuid,
  pub plan:              PlanRef,
  /// Defaults to now.
  pub start_at:          Option<DateTime<Utc>>,
  /// Overrides the plan's duration. Ignored for lifetime registrations.
  pub duration_override: Option<u32>,
  /// Overrides the plan's duration unit.
  pub duration_unit:     Option<DurationUnit>,
  /// Cancel an overlapping active instance instead of rejecting.
  pub replace_current:   bool,
}

/// Compute an instance's `end_at` from its start and paid duration.
///
/// Month arithmetic is calendar-correct: the day-of-month is clamped when
/// the target month is shorter (Jan 31 + 1 month = Feb 29 in a leap year).
/// Lifetime instances end at the far-future sentinel.
pub fn subscription_end(
  start: DateTime<Utc>,
  duration: u32,
  unit: DurationUnit,
) -> Result<DateTime<Utc>> {
  match unit {
    DurationUnit::Day => start
      .checked_add_signed(TimeDelta::days(i64::from(duration)))
      .ok_or(Error::WindowOutOfRange),
    DurationUnit::Month => start
      .checked_add_months(Months::new(duration))
      .ok_or(Error::WindowOutOfRange),
    DurationUnit::Lifetime => Ok(lifetime_end()),
  }
}

#[cfg(test)]
mod tests {
  use chrono::DateTime;

  use super::*;

  fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
  }

  #[test]
  fn month_end_clamps_to_shorter_month() {
    let end =
      subscription_end(at("2024-01-31T09:00:00Z"), 1, DurationUnit::Month)
        .unwrap();
    assert_eq!(end, at("2024-02-29T09:00:00Z"));
  }

  #[test]
  fn day_end_adds_exact_days() {
    let end =
      subscription_end(at("2024-02-27T09:00:00Z"), 3, DurationUnit::Day)
        .unwrap();
    assert_eq!(end, at("2024-03-01T09:00:00Z"));
  }

  #[test]
  fn lifetime_end_is_sentinel() {
    let end =
      subscription_end(at("2024-01-01T00:00:00Z"), 0, DurationUnit::Lifetime)
        .unwrap();
    assert_eq!(end, lifetime_end());
  }

  #[test]
  fn active_window_is_half_open() {
    let instance = SubscriptionInstance {
      instance_id:   Uuid::new_v4(),
      subject_id:    Uuid::new_v4(),
      plan_id:       Uuid::new_v4(),
      name:          "Pro".into(),
      price:         990,
      duration:      1,
      duration_unit: DurationUnit::Month,
      limits:        LimitSnapshot::default(),
      start_at:      at("2024-01-01T00:00:00Z"),
      end_at:        at("2024-02-01T00:00:00Z"),
      status:        InstanceStatus::Active,
      created_at:    at("2024-01-01T00:00:00Z"),
    };

    assert!(instance.is_active_at(at("2024-01-01T00:00:00Z")));
    assert!(instance.is_active_at(at("2024-01-31T23:59:59Z")));
    assert!(!instance.is_active_at(at("2024-02-01T00:00:00Z")));

    let canceled = SubscriptionInstance {
      status: InstanceStatus::Canceled,
      ..instance
    };
    assert!(!canceled.is_active_at(at("2024-01-15T00:00:00Z")));
  }
}
