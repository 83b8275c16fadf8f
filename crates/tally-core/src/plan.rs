//! Subscription plans — the catalogue entries subscriptions are issued from.
//!
//! The metering engine never reads a plan after registration: an instance
//! owns its own copy of the plan's limits, taken at registration time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::limits::LimitSnapshot;

/// Lifecycle state of a catalogue plan. Only `active` plans can be
/// registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
  #[default]
  Active,
  Inactive,
  Archived,
}

/// Unit for a subscription's paid duration. Distinct from window units:
/// this bounds the instance itself, not a metering window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
  Day,
  #[default]
  Month,
  Lifetime,
}

impl DurationUnit {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Day => "day",
      Self::Month => "month",
      Self::Lifetime => "lifetime",
    }
  }
}

/// A catalogue plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
  pub plan_id:       Uuid,
  pub name:          String,
  /// Stable registration handle, unique across the catalogue (e.g. `free`).
  pub code:          String,
  /// Price in minor currency units.
  pub price:         i64,
  pub description:   Option<String>,
  pub duration:      u32,
  pub duration_unit: DurationUnit,
  pub limits:        LimitSnapshot,
  pub status:        PlanStatus,
  pub created_at:    DateTime<Utc>,
}

/// Input to [`PlanStore::add_plan`](crate::store::PlanStore::add_plan).
/// `plan_id` and `created_at` are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPlan {
  pub name:          String,
  pub code:          String,
  pub price:         i64,
  pub description:   Option<String>,
  pub duration:      u32,
  pub duration_unit: DurationUnit,
  pub limits:        LimitSnapshot,
  #[serde(default)]
  pub status:        PlanStatus,
}
