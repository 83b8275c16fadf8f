//! Encoding and decoding helpers between Rust domain types and the plain
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as epoch-millisecond integers so that
//! window-boundary equality survives the round trip and range predicates
//! stay index-friendly. Limitation snapshots are stored as compact JSON.
//! UUIDs are stored as hyphenated lowercase strings.

use chrono::{DateTime, Utc};
use tally_core::{
  limits::LimitSnapshot,
  plan::{DurationUnit, Plan, PlanStatus},
  subscription::{InstanceStatus, SubscriptionInstance},
  usage::UsageRecord,
  window::{WindowType, WindowUnit},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String {
  id.hyphenated().to_string()
}

pub fn decode_uuid(s: &str) -> Result<Uuid> {
  Ok(Uuid::parse_str(s)?)
}

// ─── Timestamps ──────────────────────────────────────────────────────────────

pub fn encode_ts(dt: DateTime<Utc>) -> i64 {
  dt.timestamp_millis()
}

pub fn decode_ts(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms)
    .ok_or_else(|| Error::Decode(format!("timestamp out of range: {ms}")))
}

// ─── Counters ────────────────────────────────────────────────────────────────

pub fn encode_count(v: u64) -> i64 {
  i64::try_from(v).unwrap_or(i64::MAX)
}

pub fn decode_count(v: i64) -> Result<u64> {
  u64::try_from(v).map_err(|_| Error::Decode(format!("negative counter: {v}")))
}

// ─── Keys ────────────────────────────────────────────────────────────────────

/// The value bound against `COALESCE(function_key, '')` in key predicates.
pub fn encode_function_key(key: Option<&str>) -> String {
  key.unwrap_or_default().to_owned()
}

// ─── Enums ───────────────────────────────────────────────────────────────────

pub fn decode_duration_unit(s: &str) -> Result<DurationUnit> {
  match s {
    "day" => Ok(DurationUnit::Day),
    "month" => Ok(DurationUnit::Month),
    "lifetime" => Ok(DurationUnit::Lifetime),
    other => Err(Error::Decode(format!("unknown duration unit: {other:?}"))),
  }
}

pub fn encode_plan_status(s: PlanStatus) -> &'static str {
  match s {
    PlanStatus::Active => "active",
    PlanStatus::Inactive => "inactive",
    PlanStatus::Archived => "archived",
  }
}

pub fn decode_plan_status(s: &str) -> Result<PlanStatus> {
  match s {
    "active" => Ok(PlanStatus::Active),
    "inactive" => Ok(PlanStatus::Inactive),
    "archived" => Ok(PlanStatus::Archived),
    other => Err(Error::Decode(format!("unknown plan status: {other:?}"))),
  }
}

pub fn decode_instance_status(s: &str) -> Result<InstanceStatus> {
  match s {
    "active" => Ok(InstanceStatus::Active),
    "canceled" => Ok(InstanceStatus::Canceled),
    "expired" => Ok(InstanceStatus::Expired),
    other => Err(Error::Decode(format!("unknown instance status: {other:?}"))),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw columns of a `plans` row.
pub struct RawPlan {
  pub plan_id:       String,
  pub name:          String,
  pub code:          String,
  pub price:         i64,
  pub description:   Option<String>,
  pub duration:      i64,
  pub duration_unit: String,
  pub limits_json:   String,
  pub status:        String,
  pub created_at:    i64,
}

impl RawPlan {
  pub fn into_plan(self) -> Result<Plan> {
    Ok(Plan {
      plan_id:       decode_uuid(&self.plan_id)?,
      name:          self.name,
      code:          self.code,
      price:         self.price,
      description:   self.description,
      duration:      u32::try_from(self.duration)
        .map_err(|_| Error::Decode(format!("bad duration: {}", self.duration)))?,
      duration_unit: decode_duration_unit(&self.duration_unit)?,
      limits:        LimitSnapshot::from_json(&self.limits_json)
        .map_err(Error::Core)?,
      status:        decode_plan_status(&self.status)?,
      created_at:    decode_ts(self.created_at)?,
    })
  }
}

/// Raw columns of a `subscription_instances` row.
pub struct RawInstance {
  pub instance_id:   String,
  pub subject_id:    String,
  pub plan_id:       String,
  pub name:          String,
  pub price:         i64,
  pub duration:      i64,
  pub duration_unit: String,
  pub limits_json:   String,
  pub start_at:      i64,
  pub end_at:        i64,
  pub status:        String,
  pub created_at:    i64,
}

impl RawInstance {
  pub fn into_instance(self) -> Result<SubscriptionInstance> {
    Ok(SubscriptionInstance {
      instance_id:   decode_uuid(&self.instance_id)?,
      subject_id:    decode_uuid(&self.subject_id)?,
      plan_id:       decode_uuid(&self.plan_id)?,
      name:          self.name,
      price:         self.price,
      duration:      u32::try_from(self.duration)
        .map_err(|_| Error::Decode(format!("bad duration: {}", self.duration)))?,
      duration_unit: decode_duration_unit(&self.duration_unit)?,
      limits:        LimitSnapshot::from_json(&self.limits_json)
        .map_err(Error::Core)?,
      start_at:      decode_ts(self.start_at)?,
      end_at:        decode_ts(self.end_at)?,
      status:        decode_instance_status(&self.status)?,
      created_at:    decode_ts(self.created_at)?,
    })
  }
}

/// Raw columns of a `usage_records` row.
pub struct RawUsageRecord {
  pub instance_id:      String,
  pub subject_id:       String,
  pub module_key:       String,
  pub function_key:     Option<String>,
  pub window_type:      String,
  pub window_unit:      String,
  pub window_size:      i64,
  pub window_start:     i64,
  pub window_end:       i64,
  pub used:             i64,
  pub quota:            i64,
  pub last_bonus_at:    Option<i64>,
  pub bonus_source:     Option<String>,
  pub bonus_expires_at: Option<i64>,
}

impl RawUsageRecord {
  pub fn into_record(self) -> Result<UsageRecord> {
    Ok(UsageRecord {
      instance_id:      decode_uuid(&self.instance_id)?,
      subject_id:       decode_uuid(&self.subject_id)?,
      module_key:       self.module_key,
      function_key:     self.function_key,
      window_type:      WindowType::parse(&self.window_type).map_err(Error::Core)?,
      window_unit:      WindowUnit::parse(&self.window_unit).map_err(Error::Core)?,
      window_size:      u32::try_from(self.window_size).map_err(|_| {
        Error::Decode(format!("bad window size: {}", self.window_size))
      })?,
      window_start:     decode_ts(self.window_start)?,
      window_end:       decode_ts(self.window_end)?,
      used:             decode_count(self.used)?,
      quota:            decode_count(self.quota)?,
      last_bonus_at:    self.last_bonus_at.map(decode_ts).transpose()?,
      bonus_source:     self.bonus_source,
      bonus_expires_at: self.bonus_expires_at.map(decode_ts).transpose()?,
    })
  }
}
