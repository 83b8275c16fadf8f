//! Store traits and supporting types.
//!
//! Implemented by storage backends (e.g. `tally-store-sqlite`). Higher
//! layers (`tally-api`, the ledger engine) depend on these abstractions,
//! not on any concrete backend.
//!
//! The ledger's correctness under concurrency rests entirely on two
//! primitives the backend must supply: an atomic conditional increment
//! ([`UsageStore::consume_one`]) and unique-constraint conflict detection
//! ([`UsageStore::insert_record`]). No in-process locking is used anywhere.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  plan::{NewPlan, Plan},
  subscription::{NewSubscription, SubscriptionInstance},
  usage::{BonusStamp, UsageKey, UsageRecord, WindowMeta},
  window::Window,
};

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Result of an insert attempt against the composite uniqueness key.
/// A conflict is a normal outcome, not an error: the caller falls back to
/// the conditional-increment path.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
  Inserted(UsageRecord),
  Conflict,
}

/// Result of a registration attempt. Domain rejections are values so API
/// layers can map them without inspecting backend error types.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
  Registered(SubscriptionInstance),
  /// The subject already holds an active instance overlapping the
  /// requested period and `replace_current` was not set.
  OverlappingActive { existing: Uuid },
  PlanNotFound,
}

/// Result of adding a catalogue plan; `code` is unique.
#[derive(Debug, Clone)]
pub enum PlanInsertOutcome {
  Created(Plan),
  CodeExists,
}

// ─── Plans ───────────────────────────────────────────────────────────────────

/// Catalogue plan storage. `code` is unique across the catalogue.
pub trait PlanStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn add_plan(
    &self,
    input: NewPlan,
  ) -> impl Future<Output = Result<PlanInsertOutcome, Self::Error>> + Send + '_;

  fn get_plan(
    &self,
    plan_id: Uuid,
  ) -> impl Future<Output = Result<Option<Plan>, Self::Error>> + Send + '_;

  fn find_plan_by_code<'a>(
    &'a self,
    code: &'a str,
  ) -> impl Future<Output = Result<Option<Plan>, Self::Error>> + Send + 'a;

  fn list_plans(
    &self,
  ) -> impl Future<Output = Result<Vec<Plan>, Self::Error>> + Send + '_;

  /// Replace a plan's limitation tree. Affects future registrations only:
  /// instances keep the snapshot they were issued with. `None` when the
  /// plan does not exist.
  fn update_plan_limits(
    &self,
    plan_id: Uuid,
    limits: crate::limits::LimitSnapshot,
  ) -> impl Future<Output = Result<Option<Plan>, Self::Error>> + Send + '_;
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

/// The registrar: issues and looks up subscription instances.
pub trait SubscriptionStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Issue a new instance for a subject, deep-copying the plan's limits.
  ///
  /// Must execute as a single transaction: when an overlapping active
  /// instance exists it is either canceled (`replace_current`) or the whole
  /// registration fails — no observer may ever see two overlapping active
  /// instances for one subject.
  fn register(
    &self,
    input: NewSubscription,
  ) -> impl Future<Output = Result<RegisterOutcome, Self::Error>> + Send + '_;

  fn get_instance(
    &self,
    instance_id: Uuid,
  ) -> impl Future<Output = Result<Option<SubscriptionInstance>, Self::Error>> + Send + '_;

  /// The subject's instance with `status = active` and
  /// `start_at <= at < end_at`, if any.
  fn find_active_instance(
    &self,
    subject_id: Uuid,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<SubscriptionInstance>, Self::Error>> + Send + '_;

  fn list_instances(
    &self,
    subject_id: Uuid,
  ) -> impl Future<Output = Result<Vec<SubscriptionInstance>, Self::Error>> + Send + '_;
}

// ─── Usage ledger primitives ─────────────────────────────────────────────────

/// Storage for usage records, exposing the atomic primitives the ledger's
/// concurrency guarantees are built on.
pub trait UsageStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn find_record<'a>(
    &'a self,
    key: &'a UsageKey,
  ) -> impl Future<Output = Result<Option<UsageRecord>, Self::Error>> + Send + 'a;

  /// Create a record, detecting composite-key conflicts as a value.
  fn insert_record(
    &self,
    record: UsageRecord,
  ) -> impl Future<Output = Result<InsertOutcome, Self::Error>> + Send + '_;

  /// Atomically increment `used` by one, but only while `used < quota`.
  /// Returns the post-increment record, or `None` when the predicate
  /// matched no row (quota already exhausted, or no such record).
  ///
  /// This is the sole concurrency control for consumption: the increment
  /// and its guard must be indivisible as observed by all callers.
  fn consume_one<'a>(
    &'a self,
    key: &'a UsageKey,
  ) -> impl Future<Output = Result<Option<UsageRecord>, Self::Error>> + Send + 'a;

  /// Atomically add bonus quota, creating the record if needed.
  ///
  /// On update: `quota += amount`, bonus stamp refreshed (a `None`
  /// expiry leaves any existing expiry in place). On insert: the record
  /// starts at `used = 0`, `quota = insert_base_quota + amount`, with
  /// `meta` describing the window.
  fn add_quota<'a>(
    &'a self,
    key: &'a UsageKey,
    amount: u64,
    insert_base_quota: u64,
    meta: WindowMeta,
    stamp: BonusStamp,
  ) -> impl Future<Output = Result<UsageRecord, Self::Error>> + Send + 'a;

  /// Atomically add to `used` without a quota guard (administrative
  /// metering). On insert the record starts at `used = amount`,
  /// `quota = insert_quota`.
  fn record_usage<'a>(
    &'a self,
    key: &'a UsageKey,
    amount: u64,
    meta: WindowMeta,
    insert_quota: u64,
  ) -> impl Future<Output = Result<UsageRecord, Self::Error>> + Send + 'a;

  /// All records whose bonus has expired: `bonus_expires_at < now` and a
  /// bonus source is set.
  fn expired_bonus_records(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<UsageRecord>, Self::Error>> + Send + '_;

  /// Reset a record's quota to its base and clear the bonus fields.
  /// Never touches `used`. Returns `false` when the record no longer
  /// carries bonus metadata (already cleaned).
  fn reset_bonus<'a>(
    &'a self,
    key: &'a UsageKey,
    base_quota: u64,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Records carrying bonus metadata for one subject in one window.
  fn bonus_records(
    &self,
    instance_id: Uuid,
    subject_id: Uuid,
    window: Window,
  ) -> impl Future<Output = Result<Vec<UsageRecord>, Self::Error>> + Send + '_;
}
