//! The usage ledger — atomic check-and-consume, bonus-quota accounting, and
//! expiry cleanup.
//!
//! The ledger is stateless between calls and takes no in-process locks; all
//! correctness under concurrent invocation is delegated to the store's
//! atomic primitives ([`UsageStore::consume_one`],
//! [`UsageStore::insert_record`]). Policy denials come back as
//! [`ConsumeDecision`] values; only genuine faults are errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  limits::{DefaultAction, RuleKind, normalize_function_key, normalize_key},
  store::{InsertOutcome, SubscriptionStore, UsageStore},
  usage::{BonusStamp, UsageKey, UsageRecord, UsageSnapshot, WindowMeta},
  window::{Window, WindowType, WindowUnit, compute_window},
};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Tunables injected at construction so limits stay testable per scenario.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
  /// Subject id that bypasses capability projection entirely (superuser
  /// override). Compared by parsed-id equality, never by ownership.
  pub bypass_subject_id: Option<Uuid>,
}

// ─── Requests ────────────────────────────────────────────────────────────────

/// One consumption attempt. Exactly one unit is consumed per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeRequest {
  pub instance_id:  Uuid,
  pub subject_id:   Uuid,
  pub module_key:   String,
  pub function_key: Option<String>,
}

/// A bonus-quota grant. The caller (e.g. an ad-reward flow) has already
/// verified the triggering event; the ledger does not deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusRequest {
  pub subject_id:   Uuid,
  pub module_key:   String,
  pub function_key: Option<String>,
  pub amount:       u64,
  pub source:       String,
  pub expires_at:   Option<DateTime<Utc>>,
}

/// Administrative metering: count `amount` units in the calendar window for
/// `period` without enforcing a ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterRequest {
  pub instance_id:  Uuid,
  pub subject_id:   Uuid,
  pub module_key:   String,
  pub function_key: Option<String>,
  pub period:       WindowUnit,
  pub amount:       u64,
}

// ─── Decisions and reports ───────────────────────────────────────────────────

/// Why a consume was denied. These are policy outcomes, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
  SubscriptionNotFound,
  NoRule,
  QuotaZero,
  QuotaExceeded,
}

/// Outcome of a consumption attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeDecision {
  pub allowed:   bool,
  pub reason:    Option<DenyReason>,
  /// Units left in the window after this call. Absent for unlimited and
  /// default-allow outcomes, which track nothing.
  pub remaining: Option<u64>,
  pub reset_at:  Option<DateTime<Utc>>,
}

impl ConsumeDecision {
  fn allow_untracked() -> Self {
    Self { allowed: true, reason: None, remaining: None, reset_at: None }
  }

  fn allow(remaining: u64, reset_at: DateTime<Utc>) -> Self {
    Self {
      allowed:   true,
      reason:    None,
      remaining: Some(remaining),
      reset_at:  Some(reset_at),
    }
  }

  fn deny(reason: DenyReason) -> Self {
    Self { allowed: false, reason: Some(reason), remaining: None, reset_at: None }
  }

  fn deny_exhausted(reset_at: DateTime<Utc>) -> Self {
    Self {
      allowed:   false,
      reason:    Some(DenyReason::QuotaExceeded),
      remaining: Some(0),
      reset_at:  Some(reset_at),
    }
  }
}

/// Result of a successful bonus grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusGrant {
  pub subject_id:   Uuid,
  pub module_key:   String,
  pub function_key: Option<String>,
  pub granted:      u64,
  pub quota:        u64,
  pub used:         u64,
  pub remaining:    u64,
  pub window:       Window,
}

/// Result of an administrative metering call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterReport {
  pub module_key:   String,
  pub function_key: Option<String>,
  pub window:       Window,
  pub used:         u64,
  pub quota:        u64,
}

/// Result of a bonus-expiry sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
  pub cleaned: usize,
}

/// One capability's outstanding bonus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusSummaryItem {
  pub module_key:   String,
  pub function_key: Option<String>,
  pub bonus:        u64,
  pub source:       Option<String>,
  pub granted_at:   Option<DateTime<Utc>>,
  pub expires_at:   Option<DateTime<Utc>>,
  pub expired:      bool,
}

/// All of a subject's bonus grants in the current month window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusSummary {
  pub total_bonus: u64,
  pub items:       Vec<BonusSummaryItem>,
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

/// The metering engine, generic over any backend implementing the store
/// traits.
#[derive(Debug, Clone)]
pub struct UsageLedger<S> {
  store:  S,
  config: EngineConfig,
}

impl<S> UsageLedger<S> {
  pub fn new(store: S, config: EngineConfig) -> Self {
    Self { store, config }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub(crate) fn raw_store(&self) -> &S {
    &self.store
  }
}

impl<S> UsageLedger<S>
where
  S: SubscriptionStore + UsageStore,
{
  // ── Consume ───────────────────────────────────────────────────────────

  /// Consume one unit of a capability, enforcing the quota ceiling.
  pub async fn check_and_consume(
    &self,
    req: ConsumeRequest,
  ) -> Result<ConsumeDecision> {
    self.check_and_consume_at(req, Utc::now()).await
  }

  /// [`Self::check_and_consume`] at an explicit instant.
  pub async fn check_and_consume_at(
    &self,
    req: ConsumeRequest,
    now: DateTime<Utc>,
  ) -> Result<ConsumeDecision> {
    let module_key = normalize_key(&req.module_key);
    let function_key = normalize_function_key(req.function_key.as_deref());

    let Some(instance) = self
      .store
      .get_instance(req.instance_id)
      .await
      .map_err(Error::store)?
    else {
      return Ok(ConsumeDecision::deny(DenyReason::SubscriptionNotFound));
    };

    let Some(rule) = instance.limits.resolve(&module_key, function_key.as_deref())
    else {
      return Ok(match instance.limits.default_action {
        DefaultAction::Allow => ConsumeDecision::allow_untracked(),
        DefaultAction::Block => ConsumeDecision::deny(DenyReason::NoRule),
      });
    };

    if rule.kind == RuleKind::Unlimited {
      return Ok(ConsumeDecision::allow_untracked());
    }

    let window = rule.active_window(now)?;
    let key = UsageKey {
      instance_id: req.instance_id,
      subject_id: req.subject_id,
      module_key,
      function_key,
      window,
    };

    if let Some(existing) =
      self.store.find_record(&key).await.map_err(Error::store)?
    {
      if existing.used >= existing.quota {
        return Ok(ConsumeDecision::deny_exhausted(window.end));
      }
      return match self.store.consume_one(&key).await.map_err(Error::store)? {
        Some(updated) => Ok(ConsumeDecision::allow(updated.remaining(), window.end)),
        // Lost the race to the last unit between the read and the guard.
        None => Ok(ConsumeDecision::deny_exhausted(window.end)),
      };
    }

    // No record yet. A zero-quota rule denies without creating one.
    if rule.quota == 0 {
      return Ok(ConsumeDecision::deny(DenyReason::QuotaZero));
    }

    let record = UsageRecord {
      instance_id:      key.instance_id,
      subject_id:       key.subject_id,
      module_key:       key.module_key.clone(),
      function_key:     key.function_key.clone(),
      window_type:      rule.window_type.unwrap_or_default(),
      window_unit:      rule.window_unit_or_default(),
      window_size:      rule.window_size_or_default(),
      window_start:     window.start,
      window_end:       window.end,
      used:             1,
      quota:            rule.quota,
      last_bonus_at:    None,
      bonus_source:     None,
      bonus_expires_at: None,
    };

    match self.store.insert_record(record).await.map_err(Error::store)? {
      InsertOutcome::Inserted(created) => {
        Ok(ConsumeDecision::allow(created.remaining(), window.end))
      }
      // A concurrent creator won the race: retry as a guarded increment
      // against the now-existing record.
      InsertOutcome::Conflict => {
        match self.store.consume_one(&key).await.map_err(Error::store)? {
          Some(updated) => Ok(ConsumeDecision::allow(updated.remaining(), window.end)),
          None => Ok(ConsumeDecision::deny_exhausted(window.end)),
        }
      }
    }
  }

  // ── Bonus quota ───────────────────────────────────────────────────────

  /// Grant additional quota on top of the plan's base quota.
  ///
  /// Bonus grants are always scoped to the current calendar month window
  /// regardless of the rule's configured window — a fixed policy, not
  /// configurable. Repeated grants accumulate; `used` is never touched.
  pub async fn add_bonus_quota(&self, req: BonusRequest) -> Result<BonusGrant> {
    self.add_bonus_quota_at(req, Utc::now()).await
  }

  /// [`Self::add_bonus_quota`] at an explicit instant.
  pub async fn add_bonus_quota_at(
    &self,
    req: BonusRequest,
    now: DateTime<Utc>,
  ) -> Result<BonusGrant> {
    if req.amount == 0 {
      return Err(Error::InvalidBonusAmount);
    }

    let module_key = normalize_key(&req.module_key);
    let function_key = normalize_function_key(req.function_key.as_deref());

    let instance = self
      .store
      .find_active_instance(req.subject_id, now)
      .await
      .map_err(Error::store)?
      .ok_or(Error::NoActiveSubscription(req.subject_id))?;

    // Base quota seeds the record when the grant arrives before any
    // consumption; without it the base allowance would be lost for the
    // rest of the window.
    let base_quota = instance
      .limits
      .resolve(&module_key, function_key.as_deref())
      .map(|r| r.quota)
      .unwrap_or(0);

    let window = compute_window(now, WindowUnit::Month, 1)?;
    let key = UsageKey {
      instance_id: instance.instance_id,
      subject_id: req.subject_id,
      module_key,
      function_key,
      window,
    };
    let stamp = BonusStamp {
      granted_at: now,
      source:     req.source,
      expires_at: req.expires_at,
    };

    let record = self
      .store
      .add_quota(&key, req.amount, base_quota, WindowMeta::calendar_month(), stamp)
      .await
      .map_err(Error::store)?;

    tracing::info!(
      subject = %req.subject_id,
      module = %key.module_key,
      granted = req.amount,
      quota = record.quota,
      "bonus quota granted"
    );

    Ok(BonusGrant {
      subject_id:   req.subject_id,
      module_key:   key.module_key,
      function_key: key.function_key,
      granted:      req.amount,
      quota:        record.quota,
      used:         record.used,
      remaining:    record.remaining(),
      window,
    })
  }

  /// Reset every record whose bonus has expired back to its base quota.
  ///
  /// Idempotent: a second sweep finds nothing. Intended to run on an
  /// external periodic trigger; the engine holds no state between sweeps.
  pub async fn cleanup_expired_bonus(&self) -> Result<CleanupReport> {
    self.cleanup_expired_bonus_at(Utc::now()).await
  }

  /// [`Self::cleanup_expired_bonus`] at an explicit instant.
  pub async fn cleanup_expired_bonus_at(
    &self,
    now: DateTime<Utc>,
  ) -> Result<CleanupReport> {
    let expired = self
      .store
      .expired_bonus_records(now)
      .await
      .map_err(Error::store)?;

    let mut cleaned = 0;
    for record in expired {
      let Some(instance) = self
        .store
        .get_instance(record.instance_id)
        .await
        .map_err(Error::store)?
      else {
        tracing::warn!(
          instance = %record.instance_id,
          module = %record.module_key,
          "expired bonus record references a missing instance; skipping"
        );
        continue;
      };

      let base_quota = instance
        .limits
        .resolve(&record.module_key, record.function_key.as_deref())
        .map(|r| r.quota)
        .unwrap_or(0);

      if self
        .store
        .reset_bonus(&record.key(), base_quota)
        .await
        .map_err(Error::store)?
      {
        cleaned += 1;
      }
    }

    if cleaned > 0 {
      tracing::info!(cleaned, "expired bonus quota cleaned");
    }
    Ok(CleanupReport { cleaned })
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// The subject's consumption snapshot for one capability in the current
  /// month window. `None` when the subject has no active subscription; a
  /// synthesized zero-use snapshot when no record exists yet.
  pub async fn current_usage(
    &self,
    subject_id: Uuid,
    module_key: &str,
    function_key: Option<&str>,
  ) -> Result<Option<UsageSnapshot>> {
    self
      .current_usage_at(subject_id, module_key, function_key, Utc::now())
      .await
  }

  /// [`Self::current_usage`] at an explicit instant.
  pub async fn current_usage_at(
    &self,
    subject_id: Uuid,
    module_key: &str,
    function_key: Option<&str>,
    now: DateTime<Utc>,
  ) -> Result<Option<UsageSnapshot>> {
    let module_key = normalize_key(module_key);
    let function_key = normalize_function_key(function_key);

    let Some(instance) = self
      .store
      .find_active_instance(subject_id, now)
      .await
      .map_err(Error::store)?
    else {
      return Ok(None);
    };

    let base_quota = instance
      .limits
      .resolve(&module_key, function_key.as_deref())
      .map(|r| r.quota)
      .unwrap_or(0);

    let window = compute_window(now, WindowUnit::Month, 1)?;
    let key = UsageKey {
      instance_id: instance.instance_id,
      subject_id,
      module_key,
      function_key,
      window,
    };

    let snapshot = match self.store.find_record(&key).await.map_err(Error::store)? {
      None => UsageSnapshot {
        quota: base_quota,
        base_quota,
        bonus_quota: 0,
        used: 0,
        remaining: base_quota,
        window,
        last_bonus_at: None,
        bonus_source: None,
        bonus_expires_at: None,
      },
      Some(record) => UsageSnapshot {
        quota:            record.quota,
        base_quota,
        bonus_quota:      record.quota.saturating_sub(base_quota),
        used:             record.used,
        remaining:        record.remaining(),
        window:           record.window(),
        last_bonus_at:    record.last_bonus_at,
        bonus_source:     record.bonus_source,
        bonus_expires_at: record.bonus_expires_at,
      },
    };

    Ok(Some(snapshot))
  }

  /// The subject's outstanding bonus grants in the current month window.
  /// `None` when no active subscription exists.
  pub async fn bonus_summary(
    &self,
    subject_id: Uuid,
  ) -> Result<Option<BonusSummary>> {
    self.bonus_summary_at(subject_id, Utc::now()).await
  }

  /// [`Self::bonus_summary`] at an explicit instant.
  pub async fn bonus_summary_at(
    &self,
    subject_id: Uuid,
    now: DateTime<Utc>,
  ) -> Result<Option<BonusSummary>> {
    let Some(instance) = self
      .store
      .find_active_instance(subject_id, now)
      .await
      .map_err(Error::store)?
    else {
      return Ok(None);
    };

    let window = compute_window(now, WindowUnit::Month, 1)?;
    let records = self
      .store
      .bonus_records(instance.instance_id, subject_id, window)
      .await
      .map_err(Error::store)?;

    let mut total_bonus = 0;
    let items = records
      .into_iter()
      .map(|record| {
        let base_quota = instance
          .limits
          .resolve(&record.module_key, record.function_key.as_deref())
          .map(|r| r.quota)
          .unwrap_or(0);
        let bonus = record.quota.saturating_sub(base_quota);
        total_bonus += bonus;

        BonusSummaryItem {
          module_key:   record.module_key.clone(),
          function_key: record.function_key.clone(),
          bonus,
          source:       record.bonus_source.clone(),
          granted_at:   record.last_bonus_at,
          expires_at:   record.bonus_expires_at,
          expired:      record.bonus_expires_at.is_some_and(|at| at < now),
        }
      })
      .collect();

    Ok(Some(BonusSummary { total_bonus, items }))
  }

  // ── Administrative metering ───────────────────────────────────────────

  /// Count usage after the fact, without enforcing a ceiling.
  ///
  /// The record's quota is inferred from the resolved rule on first
  /// insert so later reads still show a meaningful remaining count.
  pub async fn record_usage(&self, req: MeterRequest) -> Result<MeterReport> {
    self.record_usage_at(req, Utc::now()).await
  }

  /// [`Self::record_usage`] at an explicit instant.
  pub async fn record_usage_at(
    &self,
    req: MeterRequest,
    at: DateTime<Utc>,
  ) -> Result<MeterReport> {
    let module_key = normalize_key(&req.module_key);
    let function_key = normalize_function_key(req.function_key.as_deref());

    let instance = self
      .store
      .get_instance(req.instance_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::InstanceNotFound(req.instance_id))?;

    let inferred_quota = instance
      .limits
      .resolve(&module_key, function_key.as_deref())
      .filter(|r| r.kind == RuleKind::Count)
      .map(|r| r.quota)
      .unwrap_or(0);

    let window = compute_window(at, req.period, 1)?;
    let key = UsageKey {
      instance_id: req.instance_id,
      subject_id: req.subject_id,
      module_key,
      function_key,
      window,
    };
    let meta = WindowMeta {
      window_type: WindowType::Calendar,
      window_unit: req.period,
      window_size: 1,
    };

    let record = self
      .store
      .record_usage(&key, req.amount.max(1), meta, inferred_quota)
      .await
      .map_err(Error::store)?;

    Ok(MeterReport {
      module_key:   key.module_key,
      function_key: key.function_key,
      window:       record.window(),
      used:         record.used,
      quota:        record.quota,
    })
  }
}
