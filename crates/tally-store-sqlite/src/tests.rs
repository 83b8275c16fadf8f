//! Integration tests for the ledger engine against an in-memory database.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tally_core::{
  UsageLedger,
  ledger::{BonusRequest, ConsumeRequest, DenyReason, EngineConfig, MeterRequest},
  limits::{
    DefaultAction, FunctionRule, LimitSnapshot, ModuleLimits, Rule, RuleKind,
  },
  plan::{DurationUnit, NewPlan, Plan, PlanStatus},
  store::{
    InsertOutcome, PlanInsertOutcome, PlanStore, RegisterOutcome,
    SubscriptionStore, UsageStore,
  },
  subscription::{InstanceStatus, NewSubscription, PlanRef, SubscriptionInstance},
  usage::{UsageKey, UsageRecord},
  window::{WindowType, WindowUnit, compute_window},
};
use uuid::Uuid;

use crate::SqliteStore;

// ─── Fixtures ────────────────────────────────────────────────────────────────

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn at(s: &str) -> DateTime<Utc> {
  DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// The fixed "now" used throughout: mid-day, mid-month, mid-week.
fn now() -> DateTime<Utc> {
  at("2024-03-10T12:00:00Z")
}

/// `pack` module: 100/month module-wide, 3/day for `create`, unlimited
/// `export`.
fn pack_limits() -> LimitSnapshot {
  LimitSnapshot {
    default_action: DefaultAction::Block,
    modules:        vec![ModuleLimits {
      key:         "pack".into(),
      module_rule: Some(Rule::count(100, WindowUnit::Month, 1)),
      functions:   vec![
        FunctionRule {
          key:  "create".into(),
          rule: Rule::count(3, WindowUnit::Day, 1),
        },
        FunctionRule { key: "export".into(), rule: Rule::unlimited() },
      ],
    }],
  }
}

fn single_rule_limits(function_key: &str, rule: Rule) -> LimitSnapshot {
  LimitSnapshot {
    default_action: DefaultAction::Block,
    modules:        vec![ModuleLimits {
      key:         "pack".into(),
      module_rule: None,
      functions:   vec![FunctionRule { key: function_key.into(), rule }],
    }],
  }
}

async fn seed_plan(s: &SqliteStore, code: &str, limits: LimitSnapshot) -> Plan {
  let outcome = s
    .add_plan(NewPlan {
      name: code.to_owned(),
      code: code.to_owned(),
      price: 0,
      description: None,
      duration: 12,
      duration_unit: DurationUnit::Month,
      limits,
      status: PlanStatus::Active,
    })
    .await
    .unwrap();
  match outcome {
    PlanInsertOutcome::Created(plan) => plan,
    PlanInsertOutcome::CodeExists => panic!("plan code {code:?} taken"),
  }
}

async fn register_subject(
  s: &SqliteStore,
  code: &str,
  subject_id: Uuid,
) -> SubscriptionInstance {
  let outcome = s
    .register(NewSubscription {
      subject_id,
      plan: PlanRef::ByCode(code.to_owned()),
      start_at: Some(at("2024-03-01T00:00:00Z")),
      duration_override: None,
      duration_unit: None,
      replace_current: false,
    })
    .await
    .unwrap();
  match outcome {
    RegisterOutcome::Registered(instance) => instance,
    other => panic!("registration failed: {other:?}"),
  }
}

fn ledger(s: &SqliteStore) -> UsageLedger<SqliteStore> {
  UsageLedger::new(s.clone(), EngineConfig::default())
}

fn consume_create(instance_id: Uuid, subject_id: Uuid) -> ConsumeRequest {
  ConsumeRequest {
    instance_id,
    subject_id,
    module_key: "pack".into(),
    function_key: Some("create".into()),
  }
}

fn bonus(subject_id: Uuid, amount: u64) -> BonusRequest {
  BonusRequest {
    subject_id,
    module_key: "pack".into(),
    function_key: Some("create".into()),
    amount,
    source: "ad_reward".into(),
    expires_at: None,
  }
}

// ─── Consume ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn daily_quota_scenario() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  // Three units per day: remaining counts down 2, 1, 0.
  for expected in [2u64, 1, 0] {
    let d = l
      .check_and_consume_at(consume_create(instance.instance_id, subject), now())
      .await
      .unwrap();
    assert!(d.allowed);
    assert_eq!(d.remaining, Some(expected));
    assert_eq!(d.reset_at, Some(at("2024-03-11T00:00:00Z")));
  }

  // Fourth call the same day is denied.
  let d = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), now())
    .await
    .unwrap();
  assert!(!d.allowed);
  assert_eq!(d.reason, Some(DenyReason::QuotaExceeded));
  assert_eq!(d.remaining, Some(0));

  // A new day is a new window and a fresh record.
  let tomorrow = now() + TimeDelta::days(1);
  let d = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), tomorrow)
    .await
    .unwrap();
  assert!(d.allowed);
  assert_eq!(d.remaining, Some(2));
}

#[tokio::test]
async fn unknown_instance_denies() {
  let s = store().await;
  let l = ledger(&s);

  let d = l
    .check_and_consume_at(consume_create(Uuid::new_v4(), Uuid::new_v4()), now())
    .await
    .unwrap();
  assert!(!d.allowed);
  assert_eq!(d.reason, Some(DenyReason::SubscriptionNotFound));
}

#[tokio::test]
async fn unlimited_rule_writes_no_record() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  let d = l
    .check_and_consume_at(
      ConsumeRequest {
        instance_id: instance.instance_id,
        subject_id: subject,
        module_key: "pack".into(),
        function_key: Some("export".into()),
      },
      now(),
    )
    .await
    .unwrap();
  assert!(d.allowed);
  assert!(d.remaining.is_none());
  assert!(d.reset_at.is_none());

  // Nothing landed in the ledger.
  let key = UsageKey {
    instance_id:  instance.instance_id,
    subject_id:   subject,
    module_key:   "pack".into(),
    function_key: Some("export".into()),
    window:       compute_window(now(), WindowUnit::Month, 1).unwrap(),
  };
  assert!(s.find_record(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn missing_rule_applies_default_action() {
  let s = store().await;

  // default_action = block
  seed_plan(&s, "blocking", pack_limits()).await;
  let blocked_subject = Uuid::new_v4();
  let blocked = register_subject(&s, "blocking", blocked_subject).await;

  // default_action = allow
  let permissive = LimitSnapshot {
    default_action: DefaultAction::Allow,
    modules:        vec![],
  };
  seed_plan(&s, "permissive", permissive).await;
  let allowed_subject = Uuid::new_v4();
  let allowed = register_subject(&s, "permissive", allowed_subject).await;

  let l = ledger(&s);

  let d = l
    .check_and_consume_at(
      ConsumeRequest {
        instance_id: blocked.instance_id,
        subject_id: blocked_subject,
        module_key: "billing".into(),
        function_key: None,
      },
      now(),
    )
    .await
    .unwrap();
  assert!(!d.allowed);
  assert_eq!(d.reason, Some(DenyReason::NoRule));

  let d = l
    .check_and_consume_at(
      ConsumeRequest {
        instance_id: allowed.instance_id,
        subject_id: allowed_subject,
        module_key: "billing".into(),
        function_key: None,
      },
      now(),
    )
    .await
    .unwrap();
  assert!(d.allowed);
  assert!(d.remaining.is_none());
}

#[tokio::test]
async fn zero_quota_rule_denies_without_creating_a_record() {
  let s = store().await;
  seed_plan(
    &s,
    "zero",
    single_rule_limits("create", Rule::count(0, WindowUnit::Day, 1)),
  )
  .await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "zero", subject).await;
  let l = ledger(&s);

  let d = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), now())
    .await
    .unwrap();
  assert!(!d.allowed);
  assert_eq!(d.reason, Some(DenyReason::QuotaZero));

  let key = UsageKey {
    instance_id:  instance.instance_id,
    subject_id:   subject,
    module_key:   "pack".into(),
    function_key: Some("create".into()),
    window:       compute_window(now(), WindowUnit::Day, 1).unwrap(),
  };
  assert!(s.find_record(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn keys_are_normalized_before_lookup() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  let d = l
    .check_and_consume_at(
      ConsumeRequest {
        instance_id: instance.instance_id,
        subject_id: subject,
        module_key: "  Pack ".into(),
        function_key: Some(" CREATE ".into()),
      },
      now(),
    )
    .await
    .unwrap();
  assert!(d.allowed);
  assert_eq!(d.remaining, Some(2));

  // The shouty spelling hit the same counter.
  let d = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), now())
    .await
    .unwrap();
  assert_eq!(d.remaining, Some(1));
}

#[tokio::test]
async fn rolling_window_rule_is_rejected() {
  let rolling = Rule {
    kind:        RuleKind::Count,
    quota:       5,
    window_unit: Some(WindowUnit::Day),
    window_size: Some(1),
    window_type: Some(WindowType::Rolling),
  };
  let s = store().await;
  seed_plan(&s, "rolling", single_rule_limits("create", rolling)).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "rolling", subject).await;
  let l = ledger(&s);

  let err = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), now())
    .await
    .unwrap_err();
  assert!(matches!(err, tally_core::Error::RollingWindowUnsupported));
}

#[tokio::test]
async fn lifetime_window_never_resets() {
  let s = store().await;
  seed_plan(
    &s,
    "lifetime",
    single_rule_limits("create", Rule::count(2, WindowUnit::Lifetime, 1)),
  )
  .await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "lifetime", subject).await;
  let l = ledger(&s);

  let d = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), now())
    .await
    .unwrap();
  assert_eq!(d.remaining, Some(1));

  // Nearly a year later: same window, same counter.
  let later = now() + TimeDelta::days(300);
  let d = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), later)
    .await
    .unwrap();
  assert_eq!(d.remaining, Some(0));

  let d = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), later)
    .await
    .unwrap();
  assert!(!d.allowed);
  assert_eq!(d.reason, Some(DenyReason::QuotaExceeded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumes_never_overcommit() {
  let s = store().await;
  seed_plan(
    &s,
    "burst",
    single_rule_limits("create", Rule::count(10, WindowUnit::Day, 1)),
  )
  .await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "burst", subject).await;
  let l = Arc::new(ledger(&s));

  let mut handles = Vec::new();
  for _ in 0..32 {
    let l = Arc::clone(&l);
    let req = consume_create(instance.instance_id, subject);
    handles.push(tokio::spawn(async move {
      l.check_and_consume_at(req, now()).await.unwrap().allowed
    }));
  }

  let mut allowed = 0;
  for handle in handles {
    if handle.await.unwrap() {
      allowed += 1;
    }
  }
  assert_eq!(allowed, 10);

  // The winners all landed on a single record, capped at its quota.
  let key = UsageKey {
    instance_id:  instance.instance_id,
    subject_id:   subject,
    module_key:   "pack".into(),
    function_key: Some("create".into()),
    window:       compute_window(now(), WindowUnit::Day, 1).unwrap(),
  };
  let record = s.find_record(&key).await.unwrap().unwrap();
  assert_eq!(record.used, 10);
  assert_eq!(record.quota, 10);
}

// ─── Bonus quota ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn bonus_accumulates_and_preserves_used() {
  let s = store().await;
  seed_plan(
    &s,
    "base10",
    single_rule_limits("create", Rule::count(10, WindowUnit::Month, 1)),
  )
  .await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "base10", subject).await;
  let l = ledger(&s);

  let g = l.add_bonus_quota_at(bonus(subject, 5), now()).await.unwrap();
  assert_eq!(g.quota, 15);
  assert_eq!(g.used, 0);

  let g = l.add_bonus_quota_at(bonus(subject, 3), now()).await.unwrap();
  assert_eq!(g.quota, 18);
  assert_eq!(g.used, 0);
  assert_eq!(g.remaining, 18);

  // Base allowance survives: the grants seeded base + bonus, so a consume
  // draws from 18.
  let d = l
    .check_and_consume_at(consume_create(instance.instance_id, subject), now())
    .await
    .unwrap();
  assert!(d.allowed);
  assert_eq!(d.remaining, Some(17));
}

#[tokio::test]
async fn bonus_after_consumption_tops_up_the_existing_record() {
  let s = store().await;
  seed_plan(
    &s,
    "base10",
    single_rule_limits("create", Rule::count(10, WindowUnit::Month, 1)),
  )
  .await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "base10", subject).await;
  let l = ledger(&s);

  l.check_and_consume_at(consume_create(instance.instance_id, subject), now())
    .await
    .unwrap();

  let g = l.add_bonus_quota_at(bonus(subject, 4), now()).await.unwrap();
  assert_eq!(g.quota, 14);
  assert_eq!(g.used, 1);
  assert_eq!(g.remaining, 13);
}

#[tokio::test]
async fn bonus_without_active_subscription_errors() {
  let s = store().await;
  let l = ledger(&s);

  let err = l
    .add_bonus_quota_at(bonus(Uuid::new_v4(), 5), now())
    .await
    .unwrap_err();
  assert!(matches!(err, tally_core::Error::NoActiveSubscription(_)));
}

#[tokio::test]
async fn zero_bonus_amount_is_rejected() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  let err = l
    .add_bonus_quota_at(bonus(subject, 0), now())
    .await
    .unwrap_err();
  assert!(matches!(err, tally_core::Error::InvalidBonusAmount));
}

#[tokio::test]
async fn expired_bonus_cleanup_resets_quota_but_not_used() {
  let s = store().await;
  seed_plan(
    &s,
    "base10",
    single_rule_limits("create", Rule::count(10, WindowUnit::Month, 1)),
  )
  .await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "base10", subject).await;
  let l = ledger(&s);

  for _ in 0..7 {
    let d = l
      .check_and_consume_at(consume_create(instance.instance_id, subject), now())
      .await
      .unwrap();
    assert!(d.allowed);
  }

  let mut grant = bonus(subject, 5);
  grant.expires_at = Some(now() - TimeDelta::hours(1));
  let g = l.add_bonus_quota_at(grant, now()).await.unwrap();
  assert_eq!(g.quota, 15);
  assert_eq!(g.used, 7);

  let report = l.cleanup_expired_bonus_at(now()).await.unwrap();
  assert_eq!(report.cleaned, 1);

  let snapshot = l
    .current_usage_at(subject, "pack", Some("create"), now())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(snapshot.quota, 10);
  assert_eq!(snapshot.used, 7);
  assert_eq!(snapshot.remaining, 3);
  assert_eq!(snapshot.bonus_quota, 0);
  assert!(snapshot.bonus_source.is_none());
  assert!(snapshot.bonus_expires_at.is_none());

  // The sweep is idempotent.
  let report = l.cleanup_expired_bonus_at(now()).await.unwrap();
  assert_eq!(report.cleaned, 0);
}

#[tokio::test]
async fn unexpired_bonus_survives_cleanup() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  let mut grant = bonus(subject, 5);
  grant.expires_at = Some(now() + TimeDelta::hours(1));
  l.add_bonus_quota_at(grant, now()).await.unwrap();

  let report = l.cleanup_expired_bonus_at(now()).await.unwrap();
  assert_eq!(report.cleaned, 0);

  let snapshot = l
    .current_usage_at(subject, "pack", Some("create"), now())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(snapshot.bonus_quota, 5);
}

#[tokio::test]
async fn bonus_summary_reports_outstanding_grants() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  let mut expired = bonus(subject, 5);
  expired.expires_at = Some(now() - TimeDelta::hours(1));
  l.add_bonus_quota_at(expired, now()).await.unwrap();

  let mut live = bonus(subject, 2);
  live.function_key = None; // module-level grant
  live.expires_at = Some(now() + TimeDelta::days(30));
  l.add_bonus_quota_at(live, now()).await.unwrap();

  let summary = l.bonus_summary_at(subject, now()).await.unwrap().unwrap();
  assert_eq!(summary.items.len(), 2);
  assert_eq!(summary.total_bonus, 7);

  let expired_item = summary
    .items
    .iter()
    .find(|i| i.function_key.as_deref() == Some("create"))
    .unwrap();
  assert!(expired_item.expired);
  assert_eq!(expired_item.bonus, 5);

  let live_item = summary
    .items
    .iter()
    .find(|i| i.function_key.is_none())
    .unwrap();
  assert!(!live_item.expired);
  assert_eq!(live_item.bonus, 2);
}

// ─── Usage snapshots ─────────────────────────────────────────────────────────

#[tokio::test]
async fn usage_snapshot_synthesizes_before_first_consume() {
  let s = store().await;
  seed_plan(
    &s,
    "base10",
    single_rule_limits("create", Rule::count(10, WindowUnit::Month, 1)),
  )
  .await;
  let subject = Uuid::new_v4();
  register_subject(&s, "base10", subject).await;
  let l = ledger(&s);

  let snapshot = l
    .current_usage_at(subject, "pack", Some("create"), now())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(snapshot.quota, 10);
  assert_eq!(snapshot.base_quota, 10);
  assert_eq!(snapshot.used, 0);
  assert_eq!(snapshot.remaining, 10);
  assert_eq!(
    snapshot.window,
    compute_window(now(), WindowUnit::Month, 1).unwrap()
  );
}

#[tokio::test]
async fn usage_snapshot_none_without_subscription() {
  let s = store().await;
  let l = ledger(&s);

  let snapshot = l
    .current_usage_at(Uuid::new_v4(), "pack", Some("create"), now())
    .await
    .unwrap();
  assert!(snapshot.is_none());
}

// ─── Capabilities ────────────────────────────────────────────────────────────

#[tokio::test]
async fn capabilities_project_every_rule() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  l.check_and_consume_at(consume_create(instance.instance_id, subject), now())
    .await
    .unwrap();

  let set = l
    .build_capabilities_at(instance.instance_id, subject, now())
    .await
    .unwrap();
  assert_eq!(set.default_action, DefaultAction::Block);
  assert_eq!(set.items.len(), 3);

  let module_item = set
    .items
    .iter()
    .find(|i| i.function_key.is_none())
    .unwrap();
  assert_eq!(module_item.quota, Some(100));
  assert_eq!(module_item.remaining, Some(100));

  let create = set
    .items
    .iter()
    .find(|i| i.function_key.as_deref() == Some("create"))
    .unwrap();
  assert_eq!(create.base_quota, Some(3));
  assert_eq!(create.remaining, Some(2));
  assert_eq!(create.reset_at, Some(at("2024-03-11T00:00:00Z")));

  let export = set
    .items
    .iter()
    .find(|i| i.function_key.as_deref() == Some("export"))
    .unwrap();
  assert!(export.quota.is_none());
  assert!(export.remaining.is_none());
  assert!(export.reset_at.is_none());
}

#[tokio::test]
async fn capabilities_include_bonus_split() {
  let s = store().await;
  seed_plan(
    &s,
    "base10",
    single_rule_limits("create", Rule::count(10, WindowUnit::Month, 1)),
  )
  .await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "base10", subject).await;
  let l = ledger(&s);

  l.add_bonus_quota_at(bonus(subject, 5), now()).await.unwrap();

  let set = l
    .build_capabilities_at(instance.instance_id, subject, now())
    .await
    .unwrap();
  let create = set
    .items
    .iter()
    .find(|i| i.function_key.as_deref() == Some("create"))
    .unwrap();
  assert_eq!(create.quota, Some(15));
  assert_eq!(create.base_quota, Some(10));
  assert_eq!(create.bonus_quota, Some(5));
  assert_eq!(create.remaining, Some(15));
}

#[tokio::test]
async fn bypass_subject_short_circuits_projection() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;

  let l = UsageLedger::new(
    s.clone(),
    EngineConfig { bypass_subject_id: Some(subject) },
  );

  let set = l
    .build_capabilities_at(instance.instance_id, subject, now())
    .await
    .unwrap();
  assert_eq!(set.default_action, DefaultAction::Allow);
  assert!(set.items.is_empty());
}

#[tokio::test]
async fn capabilities_for_unknown_instance_block() {
  let s = store().await;
  let l = ledger(&s);

  let set = l
    .build_capabilities_at(Uuid::new_v4(), Uuid::new_v4(), now())
    .await
    .unwrap();
  assert_eq!(set.default_action, DefaultAction::Block);
  assert!(set.items.is_empty());
}

// ─── Registrar ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_registration_is_rejected() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let first = register_subject(&s, "basic", subject).await;

  let outcome = s
    .register(NewSubscription {
      subject_id:        subject,
      plan:              PlanRef::ByCode("basic".into()),
      start_at:          Some(at("2024-06-01T00:00:00Z")),
      duration_override: None,
      duration_unit:     None,
      replace_current:   false,
    })
    .await
    .unwrap();

  match outcome {
    RegisterOutcome::OverlappingActive { existing } => {
      assert_eq!(existing, first.instance_id);
    }
    other => panic!("expected overlap rejection, got {other:?}"),
  }
}

#[tokio::test]
async fn replace_current_cancels_the_previous_instance() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let first = register_subject(&s, "basic", subject).await;

  let outcome = s
    .register(NewSubscription {
      subject_id:        subject,
      plan:              PlanRef::ByCode("basic".into()),
      start_at:          Some(at("2024-06-01T00:00:00Z")),
      duration_override: None,
      duration_unit:     None,
      replace_current:   true,
    })
    .await
    .unwrap();
  let second = match outcome {
    RegisterOutcome::Registered(instance) => instance,
    other => panic!("registration failed: {other:?}"),
  };

  let old = s.get_instance(first.instance_id).await.unwrap().unwrap();
  assert_eq!(old.status, InstanceStatus::Canceled);

  let active = s
    .find_active_instance(subject, at("2024-06-15T00:00:00Z"))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(active.instance_id, second.instance_id);
}

#[tokio::test]
async fn registering_an_unknown_plan_reports_not_found() {
  let s = store().await;

  let outcome = s
    .register(NewSubscription {
      subject_id:        Uuid::new_v4(),
      plan:              PlanRef::ByCode("nope".into()),
      start_at:          None,
      duration_override: None,
      duration_unit:     None,
      replace_current:   false,
    })
    .await
    .unwrap();
  assert!(matches!(outcome, RegisterOutcome::PlanNotFound));
}

#[tokio::test]
async fn instance_snapshot_is_immune_to_plan_edits() {
  let s = store().await;
  let plan = seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;

  // Retune the plan after the instance was issued.
  s.update_plan_limits(
    plan.plan_id,
    single_rule_limits("create", Rule::count(99, WindowUnit::Day, 1)),
  )
  .await
  .unwrap()
  .unwrap();

  let stored = s.get_instance(instance.instance_id).await.unwrap().unwrap();
  let rule = stored.limits.resolve("pack", Some("create")).unwrap();
  assert_eq!(rule.quota, 3);

  // A fresh registration picks up the new tree.
  let other_subject = Uuid::new_v4();
  let fresh = register_subject(&s, "basic", other_subject).await;
  let rule = fresh.limits.resolve("pack", Some("create")).unwrap();
  assert_eq!(rule.quota, 99);
}

#[tokio::test]
async fn duplicate_plan_code_is_reported() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;

  let outcome = s
    .add_plan(NewPlan {
      name: "Basic again".into(),
      code: "basic".into(),
      price: 0,
      description: None,
      duration: 1,
      duration_unit: DurationUnit::Month,
      limits: pack_limits(),
      status: PlanStatus::Active,
    })
    .await
    .unwrap();
  assert!(matches!(outcome, PlanInsertOutcome::CodeExists));
}

// ─── Administrative metering ─────────────────────────────────────────────────

#[tokio::test]
async fn record_usage_upserts_the_counter() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  let meter = |amount| MeterRequest {
    instance_id:  instance.instance_id,
    subject_id:   subject,
    module_key:   "pack".into(),
    function_key: Some("create".into()),
    period:       WindowUnit::Day,
    amount,
  };

  let report = l.record_usage_at(meter(2), now()).await.unwrap();
  assert_eq!(report.used, 2);
  assert_eq!(report.quota, 3); // inferred from the create rule

  let report = l.record_usage_at(meter(3), now()).await.unwrap();
  assert_eq!(report.used, 5); // no ceiling on the administrative path
}

#[tokio::test]
async fn record_usage_for_unknown_instance_errors() {
  let s = store().await;
  let l = ledger(&s);

  let err = l
    .record_usage_at(
      MeterRequest {
        instance_id:  Uuid::new_v4(),
        subject_id:   Uuid::new_v4(),
        module_key:   "pack".into(),
        function_key: None,
        period:       WindowUnit::Day,
        amount:       1,
      },
      now(),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, tally_core::Error::InstanceNotFound(_)));
}

// ─── Store primitives ────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_conflicts_and_guarded_increments() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;

  let window = compute_window(now(), WindowUnit::Day, 1).unwrap();
  let record = UsageRecord {
    instance_id:      instance.instance_id,
    subject_id:       subject,
    module_key:       "pack".into(),
    function_key:     Some("create".into()),
    window_type:      WindowType::Calendar,
    window_unit:      WindowUnit::Day,
    window_size:      1,
    window_start:     window.start,
    window_end:       window.end,
    used:             1,
    quota:            1,
    last_bonus_at:    None,
    bonus_source:     None,
    bonus_expires_at: None,
  };

  let outcome = s.insert_record(record.clone()).await.unwrap();
  assert!(matches!(outcome, InsertOutcome::Inserted(_)));

  // Same composite key: the unique index rejects the duplicate.
  let outcome = s.insert_record(record.clone()).await.unwrap();
  assert!(matches!(outcome, InsertOutcome::Conflict));

  // used == quota: the guarded increment matches no row.
  assert!(s.consume_one(&record.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn module_level_records_share_one_row() {
  let s = store().await;
  seed_plan(&s, "basic", pack_limits()).await;
  let subject = Uuid::new_v4();
  let instance = register_subject(&s, "basic", subject).await;
  let l = ledger(&s);

  // Module-level consumption (no function key) twice in the month window.
  let req = ConsumeRequest {
    instance_id:  instance.instance_id,
    subject_id:   subject,
    module_key:   "pack".into(),
    function_key: None,
  };
  l.check_and_consume_at(req.clone(), now()).await.unwrap();
  l.check_and_consume_at(req, now()).await.unwrap();

  let key = UsageKey {
    instance_id:  instance.instance_id,
    subject_id:   subject,
    module_key:   "pack".into(),
    function_key: None,
    window:       compute_window(now(), WindowUnit::Month, 1).unwrap(),
  };
  let record = s.find_record(&key).await.unwrap().unwrap();
  assert_eq!(record.used, 2);
  assert_eq!(record.quota, 100);
}
