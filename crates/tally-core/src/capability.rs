//! Capability projection — the read-only view of everything a subscription
//! grants, with live remaining counts. Consumed by UI and policy layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  ledger::UsageLedger,
  limits::{DefaultAction, Rule, RuleKind},
  store::{SubscriptionStore, UsageStore},
  usage::UsageKey,
};

/// One projected capability. For `count` rules the quota fields reflect the
/// current window's record when one exists (bonus included); `unlimited`
/// rules project `None` throughout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityItem {
  pub module_key:   String,
  /// `None` for a module-level rule.
  pub function_key: Option<String>,
  pub kind:         RuleKind,
  /// Total currently-grantable quota, base + bonus.
  pub quota:        Option<u64>,
  pub base_quota:   Option<u64>,
  pub bonus_quota:  Option<u64>,
  pub remaining:    Option<u64>,
  pub reset_at:     Option<DateTime<Utc>>,
}

/// The full capability view for a subject under one subscription instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySet {
  pub default_action: DefaultAction,
  pub items:          Vec<CapabilityItem>,
}

impl<S> UsageLedger<S>
where
  S: SubscriptionStore + UsageStore,
{
  /// Project every module- and function-level rule in the instance's
  /// snapshot. Read-only: no record is ever created.
  ///
  /// The configured bypass subject short-circuits to `{allow, []}`. An
  /// unknown instance projects `{block, []}` rather than failing, so policy
  /// layers can treat the result uniformly.
  pub async fn build_capabilities(
    &self,
    instance_id: Uuid,
    subject_id: Uuid,
  ) -> Result<CapabilitySet> {
    self.build_capabilities_at(instance_id, subject_id, Utc::now()).await
  }

  /// [`Self::build_capabilities`] at an explicit instant.
  pub async fn build_capabilities_at(
    &self,
    instance_id: Uuid,
    subject_id: Uuid,
    now: DateTime<Utc>,
  ) -> Result<CapabilitySet> {
    if self.config().bypass_subject_id == Some(subject_id) {
      return Ok(CapabilitySet {
        default_action: DefaultAction::Allow,
        items:          Vec::new(),
      });
    }

    let store = self.raw_store();
    let Some(instance) =
      store.get_instance(instance_id).await.map_err(Error::store)?
    else {
      return Ok(CapabilitySet {
        default_action: DefaultAction::Block,
        items:          Vec::new(),
      });
    };

    let mut items = Vec::new();
    for module in &instance.limits.modules {
      if let Some(rule) = &module.module_rule {
        items.push(
          self
            .project(instance_id, subject_id, &module.key, None, rule, now)
            .await?,
        );
      }
      for function in &module.functions {
        items.push(
          self
            .project(
              instance_id,
              subject_id,
              &module.key,
              Some(&function.key),
              &function.rule,
              now,
            )
            .await?,
        );
      }
    }

    Ok(CapabilitySet { default_action: instance.limits.default_action, items })
  }

  async fn project(
    &self,
    instance_id: Uuid,
    subject_id: Uuid,
    module_key: &str,
    function_key: Option<&str>,
    rule: &Rule,
    now: DateTime<Utc>,
  ) -> Result<CapabilityItem> {
    let module_key = crate::limits::normalize_key(module_key);
    let function_key = crate::limits::normalize_function_key(function_key);

    if rule.kind == RuleKind::Unlimited {
      return Ok(CapabilityItem {
        module_key,
        function_key,
        kind: RuleKind::Unlimited,
        quota: None,
        base_quota: None,
        bonus_quota: None,
        remaining: None,
        reset_at: None,
      });
    }

    let window = rule.active_window(now)?;
    let key = UsageKey {
      instance_id,
      subject_id,
      module_key: module_key.clone(),
      function_key: function_key.clone(),
      window,
    };

    let (quota, used) =
      match self.raw_store().find_record(&key).await.map_err(Error::store)? {
        Some(record) => (record.quota, record.used),
        None => (rule.quota, 0),
      };

    Ok(CapabilityItem {
      module_key,
      function_key,
      kind: RuleKind::Count,
      quota: Some(quota),
      base_quota: Some(rule.quota),
      bonus_quota: Some(quota.saturating_sub(rule.quota)),
      remaining: Some(quota.saturating_sub(used)),
      reset_at: Some(window.end),
    })
  }
}
