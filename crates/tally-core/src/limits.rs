//! Limitation snapshots — the rule tree a subscription plan grants, and the
//! resolver that maps a `(module, function)` capability key onto the
//! applicable rule.
//!
//! A snapshot is an owned value. Registration deep-copies it from the plan so
//! that later plan edits never affect already-issued subscriptions.

use serde::{Deserialize, Serialize};

use crate::{
  Result,
  window::{Window, WindowType, WindowUnit, compute_window},
};

// ─── Rules ───────────────────────────────────────────────────────────────────

/// What happens for capability keys with no matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
  Allow,
  #[default]
  Block,
}

/// Whether a rule meters at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
  /// No metering; consumption always succeeds and writes nothing.
  Unlimited,
  /// Windowed counter with a quota ceiling.
  Count,
}

/// A single metering rule. `window_unit`/`window_size` default to one
/// calendar month when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
  pub kind:        RuleKind,
  #[serde(default)]
  pub quota:       u64,
  pub window_unit: Option<WindowUnit>,
  pub window_size: Option<u32>,
  pub window_type: Option<WindowType>,
}

impl Rule {
  /// Convenience constructor for an unlimited rule.
  pub fn unlimited() -> Self {
    Self {
      kind:        RuleKind::Unlimited,
      quota:       0,
      window_unit: None,
      window_size: None,
      window_type: None,
    }
  }

  /// Convenience constructor for a counted rule over the given window.
  pub fn count(quota: u64, unit: WindowUnit, size: u32) -> Self {
    Self {
      kind:        RuleKind::Count,
      quota,
      window_unit: Some(unit),
      window_size: Some(size),
      window_type: Some(WindowType::Calendar),
    }
  }

  pub fn window_unit_or_default(&self) -> WindowUnit {
    self.window_unit.unwrap_or(WindowUnit::Month)
  }

  pub fn window_size_or_default(&self) -> u32 {
    self.window_size.unwrap_or(1)
  }

  /// The calendar window active at `now` under this rule.
  ///
  /// Rules demanding a `rolling` window are rejected: no rolling
  /// computation exists, and mis-computing a calendar window instead would
  /// silently change the rule's meaning.
  pub fn active_window(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Window> {
    if self.window_type == Some(WindowType::Rolling) {
      return Err(crate::Error::RollingWindowUnsupported);
    }
    compute_window(now, self.window_unit_or_default(), self.window_size_or_default())
  }
}

/// A rule scoped to one function inside a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRule {
  pub key:  String,
  #[serde(flatten)]
  pub rule: Rule,
}

/// All rules for one module: an optional module-wide rule plus any number of
/// function-level rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleLimits {
  pub key:         String,
  pub module_rule: Option<Rule>,
  #[serde(default)]
  pub functions:   Vec<FunctionRule>,
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// The complete limitation tree granted by a plan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LimitSnapshot {
  #[serde(default)]
  pub default_action: DefaultAction,
  #[serde(default)]
  pub modules:        Vec<ModuleLimits>,
}

impl LimitSnapshot {
  /// Find the rule applicable to `(module_key, function_key)`.
  ///
  /// Function-level rules win; a module-level rule is the fallback when the
  /// function has no rule of its own. `None` means the caller must apply
  /// [`DefaultAction`]. Keys are compared case-insensitively after trimming.
  pub fn resolve(
    &self,
    module_key: &str,
    function_key: Option<&str>,
  ) -> Option<&Rule> {
    let module_key = normalize_key(module_key);
    let module = self
      .modules
      .iter()
      .find(|m| normalize_key(&m.key) == module_key)?;

    match function_key {
      Some(fk) => {
        let fk = normalize_key(fk);
        module
          .functions
          .iter()
          .find(|f| normalize_key(&f.key) == fk)
          .map(|f| &f.rule)
          .or(module.module_rule.as_ref())
      }
      None => module.module_rule.as_ref(),
    }
  }

  /// Serialise for the `limits_json` database column.
  pub fn to_json(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }

  /// Deserialise from the `limits_json` database column.
  pub fn from_json(s: &str) -> Result<Self> {
    Ok(serde_json::from_str(s)?)
  }
}

/// Canonical form for module and function keys: trimmed, lowercased.
/// Applied to both sides of every comparison and to every persisted key.
pub fn normalize_key(key: &str) -> String {
  key.trim().to_ascii_lowercase()
}

/// Canonical form for an optional function key. Empty and whitespace-only
/// keys collapse to `None` (module-level).
pub fn normalize_function_key(key: Option<&str>) -> Option<String> {
  key
    .map(normalize_key)
    .filter(|k| !k.is_empty())
}
