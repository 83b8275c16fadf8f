//! Usage records — the persisted counter entities the ledger mutates.
//!
//! A record is uniquely identified by its composite key: `(subscription
//! instance, subject, module, function-or-null, window)`. Records are
//! created lazily on first consumption or first bonus grant, never deleted,
//! and superseded by records for later windows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::window::{Window, WindowType, WindowUnit};

// ─── Key ─────────────────────────────────────────────────────────────────────

/// The composite identity of a usage record. Module and function keys are
/// stored in normalized (trimmed, lowercased) form; a `None` function key
/// marks a module-level counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageKey {
  pub instance_id:  Uuid,
  pub subject_id:   Uuid,
  pub module_key:   String,
  pub function_key: Option<String>,
  pub window:       Window,
}

// ─── Record ──────────────────────────────────────────────────────────────────

/// A windowed usage counter.
///
/// `quota` is the TOTAL currently-grantable quota (base + active bonus);
/// `used` is monotonically non-decreasing within the window. `used <= quota`
/// holds after every successful consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
  pub instance_id:      Uuid,
  pub subject_id:       Uuid,
  pub module_key:       String,
  pub function_key:     Option<String>,
  pub window_type:      WindowType,
  pub window_unit:      WindowUnit,
  pub window_size:      u32,
  pub window_start:     DateTime<Utc>,
  pub window_end:       DateTime<Utc>,
  pub used:             u64,
  pub quota:            u64,
  pub last_bonus_at:    Option<DateTime<Utc>>,
  pub bonus_source:     Option<String>,
  pub bonus_expires_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
  pub fn remaining(&self) -> u64 {
    self.quota.saturating_sub(self.used)
  }

  pub fn window(&self) -> Window {
    Window { start: self.window_start, end: self.window_end }
  }

  pub fn key(&self) -> UsageKey {
    UsageKey {
      instance_id:  self.instance_id,
      subject_id:   self.subject_id,
      module_key:   self.module_key.clone(),
      function_key: self.function_key.clone(),
      window:       self.window(),
    }
  }
}

// ─── Store inputs ────────────────────────────────────────────────────────────

/// Window attributes stamped onto a record when it is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMeta {
  pub window_type: WindowType,
  pub window_unit: WindowUnit,
  pub window_size: u32,
}

impl WindowMeta {
  /// The fixed shape of bonus-grant windows: one calendar month.
  pub fn calendar_month() -> Self {
    Self {
      window_type: WindowType::Calendar,
      window_unit: WindowUnit::Month,
      window_size: 1,
    }
  }
}

/// Bonus metadata written by every grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusStamp {
  pub granted_at: DateTime<Utc>,
  pub source:     String,
  pub expires_at: Option<DateTime<Utc>>,
}

// ─── Read models ─────────────────────────────────────────────────────────────

/// Point-in-time view of one capability's consumption, including the bonus
/// split. Returned by `current_usage`; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
  pub quota:            u64,
  pub base_quota:       u64,
  pub bonus_quota:      u64,
  pub used:             u64,
  pub remaining:        u64,
  pub window:           Window,
  pub last_bonus_at:    Option<DateTime<Utc>>,
  pub bonus_source:     Option<String>,
  pub bonus_expires_at: Option<DateTime<Utc>>,
}
