//! Error types for `tally-core`.
//!
//! Policy denials (quota exceeded, no applicable rule, ...) are NOT errors —
//! they are returned as [`ConsumeDecision`](crate::ledger::ConsumeDecision)
//! values. This enum covers genuine fault conditions only.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  /// The subject has no `active` subscription instance covering "now".
  /// Raised by bonus grants and usage snapshots, which have no sensible
  /// "denied" semantics.
  #[error("no active subscription for subject {0}")]
  NoActiveSubscription(Uuid),

  /// A subscription instance id that does not exist was named explicitly.
  #[error("subscription instance not found: {0}")]
  InstanceNotFound(Uuid),

  /// A stored rule or record carries a window unit outside the supported
  /// vocabulary. Configuration error; surfaced, never silently defaulted.
  #[error("invalid window unit: {0:?}")]
  InvalidWindowUnit(String),

  /// `rolling` windows are persisted as record metadata but no rolling
  /// computation exists; a rule demanding one is rejected rather than
  /// silently mis-computed as a calendar window.
  #[error("rolling windows are not supported")]
  RollingWindowUnsupported,

  /// Window arithmetic left the representable time range.
  #[error("window arithmetic out of range")]
  WindowOutOfRange,

  /// Bonus grants must add at least one unit.
  #[error("bonus amount must be positive")]
  InvalidBonusAmount,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A fault propagated from the backing store.
  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  /// Wrap a store backend error.
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
