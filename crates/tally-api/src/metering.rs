//! Handlers for the metering endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/consume` | One unit per call; returns the decision |
//! | `POST` | `/bonus` | Grant bonus quota; 409 without an active subscription |
//! | `GET`  | `/bonus/summary` | `?subject_id=<id>` |
//! | `GET`  | `/usage` | `?subject_id&module_key[&function_key]`; 404 without subscription |
//! | `POST` | `/usage/record` | Administrative metering, no ceiling |
//! | `GET`  | `/capabilities` | `?instance_id&subject_id` |
//! | `POST` | `/maintenance/bonus-cleanup` | Periodic trigger for bonus expiry |

use axum::{
  Json,
  extract::{Query, State},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tally_core::{
  capability::CapabilitySet,
  ledger::{
    BonusGrant, BonusRequest, BonusSummary, CleanupReport, ConsumeDecision,
    ConsumeRequest, MeterReport, MeterRequest,
  },
  store::{PlanStore, SubscriptionStore, UsageStore},
  usage::UsageSnapshot,
  window::WindowUnit,
};
use uuid::Uuid;

use crate::{AppState, error::ApiError};

// ─── Consume ──────────────────────────────────────────────────────────────────

/// `POST /consume` — body: [`ConsumeRequest`].
pub async fn consume<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<ConsumeRequest>,
) -> Result<Json<ConsumeDecision>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let decision = state
    .ledger
    .check_and_consume(body)
    .await
    .map_err(ApiError::engine)?;
  Ok(Json(decision))
}

// ─── Bonus ────────────────────────────────────────────────────────────────────

/// JSON body accepted by `POST /bonus`. The caller has already verified the
/// rewarded event; this endpoint does not deduplicate.
#[derive(Debug, Deserialize)]
pub struct BonusBody {
  pub subject_id:   Uuid,
  pub module_key:   String,
  pub function_key: Option<String>,
  pub amount:       u64,
  #[serde(default = "default_bonus_source")]
  pub source:       String,
  pub expires_at:   Option<DateTime<Utc>>,
}

fn default_bonus_source() -> String {
  "bonus".to_owned()
}

/// `POST /bonus` — returns the grant with the post-grant quota split.
pub async fn grant_bonus<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<BonusBody>,
) -> Result<Json<BonusGrant>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let grant = state
    .ledger
    .add_bonus_quota(BonusRequest {
      subject_id:   body.subject_id,
      module_key:   body.module_key,
      function_key: body.function_key,
      amount:       body.amount,
      source:       body.source,
      expires_at:   body.expires_at,
    })
    .await
    .map_err(ApiError::engine)?;
  Ok(Json(grant))
}

#[derive(Debug, Deserialize)]
pub struct SubjectParams {
  pub subject_id: Uuid,
}

/// `GET /bonus/summary?subject_id=<id>`
pub async fn bonus_summary<S>(
  State(state): State<AppState<S>>,
  Query(params): Query<SubjectParams>,
) -> Result<Json<BonusSummary>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let summary = state
    .ledger
    .bonus_summary(params.subject_id)
    .await
    .map_err(ApiError::engine)?
    .ok_or_else(|| {
      ApiError::NotFound(format!(
        "no active subscription for subject {}",
        params.subject_id
      ))
    })?;
  Ok(Json(summary))
}

// ─── Usage ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UsageParams {
  pub subject_id:   Uuid,
  pub module_key:   String,
  pub function_key: Option<String>,
}

/// `GET /usage?subject_id=<id>&module_key=<key>[&function_key=<key>]`
pub async fn usage<S>(
  State(state): State<AppState<S>>,
  Query(params): Query<UsageParams>,
) -> Result<Json<UsageSnapshot>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let snapshot = state
    .ledger
    .current_usage(
      params.subject_id,
      &params.module_key,
      params.function_key.as_deref(),
    )
    .await
    .map_err(ApiError::engine)?
    .ok_or_else(|| {
      ApiError::NotFound(format!(
        "no active subscription for subject {}",
        params.subject_id
      ))
    })?;
  Ok(Json(snapshot))
}

/// JSON body accepted by `POST /usage/record`.
#[derive(Debug, Deserialize)]
pub struct RecordBody {
  pub instance_id:  Uuid,
  pub subject_id:   Uuid,
  pub module_key:   String,
  pub function_key: Option<String>,
  pub period:       WindowUnit,
  #[serde(default = "default_amount")]
  pub amount:       u64,
}

fn default_amount() -> u64 {
  1
}

/// `POST /usage/record` — administrative metering without a ceiling.
pub async fn record<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<RecordBody>,
) -> Result<Json<MeterReport>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let report = state
    .ledger
    .record_usage(MeterRequest {
      instance_id:  body.instance_id,
      subject_id:   body.subject_id,
      module_key:   body.module_key,
      function_key: body.function_key,
      period:       body.period,
      amount:       body.amount,
    })
    .await
    .map_err(ApiError::engine)?;
  Ok(Json(report))
}

// ─── Capabilities ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CapabilityParams {
  pub instance_id: Uuid,
  pub subject_id:  Uuid,
}

/// `GET /capabilities?instance_id=<id>&subject_id=<id>`
pub async fn capabilities<S>(
  State(state): State<AppState<S>>,
  Query(params): Query<CapabilityParams>,
) -> Result<Json<CapabilitySet>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let set = state
    .ledger
    .build_capabilities(params.instance_id, params.subject_id)
    .await
    .map_err(ApiError::engine)?;
  Ok(Json(set))
}

// ─── Maintenance ──────────────────────────────────────────────────────────────

/// `POST /maintenance/bonus-cleanup` — reset all expired bonus grants.
pub async fn cleanup<S>(
  State(state): State<AppState<S>>,
) -> Result<Json<CleanupReport>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let report = state
    .ledger
    .cleanup_expired_bonus()
    .await
    .map_err(ApiError::engine)?;
  Ok(Json(report))
}
