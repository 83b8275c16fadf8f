//! Handlers for the plan catalogue and registrar endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/plans` | Full catalogue |
//! | `POST` | `/plans` | 409 when the code is taken |
//! | `GET`  | `/plans/{id}` | 404 if not found |
//! | `PUT`  | `/plans/{id}/limits` | Affects future registrations only |
//! | `POST` | `/subscriptions` | Register; 409 on overlap without `replace_current` |
//! | `GET`  | `/subscriptions/active` | `?subject_id=<id>`; 404 if none |
//! | `GET`  | `/subscriptions/by-subject/{subject_id}` | Full history |

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tally_core::{
  limits::LimitSnapshot,
  plan::{DurationUnit, NewPlan, Plan, PlanStatus},
  store::{
    PlanInsertOutcome, PlanStore, RegisterOutcome, SubscriptionStore,
    UsageStore,
  },
  subscription::{NewSubscription, PlanRef, SubscriptionInstance},
};
use uuid::Uuid;

use crate::{AppState, error::ApiError};

// ─── Plans ────────────────────────────────────────────────────────────────────

/// JSON body accepted by `POST /plans`.
#[derive(Debug, Deserialize)]
pub struct NewPlanBody {
  pub name:          String,
  pub code:          String,
  #[serde(default)]
  pub price:         i64,
  pub description:   Option<String>,
  #[serde(default)]
  pub duration:      u32,
  #[serde(default)]
  pub duration_unit: DurationUnit,
  pub limits:        LimitSnapshot,
  #[serde(default)]
  pub status:        PlanStatus,
}

/// `POST /plans` — returns 201 + the stored plan.
pub async fn create_plan<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<NewPlanBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let outcome = state
    .store
    .add_plan(NewPlan {
      name:          body.name,
      code:          body.code.clone(),
      price:         body.price,
      description:   body.description,
      duration:      body.duration,
      duration_unit: body.duration_unit,
      limits:        body.limits,
      status:        body.status,
    })
    .await
    .map_err(ApiError::store)?;

  match outcome {
    PlanInsertOutcome::Created(plan) => Ok((StatusCode::CREATED, Json(plan))),
    PlanInsertOutcome::CodeExists => Err(ApiError::Conflict(format!(
      "plan code {:?} already exists",
      body.code
    ))),
  }
}

/// `GET /plans`
pub async fn list_plans<S>(
  State(state): State<AppState<S>>,
) -> Result<Json<Vec<Plan>>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let plans = state.store.list_plans().await.map_err(ApiError::store)?;
  Ok(Json(plans))
}

/// `GET /plans/{id}`
pub async fn get_plan<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Plan>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let plan = state
    .store
    .get_plan(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("plan {id} not found")))?;
  Ok(Json(plan))
}

/// `PUT /plans/{id}/limits` — body: a full [`LimitSnapshot`].
///
/// Already-issued subscriptions keep the snapshot they were registered
/// with; only future registrations see the new tree.
pub async fn update_plan_limits<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
  Json(limits): Json<LimitSnapshot>,
) -> Result<Json<Plan>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let plan = state
    .store
    .update_plan_limits(id, limits)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("plan {id} not found")))?;
  Ok(Json(plan))
}

// ─── Subscriptions ────────────────────────────────────────────────────────────

/// JSON body accepted by `POST /subscriptions`. Exactly one of `plan_id` and
/// `code` must name the plan.
#[derive(Debug, Deserialize)]
pub struct RegisterBody {
  pub subject_id:        Uuid,
  pub plan_id:           Option<Uuid>,
  pub code:              Option<String>,
  pub start_at:          Option<DateTime<Utc>>,
  pub duration_override: Option<u32>,
  pub duration_unit:     Option<DurationUnit>,
  #[serde(default)]
  pub replace_current:   bool,
}

/// `POST /subscriptions` — returns 201 + the issued instance.
pub async fn register<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let plan = match (body.plan_id, body.code) {
    (Some(id), None) => PlanRef::ById(id),
    (None, Some(code)) => PlanRef::ByCode(code),
    _ => {
      return Err(ApiError::BadRequest(
        "exactly one of plan_id and code is required".into(),
      ));
    }
  };

  let outcome = state
    .store
    .register(NewSubscription {
      subject_id:        body.subject_id,
      plan,
      start_at:          body.start_at,
      duration_override: body.duration_override,
      duration_unit:     body.duration_unit,
      replace_current:   body.replace_current,
    })
    .await
    .map_err(ApiError::store)?;

  match outcome {
    RegisterOutcome::Registered(instance) => {
      Ok((StatusCode::CREATED, Json(instance)))
    }
    RegisterOutcome::OverlappingActive { existing } => {
      Err(ApiError::Conflict(format!(
        "subject already has an active subscription in this period ({existing})"
      )))
    }
    RegisterOutcome::PlanNotFound => {
      Err(ApiError::NotFound("subscription plan not found".into()))
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ActiveParams {
  pub subject_id: Uuid,
}

/// `GET /subscriptions/active?subject_id=<id>`
pub async fn active<S>(
  State(state): State<AppState<S>>,
  Query(params): Query<ActiveParams>,
) -> Result<Json<SubscriptionInstance>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let instance = state
    .store
    .find_active_instance(params.subject_id, Utc::now())
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| {
      ApiError::NotFound(format!(
        "no active subscription for subject {}",
        params.subject_id
      ))
    })?;
  Ok(Json(instance))
}

/// `GET /subscriptions/by-subject/{subject_id}`
pub async fn list_for_subject<S>(
  State(state): State<AppState<S>>,
  Path(subject_id): Path<Uuid>,
) -> Result<Json<Vec<SubscriptionInstance>>, ApiError>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  let instances = state
    .store
    .list_instances(subject_id)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(instances))
}
