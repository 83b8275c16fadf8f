//! JSON REST API for Tally.
//!
//! Exposes an axum [`Router`] backed by any store implementing the
//! `tally-core` store traits. Auth, TLS, and transport concerns are the
//! caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", tally_api::api_router(state))
//! ```

pub mod error;
pub mod metering;
pub mod subscriptions;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post, put},
};
use tally_core::{
  UsageLedger,
  store::{PlanStore, SubscriptionStore, UsageStore},
};

pub use error::ApiError;

/// Shared state threaded through all axum handlers. The ledger drives the
/// metering endpoints; the bare store handle serves the registrar and plan
/// endpoints.
#[derive(Clone)]
pub struct AppState<S> {
  pub ledger: Arc<UsageLedger<S>>,
  pub store:  S,
}

impl<S: Clone> AppState<S> {
  pub fn new(ledger: UsageLedger<S>, store: S) -> Self {
    Self { ledger: Arc::new(ledger), store }
  }
}

/// Build a fully-materialised API router for `state`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(state: AppState<S>) -> Router<()>
where
  S: PlanStore + SubscriptionStore + UsageStore + Clone + Send + Sync + 'static,
{
  Router::new()
    // Metering
    .route("/consume", post(metering::consume::<S>))
    .route("/bonus", post(metering::grant_bonus::<S>))
    .route("/bonus/summary", get(metering::bonus_summary::<S>))
    .route("/usage", get(metering::usage::<S>))
    .route("/usage/record", post(metering::record::<S>))
    .route("/capabilities", get(metering::capabilities::<S>))
    .route("/maintenance/bonus-cleanup", post(metering::cleanup::<S>))
    // Plans
    .route("/plans", get(subscriptions::list_plans::<S>).post(subscriptions::create_plan::<S>))
    .route("/plans/{id}", get(subscriptions::get_plan::<S>))
    .route("/plans/{id}/limits", put(subscriptions::update_plan_limits::<S>))
    // Subscriptions
    .route("/subscriptions", post(subscriptions::register::<S>))
    .route("/subscriptions/active", get(subscriptions::active::<S>))
    .route(
      "/subscriptions/by-subject/{subject_id}",
      get(subscriptions::list_for_subject::<S>),
    )
    .with_state(state)
}
