//! Public onboarding API.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{middleware, Json, Router};
use nacme_core::CertBundle;
use serde::Deserialize;

use super::error::ApiError;
use super::rate_limit::{rate_limit, OnboardingRateLimiter};
use crate::coordinator::{OnboardRequest, OnboardingCoordinator};

/// Body of `POST /add`.
#[derive(Debug, Deserialize)]
pub struct AddRequest {
    pub api_key: String,
    #[serde(default)]
    pub hostname_prefix: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub suggested_ip: Option<String>,
}

impl From<AddRequest> for OnboardRequest {
    fn from(req: AddRequest) -> Self {
        Self {
            api_key: req.api_key,
            hostname_prefix: req.hostname_prefix,
            public_key: req.public_key,
            suggested_ip: req.suggested_ip,
        }
    }
}

/// Router for the public listener.
pub fn router(coordinator: OnboardingCoordinator, limiter: OnboardingRateLimiter) -> Router {
    Router::new()
        .route("/add", post(add_host))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit))
        .with_state(coordinator)
}

async fn add_host(
    State(coordinator): State<OnboardingCoordinator>,
    payload: Result<Json<AddRequest>, JsonRejection>,
) -> Result<Json<CertBundle>, ApiError> {
    let Json(request) = payload?;
    let bundle = coordinator.onboard(request.into()).await?;
    Ok(Json(bundle))
}
