//! Admin API, served on its own listener.
//!
//! Every route requires the `X-Master-Key` header.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use nacme_core::master_key_matches;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::admission::issue_api_key;
use crate::ledger::Ledger;

pub const MASTER_KEY_HEADER: &str = "x-master-key";

pub const KEY_NOTE: &str = "This key is shown only once. Store it securely.";

/// Body of `POST /keys`.
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub groups: Vec<String>,
    #[serde(default)]
    pub expiry_unix: Option<i64>,
    #[serde(default)]
    pub uses_remaining: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateKeyResponse {
    pub api_key: String,
    pub note: String,
}

#[derive(Clone)]
struct AdminState {
    ledger: Ledger,
    master_key: Arc<str>,
}

/// Router for the admin listener.
pub fn router(ledger: Ledger, master_key: impl Into<Arc<str>>) -> Router {
    let state = AdminState {
        ledger,
        master_key: master_key.into(),
    };

    Router::new()
        .route("/keys", post(create_key))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_master_key))
        .with_state(state)
}

async fn require_master_key(
    State(state): State<AdminState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let provided = headers
        .get(MASTER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if provided.is_empty() || !master_key_matches(provided, &state.master_key) {
        tracing::warn!(path = %request.uri().path(), "Invalid master key");
        return ApiError::forbidden("Invalid master key").into_response();
    }

    next.run(request).await
}

async fn create_key(
    State(state): State<AdminState>,
    payload: Result<Json<CreateKeyRequest>, JsonRejection>,
) -> Result<Json<CreateKeyResponse>, ApiError> {
    let Json(request) = payload?;

    let issued = issue_api_key(
        &state.ledger,
        &request.groups,
        request.expiry_unix,
        request.uses_remaining,
    )
    .await?;

    Ok(Json(CreateKeyResponse {
        api_key: issued.secret.expose().to_string(),
        note: KEY_NOTE.to_string(),
    }))
}
