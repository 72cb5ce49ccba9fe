//! `/api/token(s)` key management handlers. All routes run behind
//! [`require_bearer`](crate::auth::require_bearer).

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::router::AppState;
use crate::api_keys::ApiKeyInfo;
use crate::auth::Resolved;
use crate::{Error, Result};

/// POST body.
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    /// Human-readable label.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateKeyResponse {
    api_key: String,
    key_id: String,
}

/// DELETE query.
#[derive(Debug, Deserialize)]
pub struct RevokeParams {
    /// Key id to revoke.
    #[serde(default)]
    pub id: Option<String>,
}

/// GET /api/token
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Resolved>,
) -> Result<Json<Vec<ApiKeyInfo>>> {
    Ok(Json(state.keys().list(caller.user_id()).await?))
}

/// POST /api/token
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Resolved>,
    body: std::result::Result<Json<CreateKeyRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = body.map_err(|e| Error::invalid(e.body_text()))?;
    let label = request
        .label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::invalid("label is required"))?;

    let issued = state.keys().issue(caller.user_id(), &label).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            api_key: issued.raw_secret,
            key_id: issued.key_id,
        }),
    )
        .into_response())
}

/// DELETE /api/token?id=<key_id>
pub async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Resolved>,
    params: std::result::Result<Query<RevokeParams>, QueryRejection>,
) -> Result<StatusCode> {
    let Query(params) = params.map_err(|e| Error::invalid(e.body_text()))?;
    let key_id = params
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::invalid("id is required"))?;

    state.keys().revoke(caller.user_id(), &key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/tokens
pub async fn revoke_all_keys(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Resolved>,
) -> Result<Response> {
    let revoked = state.keys().revoke_all(caller.user_id()).await?;
    Ok(Json(json!({ "revoked": revoked })).into_response())
}
