//! `/oauth/*` handlers

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{
        Query, State,
        rejection::{FormRejection, JsonRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use url::Url;

use super::router::AppState;
use crate::oauth::{AuthorizeParams, CallbackParams, RegistrationRequest, TokenRequest};
use crate::{Error, Result};

/// 302 Found to `url`.
fn found(url: &Url) -> Result<Response> {
    let location = HeaderValue::from_str(url.as_str())
        .map_err(|e| Error::Internal(format!("redirect URL is not a valid header: {e}")))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

/// GET /oauth/authorize
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    params: std::result::Result<Query<AuthorizeParams>, QueryRejection>,
) -> Result<Response> {
    let Query(params) = params.map_err(|e| Error::invalid(e.body_text()))?;
    let url = state.broker.authorize(params).await?;
    found(&url)
}

/// GET /oauth/callback
pub async fn callback(
    State(state): State<Arc<AppState>>,
    params: std::result::Result<Query<CallbackParams>, QueryRejection>,
) -> Result<Response> {
    let Query(params) = params.map_err(|e| Error::invalid(e.body_text()))?;
    let url = state.broker.callback(params).await?;
    found(&url)
}

/// POST /oauth/token
pub async fn token(
    State(state): State<Arc<AppState>>,
    form: std::result::Result<Form<TokenRequest>, FormRejection>,
) -> Result<Response> {
    let Form(request) = form.map_err(|e| Error::invalid(e.body_text()))?;
    let response = state.broker.token(request).await?;
    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(response),
    )
        .into_response())
}

/// Body of a successful registration.
#[derive(Debug, Serialize)]
struct RegistrationResponse {
    client_id: String,
    client_name: String,
    redirect_uris: BTreeSet<String>,
    grant_types: BTreeSet<String>,
    token_endpoint_auth_method: &'static str,
}

/// POST /oauth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<RegistrationRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = body.map_err(|e| Error::invalid(e.body_text()))?;
    let client = state.broker.clients().register(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse {
            client_id: client.client_id,
            client_name: client.client_name,
            redirect_uris: client.redirect_uris,
            grant_types: client.grant_types,
            token_endpoint_auth_method: "none",
        }),
    )
        .into_response())
}
