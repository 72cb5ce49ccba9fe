//! Discovery and health endpoints (no authentication)

use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use super::router::AppState;
use crate::oauth::{AuthorizationServerMetadata, ProtectedResourceMetadata};

/// GET /.well-known/oauth-authorization-server
pub async fn authorization_server(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(AuthorizationServerMetadata::for_broker(&state.broker_config))
}

/// GET /.well-known/oauth-protected-resource
pub async fn protected_resource(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ProtectedResourceMetadata::for_broker(&state.broker_config))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
