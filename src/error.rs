//! Error types for the auth broker

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::oauth::idp::IdpError;
use crate::store::StoreError;

/// Result type alias for the auth broker
pub type Result<T> = std::result::Result<T, Error>;

/// Auth broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown client, session or code. Reported to callers as an invalid
    /// request so existence is never revealed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authenticated flow, but the PKCE verifier, client or redirect URI
    /// does not match what was bound at authorize time
    #[error("Grant mismatch: {0}")]
    Unauthorized(String),

    /// Missing or invalid bearer credential
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Identity provider failure
    #[error("Upstream identity provider error: {message}")]
    Upstream {
        /// What went wrong
        message: String,
        /// The IdP answered and explicitly refused (as opposed to being unreachable)
        rejected: bool,
    },

    /// Key-value store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<IdpError> for Error {
    fn from(e: IdpError) -> Self {
        Self::Upstream {
            rejected: e.is_rejection(),
            message: e.to_string(),
        }
    }
}

impl Error {
    /// Shorthand for [`Error::InvalidRequest`]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// HTTP status for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::NotFound(_) | Self::Unauthorized(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthenticated(_) | Self::Upstream { rejected: true, .. } => {
                StatusCode::UNAUTHORIZED
            }
            Self::Upstream { rejected: false, .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OAuth 2.0 error code (RFC 6749 §5.2 / RFC 6750 §3.1)
    #[must_use]
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::NotFound(_) => "invalid_request",
            Self::Unauthorized(_) | Self::Upstream { rejected: true, .. } => "invalid_grant",
            Self::Unauthenticated(_) => "invalid_token",
            Self::Upstream { rejected: false, .. } => "temporarily_unavailable",
            _ => "server_error",
        }
    }

    /// Message safe to hand to the caller. Server-side failures never leak
    /// internal detail.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidRequest(m) | Self::Unauthorized(m) | Self::Unauthenticated(m) => m.clone(),
            Self::NotFound(_) => "invalid request".to_string(),
            Self::Upstream { rejected: true, .. } => "identity provider rejected the grant".to_string(),
            Self::Upstream { rejected: false, .. } => "identity provider unavailable".to_string(),
            _ => "internal error".to_string(),
        }
    }

    /// Force an upstream failure to surface as a gateway error (502),
    /// regardless of whether the IdP rejected or was unreachable.
    #[must_use]
    pub fn into_gateway_error(self) -> Self {
        match self {
            Self::Upstream { message, .. } => Self::Upstream {
                message,
                rejected: false,
            },
            other => other,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let body = Json(json!({
            "error": self.oauth_code(),
            "error_description": self.public_message(),
        }));

        let mut response = (status, body).into_response();
        if matches!(self, Self::Unauthenticated(_)) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
