//! Bearer credential resolution and the authentication middleware.
//!
//! A bearer token is either one of our API keys or an IdP access token
//! (first-party browsers hold the latter). Resolution always tries the API
//! key first; the IdP is consulted only when the key store positively
//! reports "no such key". A store outage is an error, never a reason to
//! fall through to the IdP.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::api_keys::ApiKeyStore;
use crate::audit::{self, AuditEvent};
use crate::oauth::idp::{IdentityProvider, UserIdentity};
use crate::{Error, Result};

/// How a bearer token was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    /// One of our API keys.
    ApiKey,
    /// An IdP access token, accepted by the IdP's userinfo endpoint.
    Federated,
}

impl ResolvedVia {
    /// Stable name for logs and audit events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Federated => "federated",
        }
    }
}

/// The caller behind a bearer token. Inserted into request extensions by
/// [`require_bearer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Who the caller is.
    pub identity: UserIdentity,
    /// Which path recognised them.
    pub via: ResolvedVia,
}

impl Resolved {
    /// Platform user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.identity.subject
    }
}

/// Resolves bearer tokens to users.
#[derive(Clone)]
pub struct BearerResolver {
    keys: ApiKeyStore,
    idp: Arc<dyn IdentityProvider>,
}

impl BearerResolver {
    /// Create a resolver over the key store and IdP.
    #[must_use]
    pub fn new(keys: ApiKeyStore, idp: Arc<dyn IdentityProvider>) -> Self {
        Self { keys, idp }
    }

    /// Resolve `token`: API key first, then the IdP.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] when neither recognises the token;
    /// [`Error::Store`] when the key store fails; [`Error::Upstream`] when
    /// the IdP cannot be reached.
    pub async fn resolve(&self, token: &str) -> Result<Resolved> {
        if token.is_empty() {
            return Err(Error::Unauthenticated("empty bearer token".into()));
        }

        if let Some(owner) = self.keys.resolve(token).await? {
            audit::emit(&AuditEvent::key_used(&owner, ResolvedVia::ApiKey.as_str()));
            return Ok(Resolved {
                identity: UserIdentity::subject_only(owner),
                via: ResolvedVia::ApiKey,
            });
        }

        match self.idp.user_info(token).await {
            Ok(identity) => {
                audit::emit(&AuditEvent::key_used(
                    &identity.subject,
                    ResolvedVia::Federated.as_str(),
                ));
                Ok(Resolved {
                    identity,
                    via: ResolvedVia::Federated,
                })
            }
            Err(e) if e.is_rejection() => {
                debug!(error = %e, "Bearer not recognised by key store or IdP");
                Err(Error::Unauthenticated("invalid bearer token".into()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`. The scheme is
/// matched case-insensitively.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// State for [`require_bearer`].
#[derive(Clone)]
pub struct BearerGuard {
    resolver: BearerResolver,
    challenge: HeaderValue,
}

impl BearerGuard {
    /// Guard that advertises `resource_metadata_url` in its 401 challenge.
    #[must_use]
    pub fn new(resolver: BearerResolver, resource_metadata_url: &str) -> Self {
        let challenge = HeaderValue::from_str(&format!(
            "Bearer resource_metadata=\"{resource_metadata_url}\""
        ))
        .unwrap_or_else(|_| HeaderValue::from_static("Bearer"));
        Self {
            resolver,
            challenge,
        }
    }

    /// The resolver behind this guard.
    #[must_use]
    pub fn resolver(&self) -> &BearerResolver {
        &self.resolver
    }

    fn unauthorized(&self, message: &str) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, self.challenge.clone())],
            Json(json!({
                "error": "invalid_token",
                "error_description": message,
            })),
        )
            .into_response()
    }
}

/// Authentication middleware: resolves the bearer and injects [`Resolved`]
/// for downstream handlers.
pub async fn require_bearer(
    State(guard): State<Arc<BearerGuard>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = bearer_token(request.headers()) else {
        warn!(path = %path, "Missing Authorization header");
        return guard.unauthorized("missing bearer token");
    };

    match guard.resolver.resolve(token).await {
        Ok(resolved) => {
            debug!(user = %resolved.user_id(), via = resolved.via.as_str(), path = %path, "Authenticated request");
            request.extensions_mut().insert(resolved);
            next.run(request).await
        }
        Err(Error::Unauthenticated(message)) => {
            warn!(path = %path, "Invalid bearer token");
            guard.unauthorized(&message)
        }
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::oauth::idp::{IdpError, UpstreamTokens};
    use crate::store::InMemoryStore;

    /// Accepts exactly one IdP access token.
    struct OneTokenIdp {
        unreachable: bool,
    }

    #[async_trait]
    impl IdentityProvider for OneTokenIdp {
        fn authorize_url(&self, _: &str, _: &str) -> std::result::Result<Url, IdpError> {
            Err(IdpError::Endpoint("unused".into()))
        }

        async fn exchange_code(&self, _: &str, _: &str) -> std::result::Result<UpstreamTokens, IdpError> {
            Err(IdpError::Rejected { status: 400 })
        }

        async fn refresh(&self, _: &str) -> std::result::Result<UpstreamTokens, IdpError> {
            Err(IdpError::Rejected { status: 400 })
        }

        async fn user_info(&self, token: &str) -> std::result::Result<UserIdentity, IdpError> {
            if self.unreachable {
                return Err(IdpError::Rejected { status: 503 });
            }
            if token == "idp-token" {
                Ok(UserIdentity {
                    subject: "browser-user".into(),
                    email: Some("racer@example.com".into()),
                    name: Some("Racer".into()),
                    picture: None,
                })
            } else {
                Err(IdpError::Rejected { status: 401 })
            }
        }
    }

    fn resolver(unreachable: bool) -> (Arc<InMemoryStore>, BearerResolver) {
        let mem = Arc::new(InMemoryStore::new());
        let keys = ApiKeyStore::new(mem.clone());
        (mem, BearerResolver::new(keys, Arc::new(OneTokenIdp { unreachable })))
    }

    #[tokio::test]
    async fn api_key_resolves_first() {
        let (mem, resolver) = resolver(false);
        let issued = ApiKeyStore::new(mem).issue("alice", "cli").await.unwrap();

        let resolved = resolver.resolve(&issued.raw_secret).await.unwrap();

        assert_eq!(resolved.via, ResolvedVia::ApiKey);
        assert_eq!(resolved.user_id(), "alice");
    }

    #[tokio::test]
    async fn idp_token_resolves_as_federated() {
        let (_mem, resolver) = resolver(false);

        let resolved = resolver.resolve("idp-token").await.unwrap();

        assert_eq!(resolved.via, ResolvedVia::Federated);
        assert_eq!(resolved.identity.email.as_deref(), Some("racer@example.com"));
    }

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        let (_mem, resolver) = resolver(false);
        assert!(matches!(
            resolver.resolve("garbage").await,
            Err(Error::Unauthenticated(_))
        ));
        assert!(matches!(resolver.resolve("").await, Err(Error::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn store_failure_is_not_federated() {
        // GIVEN: a key store outage and a token the IdP would accept
        let (mem, resolver) = resolver(false);
        mem.set_unavailable(true);

        // WHEN / THEN: the outage surfaces instead of falling through
        let err = resolver.resolve("idp-token").await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn idp_outage_is_bad_gateway() {
        let (_mem, resolver) = resolver(true);
        let err = resolver.resolve("idp-token").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        for value in ["Bearer abc", "bearer abc", "BEARER abc"] {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
            assert_eq!(bearer_token(&headers), Some("abc"), "{value}");
        }
    }

    #[test]
    fn malformed_authorization_headers_yield_none() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        for value in ["Basic abc", "Bearer", "Bearer ", "abc"] {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
            assert!(bearer_token(&headers).is_none(), "{value}");
        }
    }
}
