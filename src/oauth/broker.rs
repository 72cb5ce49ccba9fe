//! OAuth 2.0 + PKCE authorization broker.
//!
//! Third-party clients authorize against this broker; the broker federates
//! user login to the external IdP and, once the user is known, hands the
//! client an API key instead of the IdP's tokens.
//!
//! ```text
//! Start ──authorize──▶ Federating ──callback──▶ CodeIssued ──token──▶ Redeemed
//!   │                      │                        │
//!   └─ bad params ─▶ 400   └─ expired session ─▶ 400└─ PKCE/client/redirect ─▶ 400
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use super::clients::ClientRegistry;
use super::codes::{CodeStore, NewCode};
use super::idp::IdentityProvider;
use super::sessions::{NewSession, SessionStore};
use crate::api_keys::ApiKeyStore;
use crate::audit::{self, AuditEvent};
use crate::config::BrokerConfig;
use crate::secrets;
use crate::store::KvStore;
use crate::{Error, Result};

/// Only PKCE method accepted.
pub const PKCE_METHOD: &str = "S256";

/// `grant_type` of the authorization code exchange.
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";

/// `grant_type` of the refresh exchange.
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Query parameters of `GET /oauth/authorize`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeParams {
    /// Registered client id.
    pub client_id: Option<String>,
    /// One of the client's registered redirect URIs.
    pub redirect_uri: Option<String>,
    /// PKCE challenge.
    pub code_challenge: Option<String>,
    /// PKCE method. Absent means S256.
    pub code_challenge_method: Option<String>,
    /// Client state, echoed back with the code.
    pub state: Option<String>,
    /// Must be `code` when present.
    pub response_type: Option<String>,
}

/// Query parameters of `GET /oauth/callback`, as sent by the IdP.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// IdP authorization code.
    pub code: Option<String>,
    /// Session id the broker sent as `state`.
    pub state: Option<String>,
    /// IdP error code, if the user or IdP aborted.
    pub error: Option<String>,
    /// IdP error detail.
    pub error_description: Option<String>,
}

/// Form body of `POST /oauth/token`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// `authorization_code` or `refresh_token`.
    pub grant_type: Option<String>,
    /// Code from the callback redirect.
    pub code: Option<String>,
    /// PKCE verifier.
    pub code_verifier: Option<String>,
    /// Client id.
    pub client_id: Option<String>,
    /// Redirect URI used at authorize time.
    pub redirect_uri: Option<String>,
    /// IdP refresh token.
    pub refresh_token: Option<String>,
}

/// A validated authorization-code grant.
#[derive(Debug, Clone)]
pub struct CodeExchange {
    /// The code.
    pub code: String,
    /// PKCE verifier.
    pub code_verifier: String,
    /// Client redeeming the code.
    pub client_id: String,
    /// Must match the authorize-time URI when supplied.
    pub redirect_uri: Option<String>,
}

/// A validated refresh grant.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    /// IdP refresh token.
    pub refresh_token: String,
    /// Client on whose behalf the refresh happens, if stated.
    pub client_id: Option<String>,
}

/// Successful token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// A freshly issued API key.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
}

impl TokenResponse {
    fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "Bearer".to_string(),
        }
    }
}

/// Treat absent and empty parameters alike.
fn required<'a>(value: Option<&'a String>, name: &str) -> Result<&'a str> {
    match value.map(String::as_str) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::invalid(format!("{name} is required"))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// The OAuth broker.
#[derive(Clone)]
pub struct OAuthBroker {
    clients: ClientRegistry,
    sessions: SessionStore,
    codes: CodeStore,
    keys: ApiKeyStore,
    idp: Arc<dyn IdentityProvider>,
    callback_url: String,
}

impl OAuthBroker {
    /// Wire a broker over a shared store and IdP.
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        idp: Arc<dyn IdentityProvider>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            clients: ClientRegistry::new(Arc::clone(&store)),
            sessions: SessionStore::new(Arc::clone(&store), config.session_ttl),
            codes: CodeStore::new(Arc::clone(&store), config.code_ttl),
            keys: ApiKeyStore::new(store),
            idp,
            callback_url: config.callback_url(),
        }
    }

    /// Client registry used by the broker.
    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// API key store the broker issues into.
    #[must_use]
    pub fn keys(&self) -> &ApiKeyStore {
        &self.keys
    }

    // ── Start ──────────────────────────────────────────────────────────

    /// Validate an authorization request, open a session and return the IdP
    /// URL to send the user agent to.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for missing parameters, a non-S256 method,
    /// an unknown client or an unregistered redirect URI. No session is
    /// created in any of those cases.
    pub async fn authorize(&self, params: AuthorizeParams) -> Result<Url> {
        let client_id = required(params.client_id.as_ref(), "client_id")?;
        let redirect_uri = required(params.redirect_uri.as_ref(), "redirect_uri")?;
        let code_challenge = required(params.code_challenge.as_ref(), "code_challenge")?;
        let state = required(params.state.as_ref(), "state")?;

        if let Some(method) = non_empty(params.code_challenge_method) {
            if method != PKCE_METHOD {
                audit::emit(&AuditEvent::denied(
                    format!("unsupported code_challenge_method {method}"),
                    Some(client_id),
                ));
                return Err(Error::invalid("code_challenge_method must be S256"));
            }
        }
        if let Some(response_type) = non_empty(params.response_type) {
            if response_type != "code" {
                return Err(Error::invalid("response_type must be code"));
            }
        }

        let Some(client) = self.clients.get(client_id).await? else {
            audit::emit(&AuditEvent::denied("unknown client", Some(client_id)));
            return Err(Error::invalid("unknown client_id"));
        };
        if !client.allows_redirect(redirect_uri) {
            audit::emit(&AuditEvent::denied("unregistered redirect_uri", Some(client_id)));
            return Err(Error::invalid("redirect_uri is not registered for this client"));
        }

        let session = self
            .sessions
            .create(NewSession {
                client_id,
                redirect_uri,
                code_challenge,
                state,
            })
            .await?;

        let url = self
            .idp
            .authorize_url(&self.callback_url, &session.session_id)?;
        info!(client_id = %client_id, "Authorization started, redirecting to IdP");
        Ok(url)
    }

    // ── Callback ───────────────────────────────────────────────────────

    /// Complete federation: exchange the IdP code, identify the user, mint a
    /// one-time code and return the client redirect carrying it.
    ///
    /// The session is consumed up front, so a failed or replayed callback
    /// needs a fresh authorization. Upstream failures surface as 502 here
    /// regardless of cause.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for missing parameters, an IdP-reported
    /// error or an unknown/expired session (nothing is created);
    /// [`Error::Upstream`] when the IdP exchange or userinfo call fails.
    pub async fn callback(&self, params: CallbackParams) -> Result<Url> {
        if let Some(idp_error) = non_empty(params.error) {
            warn!(
                error = %idp_error,
                description = params.error_description.as_deref().unwrap_or(""),
                "IdP returned an error to the callback"
            );
            return Err(Error::invalid(format!("identity provider error: {idp_error}")));
        }

        let idp_code = required(params.code.as_ref(), "code")?;
        let session_id = required(params.state.as_ref(), "state")?;

        // Claimed before the IdP round trip: a session yields at most one code.
        let Some(session) = self.sessions.take(session_id).await? else {
            audit::emit(&AuditEvent::denied("unknown, expired or consumed session", None));
            return Err(Error::invalid("unknown or expired authorization session"));
        };

        let tokens = self
            .idp
            .exchange_code(idp_code, &self.callback_url)
            .await
            .map_err(|e| Error::from(e).into_gateway_error())?;
        let identity = self
            .idp
            .user_info(&tokens.access_token)
            .await
            .map_err(|e| Error::from(e).into_gateway_error())?;

        let mut redirect = Url::parse(&session.redirect_uri)
            .map_err(|e| Error::Internal(format!("stored redirect_uri is invalid: {e}")))?;

        let code = self
            .codes
            .create(NewCode {
                session_id: session.session_id.clone(),
                user_id: identity.subject.clone(),
                upstream_access_token: tokens.access_token,
                upstream_refresh_token: tokens.refresh_token,
                code_challenge: session.code_challenge.clone(),
                client_id: session.client_id.clone(),
                redirect_uri: session.redirect_uri.clone(),
            })
            .await?;

        audit::emit(&AuditEvent::code_issued(&identity.subject, &session.client_id));

        redirect
            .query_pairs_mut()
            .append_pair("code", &code.code)
            .append_pair("state", &session.state);
        Ok(redirect)
    }

    // ── Token endpoint ─────────────────────────────────────────────────

    /// Dispatch a token endpoint request on `grant_type`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for a missing or unsupported grant type or
    /// missing grant parameters; otherwise whatever the grant returns.
    pub async fn token(&self, request: TokenRequest) -> Result<TokenResponse> {
        match required(request.grant_type.as_ref(), "grant_type")? {
            GRANT_AUTHORIZATION_CODE => {
                let exchange = CodeExchange {
                    code: required(request.code.as_ref(), "code")?.to_string(),
                    code_verifier: required(request.code_verifier.as_ref(), "code_verifier")?
                        .to_string(),
                    client_id: required(request.client_id.as_ref(), "client_id")?.to_string(),
                    redirect_uri: non_empty(request.redirect_uri),
                };
                self.exchange_code(exchange).await
            }
            GRANT_REFRESH_TOKEN => {
                let refresh = RefreshRequest {
                    refresh_token: required(request.refresh_token.as_ref(), "refresh_token")?
                        .to_string(),
                    client_id: non_empty(request.client_id),
                };
                self.refresh(refresh).await
            }
            other => Err(Error::invalid(format!("unsupported grant_type: {other}"))),
        }
    }

    /// Redeem an authorization code for a new API key.
    ///
    /// The code is consumed before any check runs, so a failed attempt burns
    /// it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if the code is unknown, expired or already
    /// used, or the client is not registered for `authorization_code`;
    /// [`Error::Unauthorized`] on PKCE, client or redirect mismatch;
    /// [`Error::Store`] if issuing the key fails.
    pub async fn exchange_code(&self, exchange: CodeExchange) -> Result<TokenResponse> {
        let Some(code) = self.codes.take(&exchange.code).await? else {
            audit::emit(&AuditEvent::denied(
                "unknown, expired or replayed code",
                Some(&exchange.client_id),
            ));
            return Err(Error::invalid("invalid or expired code"));
        };

        let deny = |reason: &str| {
            audit::emit(&AuditEvent::denied(reason, Some(&exchange.client_id)));
            Error::Unauthorized(reason.to_string())
        };

        if !secrets::pkce_matches(&exchange.code_verifier, &code.code_challenge) {
            return Err(deny("PKCE verification failed"));
        }
        if exchange.client_id != code.client_id {
            return Err(deny("client_id mismatch"));
        }
        if let Some(redirect_uri) = &exchange.redirect_uri {
            if *redirect_uri != code.redirect_uri {
                return Err(deny("redirect_uri mismatch"));
            }
        }
        self.require_grant(&code.client_id, GRANT_AUTHORIZATION_CODE)
            .await?;

        let issued = self
            .keys
            .issue(&code.user_id, &format!("OAuth: {}", code.client_id))
            .await?;

        audit::emit(&AuditEvent::code_redeemed(
            &code.user_id,
            &code.client_id,
            &issued.key_id,
        ));
        Ok(TokenResponse::bearer(issued.raw_secret))
    }

    /// Re-authenticate through the IdP with a refresh token and issue a new
    /// API key. Previously issued keys stay valid.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for an unknown `client_id` or one not
    /// registered for `refresh_token`; [`Error::Upstream`] if the IdP refuses (401) or is unreachable (502).
    pub async fn refresh(&self, request: RefreshRequest) -> Result<TokenResponse> {
        if let Some(client_id) = &request.client_id {
            self.require_grant(client_id, GRANT_REFRESH_TOKEN).await?;
        }

        let tokens = self.idp.refresh(&request.refresh_token).await.map_err(|e| {
            audit::emit(&AuditEvent::denied(
                "refresh rejected by identity provider",
                request.client_id.as_deref(),
            ));
            Error::from(e)
        })?;
        let identity = self.idp.user_info(&tokens.access_token).await?;

        let label = match &request.client_id {
            Some(client_id) => format!("OAuth: {client_id}"),
            None => "OAuth: refresh".to_string(),
        };
        let issued = self.keys.issue(&identity.subject, &label).await?;
        info!(owner = %identity.subject, key_id = %issued.key_id, "Issued API key from refresh");

        Ok(TokenResponse::bearer(issued.raw_secret))
    }

    /// Fail unless `client_id` is registered for `grant_type`.
    async fn require_grant(&self, client_id: &str, grant_type: &str) -> Result<()> {
        let Some(client) = self.clients.get(client_id).await? else {
            audit::emit(&AuditEvent::denied("unknown client", Some(client_id)));
            return Err(Error::invalid("unknown client_id"));
        };
        if !client.allows_grant(grant_type) {
            audit::emit(&AuditEvent::denied(
                format!("grant {grant_type} not registered"),
                Some(client_id),
            ));
            return Err(Error::invalid(format!(
                "unauthorized_client: client is not registered for {grant_type}"
            )));
        }
        Ok(())
    }
}
