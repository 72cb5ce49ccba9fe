//! External identity provider boundary.
//!
//! The broker never authenticates users itself. It sends the user agent to
//! the IdP's authorize endpoint, then talks to the IdP server-to-server to
//! turn the returned code into tokens and the tokens into an identity.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::IdpConfig;

/// Errors talking to the identity provider.
#[derive(Debug, thiserror::Error)]
pub enum IdpError {
    /// The IdP could not be reached or the request timed out.
    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The IdP answered with a non-success status.
    #[error("identity provider returned HTTP {status}")]
    Rejected {
        /// HTTP status returned by the IdP.
        status: u16,
    },

    /// The IdP answered 2xx with a body we could not use.
    #[error("unexpected identity provider response: {0}")]
    Decode(String),

    /// A configured endpoint is not a valid URL.
    #[error("invalid identity provider endpoint: {0}")]
    Endpoint(String),
}

impl IdpError {
    /// The IdP explicitly refused the grant or token (4xx), as opposed to
    /// being unreachable or failing internally.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { status } if (400..500).contains(status))
    }
}

/// Tokens returned by the IdP token endpoint.
///
/// Never leaves the broker: these are stored on the authorization code and
/// used to resolve identity, but the client only ever receives an API key.
#[derive(Clone, Deserialize)]
pub struct UpstreamTokens {
    /// IdP access token.
    pub access_token: String,
    /// IdP refresh token, when the grant produced one.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for UpstreamTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A user as described by the IdP userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UserInfoBody")]
pub struct UserIdentity {
    /// Stable subject identifier; the platform's user id.
    #[serde(rename = "sub")]
    pub subject: String,
    /// Email address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name: `name`, falling back to `username`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// Wire shape of a userinfo response. Providers may send `name`,
/// `username`, or both.
#[derive(Deserialize)]
struct UserInfoBody {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

impl From<UserInfoBody> for UserIdentity {
    fn from(body: UserInfoBody) -> Self {
        Self {
            subject: body.sub,
            email: body.email,
            name: body.name.filter(|n| !n.is_empty()).or(body.username),
            picture: body.picture,
        }
    }
}

impl UserIdentity {
    /// An identity known only by its subject (API-key resolution).
    #[must_use]
    pub fn subject_only(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            email: None,
            name: None,
            picture: None,
        }
    }
}

/// Operations the broker needs from the IdP.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Where to send the user agent to log in. `state` round-trips back to
    /// the broker's callback.
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<Url, IdpError>;

    /// Exchange an IdP authorization code for tokens.
    async fn exchange_code(&self, code: &str, redirect_uri: &str)
    -> Result<UpstreamTokens, IdpError>;

    /// Exchange an IdP refresh token for fresh tokens.
    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamTokens, IdpError>;

    /// Resolve an IdP access token to a user.
    async fn user_info(&self, access_token: &str) -> Result<UserIdentity, IdpError>;
}

// ── HTTP implementation ─────────────────────────────────────────────────

/// Identity provider spoken to over standard OAuth 2.0 / OIDC endpoints.
pub struct HttpIdentityProvider {
    http: Client,
    authorize_endpoint: Url,
    token_endpoint: Url,
    userinfo_endpoint: Url,
    client_id: String,
    client_secret: Option<String>,
    scopes: Vec<String>,
}

impl std::fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityProvider")
            .field("authorize_endpoint", &self.authorize_endpoint.as_str())
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpIdentityProvider {
    /// Build a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IdpError::Endpoint`] if an endpoint does not parse, or
    /// [`IdpError::Transport`] if the HTTP client cannot be built.
    pub fn from_config(config: &IdpConfig) -> Result<Self, IdpError> {
        let parse = |name: &str, raw: &str| {
            Url::parse(raw).map_err(|e| IdpError::Endpoint(format!("{name} {raw:?}: {e}")))
        };

        let http = Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            authorize_endpoint: parse("authorize_endpoint", &config.authorize_endpoint)?,
            token_endpoint: parse("token_endpoint", &config.token_endpoint)?,
            userinfo_endpoint: parse("userinfo_endpoint", &config.userinfo_endpoint)?,
            client_id: config.client_id.clone(),
            client_secret: config.resolved_client_secret(),
            scopes: config.scopes.clone(),
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<UpstreamTokens, IdpError> {
        let mut request = self.http.post(self.token_endpoint.clone()).form(form);
        if let Some(secret) = &self.client_secret {
            request = request.basic_auth(&self.client_id, Some(secret));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "IdP token endpoint refused request");
            return Err(IdpError::Rejected {
                status: status.as_u16(),
            });
        }

        response
            .json::<UpstreamTokens>()
            .await
            .map_err(|e| IdpError::Decode(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<Url, IdpError> {
        let mut url = self.authorize_endpoint.clone();
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.client_id);
            params.append_pair("response_type", "code");
            if !self.scopes.is_empty() {
                params.append_pair("scope", &self.scopes.join(" "));
            }
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("state", state);
        }
        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamTokens, IdpError> {
        debug!("Exchanging IdP authorization code");
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.client_id),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamTokens, IdpError> {
        debug!("Refreshing IdP tokens");
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.client_id),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn user_info(&self, access_token: &str) -> Result<UserIdentity, IdpError> {
        let response = self
            .http
            .get(self.userinfo_endpoint.clone())
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            debug!(status = status.as_u16(), "IdP userinfo refused token");
            return Err(IdpError::Rejected {
                status: status.as_u16(),
            });
        }

        let identity: UserIdentity = response
            .json()
            .await
            .map_err(|e| IdpError::Decode(e.to_string()))?;
        if identity.subject.is_empty() {
            return Err(IdpError::Decode("userinfo response has empty sub".to_string()));
        }
        Ok(identity)
    }
}
