//! One-time authorization codes minted at the callback and redeemed at the
//! token endpoint.
//!
//! Redemption goes through [`KvStore::take`], so reading a code and deleting
//! it is a single store operation: of any number of concurrent redemptions at
//! most one sees the code.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sessions::expiry;
use crate::Result;
use crate::secrets;
use crate::store::{self, Key, KvStore};

/// Partition prefix for code records.
pub const CODE_PREFIX: &str = "oauth_code#";

/// A minted authorization code and everything bound to it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCode {
    /// The code itself.
    pub code: String,
    /// Session the code was minted from.
    pub session_id: String,
    /// Platform user id (IdP subject).
    pub user_id: String,
    /// IdP access token from the callback exchange.
    pub upstream_access_token: String,
    /// IdP refresh token, if the IdP issued one.
    #[serde(default)]
    pub upstream_refresh_token: Option<String>,
    /// PKCE challenge carried over from the session.
    pub code_challenge: String,
    /// Client the code was issued to.
    pub client_id: String,
    /// Redirect URI the code was delivered to.
    pub redirect_uri: String,
    /// Unix expiry.
    pub ttl: i64,
}

impl std::fmt::Debug for AuthCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCode")
            .field("code", &secrets::redact(&self.code))
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Binding for a new code.
#[derive(Debug, Clone)]
pub struct NewCode {
    /// Originating session.
    pub session_id: String,
    /// Authenticated user.
    pub user_id: String,
    /// IdP access token.
    pub upstream_access_token: String,
    /// IdP refresh token.
    pub upstream_refresh_token: Option<String>,
    /// PKCE challenge.
    pub code_challenge: String,
    /// Client id.
    pub client_id: String,
    /// Client redirect URI.
    pub redirect_uri: String,
}

fn code_key(code: &str) -> Key {
    Key::single(format!("{CODE_PREFIX}{code}"))
}

/// Store of authorization codes.
#[derive(Clone)]
pub struct CodeStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl CodeStore {
    /// Create a code store whose records live for `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mint and persist a fresh code.
    pub async fn create(&self, new: NewCode) -> Result<AuthCode> {
        let code = AuthCode {
            code: secrets::new_opaque_id(),
            session_id: new.session_id,
            user_id: new.user_id,
            upstream_access_token: new.upstream_access_token,
            upstream_refresh_token: new.upstream_refresh_token,
            code_challenge: new.code_challenge,
            client_id: new.client_id,
            redirect_uri: new.redirect_uri,
            ttl: expiry(self.ttl),
        };

        let key = code_key(&code.code);
        let item = store::to_item(&key, &code)?;
        self.store.put(key, item).await?;
        debug!(client_id = %code.client_id, user_id = %code.user_id, "Minted authorization code");
        Ok(code)
    }

    /// Atomically fetch and delete a code. `None` if it never existed, has
    /// expired, or was already redeemed.
    pub async fn take(&self, code: &str) -> Result<Option<AuthCode>> {
        let key = code_key(code);
        match self.store.take(&key).await? {
            Some(item) => Ok(Some(store::from_item(&key, item)?)),
            None => Ok(None),
        }
    }
}
