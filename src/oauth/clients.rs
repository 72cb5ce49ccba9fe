//! OAuth client registry (RFC 7591 dynamic client registration).
//!
//! Clients are public (no secret) and immutable once registered.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::secrets;
use crate::store::{self, Key, KvStore};
use crate::{Error, Result};

/// Partition prefix for client records.
pub const CLIENT_PREFIX: &str = "oauth_client#";

/// Grant types a client may register for.
pub const SUPPORTED_GRANT_TYPES: [&str; 2] = ["authorization_code", "refresh_token"];

/// Registration payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationRequest {
    /// Human-readable client name.
    #[serde(default)]
    pub client_name: String,
    /// Allowed redirect URIs. At least one is required.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Requested grant types. Empty means both supported grants.
    #[serde(default)]
    pub grant_types: Vec<String>,
}

/// A registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClient {
    /// Opaque identifier.
    pub client_id: String,
    /// Human-readable name.
    pub client_name: String,
    /// Allowed redirect URIs.
    pub redirect_uris: BTreeSet<String>,
    /// Allowed grant types.
    pub grant_types: BTreeSet<String>,
    /// RFC 3339 registration time.
    pub created_at: String,
}

impl OAuthClient {
    /// Whether `uri` exactly matches a registered redirect URI.
    #[must_use]
    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.contains(uri)
    }

    /// Whether the client registered for `grant_type`.
    #[must_use]
    pub fn allows_grant(&self, grant_type: &str) -> bool {
        self.grant_types.contains(grant_type)
    }
}

fn client_key(client_id: &str) -> Key {
    Key::single(format!("{CLIENT_PREFIX}{client_id}"))
}

/// Registry of OAuth clients.
#[derive(Clone)]
pub struct ClientRegistry {
    store: Arc<dyn KvStore>,
}

impl ClientRegistry {
    /// Create a registry over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Register a new client.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for an empty or malformed redirect URI list
    /// or an unsupported grant type; [`Error::Store`] if the write fails.
    pub async fn register(&self, request: RegistrationRequest) -> Result<OAuthClient> {
        if request.redirect_uris.is_empty() {
            return Err(Error::invalid("redirect_uris is required"));
        }
        for uri in &request.redirect_uris {
            Url::parse(uri).map_err(|_| Error::invalid(format!("invalid redirect_uri: {uri}")))?;
        }

        let grant_types: BTreeSet<String> = if request.grant_types.is_empty() {
            SUPPORTED_GRANT_TYPES.iter().map(|g| (*g).to_string()).collect()
        } else {
            if let Some(bad) = request
                .grant_types
                .iter()
                .find(|g| !SUPPORTED_GRANT_TYPES.contains(&g.as_str()))
            {
                return Err(Error::invalid(format!("unsupported grant_type: {bad}")));
            }
            request.grant_types.into_iter().collect()
        };

        let client = OAuthClient {
            client_id: secrets::new_opaque_id(),
            client_name: request.client_name,
            redirect_uris: request.redirect_uris.into_iter().collect(),
            grant_types,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        let key = client_key(&client.client_id);
        let item = store::to_item(&key, &client)?;
        self.store.put(key, item).await?;

        info!(
            client_id = %client.client_id,
            client_name = %client.client_name,
            redirect_uris = client.redirect_uris.len(),
            "Registered OAuth client"
        );
        Ok(client)
    }

    /// Look up a client by id.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] if the read fails or the record is malformed.
    pub async fn get(&self, client_id: &str) -> Result<Option<OAuthClient>> {
        let key = client_key(client_id);
        match self.store.get(&key).await? {
            Some(item) => Ok(Some(store::from_item(&key, item)?)),
            None => Ok(None),
        }
    }
}
