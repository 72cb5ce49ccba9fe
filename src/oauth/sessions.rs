//! Authorization sessions: the state held between `/oauth/authorize` and the
//! IdP's redirect back to `/oauth/callback`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::secrets;
use crate::store::{self, Key, KvStore, unix_now};

/// Partition prefix for session records.
pub const SESSION_PREFIX: &str = "oauth_session#";

/// An in-flight authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// Opaque id, sent to the IdP as `state`.
    pub session_id: String,
    /// Client that started the flow.
    pub client_id: String,
    /// Where the client wants the code delivered.
    pub redirect_uri: String,
    /// PKCE S256 challenge.
    pub code_challenge: String,
    /// The client's own `state`, echoed back untouched.
    pub state: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Unix expiry.
    pub ttl: i64,
}

/// Parameters captured at authorize time.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    /// Client id.
    pub client_id: &'a str,
    /// Client redirect URI.
    pub redirect_uri: &'a str,
    /// PKCE challenge.
    pub code_challenge: &'a str,
    /// Client state.
    pub state: &'a str,
}

fn session_key(session_id: &str) -> Key {
    Key::single(format!("{SESSION_PREFIX}{session_id}"))
}

/// Store of authorization sessions.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a session store whose records live for `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Persist a fresh session.
    pub async fn create(&self, new: NewSession<'_>) -> Result<AuthSession> {
        let session = AuthSession {
            session_id: secrets::new_opaque_id(),
            client_id: new.client_id.to_string(),
            redirect_uri: new.redirect_uri.to_string(),
            code_challenge: new.code_challenge.to_string(),
            state: new.state.to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ttl: expiry(self.ttl),
        };

        let key = session_key(&session.session_id);
        let item = store::to_item(&key, &session)?;
        self.store.put(key, item).await?;
        debug!(client_id = %session.client_id, "Created authorization session");
        Ok(session)
    }

    /// Load a live session. Expired sessions read as `None`.
    pub async fn get(&self, session_id: &str) -> Result<Option<AuthSession>> {
        let key = session_key(session_id);
        match self.store.get(&key).await? {
            Some(item) => Ok(Some(store::from_item(&key, item)?)),
            None => Ok(None),
        }
    }

    /// Atomically fetch and delete a live session. Of concurrent callers for
    /// the same id at most one receives it.
    pub async fn take(&self, session_id: &str) -> Result<Option<AuthSession>> {
        let key = session_key(session_id);
        match self.store.take(&key).await? {
            Some(item) => Ok(Some(store::from_item(&key, item)?)),
            None => Ok(None),
        }
    }
}

/// Unix timestamp `ttl` from now.
pub(crate) fn expiry(ttl: Duration) -> i64 {
    unix_now().saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn new_session() -> NewSession<'static> {
        NewSession {
            client_id: "client-1",
            redirect_uri: "http://localhost:7777/cb",
            code_challenge: "challenge",
            state: "client-state",
        }
    }

    #[tokio::test]
    async fn create_then_get() {
        let mem = Arc::new(InMemoryStore::new());
        let sessions = SessionStore::new(mem, Duration::from_secs(600));

        let created = sessions.create(new_session()).await.unwrap();
        let loaded = sessions.get(&created.session_id).await.unwrap().unwrap();

        assert_eq!(loaded, created);
        assert_eq!(loaded.state, "client-state");
        assert!(loaded.ttl > unix_now());
    }

    #[tokio::test]
    async fn sessions_expire_after_ttl() {
        let mem = Arc::new(InMemoryStore::new());
        let sessions = SessionStore::new(mem.clone(), Duration::from_secs(600));
        let created = sessions.create(new_session()).await.unwrap();

        mem.advance(Duration::from_secs(599));
        assert!(sessions.get(&created.session_id).await.unwrap().is_some());

        mem.advance(Duration::from_secs(2));
        assert!(sessions.get(&created.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn take_consumes_session_once() {
        let mem = Arc::new(InMemoryStore::new());
        let sessions = SessionStore::new(mem.clone(), Duration::from_secs(600));
        let created = sessions.create(new_session()).await.unwrap();

        let taken = sessions.take(&created.session_id).await.unwrap();

        assert_eq!(taken, Some(created.clone()));
        assert!(sessions.take(&created.session_id).await.unwrap().is_none());
        assert!(mem.is_empty());
    }

    #[tokio::test]
    async fn concurrent_takes_have_one_winner() {
        let mem = Arc::new(InMemoryStore::new());
        let sessions = SessionStore::new(mem, Duration::from_secs(600));
        let created = sessions.create(new_session()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sessions = sessions.clone();
            let id = created.session_id.clone();
            handles.push(tokio::spawn(async move { sessions.take(&id).await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_session_cannot_be_taken() {
        let mem = Arc::new(InMemoryStore::new());
        let sessions = SessionStore::new(mem.clone(), Duration::from_secs(600));
        let created = sessions.create(new_session()).await.unwrap();

        mem.advance(Duration::from_secs(601));

        assert!(sessions.take(&created.session_id).await.unwrap().is_none());
    }
}
