//! API key store: long-lived bearer credentials.
//!
//! Each key is two records written and deleted in one atomic commit:
//!
//! ```text
//! owner record   pk = <owner>           sk = apikey#<key_id>   { key_hash, label, created_at }
//! lookup record  pk = apikey#<hash>     sk = apikey#<hash>     { owner, key_id }
//! ```
//!
//! The owner record serves listing and revocation; the lookup record serves
//! bearer resolution in O(1) from the raw secret. The raw secret itself is
//! never stored.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEvent};
use crate::secrets;
use crate::store::{self, Key, KvStore, QueryOptions, StoreError, StoreResult, WriteOp};

/// Sort-key prefix for owner records and partition prefix for lookups.
pub const APIKEY_PREFIX: &str = "apikey#";

/// Issuance attempts before giving up on key-id collisions.
const MAX_ISSUE_ATTEMPTS: usize = 3;

/// A freshly issued key. `raw_secret` is only ever available here.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    /// The bearer secret to hand back to the caller.
    pub raw_secret: String,
    /// Public identifier used for listing and revocation.
    pub key_id: String,
}

/// Metadata about a key, safe to list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    /// Key id.
    pub key_id: String,
    /// Caller-supplied label.
    pub label: String,
    /// RFC 3339 creation time.
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OwnerRecord {
    key_hash: String,
    label: String,
    created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LookupRecord {
    owner: String,
    key_id: String,
}

fn owner_key(owner: &str, key_id: &str) -> Key {
    Key::new(owner, format!("{APIKEY_PREFIX}{key_id}"))
}

fn lookup_key(hash: &str) -> Key {
    Key::single(format!("{APIKEY_PREFIX}{hash}"))
}

/// The API key store.
#[derive(Clone)]
pub struct ApiKeyStore {
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for ApiKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyStore").finish_non_exhaustive()
    }
}

impl ApiKeyStore {
    /// Create a key store over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Issue a new key for `owner`.
    ///
    /// Both records are created in one commit with create-if-absent
    /// semantics; a key-id collision cancels the commit and issuance retries
    /// with fresh values.
    ///
    /// # Errors
    ///
    /// Returns the store error if the commit fails. Nothing is persisted in
    /// that case and no secret is returned.
    pub async fn issue(&self, owner: &str, label: &str) -> StoreResult<IssuedKey> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let key_id = secrets::new_key_id();
            let raw_secret = secrets::new_api_secret();
            let hash = secrets::hash_secret(&raw_secret);

            let owner_k = owner_key(owner, &key_id);
            let lookup_k = lookup_key(&hash);
            let owner_item = store::to_item(
                &owner_k,
                &OwnerRecord {
                    key_hash: hash,
                    label: label.to_string(),
                    created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                },
            )?;
            let lookup_item = store::to_item(
                &lookup_k,
                &LookupRecord {
                    owner: owner.to_string(),
                    key_id: key_id.clone(),
                },
            )?;

            let result = self
                .store
                .transact(vec![
                    WriteOp::Create {
                        key: owner_k,
                        item: owner_item,
                    },
                    WriteOp::Create {
                        key: lookup_k,
                        item: lookup_item,
                    },
                ])
                .await;

            match result {
                Ok(()) => {
                    info!(owner = %owner, key_id = %key_id, "Issued API key");
                    audit::emit(&AuditEvent::key_issued(owner, &key_id));
                    return Ok(IssuedKey { raw_secret, key_id });
                }
                Err(StoreError::TransactionCancelled(reason)) if attempt < MAX_ISSUE_ATTEMPTS => {
                    debug!(owner = %owner, attempt, reason = %reason, "Key id collision, retrying");
                }
                Err(e) => {
                    warn!(owner = %owner, error = %e, "API key commit failed");
                    return Err(e);
                }
            }
        }
    }

    /// List metadata for every key `owner` holds. Never exposes hashes.
    ///
    /// # Errors
    ///
    /// Returns the store error if the query fails.
    pub async fn list(&self, owner: &str) -> StoreResult<Vec<ApiKeyInfo>> {
        let rows = self
            .store
            .query(owner, APIKEY_PREFIX, QueryOptions::default())
            .await?;

        rows.into_iter()
            .map(|(key, item)| {
                let record: OwnerRecord = store::from_item(&key, item)?;
                let key_id = key
                    .sk
                    .strip_prefix(APIKEY_PREFIX)
                    .unwrap_or(&key.sk)
                    .to_string();
                Ok(ApiKeyInfo {
                    key_id,
                    label: record.label,
                    created_at: record.created_at,
                })
            })
            .collect()
    }

    /// Resolve a raw secret to its owner. `Ok(None)` means the secret is not
    /// a known key; errors mean the store could not answer.
    ///
    /// # Errors
    ///
    /// Returns the store error if the lookup fails.
    pub async fn resolve(&self, raw_secret: &str) -> StoreResult<Option<String>> {
        let key = lookup_key(&secrets::hash_secret(raw_secret));
        let Some(item) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let record: LookupRecord = store::from_item(&key, item)?;
        Ok(Some(record.owner))
    }

    /// Revoke one key. Unknown key ids are a no-op.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read or the delete commit fails.
    pub async fn revoke(&self, owner: &str, key_id: &str) -> StoreResult<()> {
        let owner_k = owner_key(owner, key_id);
        let Some(item) = self.store.get(&owner_k).await? else {
            debug!(owner = %owner, key_id = %key_id, "Revoke of unknown key id ignored");
            return Ok(());
        };
        let record: OwnerRecord = store::from_item(&owner_k, item)?;

        self.store
            .transact(vec![
                WriteOp::Delete { key: owner_k },
                WriteOp::Delete {
                    key: lookup_key(&record.key_hash),
                },
            ])
            .await?;

        info!(owner = %owner, key_id = %key_id, "Revoked API key");
        audit::emit(&AuditEvent::key_revoked(owner, key_id));
        Ok(())
    }

    /// Revoke every key `owner` holds. Not atomic across the set: each key's
    /// pair is removed atomically, and a failure stops the sweep.
    ///
    /// # Errors
    ///
    /// Returns the first store error encountered.
    pub async fn revoke_all(&self, owner: &str) -> StoreResult<usize> {
        let keys = self.list(owner).await?;
        for key in &keys {
            self.revoke(owner, &key.key_id).await?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn setup() -> (Arc<InMemoryStore>, ApiKeyStore) {
        let mem = Arc::new(InMemoryStore::new());
        let keys = ApiKeyStore::new(mem.clone());
        (mem, keys)
    }

    /// Every owner record has its lookup twin and vice versa.
    fn assert_paired(mem: &InMemoryStore) {
        let lookups = mem.keys_with_pk_prefix(APIKEY_PREFIX);
        let owners: usize = mem.len() - lookups.len();
        assert_eq!(owners, lookups.len(), "owner/lookup records out of step");
    }

    #[tokio::test]
    async fn issue_then_resolve_returns_owner() {
        // GIVEN: a key issued for alice
        let (_mem, keys) = setup();
        let issued = keys.issue("alice", "laptop").await.unwrap();

        // THEN: the raw secret resolves to alice
        assert_eq!(issued.raw_secret.len(), 64);
        assert_eq!(issued.key_id.len(), 8);
        assert_eq!(keys.resolve(&issued.raw_secret).await.unwrap().as_deref(), Some("alice"));

        // AND: nothing else does
        assert!(keys.resolve("not-a-key").await.unwrap().is_none());
        assert!(keys.resolve(&issued.key_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_secret_is_never_persisted() {
        let (mem, keys) = setup();
        let issued = keys.issue("alice", "laptop").await.unwrap();

        for key in mem.keys_with_pk_prefix("") {
            let item = mem.get(&key).await.unwrap().unwrap();
            let json = serde_json::to_string(&item).unwrap();
            assert!(!json.contains(&issued.raw_secret));
            assert!(!key.pk.contains(&issued.raw_secret));
        }
    }

    #[tokio::test]
    async fn list_shows_metadata_only() {
        let (_mem, keys) = setup();
        let a = keys.issue("alice", "laptop").await.unwrap();
        let b = keys.issue("alice", "phone").await.unwrap();
        keys.issue("bob", "desktop").await.unwrap();

        let listed = keys.list("alice").await.unwrap();
        assert_eq!(listed.len(), 2);

        let mut ids: Vec<_> = listed.iter().map(|k| k.key_id.clone()).collect();
        ids.sort();
        let mut expected = vec![a.key_id, b.key_id];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(listed.iter().all(|k| !k.created_at.is_empty()));

        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("key_hash"));
    }

    #[tokio::test]
    async fn revoke_removes_both_records() {
        let (mem, keys) = setup();
        let issued = keys.issue("alice", "laptop").await.unwrap();

        keys.revoke("alice", &issued.key_id).await.unwrap();

        assert!(keys.resolve(&issued.raw_secret).await.unwrap().is_none());
        assert!(keys.list("alice").await.unwrap().is_empty());
        assert!(mem.is_empty());
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let (mem, keys) = setup();
        let issued = keys.issue("alice", "laptop").await.unwrap();

        keys.revoke("alice", &issued.key_id).await.unwrap();
        keys.revoke("alice", &issued.key_id).await.unwrap();
        keys.revoke("alice", "deadbeef").await.unwrap();
        keys.revoke("nobody", "deadbeef").await.unwrap();

        assert!(mem.keys_with_pk_prefix(APIKEY_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn revoke_only_touches_the_named_owner() {
        let (_mem, keys) = setup();
        let issued = keys.issue("alice", "laptop").await.unwrap();

        // bob cannot revoke alice's key by guessing its id
        keys.revoke("bob", &issued.key_id).await.unwrap();
        assert_eq!(keys.resolve(&issued.raw_secret).await.unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn revoke_all_clears_owner_and_spares_others() {
        let (mem, keys) = setup();
        keys.issue("alice", "a").await.unwrap();
        keys.issue("alice", "b").await.unwrap();
        let bob = keys.issue("bob", "c").await.unwrap();

        let revoked = keys.revoke_all("alice").await.unwrap();

        assert_eq!(revoked, 2);
        assert!(keys.list("alice").await.unwrap().is_empty());
        assert_eq!(keys.resolve(&bob.raw_secret).await.unwrap().as_deref(), Some("bob"));
        assert_paired(&mem);
    }

    #[tokio::test]
    async fn failed_issue_commit_leaves_no_partial_state() {
        // GIVEN: the next commit will fail
        let (mem, keys) = setup();
        mem.fail_next_transactions(1);

        // WHEN: issuing
        let result = keys.issue("alice", "laptop").await;

        // THEN: an error and no records at all
        assert!(result.is_err());
        assert!(mem.is_empty());
        assert!(keys.list("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_revoke_commit_keeps_the_pair_intact() {
        let (mem, keys) = setup();
        let issued = keys.issue("alice", "laptop").await.unwrap();
        mem.fail_next_transactions(1);

        assert!(keys.revoke("alice", &issued.key_id).await.is_err());

        assert_paired(&mem);
        assert_eq!(keys.resolve(&issued.raw_secret).await.unwrap().as_deref(), Some("alice"));
        assert_eq!(keys.list("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_outage_is_an_error_not_a_miss() {
        let (mem, keys) = setup();
        let issued = keys.issue("alice", "laptop").await.unwrap();
        mem.set_unavailable(true);

        assert!(matches!(
            keys.resolve(&issued.raw_secret).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn pairing_holds_across_many_operations() {
        let (mem, keys) = setup();
        let mut issued = Vec::new();
        for i in 0..10 {
            let owner = if i % 2 == 0 { "alice" } else { "bob" };
            issued.push((owner, keys.issue(owner, &format!("k{i}")).await.unwrap()));
            if i % 3 == 0 {
                mem.fail_next_transactions(1);
                let _ = keys.issue(owner, "doomed").await;
            }
        }
        for (owner, key) in issued.iter().step_by(3) {
            keys.revoke(owner, &key.key_id).await.unwrap();
        }

        assert_paired(&mem);
    }
}
