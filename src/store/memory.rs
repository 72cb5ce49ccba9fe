//! In-memory [`KvStore`] implementation.
//!
//! Backed by a `BTreeMap` behind a `parking_lot::RwLock`, so prefix queries
//! come back in sort-key order and every multi-key operation runs under one
//! write lock (which is what makes [`take`](KvStore::take) and
//! [`transact`](KvStore::transact) atomic).
//!
//! Expiry mirrors a managed store's native TTL: records whose [`TTL_ATTR`]
//! timestamp has passed are invisible to reads. Expired entries are dropped
//! lazily when a write touches them.
//!
//! The store also carries two knobs used by tests and local runs:
//! a clock offset ([`advance`](InMemoryStore::advance)) for simulating elapsed
//! TTLs, and fault injection ([`fail_next_transactions`](InMemoryStore::fail_next_transactions),
//! [`set_unavailable`](InMemoryStore::set_unavailable)).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{Item, Key, KvStore, QueryOptions, StoreError, StoreResult, TTL_ATTR, WriteOp, unix_now};

/// In-memory store with native TTL semantics.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    items: RwLock<BTreeMap<Key, Item>>,
    /// Seconds added to the wall clock when evaluating expiry.
    clock_offset: AtomicI64,
    /// Number of upcoming `transact` calls that will fail.
    failing_transactions: AtomicUsize,
    /// When set, every operation fails with [`StoreError::Unavailable`].
    unavailable: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the store's notion of "now" forward by `by`.
    pub fn advance(&self, by: Duration) {
        let secs = i64::try_from(by.as_secs()).unwrap_or(i64::MAX);
        self.clock_offset.fetch_add(secs, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `transact` fail without applying anything.
    pub fn fail_next_transactions(&self, n: usize) {
        self.failing_transactions.store(n, Ordering::SeqCst);
    }

    /// Toggle a full outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live (unexpired) records.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.now();
        self.items
            .read()
            .values()
            .filter(|item| !is_expired(item, now))
            .count()
    }

    /// Whether the store holds no live records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live keys whose partition key starts with `prefix`.
    #[must_use]
    pub fn keys_with_pk_prefix(&self, prefix: &str) -> Vec<Key> {
        let now = self.now();
        self.items
            .read()
            .iter()
            .filter(|(key, item)| key.pk.starts_with(prefix) && !is_expired(item, now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn now(&self) -> i64 {
        unix_now() + self.clock_offset.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn consume_injected_failure(&self) -> bool {
        self.failing_transactions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn is_expired(item: &Item, now: i64) -> bool {
    item.get(TTL_ATTR)
        .and_then(serde_json::Value::as_i64)
        .is_some_and(|ttl| ttl <= now)
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &Key) -> StoreResult<Option<Item>> {
        self.check_available()?;
        let now = self.now();
        Ok(self
            .items
            .read()
            .get(key)
            .filter(|item| !is_expired(item, now))
            .cloned())
    }

    async fn put(&self, key: Key, item: Item) -> StoreResult<()> {
        self.check_available()?;
        self.items.write().insert(key, item);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> StoreResult<()> {
        self.check_available()?;
        self.items.write().remove(key);
        Ok(())
    }

    async fn take(&self, key: &Key) -> StoreResult<Option<Item>> {
        self.check_available()?;
        let now = self.now();
        let mut items = self.items.write();
        match items.remove(key) {
            Some(item) if is_expired(&item, now) => {
                debug!(key = %key, "Dropped expired record on take");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn query(
        &self,
        pk: &str,
        sk_prefix: &str,
        options: QueryOptions,
    ) -> StoreResult<Vec<(Key, Item)>> {
        self.check_available()?;
        let now = self.now();
        let start = Key::new(pk, sk_prefix);
        let items = self.items.read();

        let matching = items
            .range(start..)
            .take_while(|(key, _)| key.pk == pk && key.sk.starts_with(sk_prefix))
            .filter(|(_, item)| !is_expired(item, now))
            .map(|(key, item)| (key.clone(), item.clone()));

        let mut out: Vec<(Key, Item)> = matching.collect();
        if options.descending {
            out.reverse();
        }
        if let Some(limit) = options.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn transact(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        self.check_available()?;
        if self.consume_injected_failure() {
            warn!(ops = ops.len(), "Injected transaction failure");
            return Err(StoreError::Unavailable("injected transaction failure".to_string()));
        }

        let now = self.now();
        let mut items = self.items.write();

        // Validate every condition before applying anything.
        for (i, op) in ops.iter().enumerate() {
            if ops[..i].iter().any(|prev| prev.key() == op.key()) {
                return Err(StoreError::TransactionCancelled(format!(
                    "duplicate key {} in transaction",
                    op.key()
                )));
            }
            if let WriteOp::Create { key, .. } = op {
                if items.get(key).is_some_and(|item| !is_expired(item, now)) {
                    return Err(StoreError::TransactionCancelled(format!(
                        "record {key} already exists"
                    )));
                }
            }
        }

        for op in ops {
            match op {
                WriteOp::Put { key, item } | WriteOp::Create { key, item } => {
                    items.insert(key, item);
                }
                WriteOp::Delete { key } => {
                    items.remove(&key);
                }
            }
        }
        Ok(())
    }
}
