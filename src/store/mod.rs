//! Key-value store boundary.
//!
//! Every record the broker owns lives in a single logical table addressed by
//! a composite [`Key`] (`pk` + `sk`). The [`KvStore`] trait is the narrow
//! interface the rest of the crate depends on:
//!
//! | Operation | Used for |
//! |-----------|----------|
//! | [`get`](KvStore::get) / [`put`](KvStore::put) / [`delete`](KvStore::delete) | clients, sessions, codes |
//! | [`take`](KvStore::take) | one-time authorization code redemption |
//! | [`query`](KvStore::query) | listing an owner's API keys |
//! | [`transact`](KvStore::transact) | API key issuance and revocation (owner + lookup pair) |
//!
//! Records carrying a numeric [`TTL_ATTR`] attribute expire natively: once
//! the Unix timestamp has passed, the store treats the record as absent. The
//! broker never sweeps expired records itself.

pub mod memory;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

pub use memory::InMemoryStore;

/// Attribute holding the Unix expiry timestamp (seconds).
pub const TTL_ATTR: &str = "ttl";

/// A stored record: a flat JSON object of attributes.
pub type Item = serde_json::Map<String, serde_json::Value>;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a [`KvStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An atomic commit was rejected as a whole (a condition failed).
    /// None of its operations were applied.
    #[error("transaction cancelled: {0}")]
    TransactionCancelled(String),

    /// A record exists but does not have the expected shape.
    #[error("malformed record {key}: {reason}")]
    Malformed {
        /// Key of the offending record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Composite primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    /// Partition key.
    pub pk: String,
    /// Sort key.
    pub sk: String,
}

impl Key {
    /// Build a key from its two halves.
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    /// A self-keyed record: `pk == sk`.
    pub fn single(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            pk: id.clone(),
            sk: id,
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pk, self.sk)
    }
}

/// Options for a prefix [`query`](KvStore::query).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Return records in descending sort-key order.
    pub descending: bool,
}

/// One operation inside an atomic [`transact`](KvStore::transact) call.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Unconditional put (overwrites).
    Put {
        /// Target key.
        key: Key,
        /// New record.
        item: Item,
    },
    /// Put that fails the whole transaction if a live record already exists.
    Create {
        /// Target key.
        key: Key,
        /// New record.
        item: Item,
    },
    /// Unconditional delete (absent keys are fine).
    Delete {
        /// Target key.
        key: Key,
    },
}

impl WriteOp {
    /// The key this operation touches.
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            Self::Put { key, .. } | Self::Create { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// The store interface consumed by the broker.
///
/// Implementations must be `Send + Sync`: a single instance is shared by all
/// request handlers.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Point read. Expired records read as `None`.
    async fn get(&self, key: &Key) -> StoreResult<Option<Item>>;

    /// Point write (last write wins).
    async fn put(&self, key: Key, item: Item) -> StoreResult<()>;

    /// Point delete. Deleting an absent key is not an error.
    async fn delete(&self, key: &Key) -> StoreResult<()>;

    /// Conditional delete-and-fetch: removes the record only if it is
    /// present and unexpired, returning what was removed. Of any number of
    /// concurrent callers for the same key, at most one receives `Some`.
    async fn take(&self, key: &Key) -> StoreResult<Option<Item>>;

    /// Range query over `pk` for sort keys starting with `sk_prefix`.
    async fn query(
        &self,
        pk: &str,
        sk_prefix: &str,
        options: QueryOptions,
    ) -> StoreResult<Vec<(Key, Item)>>;

    /// All-or-nothing commit across several keys.
    async fn transact(&self, ops: Vec<WriteOp>) -> StoreResult<()>;
}

/// Serialize a record struct into an [`Item`].
pub fn to_item<T: Serialize>(key: &Key, record: &T) -> StoreResult<Item> {
    match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(StoreError::Malformed {
            key: key.to_string(),
            reason: "record did not serialize to an object".to_string(),
        }),
        Err(e) => Err(StoreError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Deserialize an [`Item`] back into a record struct.
pub fn from_item<T: DeserializeOwned>(key: &Key, item: Item) -> StoreResult<T> {
    serde_json::from_value(serde_json::Value::Object(item)).map_err(|e| StoreError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
