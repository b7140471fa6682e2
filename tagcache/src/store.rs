//! Store trait definition.

use crate::error::CacheResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashSet;
use std::time::Duration;

/// Shortest time-to-live handed to a store.
pub const MIN_TTL: Duration = Duration::from_secs(1);

/// Time-to-live for an absolute expiry, clamped to [`MIN_TTL`].
///
/// Stores read a zero or negative TTL as "no expiry" (or reject it), so an
/// expiry that has already passed still yields a short positive TTL.
pub fn ttl_until(expiry: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expiry - now)
        .to_std()
        .map(|ttl| ttl.max(MIN_TTL))
        .unwrap_or(MIN_TTL)
}

/// One command inside a [`StoreBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Delete a key of any type.
    DeleteKey(String),
    /// Add members to a set.
    AddToSet { key: String, members: Vec<String> },
    /// Remove members from a set.
    RemoveFromSet { key: String, members: Vec<String> },
}

/// Commands applied all-or-nothing by [`Store::execute_atomic`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreBatch {
    ops: Vec<BatchOp>,
}

impl StoreBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a key deletion.
    pub fn delete_key(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::DeleteKey(key.into()));
        self
    }

    /// Queue a set addition. Skipped when `members` is empty.
    pub fn add_to_set(mut self, key: impl Into<String>, members: &[String]) -> Self {
        if !members.is_empty() {
            self.ops.push(BatchOp::AddToSet {
                key: key.into(),
                members: members.to_vec(),
            });
        }
        self
    }

    /// Queue a set removal. Skipped when `members` is empty.
    pub fn remove_from_set(mut self, key: impl Into<String>, members: &[String]) -> Self {
        if !members.is_empty() {
            self.ops.push(BatchOp::RemoveFromSet {
                key: key.into(),
                members: members.to_vec(),
            });
        }
        self
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The queued commands, in order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Take the queued commands.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Key-value store with sets, sorted sets and native expiry.
///
/// Implementations own no cache logic; they translate each call into one
/// round trip (or one transaction) against the backing server.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a value.
    async fn get_string(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Read several values in one round trip, in the order of `keys`.
    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<Vec<u8>>>>;

    /// Write a value with an optional relative time-to-live.
    ///
    /// Returns `Ok(false)` when no connection could be obtained; that case is
    /// a soft failure, not an error.
    async fn set_string(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> CacheResult<bool>;

    /// Delete keys of any type, returning how many existed.
    async fn delete_keys(&self, keys: &[String]) -> CacheResult<u64>;

    /// Delete a single key.
    async fn delete_key(&self, key: &str) -> CacheResult<bool> {
        Ok(self.delete_keys(&[key.to_string()]).await? > 0)
    }

    /// Members of a set; empty when the set does not exist.
    async fn set_members(&self, set_key: &str) -> CacheResult<HashSet<String>>;

    /// Add members to a set.
    async fn add_to_set(&self, set_key: &str, members: &[String]) -> CacheResult<()>;

    /// Remove members from a set.
    async fn remove_from_set(&self, set_key: &str, members: &[String]) -> CacheResult<()>;

    /// Add or move `member` in a sorted set.
    async fn sorted_set_add(&self, set_key: &str, member: &str, rank: i64) -> CacheResult<()>;

    /// Remove members from a sorted set.
    async fn sorted_set_remove(&self, set_key: &str, members: &[String]) -> CacheResult<()>;

    /// Members with a score of at most `max_rank`, lowest score first.
    async fn sorted_set_range_by_score(
        &self,
        set_key: &str,
        max_rank: i64,
    ) -> CacheResult<Vec<String>>;

    /// Whether a key exists.
    async fn key_exists(&self, key: &str) -> CacheResult<bool>;

    /// Lazily enumerate keys matching a glob pattern.
    ///
    /// Walks the whole keyspace; keep it off hot paths.
    fn scan_keys<'a>(&'a self, pattern: &str) -> BoxStream<'a, CacheResult<String>>;

    /// Apply every command in `batch` as one transaction.
    async fn execute_atomic(&self, batch: StoreBatch) -> CacheResult<()>;

    /// Stream of keys the store expired natively.
    ///
    /// `Ok(None)` when the store cannot push expiry notifications.
    async fn subscribe_expired(&self) -> CacheResult<Option<BoxStream<'static, String>>>;

    /// Identity of the server behind this store, e.g. `host:port/db`.
    fn identity(&self) -> String;

    /// Release the connection. The store reconnects on next use.
    async fn close(&self) -> CacheResult<()>;
}
