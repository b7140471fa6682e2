//! Secondary indexes between tags and cache keys.

use crate::error::{CacheError, CacheResult};
use crate::keys::KeySpace;
use crate::store::{Store, StoreBatch};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Maintains `tag -> {keys}` (reverse) and `key -> {tags}` (forward).
///
/// Each index step is a single Store transaction, but steps are not atomic
/// with each other or with the entry write. Drift is repaired by
/// [`reconcile_against_live_keys`](Self::reconcile_against_live_keys).
#[derive(Clone)]
pub struct TagIndex {
    store: Arc<dyn Store>,
    keys: KeySpace,
    max_parallelism: usize,
}

impl TagIndex {
    /// Create an index over `store` under the given key space.
    pub fn new(store: Arc<dyn Store>, keys: KeySpace, max_parallelism: usize) -> Self {
        Self {
            store,
            keys,
            max_parallelism: max_parallelism.max(1),
        }
    }

    /// Keys tagged with `tag`.
    pub async fn keys_for_tag(&self, tag: &str) -> CacheResult<HashSet<String>> {
        self.store.set_members(&self.keys.keys_for_tag(tag)).await
    }

    /// Tags carried by `key`.
    pub async fn tags_for_key(&self, key: &str) -> CacheResult<HashSet<String>> {
        self.store.set_members(&self.keys.tags_for_key(key)).await
    }

    /// Replace the forward entry of `key`. Empty `tags` clears it.
    pub async fn set_tags_for_key(&self, key: &str, tags: &[String]) -> CacheResult<()> {
        let index_key = self.keys.tags_for_key(key);
        let batch = StoreBatch::new()
            .delete_key(&index_key)
            .add_to_set(&index_key, tags);
        self.store.execute_atomic(batch).await
    }

    /// Add `key` to the reverse entry of every tag.
    pub async fn add_key_to_tags(&self, key: &str, tags: &[String]) -> CacheResult<()> {
        let member = [key.to_string()];
        let batch = tags.iter().fold(StoreBatch::new(), |batch, tag| {
            batch.add_to_set(self.keys.keys_for_tag(tag), &member)
        });
        self.execute(batch).await
    }

    /// Remove `key` from the reverse entry of every tag.
    pub async fn remove_key_from_tags(&self, key: &str, tags: &[String]) -> CacheResult<()> {
        let member = [key.to_string()];
        let batch = tags.iter().fold(StoreBatch::new(), |batch, tag| {
            batch.remove_from_set(self.keys.keys_for_tag(tag), &member)
        });
        self.execute(batch).await
    }

    /// Re-index `key` under exactly `tags`.
    ///
    /// The key leaves every tag it no longer carries, then the forward entry
    /// is replaced and the new reverse entries are added concurrently.
    pub async fn update_tags(&self, key: &str, tags: &[String]) -> CacheResult<()> {
        let previous = self.tags_for_key(key).await?;
        let stale: Vec<String> = previous
            .into_iter()
            .filter(|tag| !tags.contains(tag))
            .collect();

        if !stale.is_empty() {
            debug!(key = %key, stale = ?stale, "Removing key from stale tags");
            self.remove_key_from_tags(key, &stale).await?;
        }

        futures::try_join!(
            self.set_tags_for_key(key, tags),
            self.add_key_to_tags(key, tags)
        )?;
        Ok(())
    }

    /// Drop `key` from both indexes.
    ///
    /// `known_tags` (e.g. from a decoded envelope) are removed along with
    /// whatever the forward index lists.
    pub async fn remove_key(&self, key: &str, known_tags: &[String]) -> CacheResult<()> {
        let mut tags: BTreeSet<String> = self.tags_for_key(key).await?.into_iter().collect();
        tags.extend(known_tags.iter().cloned());

        let member = [key.to_string()];
        let batch = tags.iter().fold(
            StoreBatch::new().delete_key(self.keys.tags_for_key(key)),
            |batch, tag| batch.remove_from_set(self.keys.keys_for_tag(tag), &member),
        );
        self.store.execute_atomic(batch).await
    }

    /// Drop every key in `keys` from both indexes, with bounded parallelism.
    pub async fn remove_tags(&self, keys: &[String]) -> CacheResult<()> {
        stream::iter(keys.iter().cloned())
            .map(|key| async move { self.remove_key(&key, &[]).await })
            .buffer_unordered(self.max_parallelism)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    /// Remove reverse-index members whose key no longer exists.
    ///
    /// Returns the reclaimed keys. A key is only dropped after the Store
    /// reported it absent, so concurrent writers are never unindexed.
    pub async fn reconcile_reverse_index(&self) -> CacheResult<Vec<String>> {
        let index_keys: Vec<String> = self
            .store
            .scan_keys(&self.keys.keys_for_tag_pattern())
            .try_collect()
            .await?;

        let mut reclaimed = BTreeSet::new();
        for index_key in index_keys {
            let members: Vec<String> = self.store.set_members(&index_key).await?.into_iter().collect();
            let missing = self.missing(members).await?;
            if missing.is_empty() {
                continue;
            }

            debug!(index = %index_key, count = missing.len(), "Dropping vanished keys from tag");
            self.store.remove_from_set(&index_key, &missing).await?;
            reclaimed.extend(missing);
        }

        let reclaimed: Vec<String> = reclaimed.into_iter().collect();
        self.remove_tags(&reclaimed).await?;
        Ok(reclaimed)
    }

    /// Remove forward-index entries whose key no longer exists.
    ///
    /// Returns the reclaimed keys.
    pub async fn reconcile_forward_index(&self) -> CacheResult<Vec<String>> {
        let index_keys: Vec<String> = self
            .store
            .scan_keys(&self.keys.tags_for_key_pattern())
            .try_collect()
            .await?;

        let keys: Vec<String> = index_keys
            .iter()
            .filter_map(|index_key| self.keys.key_from_index_key(index_key))
            .map(str::to_string)
            .collect();

        let mut reclaimed = self.missing(keys).await?;
        reclaimed.sort();
        self.remove_tags(&reclaimed).await?;
        Ok(reclaimed)
    }

    /// Both reconciliation passes; returns the distinct reclaimed keys.
    pub async fn reconcile_against_live_keys(&self) -> CacheResult<Vec<String>> {
        let mut reclaimed = self.reconcile_reverse_index().await?;
        for key in self.reconcile_forward_index().await? {
            if !reclaimed.contains(&key) {
                reclaimed.push(key);
            }
        }
        Ok(reclaimed)
    }

    /// The subset of `keys` the Store reports as absent.
    async fn missing(&self, keys: Vec<String>) -> CacheResult<Vec<String>> {
        stream::iter(keys)
            .map(|key| async move {
                let exists = self.store.key_exists(&key).await?;
                Ok::<_, CacheError>((!exists).then_some(key))
            })
            .buffer_unordered(self.max_parallelism)
            .try_filter_map(|key| async move { Ok(key) })
            .try_collect()
            .await
    }

    async fn execute(&self, batch: StoreBatch) -> CacheResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.store.execute_atomic(batch).await
    }
}
