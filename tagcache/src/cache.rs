//! Typed cache facade.
//!
//! [`Cache`] is assembled from four narrow capabilities so a host can swap
//! any of them (for tests, or to decorate one operation) without touching
//! the others. [`CacheEngine`] provides all four.

use crate::engine::CacheEngine;
use crate::error::{CacheError, CacheResult};
use crate::keys::qualified_key;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::sync::Arc;
use tracing::warn;

/// Writes JSON payloads.
#[async_trait]
pub trait CacheSetter: Send + Sync {
    /// Store `json` under `key`. Returns whether anything was written.
    async fn set_json(
        &self,
        key: &str,
        json: &str,
        expiry: Option<DateTime<Utc>>,
        tags: &[&str],
    ) -> CacheResult<bool>;
}

/// Reads JSON payloads.
#[async_trait]
pub trait CacheGetter: Send + Sync {
    /// JSON stored under `key`, if live.
    async fn get_json(&self, key: &str) -> CacheResult<Option<String>>;

    /// Whether `key` holds a value.
    async fn exists(&self, key: &str) -> CacheResult<bool>;
}

/// Removes entries.
#[async_trait]
pub trait CacheRemover: Send + Sync {
    /// Remove `key`; absent keys are not an error.
    async fn remove(&self, key: &str) -> CacheResult<u64>;
}

/// Resolves tags.
#[async_trait]
pub trait TagLookup: Send + Sync {
    /// JSON of every live entry tagged with `tag`.
    async fn get_json_by_tag(&self, tag: &str) -> CacheResult<Vec<String>>;
}

#[async_trait]
impl CacheSetter for CacheEngine {
    async fn set_json(
        &self,
        key: &str,
        json: &str,
        expiry: Option<DateTime<Utc>>,
        tags: &[&str],
    ) -> CacheResult<bool> {
        self.set(key, Some(json), expiry, tags).await
    }
}

#[async_trait]
impl CacheGetter for CacheEngine {
    async fn get_json(&self, key: &str) -> CacheResult<Option<String>> {
        self.get::<String>(key).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        CacheEngine::exists(self, key).await
    }
}

#[async_trait]
impl CacheRemover for CacheEngine {
    async fn remove(&self, key: &str) -> CacheResult<u64> {
        CacheEngine::remove(self, key).await
    }
}

#[async_trait]
impl TagLookup for CacheEngine {
    async fn get_json_by_tag(&self, tag: &str) -> CacheResult<Vec<String>> {
        self.get_by_tag::<String>(tag).await
    }
}

/// Typed cache.
///
/// Keys are qualified with the short type name of the value, so
/// `cache.save("42", &user, ..)` for a `User` is stored under `User:42`.
/// Values are stored as JSON.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use serde::{Deserialize, Serialize};
/// use tagcache::{Cache, CacheConfiguration, CacheEngine, InMemoryStore};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct User {
///     name: String,
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), tagcache::CacheError> {
/// let engine = CacheEngine::new(Arc::new(InMemoryStore::new()), &CacheConfiguration::new());
/// let cache = Cache::from_engine(Arc::new(engine));
///
/// let ada = User { name: "Ada".into() };
/// cache.save(42, &ada, None, &["vip"]).await?;
///
/// assert_eq!(cache.get::<User>(42).await?, Some(ada));
/// assert_eq!(cache.get_by_tag::<User>("vip").await?.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Cache {
    setter: Arc<dyn CacheSetter>,
    getter: Arc<dyn CacheGetter>,
    tags: Arc<dyn TagLookup>,
    remover: Arc<dyn CacheRemover>,
}

impl Cache {
    /// Assemble a cache from its capabilities.
    pub fn new(
        setter: Arc<dyn CacheSetter>,
        getter: Arc<dyn CacheGetter>,
        tags: Arc<dyn TagLookup>,
        remover: Arc<dyn CacheRemover>,
    ) -> Self {
        Self {
            setter,
            getter,
            tags,
            remover,
        }
    }

    /// A cache whose capabilities are all served by `engine`.
    pub fn from_engine(engine: Arc<CacheEngine>) -> Self {
        Self::new(engine.clone(), engine.clone(), engine.clone(), engine)
    }

    /// Save `value` under the type-qualified `key`.
    pub async fn save<T>(
        &self,
        key: impl Display,
        value: &T,
        expiry: Option<DateTime<Utc>>,
        tags: &[&str],
    ) -> CacheResult<bool>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_string(value).map_err(|e| CacheError::Encode(e.to_string()))?;
        self.setter
            .set_json(&qualified_key::<T>(&key.to_string()), &json, expiry, tags)
            .await
    }

    /// Get the value saved under the type-qualified `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: impl Display) -> CacheResult<Option<T>> {
        match self.getter.get_json(&qualified_key::<T>(&key.to_string())).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    /// Values tagged with `tag` that decode as `T`.
    ///
    /// Entries of other shapes are skipped. Empty when nothing matches.
    pub async fn get_by_tag<T: DeserializeOwned>(&self, tag: &str) -> CacheResult<Vec<T>> {
        let values = self
            .tags
            .get_json_by_tag(tag)
            .await?
            .into_iter()
            .filter_map(|json| match serde_json::from_str(&json) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Skipping tagged value of another type");
                    None
                }
            })
            .collect();
        Ok(values)
    }

    /// Delete the value saved under the type-qualified `key`.
    pub async fn delete<T: ?Sized>(&self, key: impl Display) -> CacheResult<u64> {
        self.remover
            .remove(&qualified_key::<T>(&key.to_string()))
            .await
    }

    /// Whether a value is saved under the type-qualified `key`.
    pub async fn exists<T: ?Sized>(&self, key: impl Display) -> CacheResult<bool> {
        self.getter
            .exists(&qualified_key::<T>(&key.to_string()))
            .await
    }
}
