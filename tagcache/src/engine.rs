//! Tag-aware cache engine.
//!
//! The engine owns the consistency protocol between cached entries, the tag
//! indexes and the expiry schedule:
//!
//! - an entry is always written before its index shadows;
//! - tag and schedule maintenance run concurrently after the entry write and
//!   their failures are logged, never returned;
//! - a read that finds a logically expired envelope removes it and reports
//!   the key as absent.

use crate::clock::{Clock, SystemClock};
use crate::codec::{CacheEnvelope, CacheItemCodec};
use crate::config::CacheConfiguration;
use crate::error::CacheResult;
use crate::keys::KeySpace;
use crate::logging::{CacheLogger, TracingLogger};
use crate::schedule::ExpirySchedule;
use crate::store::{Store, ttl_until};
use crate::tag_index::TagIndex;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// The tag-aware cache over a [`Store`].
pub struct CacheEngine {
    store: Arc<dyn Store>,
    codec: CacheItemCodec,
    tags: TagIndex,
    schedule: ExpirySchedule,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn CacheLogger>,
    grace_period: ChronoDuration,
    max_parallelism: usize,
}

impl CacheEngine {
    /// Create an engine over `store` using the system clock.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use tagcache::{CacheConfiguration, CacheEngine, InMemoryStore};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), tagcache::CacheError> {
    /// let engine = CacheEngine::new(Arc::new(InMemoryStore::new()), &CacheConfiguration::new());
    ///
    /// engine.set("User:42", Some(&"Ada".to_string()), None, &["vip"]).await?;
    /// let vips: Vec<String> = engine.get_by_tag("vip").await?;
    /// assert_eq!(vips, vec!["Ada".to_string()]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(store: Arc<dyn Store>, config: &CacheConfiguration) -> Self {
        let keys = KeySpace::new(config.root_namespace.clone());
        let max_parallelism = config.max_parallelism.max(1);

        Self {
            codec: CacheItemCodec::new(config.serializer),
            tags: TagIndex::new(store.clone(), keys.clone(), max_parallelism),
            schedule: ExpirySchedule::new(store.clone(), &keys),
            store,
            clock: Arc::new(SystemClock),
            logger: Arc::new(TracingLogger),
            grace_period: ChronoDuration::from_std(config.expiry_grace_period)
                .unwrap_or(ChronoDuration::MAX),
            max_parallelism,
        }
    }

    /// Use another clock for expiry decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Route swallowed failures to another logger.
    pub fn with_logger(mut self, logger: Arc<dyn CacheLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The tag index.
    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    /// The expiry schedule.
    pub fn schedule(&self) -> &ExpirySchedule {
        &self.schedule
    }

    /// The logger receiving swallowed failures.
    pub fn logger(&self) -> &Arc<dyn CacheLogger> {
        &self.logger
    }

    /// Store `value` under `key` with an optional absolute expiry and tags.
    ///
    /// A `None` value is a no-op that never reaches the store. Returns
    /// `Ok(false)` when nothing was written, either for that reason or
    /// because no connection was available.
    pub async fn set<T>(
        &self,
        key: &str,
        value: Option<&T>,
        expiry: Option<DateTime<Utc>>,
        tags: &[&str],
    ) -> CacheResult<bool>
    where
        T: Serialize + ?Sized,
    {
        let Some(value) = value else {
            debug!(key = %key, "Ignoring set of an absent value");
            return Ok(false);
        };

        let tags = distinct(tags);
        let payload = self.codec.encode(key, value, expiry, Some(&tags))?;
        let ttl = expiry.map(|expiry| ttl_until(expiry, self.clock.now()));

        if !self.store.set_string(key, payload, ttl).await? {
            self.logger.log("set", key, Some("store unavailable, value not written"));
            return Ok(false);
        }

        let (tagged, scheduled) = tokio::join!(self.tags.update_tags(key, &tags), async {
            match expiry {
                Some(expiry) => self.schedule.set_key_expiry(key, expiry).await,
                None => self.schedule.remove_key_expiry(&[key.to_string()]).await,
            }
        });
        self.advisory("set.tags", key, tagged);
        self.advisory("set.expiry", key, scheduled);

        debug!(key = %key, tags = tags.len(), expiry = ?expiry, "Cache entry written");
        Ok(true)
    }

    /// Read the value under `key`.
    ///
    /// A value whose expiry has passed is removed and reported as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let Some(bytes) = self.store.get_string(key).await? else {
            return Ok(None);
        };
        let Some(envelope) = self.codec.decode::<T>(&bytes)? else {
            return Ok(None);
        };
        Ok(self.admit(envelope).await)
    }

    /// Whether a live value is stored under `key`.
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.store.key_exists(key).await
    }

    /// Values of every entry tagged with `tag`.
    ///
    /// Entries that fail to decode are logged and skipped; use
    /// [`get_by_tag_results`](Self::get_by_tag_results) to observe them.
    /// Returns an empty vector when nothing carries the tag.
    pub async fn get_by_tag<T: DeserializeOwned + Send>(&self, tag: &str) -> CacheResult<Vec<T>> {
        let results = self.get_by_tag_results(tag).await?;
        let mut values = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(e) => self.logger.error("get_by_tag", tag, &e),
            }
        }
        Ok(values)
    }

    /// One result per live entry tagged with `tag`, in no particular order.
    ///
    /// Index entries pointing at missing keys are skipped. Expired entries are
    /// removed and skipped.
    pub async fn get_by_tag_results<T: DeserializeOwned + Send>(
        &self,
        tag: &str,
    ) -> CacheResult<Vec<CacheResult<T>>> {
        let mut keys: Vec<String> = self.tags.keys_for_tag(tag).await?.into_iter().collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        keys.sort();

        let payloads = self.store.get_many(&keys).await?;
        let results = stream::iter(keys.into_iter().zip(payloads))
            .filter_map(|(key, payload)| async move { payload.map(|bytes| (key, bytes)) })
            .map(|(key, bytes)| async move {
                match self.codec.decode::<T>(&bytes) {
                    Ok(Some(envelope)) => self.admit(envelope).await.map(Ok),
                    Ok(None) => None,
                    Err(e) => {
                        debug!(key = %key, error = %e, "Skipping undecodable tagged entry");
                        Some(Err(e))
                    }
                }
            })
            .buffer_unordered(self.max_parallelism)
            .filter_map(futures::future::ready)
            .collect()
            .await;
        Ok(results)
    }

    /// Keys currently tagged with `tag`.
    pub async fn keys_for_tag(&self, tag: &str) -> CacheResult<HashSet<String>> {
        self.tags.keys_for_tag(tag).await
    }

    /// Tags currently indexed for `key`.
    pub async fn tags_for_key(&self, key: &str) -> CacheResult<HashSet<String>> {
        self.tags.tags_for_key(key).await
    }

    /// Remove a single key. Removing an absent key is not an error.
    pub async fn remove(&self, key: &str) -> CacheResult<u64> {
        self.remove_keys(&[key.to_string()]).await
    }

    /// Remove `keys` from the store, the tag index and the schedule.
    ///
    /// Returns how many entries existed. An empty list does nothing.
    pub async fn remove_keys(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let removed = self.store.delete_keys(keys).await?;
        let (untagged, unscheduled) = tokio::join!(
            self.tags.remove_tags(keys),
            self.schedule.remove_key_expiry(keys)
        );
        let arg = keys.join(",");
        debug!(keys = %arg, removed, "Cache entries removed");
        self.advisory("remove.tags", &arg, untagged);
        self.advisory("remove.expiry", &arg, unscheduled);

        Ok(removed)
    }

    /// Remove a decoded envelope: its key, its tags (the envelope's and the
    /// indexed ones) and its schedule entry, concurrently.
    pub async fn remove_envelope<T>(&self, envelope: &CacheEnvelope<T>) -> CacheResult<()> {
        let key = envelope.key.as_str();
        let unscheduled_key = [envelope.key.clone()];
        let (deleted, untagged, unscheduled) = tokio::join!(
            self.store.delete_key(key),
            self.tags.remove_key(key, envelope.tags()),
            self.schedule.remove_key_expiry(&unscheduled_key)
        );
        self.advisory("remove.tags", key, untagged);
        self.advisory("remove.expiry", key, unscheduled);
        deleted?;
        Ok(())
    }

    /// Remove every entry tagged with `tag`.
    pub async fn remove_by_tag(&self, tag: &str) -> CacheResult<u64> {
        let mut keys: Vec<String> = self.tags.keys_for_tag(tag).await?.into_iter().collect();
        if keys.is_empty() {
            return Ok(0);
        }
        keys.sort();
        self.remove_keys(&keys).await
    }

    /// Clean up after a key the store expired on its own.
    pub async fn handle_expired_key(&self, key: &str) -> CacheResult<()> {
        self.logger.log("expired", key, None);
        self.remove(key).await.map(|_| ())
    }

    /// Sweep everything that has expired or lost its entry.
    ///
    /// Reclaims the keys scheduled at or before now plus the grace period,
    /// then reconciles the reverse and forward tag indexes against the
    /// store. Returns the distinct reclaimed keys.
    ///
    /// Scans the whole index namespace; run it rarely.
    pub async fn remove_expired_keys(&self) -> CacheResult<Vec<String>> {
        let now = self.clock.now();
        let cutoff = now.checked_add_signed(self.grace_period).unwrap_or(now);

        let scheduled = self.schedule.get_expired_keys(cutoff).await?;
        self.remove_keys(&scheduled).await?;

        let mut reclaimed = scheduled;
        let mut seen: HashSet<String> = reclaimed.iter().cloned().collect();

        let reverse = self.tags.reconcile_reverse_index().await;
        let forward = self.tags.reconcile_forward_index().await;
        for pass in [reverse, forward] {
            match pass {
                Ok(keys) => {
                    for key in keys {
                        if seen.insert(key.clone()) {
                            reclaimed.push(key);
                        }
                    }
                }
                Err(e) => self.logger.error("remove_expired_keys", "reconcile", &e),
            }
        }

        info!(count = reclaimed.len(), cutoff = %cutoff, "Expired keys reclaimed");
        Ok(reclaimed)
    }

    /// Return the envelope's value, or remove it and return `None` when it
    /// has expired.
    async fn admit<T>(&self, envelope: CacheEnvelope<T>) -> Option<T> {
        if !envelope.is_expired_at(self.clock.now()) {
            return Some(envelope.value);
        }

        debug!(key = %envelope.key, "Lazily expiring cache entry");
        if let Err(e) = self.remove_envelope(&envelope).await {
            self.logger.error("expire", &envelope.key, &e);
        }
        None
    }

    fn advisory(&self, method: &str, arg: &str, result: CacheResult<()>) {
        if let Err(e) = result {
            self.logger.error(method, arg, &e);
        }
    }
}

fn distinct(tags: &[&str]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .filter(|tag| seen.insert(**tag))
        .map(|tag| tag.to_string())
        .collect()
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("store", &self.store.identity())
            .field("format", &self.codec.format())
            .field("schedule", &self.schedule.set_key())
            .field("max_parallelism", &self.max_parallelism)
            .finish()
    }
}
