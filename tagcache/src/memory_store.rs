//! In-process store.

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};
use crate::keys::glob_match;
use crate::store::{BatchOp, Store, StoreBatch};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

const EXPIRY_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    String(Vec<u8>),
    Set(HashSet<String>),
    SortedSet(HashMap<String, i64>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Set(_) => "set",
            Value::SortedSet(_) => "zset",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

type Data = HashMap<String, Entry>;

/// A store held in process memory.
///
/// Keys carry an optional time-to-live measured against the injected
/// [`Clock`]. Elapsed keys read as absent straight away but are only dropped,
/// and announced on the expiry stream, by [`purge_expired`](Self::purge_expired),
/// mirroring how a server reports natively expired keys.
pub struct InMemoryStore {
    data: Arc<RwLock<Data>>,
    clock: Arc<dyn Clock>,
    expired: broadcast::Sender<String>,
    identity: String,
}

impl InMemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (expired, _) = broadcast::channel(EXPIRY_CHANNEL_CAPACITY);
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            clock,
            expired,
            identity: "memory".to_string(),
        }
    }

    /// Override the identity reported to the expiry handler registry.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Drop every key whose time-to-live has elapsed and publish it as expired.
    ///
    /// Returns the dropped keys.
    pub async fn purge_expired(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut data = self.data.write().await;
        let mut purged: Vec<String> = data
            .iter()
            .filter(|(_, entry)| is_elapsed(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        purged.sort();

        for key in &purged {
            data.remove(key);
        }
        drop(data);

        for key in &purged {
            // No receivers just means nobody is listening.
            let _ = self.expired.send(key.clone());
        }

        if !purged.is_empty() {
            debug!(count = purged.len(), "Purged expired keys");
        }
        purged
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.data
            .read()
            .await
            .values()
            .filter(|entry| !is_elapsed(entry, now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn live<'a>(&self, data: &'a Data, key: &str) -> Option<&'a Entry> {
        let now = self.clock.now();
        data.get(key).filter(|entry| !is_elapsed(entry, now))
    }

    /// Mutable access to a live set-like entry, creating it with `init` when
    /// missing or elapsed.
    fn live_mut<'a>(&self, data: &'a mut Data, key: &str, init: fn() -> Value) -> &'a mut Entry {
        let now = self.clock.now();
        if data.get(key).is_some_and(|entry| is_elapsed(entry, now)) {
            data.remove(key);
        }
        data.entry(key.to_string()).or_insert_with(|| Entry {
            value: init(),
            expires_at: None,
        })
    }

    fn apply(&self, data: &mut Data, op: &BatchOp) -> CacheResult<()> {
        match op {
            BatchOp::DeleteKey(key) => {
                data.remove(key);
            }
            BatchOp::AddToSet { key, members } => {
                let entry = self.live_mut(data, key, || Value::Set(HashSet::new()));
                match &mut entry.value {
                    Value::Set(set) => set.extend(members.iter().cloned()),
                    other => return Err(wrong_type(key, other)),
                }
            }
            BatchOp::RemoveFromSet { key, members } => {
                let now = self.clock.now();
                let Some(entry) = data.get_mut(key).filter(|entry| !is_elapsed(entry, now)) else {
                    return Ok(());
                };
                match &mut entry.value {
                    Value::Set(set) => {
                        for member in members {
                            set.remove(member);
                        }
                        if set.is_empty() {
                            data.remove(key);
                        }
                    }
                    other => return Err(wrong_type(key, other)),
                }
            }
        }
        Ok(())
    }

    fn check(&self, data: &Data, op: &BatchOp) -> CacheResult<()> {
        let key = match op {
            BatchOp::DeleteKey(_) => return Ok(()),
            BatchOp::AddToSet { key, .. } | BatchOp::RemoveFromSet { key, .. } => key,
        };
        match self.live(data, key).map(|entry| &entry.value) {
            None | Some(Value::Set(_)) => Ok(()),
            Some(other) => Err(wrong_type(key, other)),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_elapsed(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.is_some_and(|at| at <= now)
}

fn wrong_type(key: &str, found: &Value) -> CacheError {
    CacheError::Command(format!(
        "WRONGTYPE key '{}' holds a {} value",
        key,
        found.type_name()
    ))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_string(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let data = self.data.read().await;
        match self.live(&data, key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::String(bytes)) => Ok(Some(bytes.clone())),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        let data = self.data.read().await;
        // MGET answers nil for keys of another type.
        Ok(keys
            .iter()
            .map(|key| match self.live(&data, key).map(|entry| &entry.value) {
                Some(Value::String(bytes)) => Some(bytes.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set_string(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let expires_at = match ttl {
            Some(ttl) => {
                let ttl = ChronoDuration::from_std(ttl)
                    .map_err(|e| CacheError::Command(format!("invalid TTL: {}", e)))?;
                Some(self.clock.now() + ttl)
            }
            None => None,
        };

        self.data.write().await.insert(
            key.to_string(),
            Entry {
                value: Value::String(value),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete_keys(&self, keys: &[String]) -> CacheResult<u64> {
        let now = self.clock.now();
        let mut data = self.data.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = data.remove(key)
                && !is_elapsed(&entry, now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn set_members(&self, set_key: &str) -> CacheResult<HashSet<String>> {
        let data = self.data.read().await;
        match self.live(&data, set_key).map(|entry| &entry.value) {
            None => Ok(HashSet::new()),
            Some(Value::Set(set)) => Ok(set.clone()),
            Some(other) => Err(wrong_type(set_key, other)),
        }
    }

    async fn add_to_set(&self, set_key: &str, members: &[String]) -> CacheResult<()> {
        self.execute_atomic(StoreBatch::new().add_to_set(set_key, members))
            .await
    }

    async fn remove_from_set(&self, set_key: &str, members: &[String]) -> CacheResult<()> {
        self.execute_atomic(StoreBatch::new().remove_from_set(set_key, members))
            .await
    }

    async fn sorted_set_add(&self, set_key: &str, member: &str, rank: i64) -> CacheResult<()> {
        let mut data = self.data.write().await;
        let entry = self.live_mut(&mut data, set_key, || Value::SortedSet(HashMap::new()));
        match &mut entry.value {
            Value::SortedSet(scores) => {
                scores.insert(member.to_string(), rank);
                Ok(())
            }
            other => Err(wrong_type(set_key, other)),
        }
    }

    async fn sorted_set_remove(&self, set_key: &str, members: &[String]) -> CacheResult<()> {
        let now = self.clock.now();
        let mut data = self.data.write().await;
        let Some(entry) = data.get_mut(set_key).filter(|entry| !is_elapsed(entry, now)) else {
            return Ok(());
        };
        match &mut entry.value {
            Value::SortedSet(scores) => {
                for member in members {
                    scores.remove(member);
                }
                if scores.is_empty() {
                    data.remove(set_key);
                }
                Ok(())
            }
            other => Err(wrong_type(set_key, other)),
        }
    }

    async fn sorted_set_range_by_score(
        &self,
        set_key: &str,
        max_rank: i64,
    ) -> CacheResult<Vec<String>> {
        let data = self.data.read().await;
        match self.live(&data, set_key).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(scores)) => {
                let mut hits: Vec<(i64, &String)> = scores
                    .iter()
                    .filter(|(_, rank)| **rank <= max_rank)
                    .map(|(member, rank)| (*rank, member))
                    .collect();
                hits.sort();
                Ok(hits.into_iter().map(|(_, member)| member.clone()).collect())
            }
            Some(other) => Err(wrong_type(set_key, other)),
        }
    }

    async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        let data = self.data.read().await;
        Ok(self.live(&data, key).is_some())
    }

    fn scan_keys<'a>(&'a self, pattern: &str) -> BoxStream<'a, CacheResult<String>> {
        let pattern = pattern.to_string();
        stream::once(async move {
            let now = self.clock.now();
            let data = self.data.read().await;
            let keys: Vec<CacheResult<String>> = data
                .iter()
                .filter(|(key, entry)| !is_elapsed(entry, now) && glob_match(&pattern, key))
                .map(|(key, _)| Ok(key.clone()))
                .collect();
            stream::iter(keys)
        })
        .flatten()
        .boxed()
    }

    async fn execute_atomic(&self, batch: StoreBatch) -> CacheResult<()> {
        let mut data = self.data.write().await;
        for op in batch.ops() {
            self.check(&data, op)?;
        }
        for op in batch.ops() {
            self.apply(&mut data, op)?;
        }
        Ok(())
    }

    async fn subscribe_expired(&self) -> CacheResult<Option<BoxStream<'static, String>>> {
        let receiver = self.expired.subscribe();
        let keys = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(key) => return Some((key, receiver)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Expiry subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Some(keys.boxed()))
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn close(&self) -> CacheResult<()> {
        Ok(())
    }
}
