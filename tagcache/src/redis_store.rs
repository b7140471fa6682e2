//! Redis-backed store.

use crate::error::{CacheError, CacheResult};
use crate::store::{BatchOp, Store, StoreBatch};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tagcache_redis::{RedisConfig, RedisConnection};
use tracing::{debug, info, warn};

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: usize = 500;

/// Store over a single lazily opened Redis connection.
pub struct RedisStore {
    connection: RedisConnection,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// Fails fast with [`CacheError::Configuration`] when the configuration is
    /// invalid or the server does not answer.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tagcache::RedisStore;
    /// use tagcache_redis::RedisConfig;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), tagcache::CacheError> {
    ///     let store = RedisStore::connect(RedisConfig::new("localhost")).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: RedisConfig) -> CacheResult<Self> {
        let host = config.host_identity();
        let connection = RedisConnection::connect(config).await.map_err(|e| {
            CacheError::Configuration(format!("cannot reach Redis at {}: {}", host, e))
        })?;

        info!(host = %host, "Redis store connected");
        Ok(Self { connection })
    }

    /// Wrap an existing connection handle without contacting the server.
    pub fn from_connection(connection: RedisConnection) -> Self {
        Self { connection }
    }

    /// Get the underlying connection.
    pub fn connection(&self) -> &RedisConnection {
        &self.connection
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> CacheResult<T> {
        let mut conn = self.connection.get().await?;
        let value: T = self.connection.timed(cmd.query_async(&mut conn)).await?;
        Ok(value)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_string(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.query(redis::cmd("MGET").arg(keys)).await
    }

    async fn set_string(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let mut conn = match self.connection.get().await {
            Ok(conn) => conn,
            Err(e) if e.is_connection_error() => {
                warn!(key = %key, error = %e, "No Redis connection, value not written");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }

        let _: () = self.connection.timed(cmd.query_async(&mut conn)).await?;
        Ok(true)
    }

    async fn delete_keys(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(keys)).await
    }

    async fn set_members(&self, set_key: &str) -> CacheResult<HashSet<String>> {
        self.query(redis::cmd("SMEMBERS").arg(set_key)).await
    }

    async fn add_to_set(&self, set_key: &str, members: &[String]) -> CacheResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let _: u64 = self.query(redis::cmd("SADD").arg(set_key).arg(members)).await?;
        Ok(())
    }

    async fn remove_from_set(&self, set_key: &str, members: &[String]) -> CacheResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let _: u64 = self.query(redis::cmd("SREM").arg(set_key).arg(members)).await?;
        Ok(())
    }

    async fn sorted_set_add(&self, set_key: &str, member: &str, rank: i64) -> CacheResult<()> {
        let _: u64 = self
            .query(redis::cmd("ZADD").arg(set_key).arg(rank).arg(member))
            .await?;
        Ok(())
    }

    async fn sorted_set_remove(&self, set_key: &str, members: &[String]) -> CacheResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let _: u64 = self.query(redis::cmd("ZREM").arg(set_key).arg(members)).await?;
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        set_key: &str,
        max_rank: i64,
    ) -> CacheResult<Vec<String>> {
        self.query(
            redis::cmd("ZRANGEBYSCORE")
                .arg(set_key)
                .arg("-inf")
                .arg(max_rank),
        )
        .await
    }

    async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        self.query(redis::cmd("EXISTS").arg(key)).await
    }

    fn scan_keys<'a>(&'a self, pattern: &str) -> BoxStream<'a, CacheResult<String>> {
        let pattern = pattern.to_string();
        stream::try_unfold(Some(0u64), move |cursor| {
            let pattern = pattern.clone();
            async move {
                let Some(cursor) = cursor else {
                    return Ok::<_, CacheError>(None);
                };
                let (next, keys): (u64, Vec<String>) = self
                    .query(
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(&pattern)
                            .arg("COUNT")
                            .arg(SCAN_COUNT),
                    )
                    .await?;
                Ok(Some((keys, (next != 0).then_some(next))))
            }
        })
        .map_ok(|keys| stream::iter(keys.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn execute_atomic(&self, batch: StoreBatch) -> CacheResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.into_ops() {
            match op {
                BatchOp::DeleteKey(key) => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                BatchOp::AddToSet { key, members } => {
                    pipe.cmd("SADD").arg(key).arg(members).ignore();
                }
                BatchOp::RemoveFromSet { key, members } => {
                    pipe.cmd("SREM").arg(key).arg(members).ignore();
                }
            }
        }

        let mut conn = self.connection.get().await?;
        let _: () = self.connection.timed(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn subscribe_expired(&self) -> CacheResult<Option<BoxStream<'static, String>>> {
        let pubsub = self.connection.pubsub();

        if self.connection.config().allow_admin
            && let Err(e) = pubsub.enable_expiry_events().await
        {
            warn!(error = %e, "Could not enable keyspace expiry events");
        }

        let database = self.connection.config().database_index();
        let subscription = pubsub.expired_keys(database).await?;
        debug!(host = %self.identity(), "Listening for expired keys");

        let keys = subscription
            .into_stream()
            .filter(|message| futures::future::ready(message.is_expiry_event()))
            .map(|message| message.payload);
        Ok(Some(keys.boxed()))
    }

    fn identity(&self) -> String {
        self.connection.host_identity()
    }

    async fn close(&self) -> CacheResult<()> {
        self.connection.reset().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn config() -> RedisConfig {
        RedisConfig::builder()
            .host("127.0.0.1")
            .port(6379)
            .database(15)
            .build()
    }

    #[tokio::test]
    async fn test_connect_fails_fast_on_unreachable_host() {
        let config = RedisConfig::builder()
            .host("127.0.0.1")
            .port(1)
            .connect_timeout(Duration::from_millis(500))
            .build();

        let err = RedisStore::connect(config).await.err().unwrap();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[test]
    fn test_identity_without_connecting() {
        let connection = RedisConnection::new(config()).unwrap();
        let store = RedisStore::from_connection(connection);
        assert_eq!(store.identity(), "127.0.0.1:6379/15");
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_expiry_stream_ignores_other_databases() {
        let admin = |db| {
            RedisConfig::builder()
                .host("127.0.0.1")
                .database(db)
                .allow_admin(true)
                .build()
        };
        let mine = RedisStore::connect(admin(15)).await.unwrap();
        let other = RedisStore::connect(admin(14)).await.unwrap();

        let mut expired = mine.subscribe_expired().await.unwrap().unwrap();

        other
            .set_string("tagcache:test:other", b"v".to_vec(), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        mine.set_string("tagcache:test:mine", b"v".to_vec(), Some(Duration::from_millis(50)))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), expired.next())
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("tagcache:test:mine"));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_string_set_and_sorted_set() {
        let store = RedisStore::connect(config()).await.unwrap();

        assert!(
            store
                .set_string("tagcache:test:k", b"v".to_vec(), Some(Duration::from_secs(5)))
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_string("tagcache:test:k").await.unwrap(),
            Some(b"v".to_vec())
        );

        store.sorted_set_add("tagcache:test:z", "a", 10).await.unwrap();
        store.sorted_set_add("tagcache:test:z", "b", 20).await.unwrap();
        let hits = store
            .sorted_set_range_by_score("tagcache:test:z", 15)
            .await
            .unwrap();
        assert_eq!(hits, vec!["a".to_string()]);

        let keys: Vec<String> = store
            .scan_keys("tagcache:test:*")
            .try_collect()
            .await
            .unwrap();
        assert!(keys.contains(&"tagcache:test:z".to_string()));

        store
            .delete_keys(&["tagcache:test:k".to_string(), "tagcache:test:z".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_atomic_batch() {
        let store = RedisStore::connect(config()).await.unwrap();
        let members = vec!["x".to_string(), "y".to_string()];

        store
            .execute_atomic(
                StoreBatch::new()
                    .delete_key("tagcache:test:s")
                    .add_to_set("tagcache:test:s", &members),
            )
            .await
            .unwrap();

        assert_eq!(store.set_members("tagcache:test:s").await.unwrap().len(), 2);
        store.delete_key("tagcache:test:s").await.unwrap();
    }
}
