//! Lazily established, shared Redis connection.

use redis::Client;
use redis::aio::ConnectionManager;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{RedisConfig, RedisError, Result, pubsub::PubSub};

/// A shared, multiplexed Redis connection that is opened on first use.
///
/// The underlying [`ConnectionManager`] multiplexes all commands over a single
/// socket and reconnects on its own; clones handed out by [`get`](Self::get)
/// are cheap. [`reset`](Self::reset) drops the cached handle so that the next
/// call opens a fresh connection.
pub struct RedisConnection {
    config: RedisConfig,
    client: Client,
    manager: Mutex<Option<ConnectionManager>>,
}

impl RedisConnection {
    /// Create a connection handle without connecting.
    ///
    /// Fails if the configuration cannot describe a Redis server.
    pub fn new(config: RedisConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::open(config.connection_url()?)
            .map_err(|e| RedisError::Config(e.to_string()))?;

        Ok(Self {
            config,
            client,
            manager: Mutex::new(None),
        })
    }

    /// Create a connection handle and verify the server answers `PING`.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let connection = Self::new(config)?;
        connection.ping().await?;
        Ok(connection)
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Get the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Identity of the server behind this connection.
    pub fn host_identity(&self) -> String {
        self.config.host_identity()
    }

    /// Get the shared connection, opening it if necessary.
    pub async fn get(&self) -> Result<ConnectionManager> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        let timeout = self.config.connect_timeout;
        let mut manager = tokio::time::timeout(timeout, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| RedisError::Timeout(timeout))?
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        if let Some(name) = &self.config.connection_name {
            let _: () = redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(name)
                .query_async(&mut manager)
                .await?;
        }

        info!(host = %self.host_identity(), "Redis connection established");
        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// Run a command future under the configured sync timeout.
    pub async fn timed<T, F>(&self, command: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let timeout = self.config.sync_timeout;
        tokio::time::timeout(timeout, command)
            .await
            .map_err(|_| RedisError::Timeout(timeout))?
            .map_err(RedisError::from)
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get().await?;
        let _: String = self.timed(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }

    /// Create a Pub/Sub client against the same server.
    pub fn pubsub(&self) -> PubSub {
        PubSub::new(self.client.clone(), self.config.connect_timeout)
    }

    /// Drop the cached connection; the next [`get`](Self::get) reconnects.
    pub async fn reset(&self) {
        if self.manager.lock().await.take().is_some() {
            debug!(host = %self.host_identity(), "Redis connection released");
        }
    }
}
