//! # tagcache-redis
//!
//! Redis connection layer used by `tagcache`.
//!
//! ## Features
//!
//! - **Lazy connection**: one multiplexed connection per server, opened on
//!   first use and released with [`RedisConnection::reset`]
//! - **Configuration**: builder, environment loading and serde support
//! - **Pub/Sub**: channel and pattern subscriptions, including keyspace
//!   expiry events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tagcache_redis::{RedisConfig, RedisConnection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .host("localhost")
//!         .port(6379)
//!         .build();
//!
//!     // Fails fast when the server cannot be reached
//!     let redis = RedisConnection::connect(config).await?;
//!
//!     let mut conn = redis.get().await?;
//!     let _: () = redis::cmd("SET")
//!         .arg("key")
//!         .arg("value")
//!         .query_async(&mut conn)
//!         .await?;
//!
//!     // Listen for keys expiring natively
//!     let mut expired = redis.pubsub().expired_keys(0).await?;
//!     while let Some(message) = expired.recv().await {
//!         println!("expired: {}", message.payload);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod pubsub;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use connection::RedisConnection;
pub use error::{RedisError, Result};
pub use pubsub::{Message, PubSub, Subscription, expired_events_channel};

// Re-export redis crate for convenience
pub use redis;
pub use redis::aio::ConnectionManager;

/// Prelude for common imports.
///
/// ```
/// use tagcache_redis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::connection::RedisConnection;
    pub use crate::error::{RedisError, Result};
    pub use crate::pubsub::{Message, PubSub, Subscription};
    pub use redis::AsyncCommands;
}
