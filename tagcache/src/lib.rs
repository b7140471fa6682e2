//! Tag-aware caching over Redis.
//!
//! Entries are stored as serialized envelopes (key, value, optional expiry,
//! optional tags) and indexed both ways: every tag points at the keys that
//! carry it, and every key points at its tags. Keys with an expiry are also
//! recorded in a time-ordered schedule so their index entries can be
//! reclaimed after the store drops them.
//!
//! # Features
//!
//! - `redis` - Redis store (enabled by default)
//! - `tls` - TLS connections to Redis
//! - **Tag lookups** - fetch every live entry carrying a tag
//! - **Lazy expiry** - expired envelopes are removed when read
//! - **Expiry reconciliation** - keyspace notifications and periodic sweeps
//!   keep the indexes free of dead keys
//! - **Serializers** - JSON, bincode and XML envelopes
//!
//! # Examples
//!
//! ## In-memory store
//!
//! ```
//! use std::sync::Arc;
//! use tagcache::{CacheConfiguration, InMemoryStore, TagCacheService};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tagcache::CacheError> {
//! let service = TagCacheService::with_store(
//!     Arc::new(InMemoryStore::new()),
//!     CacheConfiguration::new(),
//! )
//! .await?;
//!
//! let cache = service.cache();
//! cache.save("1", &"first".to_string(), None, &["posts"]).await?;
//! cache.save("2", &"second".to_string(), None, &["posts"]).await?;
//!
//! let mut posts: Vec<String> = cache.get_by_tag("posts").await?;
//! posts.sort();
//! assert_eq!(posts, vec!["first", "second"]);
//!
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Redis
//!
//! ```no_run
//! use tagcache::{CacheConfiguration, TagCacheService};
//! use tagcache_redis::RedisConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tagcache::CacheError> {
//!     tagcache::logging::init_from_env();
//!
//!     let config = CacheConfiguration::new()
//!         .with_redis(RedisConfig::builder().host("localhost").allow_admin(true).build())
//!         .with_manual_expiry(true);
//!     let service = TagCacheService::connect(config).await?;
//!
//!     service.engine().remove_by_tag("stale").await?;
//!     service.shutdown().await
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod logging;
pub mod memory_store;
pub mod reconciler;
pub mod schedule;
pub mod service;
pub mod store;
pub mod tag_index;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use cache::{Cache, CacheGetter, CacheRemover, CacheSetter, TagLookup};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CacheEnvelope, CacheItemCodec, SerializationFormat};
pub use config::CacheConfiguration;
pub use engine::CacheEngine;
pub use error::{CacheError, CacheResult};
pub use keys::{KeySpace, qualified_key};
pub use logging::{CacheLogger, TracingLogger};
pub use memory_store::InMemoryStore;
pub use reconciler::{ExpiryHandler, ExpiryHandlerRegistry, ExpirySweeper};
pub use schedule::ExpirySchedule;
pub use service::{TagCacheService, TagCacheServiceBuilder};
pub use store::{Store, StoreBatch};
pub use tag_index::TagIndex;

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::config::CacheConfiguration;
    pub use crate::engine::CacheEngine;
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::memory_store::InMemoryStore;
    pub use crate::service::TagCacheService;
    pub use crate::store::Store;

    #[cfg(feature = "redis")]
    pub use crate::redis_store::RedisStore;
}
