//! Cache service lifecycle.

use crate::cache::Cache;
use crate::config::CacheConfiguration;
use crate::engine::CacheEngine;
use crate::error::CacheResult;
use crate::logging::CacheLogger;
use crate::reconciler::{ExpiryHandler, ExpiryHandlerRegistry, ExpirySweeper};
use crate::store::Store;
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(feature = "redis")]
use crate::redis_store::RedisStore;

/// A running cache: engine, expiry handler and sweeper.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tagcache::{CacheConfiguration, InMemoryStore, TagCacheService};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), tagcache::CacheError> {
/// let service = TagCacheService::builder(Arc::new(InMemoryStore::new()), CacheConfiguration::new())
///     .start()
///     .await?;
///
/// service.cache().save(1, &"hello".to_string(), None, &["greetings"]).await?;
/// service.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct TagCacheService {
    engine: Arc<CacheEngine>,
    cache: Cache,
    handlers: Arc<ExpiryHandlerRegistry>,
    owns_handlers: bool,
    handler: Option<Arc<ExpiryHandler>>,
    sweeper: Option<ExpirySweeper>,
}

/// Builder for [`TagCacheService`].
pub struct TagCacheServiceBuilder {
    store: Arc<dyn Store>,
    config: CacheConfiguration,
    logger: Option<Arc<dyn CacheLogger>>,
    handlers: Option<Arc<ExpiryHandlerRegistry>>,
}

impl TagCacheServiceBuilder {
    /// Route advisory events to `logger`.
    pub fn logger(mut self, logger: Arc<dyn CacheLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Share expiry handlers with other services.
    ///
    /// The service does not stop a shared registry on shutdown.
    pub fn handlers(mut self, handlers: Arc<ExpiryHandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Validate the configuration and start the background tasks.
    pub async fn start(self) -> CacheResult<TagCacheService> {
        self.config.validate()?;

        let mut engine = CacheEngine::new(self.store, &self.config);
        if let Some(logger) = self.logger {
            engine = engine.with_logger(logger);
        }
        let engine = Arc::new(engine);

        let owns_handlers = self.handlers.is_none();
        let handlers = self.handlers.unwrap_or_default();

        let handler = if self.config.subscribe_to_expiry_events {
            match handlers.ensure(&engine).await {
                Ok(handler) => Some(handler),
                Err(e) => {
                    warn!(error = %e, "Expiry events unavailable, relying on sweeps");
                    engine.logger().error("subscribe", &engine.store().identity(), &e);
                    None
                }
            }
        } else {
            None
        };

        let sweeper = if self.config.manually_process_expired_keys {
            let mut sweeper = ExpirySweeper::new(engine.clone(), self.config.sweep_interval);
            sweeper.start()?;
            Some(sweeper)
        } else {
            None
        };

        info!(
            store = %engine.store().identity(),
            root = %self.config.root_namespace,
            serializer = %self.config.serializer,
            sweeping = sweeper.is_some(),
            "Tag cache started"
        );

        Ok(TagCacheService {
            cache: Cache::from_engine(engine.clone()),
            engine,
            handlers,
            owns_handlers,
            handler,
            sweeper,
        })
    }
}

impl TagCacheService {
    /// Start configuring a service over `store`.
    pub fn builder(store: Arc<dyn Store>, config: CacheConfiguration) -> TagCacheServiceBuilder {
        TagCacheServiceBuilder {
            store,
            config,
            logger: None,
            handlers: None,
        }
    }

    /// Start a service over `store` with default hooks.
    pub async fn with_store(store: Arc<dyn Store>, config: CacheConfiguration) -> CacheResult<Self> {
        Self::builder(store, config).start().await
    }

    /// Connect to Redis per `config.redis` and start a service.
    #[cfg(feature = "redis")]
    pub async fn connect(config: CacheConfiguration) -> CacheResult<Self> {
        config.validate()?;
        let store = RedisStore::connect(config.redis.clone()).await?;
        Self::with_store(Arc::new(store), config).await
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    /// The typed cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The expiry handler registry in use.
    pub fn handlers(&self) -> &Arc<ExpiryHandlerRegistry> {
        &self.handlers
    }

    /// Whether expiry notifications are being handled.
    pub fn is_listening(&self) -> bool {
        self.handler.as_ref().is_some_and(|h| h.is_listening())
    }

    /// Whether the periodic sweep runs.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.as_ref().is_some_and(|s| s.is_running())
    }

    /// Stop the sweeper and owned handlers, then close the store.
    pub async fn shutdown(mut self) -> CacheResult<()> {
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop().await?;
        }
        if self.owns_handlers {
            self.handlers.stop_all();
        }
        self.engine.store().close().await?;
        info!(store = %self.engine.store().identity(), "Tag cache stopped");
        Ok(())
    }
}
