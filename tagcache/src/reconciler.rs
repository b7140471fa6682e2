//! Expiry reconciliation.
//!
//! Two triggers feed [`CacheEngine`]'s removal path:
//!
//! - [`ExpiryHandler`] listens for keys the store expired natively and
//!   unindexes them as they arrive;
//! - [`ExpirySweeper`] periodically calls
//!   [`CacheEngine::remove_expired_keys`] for stores that cannot push, and as
//!   a safety net for missed notifications.

use crate::engine::CacheEngine;
use crate::error::{CacheError, CacheResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Subscriber turning native expiry notifications into index cleanup.
pub struct ExpiryHandler {
    identity: String,
    task: Option<JoinHandle<()>>,
}

impl ExpiryHandler {
    /// Subscribe to the engine's store and start handling expired keys.
    ///
    /// When the store cannot push notifications the handler is inert.
    pub async fn start(engine: Arc<CacheEngine>) -> CacheResult<Self> {
        let identity = engine.store().identity();
        let Some(mut expired) = engine.store().subscribe_expired().await? else {
            info!(host = %identity, "Store has no expiry notifications, relying on sweeps");
            return Ok(Self {
                identity,
                task: None,
            });
        };

        let host = identity.clone();
        let task = tokio::spawn(async move {
            while let Some(key) = expired.next().await {
                debug!(host = %host, key = %key, "Key expired");
                if let Err(e) = engine.handle_expired_key(&key).await {
                    engine.logger().error("expired", &key, &e);
                }
            }
            warn!(host = %host, "Expiry notification stream ended");
        });

        info!(host = %identity, "Expiry handler started");
        Ok(Self {
            identity,
            task: Some(task),
        })
    }

    /// Identity of the store this handler listens to.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the subscriber task is still running.
    pub fn is_listening(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop listening.
    pub fn stop(&self) {
        if let Some(task) = &self.task {
            task.abort();
            debug!(host = %self.identity, "Expiry handler stopped");
        }
    }
}

/// One [`ExpiryHandler`] per store host.
///
/// Entries are inserted at most once per identity and never removed, so
/// several engines sharing a host share one subscription. The owner calls
/// [`stop_all`](Self::stop_all) at shutdown.
#[derive(Default)]
pub struct ExpiryHandlerRegistry {
    handlers: DashMap<String, Arc<ExpiryHandler>>,
}

impl ExpiryHandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The handler for the engine's store host, starting it if needed.
    pub async fn ensure(&self, engine: &Arc<CacheEngine>) -> CacheResult<Arc<ExpiryHandler>> {
        let identity = engine.store().identity();
        if let Some(handler) = self.handlers.get(&identity) {
            return Ok(handler.clone());
        }

        let started = Arc::new(ExpiryHandler::start(engine.clone()).await?);

        match self.handlers.entry(identity) {
            Entry::Occupied(existing) => {
                // Lost a race with another engine on the same host.
                started.stop();
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => Ok(slot.insert(started).clone()),
        }
    }

    /// Handler registered for `identity`.
    pub fn get(&self, identity: &str) -> Option<Arc<ExpiryHandler>> {
        self.handlers.get(identity).map(|handler| handler.clone())
    }

    /// Number of registered hosts.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no host is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Stop every handler's subscriber. Entries stay registered.
    pub fn stop_all(&self) {
        for handler in self.handlers.iter() {
            handler.stop();
        }
    }
}

/// Periodic expiry sweep.
///
/// Stopping is cooperative: a sweep in progress runs to completion and the
/// loop exits before the next one.
pub struct ExpirySweeper {
    engine: Arc<CacheEngine>,
    interval: Duration,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Create a sweeper that runs every `interval` once started.
    pub fn new(engine: Arc<CacheEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            shutdown: None,
            handle: None,
        }
    }

    /// The sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the sweep loop.
    pub fn start(&mut self) -> CacheResult<()> {
        if self.is_running() {
            warn!("Expiry sweeper already running");
            return Err(CacheError::Reconciler("sweeper already running".to_string()));
        }
        if self.interval.is_zero() {
            return Err(CacheError::Reconciler("sweep interval must be positive".to_string()));
        }

        let (shutdown, mut stopped) = watch::channel(false);
        let engine = self.engine.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => break,
                }

                match engine.remove_expired_keys().await {
                    Ok(keys) => debug!(count = keys.len(), "Expiry sweep finished"),
                    Err(e) => {
                        error!(error = %e, "Expiry sweep failed");
                        engine.logger().error("sweep", "remove_expired_keys", &e);
                    }
                }

                if *stopped.borrow() {
                    break;
                }
            }
            debug!("Expiry sweeper loop exited");
        });

        info!(interval = ?self.interval, "Expiry sweeper started");
        self.shutdown = Some(shutdown);
        self.handle = Some(handle);
        Ok(())
    }

    /// Run one sweep now, outside the schedule.
    pub async fn sweep_now(&self) -> CacheResult<Vec<String>> {
        self.engine.remove_expired_keys().await
    }

    /// Stop the loop, waiting for an in-flight sweep to finish.
    pub async fn stop(&mut self) -> CacheResult<()> {
        let (Some(shutdown), Some(handle)) = (self.shutdown.take(), self.handle.take()) else {
            return Err(CacheError::Reconciler("sweeper not running".to_string()));
        };

        let _ = shutdown.send(true);
        handle
            .await
            .map_err(|e| CacheError::Reconciler(e.to_string()))?;

        info!("Expiry sweeper stopped");
        Ok(())
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::CacheConfiguration;
    use crate::memory_store::InMemoryStore;
    use chrono::Duration as ChronoDuration;

    fn engine_on(store: Arc<InMemoryStore>, clock: &ManualClock) -> Arc<CacheEngine> {
        Arc::new(
            CacheEngine::new(store, &CacheConfiguration::new().with_expiry_grace_period(Duration::ZERO))
                .with_clock(Arc::new(clock.clone())),
        )
    }

    #[tokio::test]
    async fn test_handler_unindexes_natively_expired_keys() {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let engine = engine_on(store.clone(), &clock);

        let handler = ExpiryHandler::start(engine.clone()).await.unwrap();
        assert!(handler.is_listening());

        let expiry = clock.now() + ChronoDuration::seconds(1);
        engine
            .set("User:1", Some(&"a".to_string()), Some(expiry), &["t"])
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2));
        store.purge_expired().await;

        for _ in 0..100 {
            if engine.keys_for_tag("t").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.keys_for_tag("t").await.unwrap().is_empty());
        handler.stop();
    }

    #[tokio::test]
    async fn test_registry_keeps_one_handler_per_host() {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())).with_identity("h1"));
        let first = engine_on(store.clone(), &clock);
        let second = engine_on(store, &clock);
        let registry = ExpiryHandlerRegistry::new();

        let a = registry.ensure(&first).await.unwrap();
        let b = registry.ensure(&second).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("h1").unwrap().identity(), "h1");

        registry.stop_all();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval_and_stops() {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let engine = engine_on(store, &clock);

        let expiry = clock.now() - ChronoDuration::seconds(1);
        engine.schedule().set_key_expiry("User:9", expiry).await.unwrap();

        let mut sweeper = ExpirySweeper::new(engine.clone(), Duration::from_secs(60));
        sweeper.start().unwrap();
        assert!(sweeper.start().is_err());

        tokio::time::sleep(Duration::from_secs(61)).await;
        let mut pending = vec!["User:9".to_string()];
        for _ in 0..100 {
            pending = engine.schedule().get_expired_keys(clock.now()).await.unwrap();
            if pending.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(pending.is_empty());

        sweeper.stop().await.unwrap();
        assert!(!sweeper.is_running());
        assert!(sweeper.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_now() {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let engine = engine_on(store, &clock);
        engine
            .schedule()
            .set_key_expiry("User:3", clock.now() - ChronoDuration::minutes(1))
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(engine, Duration::from_secs(3600));
        assert_eq!(sweeper.sweep_now().await.unwrap(), vec!["User:3".to_string()]);
    }
}
