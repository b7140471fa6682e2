//! Logging hooks.
//!
//! Cache internals emit `tracing` events directly. Operations that swallow a
//! failure (index maintenance, lazy-expiry self-heal, reconciler ticks) also
//! report it to a [`CacheLogger`], which a host can replace to route those
//! events elsewhere.

use crate::error::CacheError;
use tracing::{error, info};

/// Environment variable holding the filter for [`init_from_env`].
pub const LOG_ENV: &str = "TAGCACHE_LOG";

/// Receives cache events that are not returned to the caller.
pub trait CacheLogger: Send + Sync {
    /// Record an event for `method` acting on `arg`.
    fn log(&self, method: &str, arg: &str, message: Option<&str>);

    /// Record a failure that was logged instead of propagated.
    fn error(&self, method: &str, arg: &str, err: &CacheError) {
        self.log(method, arg, Some(&err.to_string()));
    }
}

/// Forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl CacheLogger for TracingLogger {
    fn log(&self, method: &str, arg: &str, message: Option<&str>) {
        info!(method = %method, arg = %arg, message = message.unwrap_or_default(), "cache event");
    }

    fn error(&self, method: &str, arg: &str, err: &CacheError) {
        error!(method = %method, arg = %arg, error = %err, "cache operation failed");
    }
}

/// Install a `fmt` subscriber filtered by `TAGCACHE_LOG`, then `RUST_LOG`,
/// then `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_from_env() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(String, String, Option<String>)>>);

    impl CacheLogger for Recording {
        fn log(&self, method: &str, arg: &str, message: Option<&str>) {
            self.0.lock().unwrap().push((
                method.to_string(),
                arg.to_string(),
                message.map(str::to_string),
            ));
        }
    }

    #[test]
    fn test_error_defaults_to_log() {
        let logger = Recording::default();
        logger.error("set", "User:1", &CacheError::StoreUnavailable("down".into()));

        let entries = logger.0.lock().unwrap();
        assert_eq!(entries[0].0, "set");
        assert_eq!(entries[0].1, "User:1");
        assert!(entries[0].2.as_deref().unwrap().contains("down"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_from_env();
        init_from_env();
        TracingLogger.log("get", "k", None);
    }
}
