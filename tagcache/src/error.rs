//! Error types for cache operations.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The store could not be reached or a round trip timed out.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store rejected a command.
    #[error("Store command failed: {0}")]
    Command(String),

    /// A value could not be serialized into an envelope.
    #[error("Serialization error: {0}")]
    Encode(String),

    /// A stored payload does not deserialize into the expected envelope.
    #[error("Deserialization error: {0}")]
    Decode(String),

    /// Invalid connection or cache parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The expiry reconciler could not be started or stopped.
    #[error("Expiry reconciler error: {0}")]
    Reconciler(String),
}

impl CacheError {
    /// Whether the store could not be reached.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Whether a stored payload failed to decode.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

#[cfg(feature = "redis")]
impl From<tagcache_redis::RedisError> for CacheError {
    fn from(err: tagcache_redis::RedisError) -> Self {
        use tagcache_redis::RedisError;

        match err {
            RedisError::Config(msg) => Self::Configuration(msg),
            ref e if e.is_connection_error() => Self::StoreUnavailable(e.to_string()),
            other => Self::Command(other.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        tagcache_redis::RedisError::from(err).into()
    }
}
