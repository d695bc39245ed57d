//! Error types for stateful function operations.
//!
//! Errors fall into four classes that callers can tell apart:
//! configuration (fix and restart), contention (retry), data (the stored
//! record stays authoritative) and connectivity (backend unreachable).

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while binding, locking, loading or persisting state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Neither a per-function nor a global backend is configured.
    #[error("no backend configured for function {0}")]
    NoBackendConfigured(String),

    /// The identity is already bound to the same backend in this registry.
    #[error("function identity already bound on this backend: {0}")]
    DuplicateIdentity(String),

    /// Malformed function identity.
    #[error("invalid function identity: {0}")]
    InvalidIdentity(String),

    /// Malformed or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A record carries a codec tag this build does not know.
    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    /// The lock was not acquired before the timeout elapsed.
    #[error("timed out after {waited:?} waiting for lock on {identity}")]
    LockTimeout { identity: String, waited: Duration },

    /// The lease ran out before the write, and another holder may have
    /// taken the lock. Nothing was written.
    #[error("lock on {identity} was lost before the write")]
    LockLost { identity: String },

    /// Stored bytes could not be decoded.
    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    /// The value cannot be represented by the chosen codec.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// Cannot connect to or communicate with the storage backend.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Redis error that is not a connectivity problem.
    #[error("redis error: {0}")]
    Redis(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StateError::LockTimeout { .. }
                | StateError::LockLost { .. }
                | StateError::BackendUnavailable(_)
        )
    }

    /// Returns true for errors that only a configuration change can fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StateError::NoBackendConfigured(_)
                | StateError::DuplicateIdentity(_)
                | StateError::InvalidIdentity(_)
                | StateError::InvalidConfig(_)
                | StateError::UnknownCodec(_)
        )
    }
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StateError::BackendUnavailable(err.to_string())
            }
            other => StateError::Database(other),
        }
    }
}

impl From<redis::RedisError> for StateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StateError::BackendUnavailable(err.to_string())
        } else {
            StateError::Redis(err.to_string())
        }
    }
}
