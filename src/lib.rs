//! # stateful-fn
//!
//! Durable state for ordinary functions.
//!
//! A function is bound to a stable identity and a storage backend. Every
//! call runs under an exclusive, lease-based lock on that identity: the
//! committed state is loaded, the body mutates it through a
//! [`StateHandle`], and the result is flushed back if anything changed.
//! State survives process restarts and is shared by every process pointed
//! at the same backend.
//!
//! ## Backends
//!
//! - [`SqliteBackend`]: Embedded SQLite file, for processes on one host
//! - [`RedisBackend`]: Networked Redis server, for processes on many hosts
//! - [`MemoryBackend`]: In-process map (testing and development)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stateful_fn::{function_id, BackendConfig, BindOptions, Registry, RegistryConfig};
//!
//! #[tokio::main]
//! async fn main() -> stateful_fn::Result<()> {
//!     let registry = Registry::new(
//!         RegistryConfig::default().with_default_backend(BackendConfig::embedded("state.db")),
//!     );
//!     let counter = registry
//!         .bind(BindOptions::new(function_id!("counter")?))
//!         .await?;
//!
//!     let calls = counter
//!         .call(|state| state.increment("calls", 1))
//!         .await??;
//!     println!("called {calls} times");
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Migrating between backends
//!
//! ```rust,no_run
//! use stateful_fn::{migrate, RedisBackend, SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> stateful_fn::Result<()> {
//!     let source = SqliteBackend::open("state.db", None).await?;
//!     let destination = RedisBackend::connect("redis://127.0.0.1/", None).await?;
//!
//!     let report = migrate(&source, &destination).await;
//!     println!("{report}");
//!
//!     Ok(())
//! }
//! ```

pub mod binding;
pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod memory;
pub mod migrate;
pub mod redis_backend;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod value;

// Re-export main types
pub use binding::{BindOptions, StateHandle, StatefulFn};
pub use codec::{codec_for_tag, BincodeCodec, Codec, CodecKind, JsonCodec};
pub use config::{BackendConfig, BackendKind, RegistryConfig};
pub use error::{Result, StateError};
pub use lock::{LockGuard, LockOptions, LockToken};
pub use memory::MemoryBackend;
pub use migrate::{migrate, ItemOutcome, ItemReport, MigrationReport, MigrationStatus};
pub use redis_backend::RedisBackend;
pub use registry::Registry;
pub use sqlite::SqliteBackend;
pub use store::{
    validate_identity, FunctionId, RecordStamp, StateBackend, StateRecord, MAX_IDENTITY_LENGTH,
};
pub use value::{Key, StateMap, Value};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::binding::{BindOptions, StateHandle, StatefulFn};
    pub use crate::codec::CodecKind;
    pub use crate::config::{BackendConfig, BackendKind, RegistryConfig};
    pub use crate::error::{Result, StateError};
    pub use crate::lock::LockOptions;
    pub use crate::registry::Registry;
    pub use crate::store::{FunctionId, StateBackend};
    pub use crate::value::{Key, StateMap, Value};
    pub use crate::{function_id, state_map};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_counter_basic() {
        let registry =
            Registry::new(RegistryConfig::default().with_default_backend(BackendConfig::memory("lib")));
        let counter = registry
            .bind(BindOptions::new(FunctionId::new("counter").unwrap()))
            .await
            .unwrap();

        for expected in 1..=3 {
            let n = counter.call(|s| s.increment("n", 1)).await.unwrap().unwrap();
            assert_eq!(n, expected);
        }
    }

    #[tokio::test]
    async fn test_backends_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<MemoryBackend>();
        assert_send_sync::<SqliteBackend>();
        assert_send_sync::<RedisBackend>();
        assert_send_sync::<StatefulFn>();
        assert_send_sync::<Registry>();
    }
}
