//! StateBackend trait - the storage abstraction every backend implements.
//!
//! A backend maps a [`FunctionId`] to at most one [`StateRecord`] and
//! provides a lease-based lock per identity. Payloads are opaque bytes;
//! backends never look inside them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::config::BackendKind;
use crate::error::{Result, StateError};
use crate::lock::{self, LockOptions, LockToken};

/// Maximum identity length in bytes.
pub const MAX_IDENTITY_LENGTH: usize = 1024;

/// Stable identity of one stateful function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionId(String);

impl FunctionId {
    /// Create an identity, validating its format.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identity(&id)?;
        Ok(Self(id))
    }

    /// Identity derived from a module path and a function name.
    ///
    /// Usually called through [`function_id!`](crate::function_id).
    pub fn from_path(module_path: &str, name: &str) -> Result<Self> {
        Self::new(format!("{module_path}::{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FunctionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FunctionId {
    type Error = StateError;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id)
    }
}

impl TryFrom<&str> for FunctionId {
    type Error = StateError;

    fn try_from(id: &str) -> Result<Self> {
        Self::new(id)
    }
}

impl From<FunctionId> for String {
    fn from(id: FunctionId) -> Self {
        id.0
    }
}

/// Derive a [`FunctionId`] from the calling module's path and a name.
///
/// ```
/// let id = stateful_fn::function_id!("counter").unwrap();
/// assert!(id.as_str().ends_with("::counter"));
/// ```
#[macro_export]
macro_rules! function_id {
    ($name:expr) => {
        $crate::FunctionId::from_path(::core::module_path!(), $name)
    };
}

/// Validate that an identity is well-formed.
pub fn validate_identity(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StateError::InvalidIdentity(
            "identity cannot be empty".to_string(),
        ));
    }
    if id.len() > MAX_IDENTITY_LENGTH {
        return Err(StateError::InvalidIdentity(format!(
            "identity exceeds maximum length of {} bytes",
            MAX_IDENTITY_LENGTH
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(StateError::InvalidIdentity(format!(
            "identity contains control characters: {id:?}"
        )));
    }
    Ok(())
}

/// The persisted unit: one function's encoded state plus metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    /// Owning function.
    pub identity: FunctionId,
    /// Encoded state (opaque to the backend).
    pub payload: Vec<u8>,
    /// Tag of the codec that produced `payload`.
    pub codec: String,
    /// Incremented on every successful write, starting at 1.
    ///
    /// Restarts at 1 after a delete, so it does not identify a write on its
    /// own; see `etag`.
    pub version: u64,
    /// Unique tag of the write that produced this record. Copied verbatim
    /// by `restore`.
    pub etag: String,
    /// When the record was last written.
    pub updated_at: SystemTime,
}

impl StateRecord {
    pub fn stamp(&self) -> RecordStamp {
        RecordStamp {
            version: self.version,
            etag: self.etag.clone(),
        }
    }
}

/// Identifies one committed write of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordStamp {
    pub version: u64,
    pub etag: String,
}

/// Fresh tag for a new write.
pub(crate) fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Milliseconds since the Unix epoch, as stored by the persistent backends.
pub(crate) fn system_time_to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub(crate) fn millis_to_system_time(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

pub(crate) fn now_millis() -> i64 {
    system_time_to_millis(SystemTime::now())
}

/// Uniform storage and locking primitives over one store instance.
///
/// Code should depend on this trait, not on specific implementations.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Which kind of backend this is.
    fn kind(&self) -> BackendKind;

    /// Get the record for `id`.
    ///
    /// Returns `None` if the function has never been written.
    async fn get(&self, id: &FunctionId) -> Result<Option<StateRecord>>;

    /// Current version of the record for `id`, without its payload.
    async fn version(&self, id: &FunctionId) -> Result<Option<u64>> {
        Ok(self.get(id).await?.map(|r| r.version))
    }

    /// Version and etag of the record for `id`, without its payload.
    async fn stamp(&self, id: &FunctionId) -> Result<Option<RecordStamp>> {
        Ok(self.get(id).await?.map(|r| r.stamp()))
    }

    /// Atomically replace the payload for `id`.
    ///
    /// Either the full payload and the bumped version become visible, or the
    /// previous record is left untouched. Returns the new version.
    async fn put(&self, id: &FunctionId, payload: Vec<u8>, codec: &str) -> Result<u64>;

    /// Like [`put`](Self::put), but only while `token` holds a live lease on
    /// the lock for `id`. The check and the write are one atomic step.
    ///
    /// Fails with `LockLost` and writes nothing once the lease is gone.
    async fn put_locked(
        &self,
        id: &FunctionId,
        payload: Vec<u8>,
        codec: &str,
        token: &str,
    ) -> Result<RecordStamp>;

    /// Write a record verbatim, keeping its version and timestamp.
    ///
    /// Used when copying records between backends.
    async fn restore(&self, record: &StateRecord) -> Result<()>;

    /// Delete the record for `id`. Returns true if it existed.
    async fn delete(&self, id: &FunctionId) -> Result<bool>;

    /// All identities with a record, in lexicographic order.
    async fn list(&self) -> Result<Vec<FunctionId>>;

    /// Take the lock for `id` with `token` if it is free or its lease expired.
    ///
    /// Returns false if another holder has a live lease.
    async fn try_lock(&self, id: &FunctionId, token: &str, lease: Duration) -> Result<bool>;

    /// Release the lock for `id` if it is still held by `token`.
    ///
    /// Returns false if the lease had already expired or been taken over.
    async fn unlock(&self, id: &FunctionId, token: &str) -> Result<bool>;

    /// Block until the lock for `id` is acquired or `options.timeout` elapses.
    async fn acquire_lock(&self, id: &FunctionId, options: &LockOptions) -> Result<LockToken> {
        lock::acquire(self, id, options).await
    }

    /// Release a lock acquired with [`acquire_lock`](Self::acquire_lock).
    async fn release_lock(&self, token: LockToken) -> Result<()> {
        if !self.unlock(&token.identity, &token.token).await? {
            tracing::warn!(
                identity = %token.identity,
                held_for = ?token.acquired_at.elapsed(),
                "lock lease expired before release"
            );
        }
        Ok(())
    }

    /// Verify connectivity and store integrity.
    async fn healthcheck(&self) -> Result<()>;
}
