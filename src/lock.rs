//! Lease-based per-identity locks.
//!
//! Backends provide a non-blocking `try_lock`/`unlock` pair over their own
//! atomic primitive. This module turns that into a bounded blocking
//! acquire and a guard that releases on every exit path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{Result, StateError};
use crate::store::{FunctionId, StateBackend};

/// Timing parameters for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// How long `acquire` waits before failing with `LockTimeout`.
    #[serde(with = "millis", rename = "timeout_ms", default = "default_timeout")]
    pub timeout: Duration,
    /// How long a held lock survives without being released.
    #[serde(with = "millis", rename = "lease_ms", default = "default_lease")]
    pub lease: Duration,
    /// First backoff delay between attempts.
    #[serde(with = "millis", rename = "retry_min_ms", default = "default_retry_min")]
    pub retry_min: Duration,
    /// Backoff ceiling between attempts.
    #[serde(with = "millis", rename = "retry_max_ms", default = "default_retry_max")]
    pub retry_max: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_lease() -> Duration {
    Duration::from_secs(30)
}
fn default_retry_min() -> Duration {
    Duration::from_millis(5)
}
fn default_retry_max() -> Duration {
    Duration::from_millis(100)
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            lease: default_lease(),
            retry_min: default_retry_min(),
            retry_max: default_retry_max(),
        }
    }
}

impl LockOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease.is_zero() {
            return Err(StateError::InvalidConfig(
                "lock lease must be greater than zero".to_string(),
            ));
        }
        lease_millis(self.lease)?;
        lease_millis(self.timeout)?;
        Ok(())
    }
}

/// Whole milliseconds of `lease`, as the persistent backends store it.
pub(crate) fn lease_millis(lease: Duration) -> Result<i64> {
    i64::try_from(lease.as_millis())
        .map_err(|_| StateError::InvalidConfig(format!("duration {lease:?} is too long")))
}

mod millis {
    use serde::{ser, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(d.as_millis())
            .map_err(|_| ser::Error::custom(format!("duration {d:?} overflows u64 millis")))?;
        s.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Proof of ownership of one identity's lock.
#[derive(Debug)]
pub struct LockToken {
    pub identity: FunctionId,
    /// Random owner token stored in the backend's lock slot.
    pub token: String,
    pub acquired_at: Instant,
}

impl LockToken {
    fn new(identity: FunctionId) -> Self {
        Self {
            identity,
            token: Uuid::new_v4().to_string(),
            acquired_at: Instant::now(),
        }
    }
}

/// Poll `try_lock` with exponential backoff until acquired or timed out.
pub async fn acquire<B>(backend: &B, id: &FunctionId, options: &LockOptions) -> Result<LockToken>
where
    B: StateBackend + ?Sized,
{
    let started = Instant::now();
    let deadline = started + options.timeout;
    let mut token = LockToken::new(id.clone());
    let mut delay = options.retry_min.max(Duration::from_millis(1));
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if backend.try_lock(id, &token.token, options.lease).await? {
            token.acquired_at = Instant::now();
            trace!(identity = %id, attempts, waited = ?started.elapsed(), "lock acquired");
            return Ok(token);
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(identity = %id, attempts, "lock acquisition timed out");
            return Err(StateError::LockTimeout {
                identity: id.to_string(),
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(options.retry_max.max(delay));
    }
}

/// Holds a lock and releases it exactly once.
///
/// Call [`release`](Self::release) on the normal path. If the guard is
/// dropped while still holding (panic, cancelled future), the release is
/// spawned on the current tokio runtime; without a runtime the lease
/// expires on its own.
pub struct LockGuard {
    backend: Arc<dyn StateBackend>,
    token: Option<LockToken>,
}

impl LockGuard {
    /// Acquire the lock for `id` on `backend`.
    pub async fn acquire(
        backend: Arc<dyn StateBackend>,
        id: &FunctionId,
        options: &LockOptions,
    ) -> Result<Self> {
        let token = backend.acquire_lock(id, options).await?;
        Ok(Self {
            backend,
            token: Some(token),
        })
    }

    pub fn identity(&self) -> Option<&FunctionId> {
        self.token.as_ref().map(|t| &t.identity)
    }

    /// Owner token, for writes fenced on this lock.
    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.token.as_str())
    }

    /// Release the lock now.
    pub async fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.backend.release_lock(token).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.backend.clone();
                handle.spawn(async move {
                    let identity = token.identity.clone();
                    if let Err(e) = backend.release_lock(token).await {
                        warn!(%identity, error = %e, "deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    identity = %token.identity,
                    "lock guard dropped outside a runtime; waiting for lease expiry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn id(s: &str) -> FunctionId {
        FunctionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let backend = MemoryBackend::new();
        let options = LockOptions::default();

        let token = backend.acquire_lock(&id("a"), &options).await.unwrap();
        assert_eq!(token.identity, id("a"));
        backend.release_lock(token).await.unwrap();

        let again = backend.acquire_lock(&id("a"), &options).await.unwrap();
        backend.release_lock(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let backend = MemoryBackend::new();
        let held = backend
            .acquire_lock(&id("a"), &LockOptions::default())
            .await
            .unwrap();

        let short = LockOptions::default().with_timeout(Duration::from_millis(50));
        let err = backend.acquire_lock(&id("a"), &short).await.unwrap_err();
        match err {
            StateError::LockTimeout { identity, waited } => {
                assert_eq!(identity, "a");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }

        // Other identities are independent.
        let other = backend.acquire_lock(&id("b"), &short).await.unwrap();
        backend.release_lock(other).await.unwrap();
        backend.release_lock(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let backend = MemoryBackend::new();
        let crashed = LockOptions::default().with_lease(Duration::from_millis(20));
        let abandoned = backend.acquire_lock(&id("a"), &crashed).await.unwrap();
        std::mem::forget(abandoned);

        let options = LockOptions::default().with_timeout(Duration::from_secs(2));
        let token = backend.acquire_lock(&id("a"), &options).await.unwrap();
        backend.release_lock(token).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_token_cannot_unlock() {
        let backend = MemoryBackend::new();
        let lease = Duration::from_millis(10);
        assert!(backend.try_lock(&id("a"), "first", lease).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.try_lock(&id("a"), "second", lease).await.unwrap());

        assert!(!backend.unlock(&id("a"), "first").await.unwrap());
        assert!(backend.unlock(&id("a"), "second").await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let options = LockOptions::default().with_timeout(Duration::from_secs(2));

        let guard = LockGuard::acquire(backend.clone(), &id("a"), &options)
            .await
            .unwrap();
        drop(guard);

        let guard = LockGuard::acquire(backend.clone(), &id("a"), &options)
            .await
            .unwrap();
        guard.release().await.unwrap();
    }

    #[test]
    fn test_options_from_toml() {
        let options: LockOptions = toml::from_str("timeout_ms = 250\nlease_ms = 5000").unwrap();
        assert_eq!(options.timeout, Duration::from_millis(250));
        assert_eq!(options.lease, Duration::from_secs(5));
        assert_eq!(options.retry_max, Duration::from_millis(100));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        assert!(LockOptions::default().validate().is_ok());
        assert!(LockOptions::default()
            .with_lease(Duration::ZERO)
            .validate()
            .is_err());

        let huge = LockOptions::default().with_lease(Duration::MAX);
        assert!(huge.validate().unwrap_err().is_configuration());
        assert!(toml::to_string(&huge).is_err());
        assert_eq!(lease_millis(Duration::from_secs(2)).unwrap(), 2000);
    }
}
