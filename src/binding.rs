//! Binding of a function to its durable state.
//!
//! Each call runs through the same sequence: acquire the identity's lock,
//! load the state, run the body against a [`StateHandle`], flush if the
//! state changed, release the lock. A body that returns `Err` commits
//! nothing; the lock is released on every path.

use parking_lot::Mutex;
use std::collections::btree_map;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::codec::{codec_for_tag, Codec, CodecKind};
use crate::config::BackendConfig;
use crate::error::{Result, StateError};
use crate::lock::{LockGuard, LockOptions};
use crate::registry::BindingSlot;
use crate::store::{FunctionId, RecordStamp, StateBackend};
use crate::value::{same_map, Key, StateMap, Value};

/// Per-function options given at bind time. Unset fields fall back to the
/// registry's defaults.
#[derive(Debug, Clone)]
pub struct BindOptions {
    pub id: FunctionId,
    pub backend: Option<BackendConfig>,
    pub codec: Option<CodecKind>,
    pub lock: Option<LockOptions>,
}

impl BindOptions {
    pub fn new(id: FunctionId) -> Self {
        Self {
            id,
            backend: None,
            codec: None,
            lock: None,
        }
    }

    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = Some(lock);
        self
    }
}

/// Live view of a function's state for the duration of one call.
///
/// Reads are free. The first mutable access snapshots the loaded map so
/// the binding can tell at the end whether anything really changed.
#[derive(Debug, Default)]
pub struct StateHandle {
    map: StateMap,
    pristine: Option<StateMap>,
}

impl StateHandle {
    pub(crate) fn new(map: StateMap) -> Self {
        Self {
            map,
            pristine: None,
        }
    }

    fn touch(&mut self) -> &mut StateMap {
        if self.pristine.is_none() {
            self.pristine = Some(self.map.clone());
        }
        &mut self.map
    }

    pub fn get(&self, key: impl Into<Key>) -> Option<&Value> {
        self.map.get(&key.into())
    }

    pub fn contains_key(&self, key: impl Into<Key>) -> bool {
        self.map.contains_key(&key.into())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Key, Value> {
        self.map.iter()
    }

    pub fn as_map(&self) -> &StateMap {
        &self.map
    }

    pub fn get_mut(&mut self, key: impl Into<Key>) -> Option<&mut Value> {
        let key = key.into();
        if !self.map.contains_key(&key) {
            return None;
        }
        self.touch().get_mut(&key)
    }

    pub fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Option<Value> {
        self.touch().insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        if !self.map.contains_key(&key) {
            return None;
        }
        self.touch().remove(&key)
    }

    /// Mutable access to `key`, inserting `default()` first if it is absent.
    pub fn entry_or_insert_with(
        &mut self,
        key: impl Into<Key>,
        default: impl FnOnce() -> Value,
    ) -> &mut Value {
        self.touch().entry(key.into()).or_insert_with(default)
    }

    /// Mutable access to `key`, inserting `default` first if it is absent.
    pub fn get_or_insert(&mut self, key: impl Into<Key>, default: impl Into<Value>) -> &mut Value {
        self.touch().entry(key.into()).or_insert_with(|| default.into())
    }

    /// Add `delta` to the integer at `key`, starting from zero if absent.
    ///
    /// Fails with `UnsupportedValue` if the existing value is not an integer.
    pub fn increment(&mut self, key: impl Into<Key>, delta: i64) -> Result<i64> {
        let key = key.into();
        let slot = self.touch().entry(key.clone()).or_insert(Value::Null);
        let kind = slot.kind();
        slot.increment(delta).ok_or_else(|| {
            StateError::UnsupportedValue(format!("cannot increment {kind} value at {key}"))
        })
    }

    /// Replace the whole state. Returns the previous contents.
    pub fn replace(&mut self, state: StateMap) -> StateMap {
        std::mem::replace(self.touch(), state)
    }

    pub fn clear(&mut self) {
        self.touch().clear();
    }

    /// Unrestricted mutable access to the underlying map.
    pub fn as_map_mut(&mut self) -> &mut StateMap {
        self.touch()
    }

    /// True if the contents differ from what was loaded.
    pub fn is_modified(&self) -> bool {
        self.pristine
            .as_ref()
            .is_some_and(|pristine| !same_map(pristine, &self.map))
    }

    pub fn into_map(self) -> StateMap {
        self.map
    }
}

struct CachedState {
    stamp: RecordStamp,
    state: StateMap,
}

/// A function identity bound to a backend and codec.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Dropping it
/// frees the identity for rebinding in its registry.
pub struct StatefulFn {
    id: FunctionId,
    backend_config: BackendConfig,
    backend: Arc<dyn StateBackend>,
    codec: &'static dyn Codec,
    lock: LockOptions,
    cache: Mutex<Option<CachedState>>,
    _slot: BindingSlot,
}

impl fmt::Debug for StatefulFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulFn")
            .field("id", &self.id)
            .field("backend", &self.backend_config)
            .field("codec", &self.codec.tag())
            .field("lock", &self.lock)
            .finish()
    }
}

impl StatefulFn {
    pub(crate) fn new(
        id: FunctionId,
        backend_config: BackendConfig,
        backend: Arc<dyn StateBackend>,
        codec: CodecKind,
        lock: LockOptions,
        slot: BindingSlot,
    ) -> Self {
        Self {
            id,
            backend_config,
            backend,
            codec: codec.codec(),
            lock,
            cache: Mutex::new(None),
            _slot: slot,
        }
    }

    pub fn id(&self) -> &FunctionId {
        &self.id
    }

    pub fn backend_config(&self) -> &BackendConfig {
        &self.backend_config
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Tag of the codec used for writes.
    pub fn codec_tag(&self) -> &'static str {
        self.codec.tag()
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock
    }

    /// Run `body` against the function's state and persist any change.
    pub async fn call<R>(&self, body: impl FnOnce(&mut StateHandle) -> R) -> Result<R> {
        self.try_call(|state| Ok::<R, StateError>(body(state))).await
    }

    /// Like [`call`](Self::call), but a body returning `Err` discards its
    /// mutations.
    pub async fn try_call<R, E>(
        &self,
        body: impl FnOnce(&mut StateHandle) -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E>
    where
        E: From<StateError>,
    {
        trace!(identity = %self.id, "lock acquiring");
        let guard = LockGuard::acquire(self.backend.clone(), &self.id, &self.lock).await?;

        let token = guard.token().unwrap_or_default().to_string();
        let outcome = self.run_locked(&token, body).await;

        if let Err(e) = guard.release().await {
            warn!(identity = %self.id, error = %e, "lock release failed; lease will expire");
        }
        trace!(identity = %self.id, "lock released");
        outcome
    }

    async fn run_locked<R, E>(
        &self,
        token: &str,
        body: impl FnOnce(&mut StateHandle) -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E>
    where
        E: From<StateError>,
    {
        let state = self.load().await?;
        trace!(identity = %self.id, keys = state.len(), "state loaded");

        let mut handle = StateHandle::new(state);
        let value = match body(&mut handle) {
            Ok(value) => value,
            Err(e) => {
                debug!(identity = %self.id, "call failed; discarding state changes");
                return Err(e);
            }
        };

        if handle.is_modified() {
            let version = self.flush(handle.into_map(), token).await?;
            trace!(identity = %self.id, version, "state flushed");
        } else {
            trace!(identity = %self.id, "state unchanged; flush skipped");
        }
        Ok(value)
    }

    /// Load the current state, reusing the cached decode when the stored
    /// record is still the write this binding last saw.
    async fn load(&self) -> Result<StateMap> {
        let Some(stamp) = self.backend.stamp(&self.id).await? else {
            *self.cache.lock() = None;
            return Ok(StateMap::new());
        };

        let cached = {
            let cache = self.cache.lock();
            cache
                .as_ref()
                .filter(|c| c.stamp == stamp)
                .map(|c| c.state.clone())
        };
        if let Some(state) = cached {
            return Ok(state);
        }

        let Some(record) = self.backend.get(&self.id).await? else {
            *self.cache.lock() = None;
            return Ok(StateMap::new());
        };
        let state = codec_for_tag(&record.codec)?.decode(&record.payload)?;
        *self.cache.lock() = Some(CachedState {
            stamp: record.stamp(),
            state: state.clone(),
        });
        Ok(state)
    }

    async fn flush(&self, state: StateMap, token: &str) -> Result<u64> {
        let payload = self.codec.encode(&state)?;
        let stamp = self
            .backend
            .put_locked(&self.id, payload, self.codec.tag(), token)
            .await?;
        let version = stamp.version;
        *self.cache.lock() = Some(CachedState { stamp, state });
        Ok(version)
    }

    /// The last committed state, without taking the lock.
    pub async fn snapshot(&self) -> Result<StateMap> {
        self.load().await
    }

    /// Replace the whole committed state under the lock.
    pub async fn replace_state(&self, state: StateMap) -> Result<()> {
        self.call(|handle| {
            handle.replace(state);
        })
        .await
    }

    /// Delete the committed state under the lock. Returns true if a record
    /// existed.
    pub async fn reset(&self) -> Result<bool> {
        let guard = LockGuard::acquire(self.backend.clone(), &self.id, &self.lock).await?;
        let deleted = self.backend.delete(&self.id).await;
        if deleted.is_ok() {
            *self.cache.lock() = None;
        }
        if let Err(e) = guard.release().await {
            warn!(identity = %self.id, error = %e, "lock release failed; lease will expire");
        }
        deleted
    }
}
