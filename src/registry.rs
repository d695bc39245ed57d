//! Registry resolving each function to its backend, codec and lock policy.
//!
//! A registry owns the process-wide defaults and the shared backend
//! connections: at most one connection object per distinct
//! [`BackendConfig`], created on first use and shared by every function
//! configured the same way.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::binding::{BindOptions, StatefulFn};
use crate::codec::CodecKind;
use crate::config::{BackendConfig, RegistryConfig};
use crate::error::{Result, StateError};
use crate::store::{FunctionId, StateBackend};

type BoundSet = Arc<Mutex<HashSet<(BackendConfig, FunctionId)>>>;

/// Claim on one `(backend, identity)` pair; released on drop.
pub(crate) struct BindingSlot {
    bound: BoundSet,
    key: (BackendConfig, FunctionId),
}

impl BindingSlot {
    fn claim(bound: &BoundSet, backend: BackendConfig, id: FunctionId) -> Result<Self> {
        let key = (backend, id);
        if !bound.lock().insert(key.clone()) {
            return Err(StateError::DuplicateIdentity(format!(
                "{} on {}",
                key.1, key.0
            )));
        }
        Ok(Self {
            bound: bound.clone(),
            key,
        })
    }
}

impl Drop for BindingSlot {
    fn drop(&mut self) {
        self.bound.lock().remove(&self.key);
    }
}

/// Resolves and caches backends for stateful functions.
pub struct Registry {
    config: RwLock<RegistryConfig>,
    connections: tokio::sync::Mutex<HashMap<BackendConfig, Arc<dyn StateBackend>>>,
    bound: BoundSet,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config: RwLock::new(config),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            bound: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Registry configured from `STATEFUL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(RegistryConfig::from_env()?))
    }

    pub fn config(&self) -> RegistryConfig {
        self.config.read().clone()
    }

    /// Set the backend used by functions bound from now on without one of
    /// their own. Functions already bound keep their backend.
    pub fn set_global_backend(&self, backend: BackendConfig) -> Result<()> {
        backend.validate()?;
        info!(%backend, "global backend set");
        self.config.write().default_backend = Some(backend);
        Ok(())
    }

    pub fn global_backend(&self) -> Option<BackendConfig> {
        self.config.read().default_backend.clone()
    }

    pub fn set_default_codec(&self, codec: CodecKind) {
        self.config.write().default_codec = codec;
    }

    /// Explicit configuration first, then the global default.
    pub fn resolve_backend(
        &self,
        explicit: Option<&BackendConfig>,
        id: &FunctionId,
    ) -> Result<BackendConfig> {
        explicit
            .cloned()
            .or_else(|| self.global_backend())
            .ok_or_else(|| StateError::NoBackendConfigured(id.to_string()))
    }

    /// The shared connection for `config`, opening it on first use.
    pub async fn backend(&self, config: &BackendConfig) -> Result<Arc<dyn StateBackend>> {
        let config = config.normalized();
        let mut connections = self.connections.lock().await;
        if let Some(backend) = connections.get(&config) {
            return Ok(backend.clone());
        }

        let backend = config.connect().await?;
        debug!(%config, "backend connection opened");
        connections.insert(config, backend.clone());
        Ok(backend)
    }

    /// Number of distinct backend connections opened so far.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub fn is_bound(&self, backend: &BackendConfig, id: &FunctionId) -> bool {
        self.bound
            .lock()
            .contains(&(backend.normalized(), id.clone()))
    }

    /// Bind a function identity to its resolved backend and codec.
    ///
    /// Fails with `NoBackendConfigured` if neither `options` nor the registry
    /// names a backend, and with `DuplicateIdentity` if the identity is
    /// already bound to the same backend here.
    pub async fn bind(&self, options: BindOptions) -> Result<StatefulFn> {
        let BindOptions {
            id,
            backend,
            codec,
            lock,
        } = options;

        let backend_config = self.resolve_backend(backend.as_ref(), &id)?.normalized();
        backend_config.validate()?;
        let (codec, lock) = {
            let config = self.config.read();
            (
                codec.unwrap_or(config.default_codec),
                lock.unwrap_or(config.lock),
            )
        };
        lock.validate()?;

        let slot = BindingSlot::claim(&self.bound, backend_config.clone(), id.clone())?;
        let backend = self.backend(&backend_config).await?;

        debug!(identity = %id, backend = %backend_config, codec = %codec, "function bound");
        Ok(StatefulFn::new(id, backend_config, backend, codec, lock, slot))
    }
}
