//! In-memory state backend.
//!
//! This implementation is NOT durable - data is lost on process exit.
//! Locks are process-local. Use for testing and development only.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime};

use crate::config::BackendKind;
use crate::error::{Result, StateError};
use crate::store::{new_etag, FunctionId, RecordStamp, StateBackend, StateRecord};

struct Lease {
    token: String,
    expires_at: Instant,
}

/// In-memory implementation of [`StateBackend`].
///
/// Uses a BTreeMap for ordered listing and RwLock for concurrency.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<FunctionId, StateRecord>>,
    leases: Mutex<HashMap<FunctionId, Lease>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn write_record(&self, id: &FunctionId, payload: Vec<u8>, codec: &str) -> RecordStamp {
        let mut records = self.records.write();
        let version = records.get(id).map(|r| r.version + 1).unwrap_or(1);
        let record = StateRecord {
            identity: id.clone(),
            payload,
            codec: codec.to_string(),
            version,
            etag: new_etag(),
            updated_at: SystemTime::now(),
        };
        let stamp = record.stamp();
        records.insert(id.clone(), record);
        stamp
    }

    /// Drop all records and locks.
    pub fn clear(&self) {
        self.records.write().clear();
        self.leases.lock().clear();
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, id: &FunctionId) -> Result<Option<StateRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn version(&self, id: &FunctionId) -> Result<Option<u64>> {
        Ok(self.records.read().get(id).map(|r| r.version))
    }

    async fn stamp(&self, id: &FunctionId) -> Result<Option<RecordStamp>> {
        Ok(self.records.read().get(id).map(StateRecord::stamp))
    }

    async fn put(&self, id: &FunctionId, payload: Vec<u8>, codec: &str) -> Result<u64> {
        Ok(self.write_record(id, payload, codec).version)
    }

    async fn put_locked(
        &self,
        id: &FunctionId,
        payload: Vec<u8>,
        codec: &str,
        token: &str,
    ) -> Result<RecordStamp> {
        // Held across the write so the lease cannot change hands midway.
        let leases = self.leases.lock();
        let live = leases
            .get(id)
            .is_some_and(|held| held.token == token && held.expires_at > Instant::now());
        if !live {
            return Err(StateError::LockLost {
                identity: id.to_string(),
            });
        }
        Ok(self.write_record(id, payload, codec))
    }

    async fn restore(&self, record: &StateRecord) -> Result<()> {
        self.records
            .write()
            .insert(record.identity.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &FunctionId) -> Result<bool> {
        Ok(self.records.write().remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<FunctionId>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    async fn try_lock(&self, id: &FunctionId, token: &str, lease: Duration) -> Result<bool> {
        let mut leases = self.leases.lock();
        let now = Instant::now();
        if let Some(held) = leases.get(id) {
            if held.expires_at > now {
                return Ok(false);
            }
        }
        let expires_at = now.checked_add(lease).ok_or_else(|| {
            StateError::InvalidConfig(format!("lock lease {lease:?} is too long"))
        })?;
        leases.insert(
            id.clone(),
            Lease {
                token: token.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, id: &FunctionId, token: &str) -> Result<bool> {
        let mut leases = self.leases.lock();
        match leases.get(id) {
            Some(held) if held.token == token => {
                leases.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn healthcheck(&self) -> Result<()> {
        Ok(())
    }
}
