//! Redis state backend (the networked backend).
//!
//! Layout, with `ns` defaulting to `stateful`:
//! - `{ns}:state:{identity}`: hash with `codec`, `version`, `etag`, `payload`, `updated_at`
//! - `{ns}:lock:{identity}`: string holding the owner token, set with `NX PX`
//!
//! Writes and lock release run as Lua scripts so each is atomic on the
//! server. A fenced write checks the lock key inside its script. Many processes on many hosts can share one instance.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::BackendKind;
use crate::error::{Result, StateError};
use crate::lock::lease_millis;
use crate::store::{
    millis_to_system_time, new_etag, now_millis, system_time_to_millis, FunctionId, RecordStamp,
    StateBackend, StateRecord,
};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "stateful";

const PUT_SCRIPT: &str = r#"
local version = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'codec', ARGV[1], 'payload', ARGV[2], 'updated_at', ARGV[3], 'etag', ARGV[4])
return version
"#;

// KEYS[2] is the lock key; -1 means ARGV[5] no longer owns it.
const PUT_LOCKED_SCRIPT: &str = r#"
if redis.call('GET', KEYS[2]) ~= ARGV[5] then
    return -1
end
local version = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'codec', ARGV[1], 'payload', ARGV[2], 'updated_at', ARGV[3], 'etag', ARGV[4])
return version
"#;

const RESTORE_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'codec', ARGV[1], 'payload', ARGV[2], 'version', ARGV[3], 'updated_at', ARGV[4], 'etag', ARGV[5])
return 1
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis implementation of [`StateBackend`].
pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: String,
    put_script: Script,
    put_locked_script: Script,
    restore_script: Script,
    unlock_script: Script,
}

impl RedisBackend {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str, namespace: Option<&str>) -> Result<Self> {
        info!("Connecting to Redis state store at {}", url);

        let client = Client::open(url)
            .map_err(|e| StateError::InvalidConfig(format!("redis url {url:?}: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StateError::BackendUnavailable(format!("{url}: {e}")))?;

        Ok(Self {
            conn,
            namespace: namespace.unwrap_or(DEFAULT_NAMESPACE).to_string(),
            put_script: Script::new(PUT_SCRIPT),
            put_locked_script: Script::new(PUT_LOCKED_SCRIPT),
            restore_script: Script::new(RESTORE_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn state_key(&self, id: &FunctionId) -> String {
        state_key(&self.namespace, id)
    }

    fn lock_key(&self, id: &FunctionId) -> String {
        format!("{}:lock:{}", self.namespace, id)
    }

    fn state_prefix(&self) -> String {
        format!("{}:state:", self.namespace)
    }
}

fn state_key(namespace: &str, id: &FunctionId) -> String {
    format!("{namespace}:state:{id}")
}

/// Escape glob metacharacters for use in a `SCAN MATCH` pattern.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl StateBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Networked
    }

    async fn get(&self, id: &FunctionId) -> Result<Option<StateRecord>> {
        let mut conn = self.conn.clone();
        let (codec, version, etag, payload, updated_at): (
            Option<String>,
            Option<u64>,
            Option<String>,
            Option<Vec<u8>>,
            Option<i64>,
        ) = redis::cmd("HMGET")
            .arg(self.state_key(id))
            .arg("codec")
            .arg("version")
            .arg("etag")
            .arg("payload")
            .arg("updated_at")
            .query_async(&mut conn)
            .await?;

        match (codec, version, payload) {
            (Some(codec), Some(version), Some(payload)) => Ok(Some(StateRecord {
                identity: id.clone(),
                payload,
                codec,
                version,
                etag: etag.unwrap_or_default(),
                updated_at: millis_to_system_time(updated_at.unwrap_or_default()),
            })),
            (None, None, None) => Ok(None),
            _ => Err(StateError::CorruptPayload(format!(
                "incomplete record hash for {id}"
            ))),
        }
    }

    async fn version(&self, id: &FunctionId) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let version: Option<u64> = redis::cmd("HGET")
            .arg(self.state_key(id))
            .arg("version")
            .query_async(&mut conn)
            .await?;
        Ok(version)
    }

    async fn stamp(&self, id: &FunctionId) -> Result<Option<RecordStamp>> {
        let mut conn = self.conn.clone();
        let (version, etag): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(self.state_key(id))
            .arg("version")
            .arg("etag")
            .query_async(&mut conn)
            .await?;
        Ok(version.map(|version| RecordStamp {
            version,
            etag: etag.unwrap_or_default(),
        }))
    }

    async fn put(&self, id: &FunctionId, payload: Vec<u8>, codec: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let bytes = payload.len();
        let version: u64 = self
            .put_script
            .key(self.state_key(id))
            .arg(codec)
            .arg(payload)
            .arg(now_millis())
            .arg(new_etag())
            .invoke_async(&mut conn)
            .await?;

        debug!(identity = %id, version, bytes, "record stored");
        Ok(version)
    }

    async fn put_locked(
        &self,
        id: &FunctionId,
        payload: Vec<u8>,
        codec: &str,
        token: &str,
    ) -> Result<RecordStamp> {
        let mut conn = self.conn.clone();
        let bytes = payload.len();
        let etag = new_etag();
        let version: i64 = self
            .put_locked_script
            .key(self.state_key(id))
            .key(self.lock_key(id))
            .arg(codec)
            .arg(payload)
            .arg(now_millis())
            .arg(&etag)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        if version < 0 {
            return Err(StateError::LockLost {
                identity: id.to_string(),
            });
        }
        debug!(identity = %id, version, bytes, "record stored");
        Ok(RecordStamp {
            version: version as u64,
            etag,
        })
    }

    async fn restore(&self, record: &StateRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .restore_script
            .key(self.state_key(&record.identity))
            .arg(&record.codec)
            .arg(&record.payload[..])
            .arg(record.version)
            .arg(system_time_to_millis(record.updated_at))
            .arg(&record.etag)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &FunctionId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.state_key(id))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<FunctionId>> {
        let mut conn = self.conn.clone();
        let prefix = self.state_prefix();
        let pattern = format!("{}*", escape_glob(&prefix));
        let mut cursor: u64 = 0;
        let mut ids = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                if let Some(rest) = key.strip_prefix(&prefix) {
                    ids.push(FunctionId::new(rest)?);
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn try_lock(&self, id: &FunctionId, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(id))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_millis(lease)?.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, id: &FunctionId, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .unlock_script
            .key(self.lock_key(id))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn healthcheck(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StateError::BackendUnavailable(format!(
                "unexpected PING reply {pong:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> FunctionId {
        FunctionId::new(s).unwrap()
    }

    /// Redis-backed tests run only when this variable names a server.
    fn redis_url() -> Option<String> {
        std::env::var("STATEFUL_TEST_REDIS_URL").ok()
    }

    async fn fresh_backend(url: &str) -> RedisBackend {
        let namespace = format!("stateful-test-{}", uuid::Uuid::new_v4());
        RedisBackend::connect(url, Some(&namespace)).await.unwrap()
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(
            state_key(DEFAULT_NAMESPACE, &id("counter")),
            "stateful:state:counter"
        );
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("ns:state:"), "ns:state:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[tokio::test]
    async fn test_redis_invalid_url_is_config_error() {
        let err = RedisBackend::connect("not a url", None).await.err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_redis_put_get_list_delete() {
        let Some(url) = redis_url() else { return };
        let backend = fresh_backend(&url).await;

        assert!(backend.get(&id("a")).await.unwrap().is_none());
        assert_eq!(backend.put(&id("a"), vec![0, 1, 2], "bincode").await.unwrap(), 1);
        assert_eq!(backend.put(&id("a"), vec![3], "json").await.unwrap(), 2);
        backend.put(&id("b"), b"{}".to_vec(), "json").await.unwrap();

        let record = backend.get(&id("a")).await.unwrap().unwrap();
        assert_eq!(record.payload, vec![3]);
        assert_eq!(record.codec, "json");
        assert_eq!(record.version, 2);
        assert_eq!(backend.version(&id("a")).await.unwrap(), Some(2));
        assert_eq!(backend.list().await.unwrap(), vec![id("a"), id("b")]);

        assert!(backend.delete(&id("a")).await.unwrap());
        assert!(backend.delete(&id("b")).await.unwrap());
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redis_lock_lease() {
        let Some(url) = redis_url() else { return };
        let backend = fresh_backend(&url).await;
        let lease = Duration::from_millis(50);

        assert!(backend.try_lock(&id("a"), "t1", lease).await.unwrap());
        assert!(!backend.try_lock(&id("a"), "t2", lease).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.try_lock(&id("a"), "t2", lease).await.unwrap());
        assert!(!backend.unlock(&id("a"), "t1").await.unwrap());
        assert!(backend.unlock(&id("a"), "t2").await.unwrap());
    }

    #[tokio::test]
    async fn test_redis_restore_verbatim() {
        let Some(url) = redis_url() else { return };
        let backend = fresh_backend(&url).await;
        let record = StateRecord {
            identity: id("a"),
            payload: vec![9, 8, 7],
            codec: "bincode".to_string(),
            version: 12,
            etag: "e12".to_string(),
            updated_at: millis_to_system_time(1_700_000_000_000),
        };

        backend.restore(&record).await.unwrap();
        assert_eq!(backend.get(&id("a")).await.unwrap(), Some(record));
        backend.delete(&id("a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_put_locked_requires_lock_owner() {
        let Some(url) = redis_url() else { return };
        let backend = fresh_backend(&url).await;
        let lease = Duration::from_millis(50);

        let err = backend
            .put_locked(&id("a"), b"1".to_vec(), "json", "nobody")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LockLost { .. }));
        assert!(backend.get(&id("a")).await.unwrap().is_none());

        assert!(backend.try_lock(&id("a"), "stale", lease).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.try_lock(&id("a"), "fresh", Duration::from_secs(30)).await.unwrap());

        let stamp = backend
            .put_locked(&id("a"), b"2".to_vec(), "json", "fresh")
            .await
            .unwrap();
        assert_eq!(backend.stamp(&id("a")).await.unwrap(), Some(stamp));
        let err = backend
            .put_locked(&id("a"), b"3".to_vec(), "json", "stale")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::LockLost { .. }));
        assert_eq!(backend.get(&id("a")).await.unwrap().unwrap().payload, b"2");

        backend.unlock(&id("a"), "fresh").await.unwrap();
        backend.delete(&id("a")).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_rewrite_after_delete_has_new_etag() {
        let Some(url) = redis_url() else { return };
        let backend = fresh_backend(&url).await;

        backend.put(&id("a"), b"1".to_vec(), "json").await.unwrap();
        let before = backend.stamp(&id("a")).await.unwrap().unwrap();
        backend.delete(&id("a")).await.unwrap();
        backend.put(&id("a"), b"2".to_vec(), "json").await.unwrap();
        let after = backend.stamp(&id("a")).await.unwrap().unwrap();

        assert_eq!(before.version, after.version);
        assert_ne!(before, after);
        backend.delete(&id("a")).await.unwrap();
    }
}
