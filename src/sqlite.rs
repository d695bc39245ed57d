//! SQLite state backend (the embedded backend).
//!
//! Features:
//! - WAL mode for concurrent readers
//! - Single-statement upserts, so a write is all-or-nothing
//! - Lease locks in a `state_locks` table, valid across processes on one host
//!
//! Not safe for writers on separate hosts sharing a network filesystem.

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::BackendKind;
use crate::error::{Result, StateError};
use crate::lock::lease_millis;
use crate::store::{
    millis_to_system_time, new_etag, now_millis, system_time_to_millis, FunctionId, RecordStamp,
    StateBackend, StateRecord,
};

/// SQLite implementation of [`StateBackend`].
///
/// Every row is scoped by namespace, so several logical stores can share one
/// file.
pub struct SqliteBackend {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteBackend {
    /// Open or create a SQLite store at the given path.
    pub async fn open(path: impl AsRef<Path>, namespace: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite state store at {:?}", path);

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StateError::BackendUnavailable(format!("{}: {e}", path.display())))?;

        let store = Self {
            pool,
            namespace: namespace.unwrap_or_default().to_string(),
        };

        store.init_schema().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Each connection to :memory: is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StateError::BackendUnavailable(e.to_string()))?;

        let store = Self {
            pool,
            namespace: String::new(),
        };

        store.init_schema().await?;
        Ok(store)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_records (
                namespace TEXT NOT NULL,
                identity TEXT NOT NULL,
                payload BLOB NOT NULL,
                codec TEXT NOT NULL,
                version INTEGER NOT NULL,
                etag TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, identity)
            );

            CREATE TABLE IF NOT EXISTS state_locks (
                namespace TEXT NOT NULL,
                identity TEXT NOT NULL,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, identity)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema initialized");
        Ok(())
    }
}

type RecordRow = (String, Vec<u8>, String, i64, String, i64);

fn record_from_row(
    (identity, payload, codec, version, etag, updated_at): RecordRow,
) -> Result<StateRecord> {
    Ok(StateRecord {
        identity: FunctionId::new(identity)?,
        payload,
        codec,
        version: version as u64,
        etag,
        updated_at: millis_to_system_time(updated_at),
    })
}

#[async_trait]
impl StateBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn get(&self, id: &FunctionId) -> Result<Option<StateRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT identity, payload, codec, version, etag, updated_at FROM state_records \
             WHERE namespace = ? AND identity = ?",
        )
        .bind(&self.namespace)
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn version(&self, id: &FunctionId) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM state_records WHERE namespace = ? AND identity = ?",
        )
        .bind(&self.namespace)
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(v,)| v as u64))
    }

    async fn stamp(&self, id: &FunctionId) -> Result<Option<RecordStamp>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT version, etag FROM state_records WHERE namespace = ? AND identity = ?",
        )
        .bind(&self.namespace)
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(version, etag)| RecordStamp {
            version: version as u64,
            etag,
        }))
    }

    async fn put(&self, id: &FunctionId, payload: Vec<u8>, codec: &str) -> Result<u64> {
        let now = now_millis();
        let etag = new_etag();

        let (version,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO state_records (namespace, identity, payload, codec, version, etag, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT(namespace, identity) DO UPDATE SET
                payload = excluded.payload,
                codec = excluded.codec,
                version = state_records.version + 1,
                etag = excluded.etag,
                updated_at = excluded.updated_at
            RETURNING version
            "#,
        )
        .bind(&self.namespace)
        .bind(id.as_str())
        .bind(&payload)
        .bind(codec)
        .bind(&etag)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        debug!(identity = %id, version, bytes = payload.len(), "record stored");
        Ok(version as u64)
    }

    async fn put_locked(
        &self,
        id: &FunctionId,
        payload: Vec<u8>,
        codec: &str,
        token: &str,
    ) -> Result<RecordStamp> {
        let now = now_millis();
        let etag = new_etag();

        // The SELECT yields no row unless `token` holds a live lease, and
        // then nothing is inserted or updated.
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO state_records (namespace, identity, payload, codec, version, etag, created_at, updated_at)
            SELECT ?, ?, ?, ?, 1, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM state_locks
                WHERE namespace = ? AND identity = ? AND token = ? AND expires_at > ?
            )
            ON CONFLICT(namespace, identity) DO UPDATE SET
                payload = excluded.payload,
                codec = excluded.codec,
                version = state_records.version + 1,
                etag = excluded.etag,
                updated_at = excluded.updated_at
            RETURNING version
            "#,
        )
        .bind(&self.namespace)
        .bind(id.as_str())
        .bind(&payload)
        .bind(codec)
        .bind(&etag)
        .bind(now)
        .bind(now)
        .bind(&self.namespace)
        .bind(id.as_str())
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some((version,)) = row else {
            return Err(StateError::LockLost {
                identity: id.to_string(),
            });
        };
        debug!(identity = %id, version, bytes = payload.len(), "record stored");
        Ok(RecordStamp {
            version: version as u64,
            etag,
        })
    }

    async fn restore(&self, record: &StateRecord) -> Result<()> {
        let updated_at = system_time_to_millis(record.updated_at);

        sqlx::query(
            r#"
            INSERT INTO state_records (namespace, identity, payload, codec, version, etag, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, identity) DO UPDATE SET
                payload = excluded.payload,
                codec = excluded.codec,
                version = excluded.version,
                etag = excluded.etag,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.namespace)
        .bind(record.identity.as_str())
        .bind(&record.payload)
        .bind(&record.codec)
        .bind(record.version as i64)
        .bind(&record.etag)
        .bind(updated_at)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &FunctionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM state_records WHERE namespace = ? AND identity = ?")
            .bind(&self.namespace)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<FunctionId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT identity FROM state_records WHERE namespace = ? ORDER BY identity",
        )
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|(id,)| FunctionId::new(id)).collect()
    }

    async fn try_lock(&self, id: &FunctionId, token: &str, lease: Duration) -> Result<bool> {
        let now = now_millis();
        let expires_at = now.checked_add(lease_millis(lease)?).ok_or_else(|| {
            StateError::InvalidConfig(format!("lock lease {lease:?} is too long"))
        })?;

        // Takes over an existing row only when its lease has run out.
        let result = sqlx::query(
            r#"
            INSERT INTO state_locks (namespace, identity, token, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, identity) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
            WHERE state_locks.expires_at <= ?
            "#,
        )
        .bind(&self.namespace)
        .bind(id.as_str())
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, id: &FunctionId, token: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM state_locks WHERE namespace = ? AND identity = ? AND token = ?",
        )
        .bind(&self.namespace)
        .bind(id.as_str())
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn healthcheck(&self) -> Result<()> {
        let (status,): (String,) = sqlx::query_as("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;
        if status != "ok" {
            return Err(StateError::CorruptPayload(format!(
                "integrity check failed: {status}"
            )));
        }

        let (_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM state_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
