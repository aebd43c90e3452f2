use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{FailPoint, SaveStore, StoreError, WriteBatch, WriteOp};
use crate::identity::UserId;
use crate::save::{PayloadInfo, SaveMetadata, StoredPayload, SyncStatus};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const METADATA_COLUMNS: &str = "id, user_id, slot, name, checksum, algorithm, original_size, \
     compressed_size, created_at, updated_at, last_played_at, sync_status";

/// On-disk store backed by a single SQLite file. The CLI keeps one for the
/// device copy of every save and one standing in for the cloud.
pub struct SqliteStore {
    name: String,
    conn: Mutex<Connection>,
    fail_point: FailPoint,
}

impl SqliteStore {
    pub fn open(name: &str, path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(name, Connection::open(path)?)
    }

    pub fn open_in_memory(name: &str) -> Result<Self, StoreError> {
        Self::from_connection(name, Connection::open_in_memory()?)
    }

    fn from_connection(name: &str, conn: Connection) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", ())?;
        Self::init_schema(&conn)?;
        Ok(Self {
            name: name.to_string(),
            conn: Mutex::new(conn),
            fail_point: FailPoint::default(),
        })
    }

    pub fn fail_point(&self) -> &FailPoint {
        &self.fail_point
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL,
                updated TEXT NOT NULL,
                PRIMARY KEY (version)
            )",
            (),
        )?;

        let version = match conn.query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        ) {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                conn.execute(
                    "INSERT INTO schema_version (version, updated) VALUES (0, datetime('now'))",
                    [],
                )?;
                0
            }
            Err(e) => return Err(e.into()),
        };

        if version < CURRENT_SCHEMA_VERSION {
            Self::migrate_schema(conn, version)?;
        }
        Ok(())
    }

    fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
        if from_version == 0 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS save_metadata (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    slot INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    algorithm TEXT NOT NULL,
                    original_size INTEGER NOT NULL,
                    compressed_size INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    last_played_at TEXT,
                    sync_status TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_save_metadata_user
                    ON save_metadata (user_id, updated_at);
                CREATE TABLE IF NOT EXISTS save_payloads (
                    id TEXT PRIMARY KEY,
                    data BLOB NOT NULL,
                    checksum TEXT NOT NULL,
                    algorithm TEXT NOT NULL,
                    original_size INTEGER NOT NULL,
                    compressed_size INTEGER NOT NULL
                );
                INSERT INTO schema_version (version, updated) VALUES (1, datetime('now'));",
            )?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply(tx: &Transaction<'_>, op: &WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::PutMetadata(m) => {
                tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO save_metadata ({METADATA_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                    ),
                    params![
                        m.id,
                        m.user.as_str(),
                        m.slot,
                        m.name,
                        m.payload.checksum,
                        m.payload.algorithm,
                        m.payload.original_size as i64,
                        m.payload.compressed_size as i64,
                        timestamp(&m.created_at),
                        timestamp(&m.updated_at),
                        m.last_played_at.as_ref().map(timestamp),
                        m.sync_status.as_str(),
                    ],
                )?;
            }
            WriteOp::PutPayload { id, payload } => {
                tx.execute(
                    "INSERT OR REPLACE INTO save_payloads
                     (id, data, checksum, algorithm, original_size, compressed_size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        payload.data,
                        payload.info.checksum,
                        payload.info.algorithm,
                        payload.info.original_size as i64,
                        payload.info.compressed_size as i64,
                    ],
                )?;
            }
            WriteOp::DeleteMetadata { id } => {
                tx.execute("DELETE FROM save_metadata WHERE id = ?1", [id])?;
            }
            WriteOp::DeletePayload { id } => {
                tx.execute("DELETE FROM save_payloads WHERE id = ?1", [id])?;
            }
        }
        Ok(())
    }
}

// Fixed-width RFC 3339 so text ordering matches time ordering
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<SaveMetadata> {
    let status: String = row.get(11)?;
    let sync_status = SyncStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            11,
            rusqlite::types::Type::Text,
            format!("unknown sync status '{status}'").into(),
        )
    })?;
    let last_played: Option<String> = row.get(10)?;

    Ok(SaveMetadata {
        id: row.get(0)?,
        user: UserId(row.get(1)?),
        slot: row.get(2)?,
        name: row.get(3)?,
        payload: PayloadInfo {
            checksum: row.get(4)?,
            algorithm: row.get(5)?,
            original_size: row.get::<_, i64>(6)? as u64,
            compressed_size: row.get::<_, i64>(7)? as u64,
        },
        created_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
        last_played_at: last_played
            .map(|value| parse_timestamp(10, &value))
            .transpose()?,
        sync_status,
    })
}

#[async_trait]
impl SaveStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.lock().query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?;
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut conn = self.lock();
        // Dropping the transaction without commit rolls it back
        let tx = conn.transaction()?;
        for (index, op) in batch.ops().iter().enumerate() {
            self.fail_point.check(index)?;
            Self::apply(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<SaveMetadata>, StoreError> {
        let conn = self.lock();
        let metadata = conn
            .query_row(
                &format!("SELECT {METADATA_COLUMNS} FROM save_metadata WHERE id = ?1"),
                [id],
                metadata_from_row,
            )
            .optional()?;
        Ok(metadata)
    }

    async fn get_payload(&self, id: &str) -> Result<Option<StoredPayload>, StoreError> {
        let conn = self.lock();
        let payload = conn
            .query_row(
                "SELECT data, checksum, algorithm, original_size, compressed_size
                 FROM save_payloads WHERE id = ?1",
                [id],
                |row| {
                    Ok(StoredPayload {
                        data: row.get(0)?,
                        info: PayloadInfo {
                            checksum: row.get(1)?,
                            algorithm: row.get(2)?,
                            original_size: row.get::<_, i64>(3)? as u64,
                            compressed_size: row.get::<_, i64>(4)? as u64,
                        },
                    })
                },
            )
            .optional()?;
        Ok(payload)
    }

    async fn query_metadata(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<SaveMetadata>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {METADATA_COLUMNS} FROM save_metadata WHERE user_id = ?1
             ORDER BY updated_at DESC, slot ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user.as_str(), limit as i64], metadata_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::fixtures;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip_preserves_timestamps() {
        let store = SqliteStore::open_in_memory("local").unwrap();
        let mut record = fixtures::record("ada", 4, b"boss defeated");
        record.metadata.last_played_at = Some(record.metadata.updated_at);

        store.commit(WriteBatch::new().put_record(&record)).await.unwrap();
        let read = store.get_record(&record.metadata.id).await.unwrap().unwrap();
        assert_eq!(read, record);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let store = SqliteStore::open_in_memory("local").unwrap();
        let record = fixtures::record("ada", 1, b"level 3");

        store.fail_point().fail_after(1);
        assert!(store.commit(WriteBatch::new().put_record(&record)).await.is_err());
        assert!(store.get_metadata(&record.metadata.id).await.unwrap().is_none());
        assert!(store.get_payload(&record.metadata.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_delete_rolls_back() {
        let store = SqliteStore::open_in_memory("remote").unwrap();
        let record = fixtures::record("ada", 1, b"level 3");
        store.commit(WriteBatch::new().put_record(&record)).await.unwrap();

        store.fail_point().fail_after(1);
        assert!(
            store
                .commit(WriteBatch::new().delete_record(&record.metadata.id))
                .await
                .is_err()
        );
        let read = store.get_record(&record.metadata.id).await.unwrap().unwrap();
        assert_eq!(read, record);
    }

    #[tokio::test]
    async fn test_schema_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saves").join("local.db");
        let record = fixtures::record("ada", 2, b"chapter 2");
        {
            let store = SqliteStore::open("local", &path).unwrap();
            store.commit(WriteBatch::new().put_record(&record)).await.unwrap();
        }
        let store = SqliteStore::open("local", &path).unwrap();
        let listed = store.query_metadata(&UserId::from("ada"), 10).await.unwrap();
        assert_eq!(listed, vec![record.metadata]);
        assert_eq!(store.name(), "local");
    }

    #[tokio::test]
    async fn test_delete_removes_both_halves() {
        let store = SqliteStore::open_in_memory("local").unwrap();
        let record = fixtures::record("ada", 1, b"x");
        store.commit(WriteBatch::new().put_record(&record)).await.unwrap();
        store
            .commit(WriteBatch::new().delete_record(&record.metadata.id))
            .await
            .unwrap();
        assert!(store.get_record(&record.metadata.id).await.unwrap().is_none());
        assert!(store.get_payload(&record.metadata.id).await.unwrap().is_none());
    }
}
