//! OTA transfer checkpoints
//!
//! Every acknowledged chunk and state transition is persisted so a server
//! restart can fail in-flight transfers safely instead of leaving a device
//! mid-flash with no record. Rows are retained after terminal states for
//! operator inspection.

use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use super::OtaState;
use crate::protocol::DeviceId;
use crate::{Error, Result};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Initialize the checkpoint database
///
/// # Errors
///
/// Returns error if the database cannot be opened or migrated
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    migrate(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "checkpoint database initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if the database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
    migrate(&conn)?;
    Ok(pool)
}

fn migrate(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ota_checkpoint (
                device_id   TEXT PRIMARY KEY,
                job_id      TEXT NOT NULL,
                version     TEXT NOT NULL,
                size        INTEGER NOT NULL,
                sha256      TEXT NOT NULL,
                bytes_acked INTEGER NOT NULL,
                state       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            PRAGMA user_version = 1;",
        )?;
    }
    Ok(())
}

/// One persisted transfer checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaCheckpoint {
    /// Target device
    pub device: DeviceId,
    /// Job id
    pub job_id: String,
    /// Firmware version being delivered
    pub version: String,
    /// Total image size in bytes
    pub size: u64,
    /// Hex-encoded image SHA-256
    pub sha256: String,
    /// Bytes the device has acknowledged so far
    pub bytes_acked: u64,
    /// Job state at the time of the checkpoint
    pub state: OtaState,
    /// When the checkpoint was written
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint repository
#[derive(Clone)]
pub struct CheckpointRepo {
    pool: DbPool,
}

impl CheckpointRepo {
    /// Create a repository over the pool
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Write or replace the checkpoint for a device (one active job each)
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn upsert(&self, checkpoint: &OtaCheckpoint) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO ota_checkpoint
                 (device_id, job_id, version, size, sha256, bytes_acked, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(device_id) DO UPDATE SET
                 job_id = excluded.job_id,
                 version = excluded.version,
                 size = excluded.size,
                 sha256 = excluded.sha256,
                 bytes_acked = excluded.bytes_acked,
                 state = excluded.state,
                 updated_at = excluded.updated_at",
            rusqlite::params![
                checkpoint.device.as_str(),
                checkpoint.job_id,
                checkpoint.version,
                i64::try_from(checkpoint.size).unwrap_or(i64::MAX),
                checkpoint.sha256,
                i64::try_from(checkpoint.bytes_acked).unwrap_or(i64::MAX),
                checkpoint.state.as_str(),
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch the checkpoint for a device
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn get(&self, device: &DeviceId) -> Result<Option<OtaCheckpoint>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT device_id, job_id, version, size, sha256, bytes_acked, state, updated_at
             FROM ota_checkpoint WHERE device_id = ?1",
        )?;
        let mut rows = stmt.query([device.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_checkpoint(row)?)),
            None => Ok(None),
        }
    }

    /// Mark every non-terminal checkpoint as failed
    ///
    /// Called at startup: a transfer that was in flight when the server died
    /// cannot be trusted to resume, so it is failed with the row retained.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn fail_in_flight(&self) -> Result<usize> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let changed = conn.execute(
            "UPDATE ota_checkpoint SET state = ?1, updated_at = ?2
             WHERE state NOT IN (?3, ?4, ?5)",
            rusqlite::params![
                OtaState::Failed.as_str(),
                Utc::now().to_rfc3339(),
                OtaState::Applied.as_str(),
                OtaState::Failed.as_str(),
                OtaState::Cancelled.as_str(),
            ],
        )?;
        if changed > 0 {
            tracing::warn!(jobs = changed, "failed in-flight OTA transfers from previous run");
        }
        Ok(changed)
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<OtaCheckpoint> {
    let device: String = row.get(0)?;
    let state_raw: String = row.get(6)?;
    let updated_raw: String = row.get(7)?;
    let size: i64 = row.get(3)?;
    let bytes_acked: i64 = row.get(5)?;
    Ok(OtaCheckpoint {
        device: DeviceId::new(device),
        job_id: row.get(1)?,
        version: row.get(2)?,
        size: u64::try_from(size).unwrap_or(0),
        sha256: row.get(4)?,
        bytes_acked: u64::try_from(bytes_acked).unwrap_or(0),
        state: OtaState::parse(&state_raw)
            .ok_or_else(|| Error::Database(format!("unknown ota state: {state_raw}")))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_raw)
            .map_err(|e| Error::Database(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(device: &str, state: OtaState, bytes_acked: u64) -> OtaCheckpoint {
        OtaCheckpoint {
            device: DeviceId::from(device),
            job_id: "job-1".to_string(),
            version: "1.2.0".to_string(),
            size: 8_192,
            sha256: "00".repeat(32),
            bytes_acked,
            state,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let repo = CheckpointRepo::new(init_memory().unwrap());
        let cp = checkpoint("d1", OtaState::Transferring, 4_096);
        repo.upsert(&cp).unwrap();

        let loaded = repo.get(&DeviceId::from("d1")).unwrap().unwrap();
        assert_eq!(loaded.job_id, cp.job_id);
        assert_eq!(loaded.bytes_acked, 4_096);
        assert_eq!(loaded.state, OtaState::Transferring);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let repo = CheckpointRepo::new(init_memory().unwrap());
        repo.upsert(&checkpoint("d1", OtaState::Transferring, 1_024)).unwrap();
        repo.upsert(&checkpoint("d1", OtaState::Verifying, 8_192)).unwrap();

        let loaded = repo.get(&DeviceId::from("d1")).unwrap().unwrap();
        assert_eq!(loaded.state, OtaState::Verifying);
        assert_eq!(loaded.bytes_acked, 8_192);
    }

    #[test]
    fn missing_device_is_none() {
        let repo = CheckpointRepo::new(init_memory().unwrap());
        assert!(repo.get(&DeviceId::from("nope")).unwrap().is_none());
    }

    #[test]
    fn checkpoints_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota.db");

        let repo = CheckpointRepo::new(init(&path).unwrap());
        repo.upsert(&checkpoint("d1", OtaState::Transferring, 2_048)).unwrap();
        drop(repo);

        // a fresh process fails the in-flight transfer but keeps the row
        let repo = CheckpointRepo::new(init(&path).unwrap());
        assert_eq!(repo.fail_in_flight().unwrap(), 1);
        let loaded = repo.get(&DeviceId::from("d1")).unwrap().unwrap();
        assert_eq!(loaded.state, OtaState::Failed);
        assert_eq!(loaded.bytes_acked, 2_048);
    }

    #[test]
    fn fail_in_flight_spares_terminal_states() {
        let repo = CheckpointRepo::new(init_memory().unwrap());
        repo.upsert(&checkpoint("mid-transfer", OtaState::Transferring, 512)).unwrap();
        repo.upsert(&checkpoint("done", OtaState::Applied, 8_192)).unwrap();

        assert_eq!(repo.fail_in_flight().unwrap(), 1);
        assert_eq!(
            repo.get(&DeviceId::from("mid-transfer")).unwrap().unwrap().state,
            OtaState::Failed
        );
        assert_eq!(
            repo.get(&DeviceId::from("done")).unwrap().unwrap().state,
            OtaState::Applied
        );
    }
}
