//! SQLite-backed sync record store.

use crate::utils::errors::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use mirror_engine::ports::StateStore;
use mirror_engine::{MachineId, SyncRecord, SyncStatus};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::fs;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_records (
  machine_id TEXT PRIMARY KEY,
  last_sync_time TEXT,
  last_sync_status TEXT NOT NULL DEFAULT 'idle' CHECK(last_sync_status IN ('idle','syncing','success','error')),
  last_backup_location TEXT,
  total_syncs INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

pub struct SqliteStateStore {
    pool: DbPool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA synchronous = FULL;",
        )?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("[DB] State store ready at {}", path.display());
        Ok(Self { pool })
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self, machine: &MachineId) -> anyhow::Result<Option<SyncRecord>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT last_sync_time, last_sync_status, last_backup_location, total_syncs, last_error
                 FROM sync_records WHERE machine_id = ?1",
                params![machine.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((time, status, location, total, error)) = row else {
            return Ok(None);
        };

        let last_sync_time = time
            .map(|t| DateTime::parse_from_rfc3339(&t).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .context("invalid last_sync_time")?;
        let last_sync_status = status.parse::<SyncStatus>().map_err(anyhow::Error::msg)?;

        Ok(Some(SyncRecord {
            machine_id: machine.clone(),
            last_sync_time,
            last_sync_status,
            last_backup_location: location,
            total_syncs: u64::try_from(total).context("negative total_syncs")?,
            last_error: error,
        }))
    }

    fn save(&self, record: &SyncRecord) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO sync_records
               (machine_id, last_sync_time, last_sync_status, last_backup_location, total_syncs, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
             ON CONFLICT(machine_id) DO UPDATE SET
               last_sync_time = excluded.last_sync_time,
               last_sync_status = excluded.last_sync_status,
               last_backup_location = excluded.last_backup_location,
               total_syncs = excluded.total_syncs,
               last_error = excluded.last_error,
               updated_at = excluded.updated_at",
            params![
                record.machine_id.as_str(),
                record.last_sync_time.map(|t| t.to_rfc3339()),
                record.last_sync_status.as_str(),
                record.last_backup_location,
                i64::try_from(record.total_syncs).context("total_syncs out of range")?,
                record.last_error,
            ],
        )?;

        Ok(())
    }
}
