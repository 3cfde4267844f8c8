//! Per-store database (`agentfs.db`) — spec section 4.2.
//!
//! Schema and busy-retry transactional style grounded on `rusqlite`
//! (bundled) usage across the pack; opened per invocation, closed at
//! exit, exactly as spec section 4.2's concurrency note requires.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// One row from the `checkpoint` table.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRow {
    pub id: i64,
    pub version: i64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub parent_version: Option<i64>,
}

/// Handle to a single store's `agentfs.db`.
pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    /// Open (creating if absent) the database at `path`, applying schema
    /// migrations and a busy timeout so concurrent `checkpoint create`
    /// invocations (spec section 5) don't spuriously fail.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;

             CREATE TABLE IF NOT EXISTS store (
                 name TEXT NOT NULL,
                 size_bytes INTEGER NOT NULL,
                 created_at TEXT NOT NULL,
                 next_version INTEGER NOT NULL DEFAULT 1
             );

             CREATE TABLE IF NOT EXISTS checkpoint (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 version INTEGER NOT NULL UNIQUE,
                 message TEXT,
                 created_at TEXT NOT NULL,
                 duration_ms INTEGER,
                 parent_version INTEGER
             );

             CREATE INDEX IF NOT EXISTS checkpoint_version_desc
                 ON checkpoint (version DESC);
             ",
        )
        .context("applying schema")?;

        Ok(Self { conn })
    }

    /// Record the store's singleton metadata row, if not already present.
    pub fn init_store_row(&self, name: &str, size_bytes: u64, created_at: DateTime<Utc>) -> Result<()> {
        let existing: Option<i64> = self
            .conn
            .query_row("SELECT rowid FROM store LIMIT 1", [], |r| r.get(0))
            .optional()?;
        if existing.is_none() {
            self.conn.execute(
                "INSERT INTO store (name, size_bytes, created_at) VALUES (?1, ?2, ?3)",
                params![name, size_bytes as i64, created_at.to_rfc3339()],
            )?;
        }
        Ok(())
    }

    /// Insert a checkpoint reserving the next version, with `parent`
    /// explicitly supplied by the caller (create uses the previous
    /// latest; restore uses the target version — spec section 4.3.1/4.3.4).
    ///
    /// The next version comes from the `store` row's `next_version`
    /// counter rather than `MAX(version)+1` over the checkpoint table, so
    /// deleting every checkpoint never resets numbering back to 1 (spec
    /// section 3, invariant 8.12). Runs inside a transaction so the
    /// "read counter, bump it, insert" step is atomic against a racing
    /// `checkpoint create` (spec section 5).
    pub fn reserve_next_version(
        &mut self,
        message: Option<&str>,
        parent_version: Option<i64>,
        created_at: DateTime<Utc>,
    ) -> Result<(i64, i64)> {
        let tx = self.conn.transaction()?;
        let next_version: i64 =
            tx.query_row("SELECT next_version FROM store LIMIT 1", [], |r| r.get(0))?;
        tx.execute(
            "UPDATE store SET next_version = ?1",
            params![next_version + 1],
        )?;
        tx.execute(
            "INSERT INTO checkpoint (version, message, created_at, duration_ms, parent_version)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![next_version, message, created_at.to_rfc3339(), parent_version],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok((id, next_version))
    }

    /// Roll back a reservation whose band clone failed (spec section
    /// 4.3.1 failure semantics): remove the row entirely.
    pub fn remove_row(&self, id: i64) -> Result<()> {
        self.conn.execute("DELETE FROM checkpoint WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn update_duration(&self, id: i64, duration_ms: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE checkpoint SET duration_ms = ?1 WHERE id = ?2",
            params![duration_ms, id],
        )?;
        Ok(())
    }

    pub fn get_by_version(&self, version: i64) -> Result<Option<CheckpointRow>> {
        self.conn
            .query_row(
                "SELECT id, version, message, created_at, duration_ms, parent_version
                 FROM checkpoint WHERE version = ?1",
                params![version],
                row_to_checkpoint,
            )
            .optional()
            .context("querying checkpoint by version")
    }

    pub fn latest(&self) -> Result<Option<CheckpointRow>> {
        self.conn
            .query_row(
                "SELECT id, version, message, created_at, duration_ms, parent_version
                 FROM checkpoint ORDER BY version DESC LIMIT 1",
                [],
                row_to_checkpoint,
            )
            .optional()
            .context("querying latest checkpoint")
    }

    pub fn list(&self, limit: Option<i64>) -> Result<Vec<CheckpointRow>> {
        let mut stmt = match limit {
            Some(_) => self.conn.prepare(
                "SELECT id, version, message, created_at, duration_ms, parent_version
                 FROM checkpoint ORDER BY version DESC LIMIT ?1",
            )?,
            None => self.conn.prepare(
                "SELECT id, version, message, created_at, duration_ms, parent_version
                 FROM checkpoint ORDER BY version DESC",
            )?,
        };

        let rows = if let Some(limit) = limit {
            stmt.query_map(params![limit], row_to_checkpoint)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map([], row_to_checkpoint)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM checkpoint", [], |r| r.get(0))?)
    }

    /// Delete a checkpoint row by version. The caller must remove the
    /// on-disk `checkpoints/v<n>/` directory first (spec section 4.3.3).
    pub fn delete_by_version(&self, version: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM checkpoint WHERE version = ?1", params![version])?;
        Ok(())
    }
}

fn row_to_checkpoint(row: &rusqlite::Row) -> rusqlite::Result<CheckpointRow> {
    let created_at_str: String = row.get(3)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(CheckpointRow {
        id: row.get(0)?,
        version: row.get(1)?,
        message: row.get(2)?,
        created_at,
        duration_ms: row.get(4)?,
        parent_version: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, StoreDb) {
        let dir = tempdir().unwrap();
        let db = StoreDb::open(&dir.path().join("agentfs.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn first_checkpoint_has_null_parent() {
        let (_dir, mut db) = open_temp();
        let (_, version) = db.reserve_next_version(None, None, Utc::now()).unwrap();
        assert_eq!(version, 1);
        let row = db.get_by_version(1).unwrap().unwrap();
        assert_eq!(row.parent_version, None);
    }

    #[test]
    fn versions_are_strictly_monotone() {
        let (_dir, mut db) = open_temp();
        let (_, v1) = db.reserve_next_version(None, None, Utc::now()).unwrap();
        let (_, v2) = db.reserve_next_version(None, Some(v1), Utc::now()).unwrap();
        assert_eq!((v1, v2), (1, 2));
        assert_eq!(db.latest().unwrap().unwrap().version, 2);
    }

    #[test]
    fn deleting_all_then_creating_yields_strictly_greater_version() {
        let (_dir, mut db) = open_temp();
        let (_, v1) = db.reserve_next_version(None, None, Utc::now()).unwrap();
        let (_, v2) = db.reserve_next_version(None, Some(v1), Utc::now()).unwrap();
        db.delete_by_version(v1).unwrap();
        db.delete_by_version(v2).unwrap();
        assert_eq!(db.count().unwrap(), 0);

        let (_, v3) = db.reserve_next_version(None, None, Utc::now()).unwrap();
        assert_eq!(v3, 3);
    }

    #[test]
    fn remove_row_rolls_back_reservation() {
        let (_dir, mut db) = open_temp();
        let (id, _) = db.reserve_next_version(None, None, Utc::now()).unwrap();
        db.remove_row(id).unwrap();
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn update_duration_persists() {
        let (_dir, mut db) = open_temp();
        let (id, version) = db.reserve_next_version(None, None, Utc::now()).unwrap();
        db.update_duration(id, 42).unwrap();
        let row = db.get_by_version(version).unwrap().unwrap();
        assert_eq!(row.duration_ms, Some(42));
    }

    #[test]
    fn list_respects_limit_and_order() {
        let (_dir, mut db) = open_temp();
        for _ in 0..5 {
            db.reserve_next_version(None, None, Utc::now()).unwrap();
        }
        let all = db.list(None).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].version, 5);

        let limited = db.list(Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].version, 5);
        assert_eq!(limited[1].version, 4);
    }
}
