//! Global store registry — spec section 4.6.
//!
//! A single `registry.db` under the user data directory, shared across
//! invocations. Every operation here is non-critical to the data plane
//! (spec section 4.6's failure model): callers are expected to log a
//! warning and continue on error rather than propagate, which is why
//! these functions return plain `anyhow::Result` rather than
//! `AgentFsError` — they are never meant to reach the CLI's exit-code
//! mapping.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub store_path: PathBuf,
    pub mount_point: PathBuf,
    pub auto_mount: bool,
    pub created_at: DateTime<Utc>,
    pub last_mounted_at: Option<DateTime<Utc>>,
}

pub struct Registry {
    conn: Connection,
}

impl Registry {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating registry directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening registry {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;

             CREATE TABLE IF NOT EXISTS store (
                 store_path TEXT PRIMARY KEY,
                 mount_point TEXT NOT NULL,
                 auto_mount INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL,
                 last_mounted_at TEXT
             );
             ",
        )
        .context("applying registry schema")?;
        Ok(Self { conn })
    }

    /// Open at the default location (spec section 6:
    /// `<user-data>/agentfs/registry.db`).
    pub fn open_default() -> Result<Self> {
        Self::open(&crate::config::Config::data_dir().join("registry.db"))
    }

    pub fn register(&self, store_path: &Path, mount_point: &Path, auto_mount: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO store (store_path, mount_point, auto_mount, created_at, last_mounted_at)
             VALUES (?1, ?2, ?3, ?4, NULL)
             ON CONFLICT(store_path) DO UPDATE SET
                 mount_point = excluded.mount_point,
                 auto_mount = excluded.auto_mount",
            params![path_str(store_path)?, path_str(mount_point)?, auto_mount as i64, now],
        )?;
        Ok(())
    }

    pub fn unregister(&self, store_path: &Path) -> Result<()> {
        self.conn
            .execute("DELETE FROM store WHERE store_path = ?1", params![path_str(store_path)?])?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<RegistryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT store_path, mount_point, auto_mount, created_at, last_mounted_at
             FROM store ORDER BY store_path",
        )?;
        let rows = stmt
            .query_map([], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_with_auto_mount(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.list()?.into_iter().filter(|e| e.auto_mount).collect())
    }

    pub fn update_last_mounted(&self, store_path: &Path) -> Result<()> {
        self.conn.execute(
            "UPDATE store SET last_mounted_at = ?1 WHERE store_path = ?2",
            params![Utc::now().to_rfc3339(), path_str(store_path)?],
        )?;
        Ok(())
    }

    /// Remove rows whose `store_path` no longer exists on disk (spec
    /// section 4.6: `remove-stale`). Returns the removed paths.
    pub fn remove_stale(&self) -> Result<Vec<PathBuf>> {
        let entries = self.list()?;
        let mut removed = Vec::new();
        for entry in entries {
            if !entry.store_path.exists() {
                self.unregister(&entry.store_path)?;
                removed.push(entry.store_path);
            }
        }
        Ok(removed)
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<RegistryEntry> {
    let store_path: String = row.get(0)?;
    let mount_point: String = row.get(1)?;
    let auto_mount: i64 = row.get(2)?;
    let created_at_str: String = row.get(3)?;
    let last_mounted_str: Option<String> = row.get(4)?;

    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let last_mounted_at = last_mounted_str.and_then(|s| {
        DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc))
    });

    Ok(RegistryEntry {
        store_path: PathBuf::from(store_path),
        mount_point: PathBuf::from(mount_point),
        auto_mount: auto_mount != 0,
        created_at,
        last_mounted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_then_list_round_trips() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(&dir.path().join("registry.db")).unwrap();

        let store_path = dir.path().join("proj.fs");
        let mount_point = dir.path().join("proj");
        registry.register(&store_path, &mount_point, true).unwrap();

        let entries = registry.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].store_path, store_path);
        assert!(entries[0].auto_mount);
        assert!(entries[0].last_mounted_at.is_none());
    }

    #[test]
    fn update_last_mounted_sets_timestamp() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(&dir.path().join("registry.db")).unwrap();
        let store_path = dir.path().join("proj.fs");
        registry.register(&store_path, &dir.path().join("proj"), false).unwrap();

        registry.update_last_mounted(&store_path).unwrap();
        let entries = registry.list().unwrap();
        assert!(entries[0].last_mounted_at.is_some());
    }

    #[test]
    fn unregister_removes_row() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(&dir.path().join("registry.db")).unwrap();
        let store_path = dir.path().join("proj.fs");
        registry.register(&store_path, &dir.path().join("proj"), false).unwrap();
        registry.unregister(&store_path).unwrap();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn remove_stale_drops_missing_store_paths() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(&dir.path().join("registry.db")).unwrap();

        let existing = dir.path().join("exists.fs");
        std::fs::create_dir_all(&existing).unwrap();
        let missing = dir.path().join("gone.fs");

        registry.register(&existing, &dir.path().join("exists"), false).unwrap();
        registry.register(&missing, &dir.path().join("gone"), false).unwrap();

        let removed = registry.remove_stale().unwrap();
        assert_eq!(removed, vec![missing]);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn list_with_auto_mount_filters() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(&dir.path().join("registry.db")).unwrap();
        registry.register(&dir.path().join("a.fs"), &dir.path().join("a"), true).unwrap();
        registry.register(&dir.path().join("b.fs"), &dir.path().join("b"), false).unwrap();

        let auto = registry.list_with_auto_mount().unwrap();
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].store_path, dir.path().join("a.fs"));
    }
}
