//! Backup index — spec section 4.5's `manage`/`unmanage` safety net.
//!
//! A JSON-file index (`index.json`) under `~/.agentfs/backups/`, distinct
//! from the registry's sqlite backing (spec section 6 keeps them as
//! siblings under the same data directory). Grounded on
//! `diamond-drill::export::ExportManifest`'s `serde_json::to_string_pretty`
//! round-trip and typed-entry style.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub id: String,
    pub original_path: PathBuf,
    pub store_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub total_bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupIndexFile {
    #[serde(default)]
    entries: Vec<BackupEntry>,
}

/// Handle to the backup index rooted at `backups_dir` (typically
/// `~/.agentfs/backups/`, spec section 6).
pub struct BackupIndex {
    backups_dir: PathBuf,
}

impl BackupIndex {
    pub fn at(backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            backups_dir: backups_dir.into(),
        }
    }

    pub fn open_default() -> Self {
        Self::at(crate::config::Config::data_dir().join("backups"))
    }

    fn index_path(&self) -> PathBuf {
        self.backups_dir.join("index.json")
    }

    /// Directory holding the archived contents for a given backup ID.
    pub fn entry_dir(&self, id: &str) -> PathBuf {
        self.backups_dir.join(id)
    }

    fn load(&self) -> Result<BackupIndexFile> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(BackupIndexFile::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading backup index {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing backup index {}", path.display()))
    }

    fn save(&self, index: &BackupIndexFile) -> Result<()> {
        std::fs::create_dir_all(&self.backups_dir)
            .with_context(|| format!("creating backups dir {}", self.backups_dir.display()))?;
        let content = serde_json::to_string_pretty(index).context("serializing backup index")?;
        std::fs::write(self.index_path(), content).context("writing backup index")
    }

    /// Register a new pending backup, returning its generated opaque ID.
    pub fn create(&self, original_path: &Path, store_path: &Path, total_bytes: u64) -> Result<BackupEntry> {
        let mut index = self.load()?;
        let entry = BackupEntry {
            id: Uuid::new_v4().to_string(),
            original_path: original_path.to_path_buf(),
            store_path: store_path.to_path_buf(),
            created_at: Utc::now(),
            total_bytes,
        };
        index.entries.push(entry.clone());
        self.save(&index)?;
        Ok(entry)
    }

    pub fn list(&self) -> Result<Vec<BackupEntry>> {
        Ok(self.load()?.entries)
    }

    pub fn find_by_original_path(&self, original_path: &Path) -> Result<Option<BackupEntry>> {
        Ok(self
            .load()?
            .entries
            .into_iter()
            .find(|e| e.original_path == original_path))
    }

    pub fn find_by_store_path(&self, store_path: &Path) -> Result<Option<BackupEntry>> {
        Ok(self
            .load()?
            .entries
            .into_iter()
            .find(|e| e.store_path == store_path))
    }

    /// Remove the ledger entry (and, if present, its archived directory)
    /// once a `manage`/`unmanage` cycle no longer needs it.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut index = self.load()?;
        index.entries.retain(|e| e.id != id);
        self.save(&index)?;

        let dir = self.entry_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing backup archive {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_list_round_trips() {
        let dir = tempdir().unwrap();
        let index = BackupIndex::at(dir.path());

        let entry = index
            .create(Path::new("/home/user/proj"), Path::new("/home/user/proj.fs"), 1234)
            .unwrap();

        let all = index.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, entry.id);
        assert_eq!(all[0].total_bytes, 1234);
    }

    #[test]
    fn find_by_original_path() {
        let dir = tempdir().unwrap();
        let index = BackupIndex::at(dir.path());
        index
            .create(Path::new("/a/proj"), Path::new("/a/proj.fs"), 10)
            .unwrap();

        let found = index.find_by_original_path(Path::new("/a/proj")).unwrap();
        assert!(found.is_some());
        let missing = index.find_by_original_path(Path::new("/a/other")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn remove_deletes_entry_and_archive_dir() {
        let dir = tempdir().unwrap();
        let index = BackupIndex::at(dir.path());
        let entry = index
            .create(Path::new("/a/proj"), Path::new("/a/proj.fs"), 10)
            .unwrap();

        std::fs::create_dir_all(index.entry_dir(&entry.id)).unwrap();
        index.remove(&entry.id).unwrap();

        assert!(index.list().unwrap().is_empty());
        assert!(!index.entry_dir(&entry.id).exists());
    }

    #[test]
    fn load_with_missing_index_file_returns_empty() {
        let dir = tempdir().unwrap();
        let index = BackupIndex::at(dir.path());
        assert!(index.list().unwrap().is_empty());
    }
}
