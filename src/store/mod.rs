//! Store Manager — spec section 4.1.
//!
//! Grounded on `diamond-drill::core::engine::DrillEngine`'s
//! constructor/validation shape (`canonicalize`, `with_context` chains)
//! and `readonly.rs`'s mount-table parsing (`Command::new("mount")`,
//! repurposed here as the fallback path for [`is_mount_point`]).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use crate::bundle::BundleBackend;
use crate::db::StoreDb;
use crate::error::{AgentFsError, Result};
use crate::naming;

pub const CONTEXT_MARKER_NAME: &str = ".agentfs";
pub const BUNDLE_DIR_NAME: &str = "data.sparsebundle";
pub const CHECKPOINTS_DIR_NAME: &str = "checkpoints";
pub const DB_FILE_NAME: &str = "agentfs.db";

/// A resolved store: its path, derived name, and mount point. Does not
/// itself hold open handles — those are acquired per-operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Store {
    pub path: PathBuf,
    pub name: String,
    pub mount_point: PathBuf,
}

impl Store {
    pub fn bundle_path(&self) -> PathBuf {
        self.path.join(BUNDLE_DIR_NAME)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.path.join(CHECKPOINTS_DIR_NAME)
    }

    pub fn db_path(&self) -> PathBuf {
        self.path.join(DB_FILE_NAME)
    }

    pub fn bands_dir(&self) -> PathBuf {
        self.bundle_path().join("bands")
    }
}

pub struct StoreManager {
    backend: Arc<dyn BundleBackend>,
}

impl StoreManager {
    pub fn new(backend: Arc<dyn BundleBackend>) -> Self {
        Self { backend }
    }

    /// Create a new store at `store_path` (spec section 4.1: `create`).
    /// Leaves the mount attached on success; unwinds on any failure.
    pub fn create(&self, store_path: &Path, size_bytes: u64) -> Result<Store> {
        let name = naming::store_name(store_path)
            .map_err(|e| AgentFsError::InvalidInput(e.to_string()))?;
        let mount_point = naming::mount_path_for(store_path)
            .map_err(|e| AgentFsError::InvalidInput(e.to_string()))?;

        if store_path.exists() {
            return Err(AgentFsError::InvalidInput(format!(
                "store already exists: {}",
                store_path.display()
            )));
        }
        if mount_point.exists() && !is_empty_dir(&mount_point)? {
            return Err(AgentFsError::InvalidInput(format!(
                "mount path already exists and is non-empty: {}",
                mount_point.display()
            )));
        }

        let store = Store {
            path: store_path.to_path_buf(),
            name: name.clone(),
            mount_point,
        };

        self.create_inner(&store, size_bytes).inspect_err(|_| {
            let _ = std::fs::remove_dir_all(&store.path);
        })?;

        Ok(store)
    }

    fn create_inner(&self, store: &Store, size_bytes: u64) -> Result<()> {
        std::fs::create_dir_all(store.checkpoints_dir())
            .map_err(|e| AgentFsError::Other(e.into()))
            .with_context_af(store)?;

        self.backend
            .create(&store.bundle_path(), size_bytes, &store.name)
            .map_err(|e| AgentFsError::PlatformOperationFailure(e.to_string()))?;

        let db = StoreDb::open(&store.db_path()).map_err(|e| AgentFsError::Other(e))?;
        db.init_store_row(&store.name, size_bytes, Utc::now())
            .map_err(AgentFsError::Other)?;

        self.mount(store)?;
        Ok(())
    }

    /// Resolve a store from its path (spec section 4.1: `get_from_path`).
    /// Returns `Ok(None)` for a missing path; errors only on malformed
    /// existing paths.
    pub fn get_from_path(&self, store_path: &Path) -> Result<Option<Store>> {
        if !store_path.exists() {
            return Ok(None);
        }
        if !store_path.is_dir() {
            return Err(AgentFsError::InvalidInput(format!(
                "store path is not a directory: {}",
                store_path.display()
            )));
        }
        if !store_path.join(BUNDLE_DIR_NAME).exists() {
            return Err(AgentFsError::InvalidInput(format!(
                "{} is missing {}",
                store_path.display(),
                BUNDLE_DIR_NAME
            )));
        }

        let name = naming::store_name(store_path)
            .map_err(|e| AgentFsError::InvalidInput(e.to_string()))?;
        let mount_point = naming::mount_path_for(store_path)
            .map_err(|e| AgentFsError::InvalidInput(e.to_string()))?;

        Ok(Some(Store {
            path: store_path.to_path_buf(),
            name,
            mount_point,
        }))
    }

    /// Enumerate `*.fs/` children of `dir` (spec section 4.1: `list_from_dir`).
    pub fn list_from_dir(&self, dir: &Path) -> Result<Vec<Store>> {
        let mut stores = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|e| AgentFsError::Other(e.into()))?;
        for entry in entries {
            let entry = entry.map_err(|e| AgentFsError::Other(e.into()))?;
            let path = entry.path();
            if path.is_dir() && path.extension().map(|e| e == "fs").unwrap_or(false) {
                if let Some(store) = self.get_from_path(&path)? {
                    stores.push(store);
                }
            }
        }
        stores.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stores)
    }

    pub fn mount(&self, store: &Store) -> Result<()> {
        if self.is_mounted(store)? {
            return Err(AgentFsError::Busy(format!(
                "{} is already mounted",
                store.mount_point.display()
            )));
        }
        self.backend
            .attach(&store.bundle_path(), &store.mount_point)
            .map_err(|e| AgentFsError::MountFailure(e.to_string()))?;
        Ok(())
    }

    /// Detach the store's volume and remove the now-empty mount-point
    /// directory (spec section 4.1: `unmount`).
    pub fn unmount(&self, store: &Store) -> Result<()> {
        self.backend
            .detach(&store.mount_point)
            .map_err(|e| AgentFsError::MountFailure(e.to_string()))?;

        if store.mount_point.exists() {
            let _ = std::fs::remove_dir(&store.mount_point);
        }
        Ok(())
    }

    /// Unmount if mounted, remove the mount-point directory, remove the
    /// entire `<name>.fs/` (spec section 4.1: `delete`).
    pub fn delete(&self, store: &Store) -> Result<()> {
        if self.is_mounted(store)? {
            // "Already unmounted" is swallowed when destroying the store.
            if let Err(e) = self.unmount(store) {
                tracing::warn!(store = %store.path.display(), error = %e, "unmount during delete failed, continuing");
            }
        }
        if store.mount_point.exists() {
            std::fs::remove_dir_all(&store.mount_point)
                .map_err(|e| AgentFsError::Other(e.into()))?;
        }
        std::fs::remove_dir_all(&store.path).map_err(|e| AgentFsError::Other(e.into()))?;
        Ok(())
    }

    pub fn is_mounted(&self, store: &Store) -> Result<bool> {
        self.backend
            .is_attached(&store.mount_point)
            .map_err(AgentFsError::Other)
    }
}

/// Fast test: compare the device identifier of `path` and its parent; if
/// different, `path` is a mount point. Falls back to parsing the
/// platform's mount list when the fast test is ambiguous (spec section
/// 4.1).
#[cfg(unix)]
pub fn is_mount_point(path: &Path) -> anyhow::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    if !path.exists() {
        return Ok(false);
    }
    let parent = match path.parent() {
        Some(p) if p.exists() => p,
        _ => return parse_mount_table(path),
    };

    let path_dev = std::fs::metadata(path)?.dev();
    let parent_dev = std::fs::metadata(parent)?.dev();
    if path_dev != parent_dev {
        return Ok(true);
    }
    parse_mount_table(path)
}

#[cfg(not(unix))]
pub fn is_mount_point(_path: &Path) -> anyhow::Result<bool> {
    Ok(false)
}

fn parse_mount_table(path: &Path) -> anyhow::Result<bool> {
    let output = Command::new("mount").output().context("spawning mount")?;
    let table = String::from_utf8_lossy(&output.stdout);
    let path_str = path.to_string_lossy();

    for line in table.lines() {
        if let Some(mount_point) = line.split(" on ").nth(1).and_then(|rest| rest.split(" (").next()) {
            if mount_point.trim() == path_str {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(path).map_err(|e| AgentFsError::Other(e.into()))?;
    Ok(entries.next().is_none())
}

/// Small helper trait so `?`-chains through `Result<T, io::Error>` can be
/// tagged with which store they concerned, without a bespoke `with_context`
/// re-implementation per call site.
trait ResultStoreContext<T> {
    fn with_context_af(self, store: &Store) -> Result<T>;
}

impl<T> ResultStoreContext<T> for Result<T> {
    fn with_context_af(self, store: &Store) -> Result<T> {
        self.map_err(|e| match e {
            AgentFsError::Other(inner) => AgentFsError::Other(
                inner.context(format!("store {}", store.path.display())),
            ),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::FakeBundleBackend;
    use tempfile::tempdir;

    fn manager() -> StoreManager {
        StoreManager::new(Arc::new(FakeBundleBackend))
    }

    #[test]
    fn create_leaves_store_mounted() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("widget.fs");
        let mgr = manager();

        let store = mgr.create(&store_path, 0).unwrap();
        assert_eq!(store.name, "widget");
        assert_eq!(store.mount_point, dir.path().join("widget"));
        assert!(mgr.is_mounted(&store).unwrap());
        assert!(store.db_path().exists());
        assert!(store.checkpoints_dir().exists());
    }

    #[test]
    fn create_rejects_existing_store_path() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("widget.fs");
        let mgr = manager();
        mgr.create(&store_path, 0).unwrap();
        assert!(mgr.create(&store_path, 0).is_err());
    }

    #[test]
    fn create_rejects_nonempty_mount_path() {
        let dir = tempdir().unwrap();
        let mount_path = dir.path().join("widget");
        std::fs::create_dir_all(&mount_path).unwrap();
        std::fs::write(mount_path.join("existing.txt"), b"x").unwrap();

        let mgr = manager();
        assert!(mgr.create(&dir.path().join("widget.fs"), 0).is_err());
    }

    #[test]
    fn create_rolls_back_on_failure() {
        // Pre-create the mount point as non-empty so create_inner fails
        // inside backend.attach (mount point in use), after the store
        // directory has already been partially created.
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("widget.fs");
        let mount_path = dir.path().join("widget");
        std::fs::create_dir_all(&mount_path).unwrap();

        let mgr = manager();
        assert!(mgr.create(&store_path, 0).is_err());
        assert!(!store_path.exists());
    }

    #[test]
    fn get_from_path_returns_none_for_missing() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        assert!(mgr.get_from_path(&dir.path().join("nope.fs")).unwrap().is_none());
    }

    #[test]
    fn get_from_path_errors_on_malformed_store() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("widget.fs");
        std::fs::create_dir_all(&store_path).unwrap();
        let mgr = manager();
        assert!(mgr.get_from_path(&store_path).is_err());
    }

    #[test]
    fn list_from_dir_enumerates_and_sorts_stores() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        mgr.create(&dir.path().join("b.fs"), 0).unwrap();
        mgr.create(&dir.path().join("a.fs"), 0).unwrap();

        let stores = mgr.list_from_dir(dir.path()).unwrap();
        assert_eq!(stores.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn mount_bails_if_already_mounted() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let store = mgr.create(&dir.path().join("widget.fs"), 0).unwrap();
        assert!(mgr.mount(&store).is_err());
    }

    #[test]
    fn unmount_then_mount_again_succeeds() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let store = mgr.create(&dir.path().join("widget.fs"), 0).unwrap();
        mgr.unmount(&store).unwrap();
        assert!(!mgr.is_mounted(&store).unwrap());
        mgr.mount(&store).unwrap();
        assert!(mgr.is_mounted(&store).unwrap());
    }

    #[test]
    fn delete_removes_store_and_mount_point() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let store = mgr.create(&dir.path().join("widget.fs"), 0).unwrap();
        mgr.delete(&store).unwrap();
        assert!(!store.path.exists());
        assert!(!store.mount_point.exists());
    }

    #[test]
    fn delete_swallows_already_unmounted() {
        let dir = tempdir().unwrap();
        let mgr = manager();
        let store = mgr.create(&dir.path().join("widget.fs"), 0).unwrap();
        mgr.unmount(&store).unwrap();
        mgr.delete(&store).unwrap();
        assert!(!store.path.exists());
    }
}
