//! Convert Pipeline — spec section 4.5: `manage` and `unmanage`.
//!
//! Grounded on `diamond-drill::export::Exporter`'s verified-copy pattern
//! (`ExportManifest`-style count/size verification), adapted from
//! per-file hashing to the spec's count+byte-size verification (hashing
//! is explicitly out of scope on this path).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;

use crate::backup::BackupIndex;
use crate::bundle::{BundleBackend, CloneProvider};
use crate::context::ContextResolver;
use crate::db::StoreDb;
use crate::diff;
use crate::error::{AgentFsError, Result};
use crate::naming;
use crate::registry::Registry;
use crate::store::{Store, CONTEXT_MARKER_NAME};

pub struct ConvertPipeline {
    bundle_backend: Arc<dyn BundleBackend>,
    clone_provider: Arc<dyn CloneProvider>,
    registry_db_path: PathBuf,
    backups_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationMismatch {
    pub source_count: u64,
    pub source_bytes: u64,
    pub target_count: u64,
    pub target_bytes: u64,
    pub differing_paths: Vec<PathBuf>,
}

impl ConvertPipeline {
    pub fn new(
        bundle_backend: Arc<dyn BundleBackend>,
        clone_provider: Arc<dyn CloneProvider>,
        registry_db_path: PathBuf,
        backups_dir: PathBuf,
    ) -> Self {
        Self {
            bundle_backend,
            clone_provider,
            registry_db_path,
            backups_dir,
        }
    }

    fn registry(&self) -> Result<Registry> {
        Registry::open(&self.registry_db_path).map_err(AgentFsError::Other)
    }

    fn backups(&self) -> BackupIndex {
        BackupIndex::at(self.backups_dir.clone())
    }

    /// Clone each entry of `src` into the already-attached `dst` mount.
    /// `CloneProvider::clone_path` requires its destination not already
    /// exist, which rules out cloning `src` onto `dst` directly once a
    /// mount point is attached there — so entries are cloned one at a
    /// time, mirroring [`ConvertPipeline::unmanage`]'s copy-out.
    fn copy_contents_into(&self, src: &Path, dst: &Path) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
            let entry = entry?;
            let dest = dst.join(entry.file_name());
            self.clone_provider.clone_path(&entry.path(), &dest)?;
        }
        Ok(())
    }

    /// Transform an existing directory `d` into a store `d.fs/` mounted
    /// at `d/` (spec section 4.5).
    pub fn manage(&self, d: &Path) -> Result<Store> {
        if !d.exists() || !d.is_dir() {
            return Err(AgentFsError::InvalidInput(format!(
                "{} does not exist or is not a directory",
                d.display()
            )));
        }
        let d = d
            .canonicalize()
            .map_err(|e| AgentFsError::Other(e.into()))?;

        let name = d
            .file_name()
            .ok_or_else(|| AgentFsError::InvalidInput(format!("{} has no file name", d.display())))?
            .to_string_lossy()
            .to_string();
        naming::validate_name(&name).map_err(|e| AgentFsError::InvalidInput(e.to_string()))?;
        let store_path = d.with_file_name(format!("{name}.fs"));

        if store_path.exists() {
            return Err(AgentFsError::InvalidInput(format!(
                "store already exists at {}",
                store_path.display()
            )));
        }
        if ContextResolver::new().resolve(None, &d).is_ok() {
            return Err(AgentFsError::InvalidInput(format!(
                "{} is already inside a mounted store",
                d.display()
            )));
        }
        if self
            .backups()
            .find_by_original_path(&d)
            .map_err(AgentFsError::Other)?
            .is_some()
        {
            return Err(AgentFsError::InvalidInput(format!(
                "a pending backup already references {}",
                d.display()
            )));
        }

        let store = Store {
            path: store_path.clone(),
            name: name.clone(),
            mount_point: d.clone(),
        };

        self.manage_inner(&d, &store).inspect_err(|_| {
            let _ = std::fs::remove_dir_all(&store_path);
        })
    }

    fn manage_inner(&self, d: &Path, store: &Store) -> Result<Store> {
        // Step 2: create D.fs/ and an empty sparse bundle + checkpoints/.
        std::fs::create_dir_all(store.checkpoints_dir()).map_err(|e| AgentFsError::Other(e.into()))?;
        self.bundle_backend
            .create(&store.bundle_path(), 0, &store.name)
            .map_err(|e| AgentFsError::PlatformOperationFailure(e.to_string()))?;

        // Step 3: attach at a disposable mount point and copy D's contents in.
        let temp_mount = store.path.join(".manage-tmp-mount");
        self.bundle_backend
            .attach(&store.bundle_path(), &temp_mount)
            .map_err(|e| AgentFsError::MountFailure(e.to_string()))?;

        if let Err(e) = self.copy_contents_into(d, &temp_mount) {
            let _ = self.bundle_backend.detach(&temp_mount);
            return Err(AgentFsError::PlatformOperationFailure(format!(
                "copying {} into new store failed: {e}",
                d.display()
            )));
        }

        // Step 4: verify count + total size, ignoring volume metadata.
        if let Err(mismatch) = verify_counts_match(d, &temp_mount) {
            let _ = self.bundle_backend.detach(&temp_mount);
            return Err(AgentFsError::VerificationFailure {
                summary: format!(
                    "source has {} files / {} bytes, copy has {} files / {} bytes",
                    mismatch.source_count, mismatch.source_bytes, mismatch.target_count, mismatch.target_bytes
                ),
                differing_paths: mismatch.differing_paths,
            });
        }

        // Step 5: detach the temporary mount.
        self.bundle_backend
            .detach(&temp_mount)
            .map_err(|e| AgentFsError::MountFailure(e.to_string()))?;
        let _ = std::fs::remove_dir(&temp_mount);

        // From here on, failures must attempt to restore the backup.
        self.finish_manage(d, store).map_err(|e| {
            tracing::error!(error = %e, "manage failed after backup point, attempting recovery");
            e
        })
    }

    fn finish_manage(&self, d: &Path, store: &Store) -> Result<Store> {
        // Step 6: record a backup entry and move D/ aside.
        let total_bytes = diff::collect_entries(d)?.values().map(|m| m.size).sum();
        let backups = self.backups();
        let backup_entry = backups
            .create(d, &store.path, total_bytes)
            .map_err(AgentFsError::Other)?;
        let backup_dir = backups.entry_dir(&backup_entry.id);

        if let Err(e) = move_aside(d, &backup_dir) {
            let _ = backups.remove(&backup_entry.id);
            return Err(AgentFsError::Other(e));
        }

        // Step 7: recreate D/ and attach the bundle there.
        if let Err(e) = self.bundle_backend.attach(&store.bundle_path(), d) {
            self.restore_backup_or_warn(&backup_dir, d);
            let _ = backups.remove(&backup_entry.id);
            return Err(AgentFsError::MountFailure(format!(
                "re-mounting at {} failed: {e}; original contents restored from backup",
                d.display()
            )));
        }

        // Step 8: init db, write context marker, register.
        let db = match StoreDb::open(&store.db_path()) {
            Ok(db) => db,
            Err(e) => {
                let _ = self.bundle_backend.detach(d);
                self.restore_backup_or_warn(&backup_dir, d);
                let _ = backups.remove(&backup_entry.id);
                return Err(AgentFsError::Other(e));
            }
        };
        db.init_store_row(&store.name, 0, Utc::now()).map_err(AgentFsError::Other)?;

        if let Err(e) = std::fs::write(d.join(CONTEXT_MARKER_NAME), store.path.to_string_lossy().as_bytes()) {
            tracing::warn!(error = %e, "writing context marker failed");
        }

        match self.registry() {
            Ok(registry) => {
                if let Err(e) = registry.register(&store.path, d, false) {
                    tracing::warn!(error = %e, "registry write failed during manage");
                }
            }
            Err(e) => tracing::warn!(error = %e, "opening registry failed during manage"),
        }

        backups.remove(&backup_entry.id).ok();

        Ok(store.clone())
    }

    fn restore_backup_or_warn(&self, backup_dir: &Path, d: &Path) {
        if let Err(e) = move_aside(backup_dir, d) {
            tracing::error!(
                backup = %backup_dir.display(),
                target = %d.display(),
                error = %e,
                "failed to restore backup after manage failure; manual recovery required"
            );
        }
    }

    /// Inverse of `manage`: requires the store to be mounted (spec
    /// section 4.5).
    pub fn unmanage(&self, store: &Store) -> Result<()> {
        let mounted = self
            .bundle_backend
            .is_attached(&store.mount_point)
            .map_err(AgentFsError::Other)?;
        if !mounted {
            return Err(AgentFsError::Busy(format!(
                "{} is not mounted",
                store.mount_point.display()
            )));
        }

        // Staged under backups_dir, not under store.path — the store
        // directory gets removed wholesale below, and that must not take
        // the only copy of the user's data down with it.
        std::fs::create_dir_all(&self.backups_dir).map_err(|e| AgentFsError::Other(e.into()))?;
        let temp_dir = self.backups_dir.join(format!("unmanage-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&temp_dir).map_err(|e| AgentFsError::Other(e.into()))?;

        for entry in std::fs::read_dir(&store.mount_point).map_err(|e| AgentFsError::Other(e.into()))? {
            let entry = entry.map_err(|e| AgentFsError::Other(e.into()))?;
            if entry.file_name() == CONTEXT_MARKER_NAME {
                continue;
            }
            let dest = temp_dir.join(entry.file_name());
            self.clone_provider
                .clone_path(&entry.path(), &dest)
                .map_err(|e| AgentFsError::PlatformOperationFailure(e.to_string()))?;
        }

        if let Err(mismatch) = verify_counts_match_excluding(&store.mount_point, &temp_dir, CONTEXT_MARKER_NAME) {
            let _ = std::fs::remove_dir_all(&temp_dir);
            return Err(AgentFsError::VerificationFailure {
                summary: format!(
                    "mount has {} files / {} bytes, copy has {} files / {} bytes",
                    mismatch.source_count, mismatch.source_bytes, mismatch.target_count, mismatch.target_bytes
                ),
                differing_paths: mismatch.differing_paths,
            });
        }

        self.bundle_backend
            .detach(&store.mount_point)
            .map_err(|e| AgentFsError::MountFailure(e.to_string()))?;
        let _ = std::fs::remove_dir(&store.mount_point);

        std::fs::remove_dir_all(&store.path).map_err(|e| AgentFsError::Other(e.into()))?;

        move_aside(&temp_dir, &store.mount_point).map_err(AgentFsError::Other)?;

        if let Ok(registry) = self.registry() {
            if let Err(e) = registry.unregister(&store.path) {
                tracing::warn!(error = %e, "registry unregister failed during unmanage");
            }
        } else {
            tracing::warn!("opening registry failed during unmanage");
        }

        Ok(())
    }
}

fn verify_counts_match(left: &Path, right: &Path) -> std::result::Result<(), VerificationMismatch> {
    verify_counts_match_excluding(left, right, "")
}

/// Like `verify_counts_match`, but drops a single top-level entry name
/// (the context marker, which only ever lives on the mount side) from
/// both sides before comparing — it is never present on the copy side,
/// so counting it on the mount side alone would always fail the check.
fn verify_counts_match_excluding(
    left: &Path,
    right: &Path,
    exclude_top_level: &str,
) -> std::result::Result<(), VerificationMismatch> {
    let mut left_entries = diff::collect_entries(left).unwrap_or_default();
    let mut right_entries = diff::collect_entries(right).unwrap_or_default();
    if !exclude_top_level.is_empty() {
        let marker = Path::new(exclude_top_level);
        left_entries.retain(|p, _| p != marker);
        right_entries.retain(|p, _| p != marker);
    }

    let left_count = left_entries.len() as u64;
    let right_count = right_entries.len() as u64;
    let left_bytes: u64 = left_entries.values().map(|m| m.size).sum();
    let right_bytes: u64 = right_entries.values().map(|m| m.size).sum();

    if left_count == right_count && left_bytes == right_bytes {
        return Ok(());
    }

    let mut differing = Vec::new();
    for (path, meta) in &left_entries {
        match right_entries.get(path) {
            Some(other) if other.size == meta.size => {}
            _ => differing.push(path.clone()),
        }
    }
    for path in right_entries.keys() {
        if !left_entries.contains_key(path) {
            differing.push(path.clone());
        }
    }
    differing.sort();
    differing.dedup();

    Err(VerificationMismatch {
        source_count: left_count,
        source_bytes: left_bytes,
        target_count: right_count,
        target_bytes: right_bytes,
        differing_paths: differing,
    })
}

/// Move `src` to `dst` via rename; falls back to recursive copy + delete
/// on cross-device failure (spec section 4.5, step 6).
fn move_aside(src: &Path, dst: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
            crate::bundle::copy_recursive(src, dst).context("cross-device fallback copy failed")?;
            std::fs::remove_dir_all(src).context("removing source after fallback copy")?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("renaming {} to {}", src.display(), dst.display())),
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    libc::EXDEV
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    i32::MIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{CloneProvider, FakeBundleBackend, FakeCloneProvider};
    use tempfile::tempdir;

    fn pipeline(dir: &Path) -> ConvertPipeline {
        ConvertPipeline::new(
            Arc::new(FakeBundleBackend),
            Arc::new(FakeCloneProvider),
            dir.join("registry.db"),
            dir.join("backups"),
        )
    }

    fn make_source_dir(dir: &Path) -> PathBuf {
        let source = dir.join("foo");
        std::fs::create_dir_all(&source).unwrap();
        for i in 0..10 {
            std::fs::write(source.join(format!("file{i}.txt")), format!("contents {i}")).unwrap();
        }
        source
    }

    #[test]
    fn scenario_c_manage_then_unmanage_round_trips() {
        let dir = tempdir().unwrap();
        let source = make_source_dir(dir.path());
        let pipe = pipeline(dir.path());

        let store = pipe.manage(&source).unwrap();
        assert!(store.path.exists());
        assert!(source.join(CONTEXT_MARKER_NAME).exists());
        let file_count = std::fs::read_dir(&source)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name() != CONTEXT_MARKER_NAME)
            .count();
        assert_eq!(file_count, 10);

        pipe.unmanage(&store).unwrap();
        assert!(!store.path.exists());
        let restored_count = std::fs::read_dir(&source).unwrap().count();
        assert_eq!(restored_count, 10);
        assert_eq!(
            std::fs::read_to_string(source.join("file0.txt")).unwrap(),
            "contents 0"
        );
    }

    #[test]
    fn manage_rejects_existing_store() {
        let dir = tempdir().unwrap();
        let source = make_source_dir(dir.path());
        let pipe = pipeline(dir.path());
        pipe.manage(&source).unwrap();

        // Store is now mounted at `source`; managing the same path again
        // should fail because `source.fs` already exists (checked before
        // any mutation), leaving the existing store untouched.
        assert!(pipe.manage(&source).is_err());
    }

    #[test]
    fn unmanage_requires_mounted_store() {
        let dir = tempdir().unwrap();
        let source = make_source_dir(dir.path());
        let pipe = pipeline(dir.path());
        let store = pipe.manage(&source).unwrap();

        let backend = FakeBundleBackend;
        backend.detach(&store.mount_point).unwrap();

        assert!(pipe.unmanage(&store).is_err());
    }
}
