//! Differ — spec section 4.4.
//!
//! The "materialize → path, cleanup" two-variant design for a point in
//! time (spec section 9) mirrors `diamond-drill::core::scanner::Scanner`'s
//! split between collecting entries and acting on them; the parallel
//! comparison walk reuses that module's `walkdir` + `rayon` shape. Unified
//! per-file diffs use `similar`, present in the retrieval pack's
//! `MystenLabs-sui` workspace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::bundle::{BundleBackend, CloneProvider};
use crate::error::{AgentFsError, Result};
use crate::store::Store;

/// Paths excluded from every diff (spec section 4.4, step 4): platform-
/// generated volume metadata.
const EXCLUDED_NAMES: &[&str] = &[".DS_Store"];
const EXCLUDED_DIRS: &[&str] = &[".Spotlight-V100", ".Trashes", ".fseventsd", ".TemporaryItems"];
const RESOURCE_FORK_PREFIX: &str = "._";

/// A point in time the Differ can compare: either a checkpoint (must be
/// materialized as a temporary mount) or the live mount (already
/// materialized). Spec section 9's two-variant tagged sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePoint {
    Checkpoint(i64),
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

struct Materialized {
    mount_path: PathBuf,
    cleanup_as: Option<(PathBuf, PathBuf)>, // (temp bundle path, temp mount path)
}

pub struct Differ {
    clone_provider: Arc<dyn CloneProvider>,
    bundle_backend: Arc<dyn BundleBackend>,
    workers: usize,
}

impl Differ {
    pub fn new(clone_provider: Arc<dyn CloneProvider>, bundle_backend: Arc<dyn BundleBackend>, workers: usize) -> Self {
        Self {
            clone_provider,
            bundle_backend,
            workers: workers.max(1),
        }
    }

    fn temp_root(store: &Store) -> PathBuf {
        store.path.join(".agentfs-diff-tmp")
    }

    fn materialize(&self, store: &Store, point: TimePoint, label: &str) -> Result<Materialized> {
        match point {
            TimePoint::Live => Ok(Materialized {
                mount_path: store.mount_point.clone(),
                cleanup_as: None,
            }),
            TimePoint::Checkpoint(version) => {
                let checkpoint_dir = store.checkpoints_dir().join(format!("v{version}"));
                if !checkpoint_dir.exists() {
                    return Err(AgentFsError::NotFound(format!("checkpoint v{version} not found")));
                }

                let temp_root = Self::temp_root(store);
                std::fs::create_dir_all(&temp_root).map_err(|e| AgentFsError::Other(e.into()))?;
                let temp_bundle = temp_root.join(format!("{label}.sparsebundle"));
                let temp_mount = temp_root.join(label);

                std::fs::create_dir_all(&temp_bundle).map_err(|e| AgentFsError::Other(e.into()))?;
                for meta_file in ["Info.plist", "token"] {
                    let src = store.bundle_path().join(meta_file);
                    if src.exists() {
                        let _ = std::fs::copy(&src, temp_bundle.join(meta_file));
                    }
                }

                self.clone_provider
                    .clone_path(&checkpoint_dir, &temp_bundle.join("bands"))
                    .map_err(|e| AgentFsError::PlatformOperationFailure(e.to_string()))?;
                self.bundle_backend
                    .attach(&temp_bundle, &temp_mount)
                    .map_err(|e| AgentFsError::MountFailure(e.to_string()))?;

                Ok(Materialized {
                    mount_path: temp_mount.clone(),
                    cleanup_as: Some((temp_bundle, temp_mount)),
                })
            }
        }
    }

    fn cleanup(&self, materialized: Materialized) {
        if let Some((bundle, mount)) = materialized.cleanup_as {
            if let Err(e) = self.bundle_backend.detach(&mount) {
                tracing::warn!(mount = %mount.display(), error = %e, "detaching temporary diff mount failed");
            }
            let _ = std::fs::remove_dir_all(&mount);
            let _ = std::fs::remove_dir_all(&bundle);
        }
    }

    /// Compare two points in time and produce the added/modified/deleted
    /// summary (spec section 4.4, steps 1-2, 4-5).
    pub fn diff(&self, store: &Store, a: TimePoint, b: TimePoint) -> Result<DiffSummary> {
        let left = self.materialize(store, a, "diff-a")?;
        let result = self.materialize(store, b, "diff-b");
        let right = match result {
            Ok(r) => r,
            Err(e) => {
                self.cleanup(left);
                return Err(e);
            }
        };

        let summary = self.compare_trees(&left.mount_path, &right.mount_path);

        self.cleanup(left);
        self.cleanup(right);

        summary
    }

    /// Emit a unified line diff for a single file path, comparing its
    /// content between two points in time (spec section 4.4, step 3).
    /// Binary files (null byte in the first 8 KiB) report only a size
    /// change.
    pub fn diff_file(&self, store: &Store, a: TimePoint, b: TimePoint, rel_path: &Path) -> Result<FileDiff> {
        let left = self.materialize(store, a, "diff-file-a")?;
        let result = self.materialize(store, b, "diff-file-b");
        let right = match result {
            Ok(r) => r,
            Err(e) => {
                self.cleanup(left);
                return Err(e);
            }
        };

        let outcome = read_and_diff(&left.mount_path.join(rel_path), &right.mount_path.join(rel_path));

        self.cleanup(left);
        self.cleanup(right);

        outcome
    }

    fn compare_trees(&self, left_root: &Path, right_root: &Path) -> Result<DiffSummary> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| AgentFsError::Other(e.into()))?;

        let left_entries = collect_entries(left_root)?;
        let right_entries = collect_entries(right_root)?;

        let mut all_paths: Vec<&PathBuf> = left_entries.keys().chain(right_entries.keys()).collect();
        all_paths.sort();
        all_paths.dedup();

        let entries: Vec<DiffEntry> = pool.install(|| {
            all_paths
                .par_iter()
                .filter_map(|path| {
                    let left = left_entries.get(*path);
                    let right = right_entries.get(*path);
                    match (left, right) {
                        (Some(_), None) => Some(DiffEntry {
                            path: (*path).clone(),
                            kind: ChangeKind::Deleted,
                        }),
                        (None, Some(_)) => Some(DiffEntry {
                            path: (*path).clone(),
                            kind: ChangeKind::Added,
                        }),
                        (Some(l), Some(r)) => {
                            if l.size != r.size || l.modified != r.modified {
                                Some(DiffEntry {
                                    path: (*path).clone(),
                                    kind: ChangeKind::Modified,
                                })
                            } else {
                                None
                            }
                        }
                        (None, None) => None,
                    }
                })
                .collect()
        });

        let mut summary = DiffSummary::default();
        for entry in entries {
            match entry.kind {
                ChangeKind::Added => summary.added.push(entry.path),
                ChangeKind::Modified => summary.modified.push(entry.path),
                ChangeKind::Deleted => summary.deleted.push(entry.path),
            }
        }
        summary.added.sort();
        summary.modified.sort();
        summary.deleted.sort();
        Ok(summary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDiff {
    Unified(String),
    BinarySizeChange { from_bytes: u64, to_bytes: u64 },
    Unchanged,
}

fn read_and_diff(left: &Path, right: &Path) -> Result<FileDiff> {
    let left_bytes = std::fs::read(left).map_err(|e| AgentFsError::Other(e.into()))?;
    let right_bytes = std::fs::read(right).map_err(|e| AgentFsError::Other(e.into()))?;

    if is_binary(&left_bytes) || is_binary(&right_bytes) {
        if left_bytes.len() as u64 == right_bytes.len() as u64 {
            return Ok(FileDiff::Unchanged);
        }
        return Ok(FileDiff::BinarySizeChange {
            from_bytes: left_bytes.len() as u64,
            to_bytes: right_bytes.len() as u64,
        });
    }

    let left_text = String::from_utf8_lossy(&left_bytes);
    let right_text = String::from_utf8_lossy(&right_bytes);
    if left_text == right_text {
        return Ok(FileDiff::Unchanged);
    }

    let diff = similar::TextDiff::from_lines(&left_text, &right_text);
    Ok(FileDiff::Unified(diff.unified_diff().to_string()))
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|b| *b == 0)
}

pub(crate) struct EntryMeta {
    pub size: u64,
    pub modified: Option<std::time::SystemTime>,
}

pub(crate) fn collect_entries(root: &Path) -> Result<BTreeMap<PathBuf, EntryMeta>> {
    let mut entries = BTreeMap::new();
    if !root.exists() {
        return Ok(entries);
    }

    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_excluded(e.path())) {
        let entry = entry.map_err(|e| AgentFsError::Other(e.into()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| AgentFsError::Other(e.into()))?
            .to_path_buf();
        let metadata = entry.metadata().map_err(|e| AgentFsError::Other(e.into()))?;
        entries.insert(
            rel,
            EntryMeta {
                size: metadata.len(),
                modified: metadata.modified().ok(),
            },
        );
    }
    Ok(entries)
}

pub(crate) fn is_excluded(path: &Path) -> bool {
    path.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        EXCLUDED_NAMES.contains(&name.as_ref())
            || EXCLUDED_DIRS.contains(&name.as_ref())
            || name.starts_with(RESOURCE_FORK_PREFIX)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{FakeBundleBackend, FakeCloneProvider};
    use crate::checkpoint::CheckpointManager;
    use crate::store::StoreManager;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, StoreManager, CheckpointManager, Differ, Store) {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FakeBundleBackend);
        let store_mgr = StoreManager::new(backend.clone());
        let checkpoint_mgr = CheckpointManager::new(Arc::new(FakeCloneProvider), backend.clone());
        let differ = Differ::new(Arc::new(FakeCloneProvider), backend, 2);
        let store = store_mgr.create(&dir.path().join("proj.fs"), 0).unwrap();
        (dir, store_mgr, checkpoint_mgr, differ, store)
    }

    #[test]
    fn scenario_f_diff_reports_added_modified_deleted() {
        let (_dir, _store_mgr, checkpoint_mgr, differ, store) = setup();

        std::fs::write(store.mount_point.join("b.txt"), b"v1").unwrap();
        std::fs::write(store.mount_point.join("c.txt"), b"to-delete").unwrap();
        checkpoint_mgr.create(&store, None).unwrap(); // v1

        std::fs::write(store.mount_point.join("a.txt"), b"new").unwrap();
        std::fs::write(store.mount_point.join("b.txt"), b"v2-longer").unwrap();
        std::fs::remove_file(store.mount_point.join("c.txt")).unwrap();
        checkpoint_mgr.create(&store, None).unwrap(); // v2

        let summary = differ
            .diff(&store, TimePoint::Checkpoint(1), TimePoint::Checkpoint(2))
            .unwrap();

        assert_eq!(summary.added, vec![PathBuf::from("a.txt")]);
        assert_eq!(summary.modified, vec![PathBuf::from("b.txt")]);
        assert_eq!(summary.deleted, vec![PathBuf::from("c.txt")]);
    }

    #[test]
    fn diff_excludes_volume_metadata() {
        let (_dir, _store_mgr, checkpoint_mgr, differ, store) = setup();
        checkpoint_mgr.create(&store, None).unwrap(); // v1

        std::fs::write(store.mount_point.join(".DS_Store"), b"junk").unwrap();
        std::fs::create_dir_all(store.mount_point.join(".Spotlight-V100")).unwrap();
        std::fs::write(store.mount_point.join(".Spotlight-V100/index"), b"x").unwrap();
        std::fs::write(store.mount_point.join("._resourcefork"), b"x").unwrap();
        checkpoint_mgr.create(&store, None).unwrap(); // v2

        let summary = differ
            .diff(&store, TimePoint::Checkpoint(1), TimePoint::Checkpoint(2))
            .unwrap();
        assert!(summary.added.is_empty());
        assert!(summary.modified.is_empty());
        assert!(summary.deleted.is_empty());
    }

    #[test]
    fn diff_live_compares_against_current_mount_without_materializing() {
        let (_dir, _store_mgr, checkpoint_mgr, differ, store) = setup();
        checkpoint_mgr.create(&store, None).unwrap(); // v1
        std::fs::write(store.mount_point.join("live.txt"), b"hi").unwrap();

        let summary = differ.diff(&store, TimePoint::Checkpoint(1), TimePoint::Live).unwrap();
        assert_eq!(summary.added, vec![PathBuf::from("live.txt")]);
    }

    #[test]
    fn diff_file_emits_unified_diff_for_text_changes() {
        let (_dir, _store_mgr, checkpoint_mgr, differ, store) = setup();
        std::fs::write(store.mount_point.join("f.txt"), "line one\nline two\n").unwrap();
        checkpoint_mgr.create(&store, None).unwrap();
        std::fs::write(store.mount_point.join("f.txt"), "line one\nline TWO\n").unwrap();
        checkpoint_mgr.create(&store, None).unwrap();

        let result = differ
            .diff_file(&store, TimePoint::Checkpoint(1), TimePoint::Checkpoint(2), Path::new("f.txt"))
            .unwrap();
        match result {
            FileDiff::Unified(text) => assert!(text.contains("line TWO")),
            other => panic!("expected unified diff, got {other:?}"),
        }
    }

    #[test]
    fn diff_file_reports_binary_size_change() {
        let (_dir, _store_mgr, checkpoint_mgr, differ, store) = setup();
        std::fs::write(store.mount_point.join("f.bin"), [0u8, 1, 2]).unwrap();
        checkpoint_mgr.create(&store, None).unwrap();
        std::fs::write(store.mount_point.join("f.bin"), [0u8, 1, 2, 3, 4]).unwrap();
        checkpoint_mgr.create(&store, None).unwrap();

        let result = differ
            .diff_file(&store, TimePoint::Checkpoint(1), TimePoint::Checkpoint(2), Path::new("f.bin"))
            .unwrap();
        assert_eq!(result, FileDiff::BinarySizeChange { from_bytes: 3, to_bytes: 5 });
    }

    #[test]
    fn diff_unknown_checkpoint_fails_not_found() {
        let (_dir, _store_mgr, checkpoint_mgr, differ, store) = setup();
        checkpoint_mgr.create(&store, None).unwrap();
        let err = differ
            .diff(&store, TimePoint::Checkpoint(1), TimePoint::Checkpoint(99))
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }
}
