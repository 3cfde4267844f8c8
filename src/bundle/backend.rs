//! Sparse-bundle create/attach/detach, abstracted the same way
//! `CloneProvider` abstracts cloning (spec section 9).
//!
//! The real backend shells out to `hdiutil` via [`super::SparseBundle`].
//! The fake backend treats the bundle's `bands/` directory as the live
//! filesystem content directly — attaching symlinks the mount point at
//! `bands/`, so writes under the mount land exactly where a real
//! `clonefile` on `bands/` would pick them up. This is a deliberate
//! simplification (real bands are opaque block files, not a visible
//! tree) but it preserves the one property every higher-level module
//! depends on: cloning `bands/` captures the mount's current state.

use std::path::Path;

use anyhow::{bail, Context, Result};

use super::SparseBundle;

pub trait BundleBackend: Send + Sync {
    fn create(&self, bundle_path: &Path, size_bytes: u64, volume_name: &str) -> Result<()>;
    fn attach(&self, bundle_path: &Path, mount_point: &Path) -> Result<()>;
    fn detach(&self, mount_point: &Path) -> Result<()>;
    fn is_attached(&self, mount_point: &Path) -> Result<bool>;
}

#[cfg(target_os = "macos")]
pub struct PlatformBundleBackend;

#[cfg(target_os = "macos")]
impl BundleBackend for PlatformBundleBackend {
    fn create(&self, bundle_path: &Path, size_bytes: u64, volume_name: &str) -> Result<()> {
        SparseBundle::at(bundle_path).create(size_bytes, volume_name)
    }

    fn attach(&self, bundle_path: &Path, mount_point: &Path) -> Result<()> {
        SparseBundle::at(bundle_path).attach(mount_point)
    }

    fn detach(&self, mount_point: &Path) -> Result<()> {
        // `detach` doesn't need the bundle path, only the mount point,
        // but the trait threads `bundle_path` through `attach`/`create`
        // for symmetry with the fake backend.
        SparseBundle::at(mount_point).detach(mount_point)
    }

    fn is_attached(&self, mount_point: &Path) -> Result<bool> {
        crate::store::is_mount_point(mount_point)
    }
}

#[derive(Default)]
pub struct FakeBundleBackend;

impl BundleBackend for FakeBundleBackend {
    fn create(&self, bundle_path: &Path, _size_bytes: u64, _volume_name: &str) -> Result<()> {
        if bundle_path.exists() {
            bail!("bundle already exists at {}", bundle_path.display());
        }
        std::fs::create_dir_all(bundle_path.join("bands"))
            .with_context(|| format!("creating {}", bundle_path.display()))?;
        Ok(())
    }

    fn attach(&self, bundle_path: &Path, mount_point: &Path) -> Result<()> {
        let bands = bundle_path.join("bands");
        if !bands.exists() {
            bail!("bundle {} has no bands/ directory", bundle_path.display());
        }
        if mount_point.exists() || mount_point.symlink_metadata().is_ok() {
            bail!("mount point {} already in use", mount_point.display());
        }
        if let Some(parent) = mount_point.parent() {
            std::fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&bands, mount_point)
            .with_context(|| format!("attaching {} at {}", bundle_path.display(), mount_point.display()))?;
        #[cfg(not(unix))]
        bail!("FakeBundleBackend requires a unix target");
        Ok(())
    }

    fn detach(&self, mount_point: &Path) -> Result<()> {
        match mount_point.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::remove_file(mount_point)
                    .with_context(|| format!("detaching {}", mount_point.display()))?;
            }
            Ok(_) => bail!("{} is not a fake-attached mount point", mount_point.display()),
            Err(_) => {}
        }
        Ok(())
    }

    fn is_attached(&self, mount_point: &Path) -> Result<bool> {
        Ok(mount_point
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false))
    }
}
