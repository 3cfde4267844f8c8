//! Sparse-bundle disk image lifecycle: create, attach, detach.
//!
//! Grounded on the `diskutil`/`hdiutil` subprocess-wrapping style seen in
//! `other_examples`' `spacedrive` APFS detector (`Command::new(...).args([...]).output()`,
//! defensive textual parsing of tool output) and `facebook/sapling`'s
//! `eden_apfs_mount_helper`. No corpus file serializes an `Info.plist`, so
//! rather than adding an ungrounded `plist` dependency this writes the
//! handful of keys `hdiutil` needs as a hand-rolled XML template, the same
//! way `diamond-drill::config` hand-rolls its commented TOML sample.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::error::AgentFsError;

/// A sparse-bundle disk image rooted at `data.sparsebundle/` inside a store.
pub struct SparseBundle {
    pub path: PathBuf,
}

impl SparseBundle {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn bands_dir(&self) -> PathBuf {
        self.path.join("bands")
    }

    fn info_plist_path(&self) -> PathBuf {
        self.path.join("Info.plist")
    }

    /// Create a new, empty sparse bundle of the given size (bytes),
    /// with an inner volume named `volume_name`.
    pub fn create(&self, size_bytes: u64, volume_name: &str) -> Result<()> {
        if self.path.exists() {
            bail!(
                "sparse bundle already exists at {}",
                self.path.display()
            );
        }

        let output = Command::new("hdiutil")
            .args([
                "create",
                "-type",
                "SPARSEBUNDLE",
                "-fs",
                "APFS",
                "-volname",
                volume_name,
                "-size",
                &format!("{size_bytes}b"),
                self.path.to_str().context("bundle path is not valid UTF-8")?,
            ])
            .output()
            .context("spawning hdiutil create")?;

        if !output.status.success() {
            return Err(AgentFsError::PlatformOperationFailure(format!(
                "hdiutil create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
            .into());
        }

        std::fs::create_dir_all(self.bands_dir()).context("creating bands/ directory")?;
        Ok(())
    }

    /// Attach (mount) the bundle's inner volume at `mount_point`.
    pub fn attach(&self, mount_point: &Path) -> Result<()> {
        std::fs::create_dir_all(mount_point)
            .with_context(|| format!("creating mount point {}", mount_point.display()))?;

        let output = Command::new("hdiutil")
            .args([
                "attach",
                self.path.to_str().context("bundle path is not valid UTF-8")?,
                "-mountpoint",
                mount_point.to_str().context("mount path is not valid UTF-8")?,
                "-nobrowse",
                "-noautofsck",
            ])
            .output()
            .context("spawning hdiutil attach")?;

        if !output.status.success() {
            return Err(AgentFsError::MountFailure(format!(
                "hdiutil attach failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
            .into());
        }

        Ok(())
    }

    /// Detach (unmount) whatever is currently mounted at `mount_point`.
    pub fn detach(&self, mount_point: &Path) -> Result<()> {
        let output = Command::new("hdiutil")
            .args([
                "detach",
                mount_point.to_str().context("mount path is not valid UTF-8")?,
            ])
            .output()
            .context("spawning hdiutil detach")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not currently mounted") || stderr.contains("no such file") {
                return Ok(());
            }
            return Err(AgentFsError::MountFailure(format!(
                "hdiutil detach failed: {stderr}"
            ))
            .into());
        }

        Ok(())
    }

    /// Minimal Info.plist content sufficient for our temporary
    /// diff-mount bundles, which copy their token/metadata from the
    /// store's real bundle rather than generating a fresh one (spec
    /// section 4.4, step 1).
    pub fn write_minimal_info_plist(&self, volume_name: &str, band_size: u64) -> Result<()> {
        let plist = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleInfoDictionaryVersion</key>
    <string>6.0</string>
    <key>band-size</key>
    <integer>{band_size}</integer>
    <key>bundle-backingstore-version</key>
    <integer>1</integer>
    <key>diskimage-bundle-type</key>
    <string>com.apple.diskimage.sparsebundle</string>
    <key>size</key>
    <integer>0</integer>
    <key>volume-name</key>
    <string>{volume_name}</string>
</dict>
</plist>
"#
        );
        std::fs::write(self.info_plist_path(), plist).context("writing Info.plist")?;
        Ok(())
    }

    pub fn info_plist_exists(&self) -> bool {
        self.info_plist_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_minimal_info_plist_produces_expected_keys() {
        let dir = tempdir().unwrap();
        let bundle = SparseBundle::at(dir.path().join("data.sparsebundle"));
        std::fs::create_dir_all(&bundle.path).unwrap();
        bundle.write_minimal_info_plist("myproject", 8 * 1024 * 1024).unwrap();

        let content = std::fs::read_to_string(bundle.info_plist_path()).unwrap();
        assert!(content.contains("myproject"));
        assert!(content.contains("8388608"));
        assert!(bundle.info_plist_exists());
    }

    #[test]
    fn bands_dir_is_nested_under_bundle_path() {
        let bundle = SparseBundle::at("/tmp/x.fs/data.sparsebundle");
        assert_eq!(
            bundle.bands_dir(),
            PathBuf::from("/tmp/x.fs/data.sparsebundle/bands")
        );
    }
}
