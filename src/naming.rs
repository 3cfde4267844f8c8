//! Store naming and path-derivation helpers.
//!
//! A store is identified by its absolute `<name>.fs/` path; its mount path
//! is always the sibling `<name>/` directory (spec section 3, invariant 1).
//! Centralizing the back-and-forth here keeps `store`, `context`, and
//! `convert` from re-deriving it slightly differently.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

pub const STORE_SUFFIX: &str = ".fs";

/// Validate that a bare store name is safe to use in a path component.
///
/// Grounded on the `validate_name` guard in `other_examples`'
/// `noid-one-noid-cli` storage module: no separators, no traversal, no
/// empty or overlong names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("store name cannot be empty");
    }
    if name.len() > 200 {
        bail!("store name too long (max 200 characters)");
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!("store name contains invalid characters (/, \\, or ..)");
    }
    if name == "." {
        bail!("store name cannot be '.'");
    }
    Ok(())
}

/// Derive a store's name (basename minus `.fs`) from its path.
pub fn store_name(store_path: &Path) -> Result<String> {
    let file_name = store_path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("store path has no file name: {}", store_path.display()))?
        .to_string_lossy();

    match file_name.strip_suffix(STORE_SUFFIX) {
        Some(stem) if !stem.is_empty() => Ok(stem.to_string()),
        _ => bail!(
            "store path must end in '{}': {}",
            STORE_SUFFIX,
            store_path.display()
        ),
    }
}

/// Derive the sibling mount path `<parent>/<name>/` for a store path.
pub fn mount_path_for(store_path: &Path) -> Result<PathBuf> {
    let name = store_name(store_path)?;
    let parent = store_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("store path has no parent: {}", store_path.display()))?;
    Ok(parent.join(name))
}

/// Build the `<name>.fs/` store path given a directory and a bare name.
pub fn store_path_in(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    Ok(dir.join(format!("{name}{STORE_SUFFIX}")))
}

/// Resolve an explicit store identifier per spec section 4.7:
/// absolute paths are used directly; relative identifiers get `.fs`
/// appended (if missing) and are joined against `cwd`.
pub fn resolve_explicit_identifier(identifier: &str, cwd: &Path) -> Result<PathBuf> {
    let candidate = Path::new(identifier);
    if candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }

    let with_suffix = if identifier.ends_with(STORE_SUFFIX) {
        PathBuf::from(identifier)
    } else {
        PathBuf::from(format!("{identifier}{STORE_SUFFIX}"))
    };
    Ok(cwd.join(with_suffix))
}
