//! Context Resolver — spec section 4.7.
//!
//! Grounded on `diamond-drill::config::Config::default_path`/`ensure_exists`'s
//! ancestor/default-path resolution conventions, and `naming::validate_name`
//! for explicit identifiers.

use std::path::{Path, PathBuf};

use crate::error::{AgentFsError, Result};
use crate::naming;
use crate::store::CONTEXT_MARKER_NAME;

pub struct ContextResolver;

impl ContextResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a store path given an optional explicit identifier and the
    /// current working directory, per spec section 4.7's three-step
    /// fallback.
    pub fn resolve(&self, explicit: Option<&str>, cwd: &Path) -> Result<PathBuf> {
        if let Some(identifier) = explicit {
            return naming::resolve_explicit_identifier(identifier, cwd)
                .map_err(|e| AgentFsError::InvalidInput(e.to_string()));
        }

        if let Some(store_path) = self.find_via_marker(cwd)? {
            return Ok(store_path);
        }

        if let Some(store_path) = self.find_unambiguous_in(cwd)? {
            return Ok(store_path);
        }

        Err(AgentFsError::NotFound("no store selected".to_string()))
    }

    /// Search `cwd` and each parent for the context marker file.
    fn find_via_marker(&self, cwd: &Path) -> Result<Option<PathBuf>> {
        let mut dir = Some(cwd.to_path_buf());
        while let Some(current) = dir {
            let marker = current.join(CONTEXT_MARKER_NAME);
            if marker.is_file() {
                let content = std::fs::read_to_string(&marker)
                    .map_err(|e| AgentFsError::Other(e.into()))?;
                let store_path = content.trim().to_string();
                if store_path.is_empty() {
                    return Err(AgentFsError::CorruptionRecoverable(format!(
                        "context marker {} is empty",
                        marker.display()
                    )));
                }
                return Ok(Some(PathBuf::from(store_path)));
            }
            dir = current.parent().map(|p| p.to_path_buf());
        }
        Ok(None)
    }

    /// If exactly one `*.fs/` entry exists in `cwd`, use it.
    fn find_unambiguous_in(&self, cwd: &Path) -> Result<Option<PathBuf>> {
        let entries = std::fs::read_dir(cwd).map_err(|e| AgentFsError::Other(e.into()))?;
        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| AgentFsError::Other(e.into()))?;
            let path = entry.path();
            if path.is_dir() && path.extension().map(|e| e == "fs").unwrap_or(false) {
                candidates.push(path);
            }
        }
        match candidates.len() {
            1 => Ok(candidates.pop()),
            _ => Ok(None),
        }
    }
}

impl Default for ContextResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn explicit_absolute_identifier_used_directly() {
        let resolver = ContextResolver::new();
        let cwd = PathBuf::from("/home/user");
        let resolved = resolver.resolve(Some("/other/widget.fs"), &cwd).unwrap();
        assert_eq!(resolved, PathBuf::from("/other/widget.fs"));
    }

    #[test]
    fn explicit_relative_identifier_joins_cwd() {
        let resolver = ContextResolver::new();
        let cwd = PathBuf::from("/home/user");
        let resolved = resolver.resolve(Some("widget"), &cwd).unwrap();
        assert_eq!(resolved, PathBuf::from("/home/user/widget.fs"));
    }

    #[test]
    fn marker_file_in_cwd_is_found() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("widget.fs");
        std::fs::write(dir.path().join(CONTEXT_MARKER_NAME), store_path.to_string_lossy().as_bytes()).unwrap();

        let resolver = ContextResolver::new();
        let resolved = resolver.resolve(None, dir.path()).unwrap();
        assert_eq!(resolved, store_path);
    }

    #[test]
    fn marker_file_in_ancestor_is_found() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("widget.fs");
        std::fs::write(dir.path().join(CONTEXT_MARKER_NAME), store_path.to_string_lossy().as_bytes()).unwrap();

        let nested = dir.path().join("src/nested");
        std::fs::create_dir_all(&nested).unwrap();

        let resolver = ContextResolver::new();
        let resolved = resolver.resolve(None, &nested).unwrap();
        assert_eq!(resolved, store_path);
    }

    #[test]
    fn single_unambiguous_store_in_cwd_is_used() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("widget.fs")).unwrap();

        let resolver = ContextResolver::new();
        let resolved = resolver.resolve(None, dir.path()).unwrap();
        assert_eq!(resolved, dir.path().join("widget.fs"));
    }

    #[test]
    fn ambiguous_stores_in_cwd_fail() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a.fs")).unwrap();
        std::fs::create_dir_all(dir.path().join("b.fs")).unwrap();

        let resolver = ContextResolver::new();
        assert!(resolver.resolve(None, dir.path()).is_err());
    }

    #[test]
    fn no_store_and_no_marker_fails_with_not_found() {
        let dir = tempdir().unwrap();
        let resolver = ContextResolver::new();
        let err = resolver.resolve(None, dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
