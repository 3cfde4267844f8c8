//! Configuration Module - operator preferences from ~/.config/agentfs/config.toml
//!
//! These are tunable defaults for behavior not captured in the on-disk
//! store format itself (spec section D): default band size for `init`,
//! the differ's worker count, whether auto-checkpoint mode is enabled,
//! and log level.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bundle::DEFAULT_BAND_SIZE;

/// Default worker count for the differ's mount-and-walk pool (spec
/// section 5: "the default of four workers").
pub const DEFAULT_DIFFER_WORKERS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub checkpoint: CheckpointConfig,
    pub diff: DiffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            checkpoint: CheckpointConfig::default(),
            diff: DiffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Default sparse-bundle size (bytes) for `init` when no explicit
    /// size is given.
    pub default_size_bytes: u64,
    /// Whether editor-hook invocations run the cheap auto-checkpoint
    /// comparison by default (spec section 4.3.1).
    pub auto_enabled: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            default_size_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
            auto_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Worker count for the mount-and-walk traversal (0 = auto-detect).
    pub workers: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_DIFFER_WORKERS,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&Self::default_path()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("failed to write config: {}", path.display()))?;

        Ok(())
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "agentfs", "agentfs")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".agentfs")
                    .join("config.toml")
            })
    }

    /// The per-user data directory holding the registry and backup index
    /// (spec section 6: `<user-data>/agentfs/`), distinct from the config
    /// directory above.
    pub fn data_dir() -> PathBuf {
        directories::ProjectDirs::from("com", "agentfs", "agentfs")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".agentfs")
            })
    }

    pub fn exists() -> bool {
        Self::default_path().exists()
    }

    pub fn ensure_exists() -> Result<()> {
        let path = Self::default_path();
        if !path.exists() {
            let config = Config::default();
            config.save_to(&path)?;
            tracing::info!(path = %path.display(), "created default config");
        }
        Ok(())
    }

    /// Default sparse-bundle size, falling back to the crate-wide
    /// default band size's natural multiple if unset.
    pub fn default_store_size(&self) -> u64 {
        self.checkpoint.default_size_bytes.max(DEFAULT_BAND_SIZE)
    }
}

/// Generate a sample config file with comments.
pub fn generate_sample_config() -> String {
    r#"# AgentFS configuration
# Location: ~/.config/agentfs/config.toml

[general]
# Log level: trace, debug, info, warn, error
log_level = "info"

[checkpoint]
# Default sparse-bundle size (bytes) used by `init` when no --size is given
default_size_bytes = 10737418240

# Whether `checkpoint create --auto` is enabled by default for editor hooks
auto_enabled = true

[diff]
# Worker count for the differ's mount-and-walk pool (0 = auto-detect CPU count)
workers = 4
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert!(config.checkpoint.auto_enabled);
        assert_eq!(config.diff.workers, DEFAULT_DIFFER_WORKERS);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test_config.toml");

        let config = Config::default();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.general.log_level, config.general.log_level);
        assert_eq!(
            loaded.checkpoint.default_size_bytes,
            config.checkpoint.default_size_bytes
        );
    }

    #[test]
    fn test_parse_sample_config() {
        let sample = generate_sample_config();
        let _config: Config = toml::from_str(&sample).unwrap();
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(Config::load_from(&path).is_err());

        // `load()` itself never fails hard; it falls back to defaults.
        let config = Config::default();
        assert_eq!(config.diff.workers, 4);
    }
}
