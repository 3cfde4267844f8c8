//! Command surface — one args struct per subcommand, grouped under a
//! single [`Cli`]/[`Commands`] pair the way `main.rs` expects to match on.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// AgentFS — instant, local version control for a project directory via
/// APFS sparse-bundle cloning.
#[derive(Parser, Debug)]
#[command(name = "agentfs")]
#[command(author = "Ryan Cashmoney <tunclon@proton.me>")]
#[command(version)]
#[command(about = "Instant local checkpoints for a directory, backed by APFS clonefile", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Explicit store identifier (name or `.fs` path). Overrides context
    /// resolution (spec section 4.7).
    #[arg(long, short = 's', global = true)]
    pub store: Option<String>,

    /// Output format for machine parsing.
    #[arg(long, value_enum, global = true, default_value = "human")]
    pub output: OutputFormat,

    /// Verbose logging.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new empty store and mount it.
    Init(InitArgs),

    /// Mount an existing store.
    Mount(StoreIdentifierArgs),

    /// Unmount a store, leaving its data intact.
    Unmount(StoreIdentifierArgs),

    /// Permanently delete a store and its checkpoints.
    Delete(DeleteArgs),

    /// Convert an existing directory into a store mounted at the same path.
    Manage(ManageArgs),

    /// Convert a store back into a plain directory.
    Unmanage(UnmanageArgs),

    /// Checkpoint operations.
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),

    /// Compare two points in time.
    Diff(DiffArgs),

    /// Registry operations.
    #[command(subcommand)]
    Registry(RegistryCommand),

    /// Show a store's status: mount state, checkpoint count, latest version.
    Status(StoreIdentifierArgs),
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCommand {
    /// Create a checkpoint of the current mount state.
    Create(CheckpointCreateArgs),
    /// List checkpoints, most recent first.
    List(CheckpointListArgs),
    /// Restore the mount to a prior checkpoint.
    Restore(CheckpointRestoreArgs),
    /// Delete a checkpoint.
    Delete(CheckpointDeleteArgs),
}

#[derive(Subcommand, Debug)]
pub enum RegistryCommand {
    /// List every store AgentFS knows about.
    List,
    /// Drop rows whose store path no longer exists on disk.
    Prune,
}

#[derive(Debug, Clone, Parser)]
pub struct InitArgs {
    /// Path for the new store's mount point (its `.fs/` sibling is derived).
    pub path: PathBuf,

    /// Sparse-bundle size, e.g. "10GB" (default from config).
    #[arg(long)]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Parser)]
pub struct StoreIdentifierArgs {
    /// Store name or `.fs` path. Falls back to context resolution (spec
    /// section 4.7) if omitted.
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Parser)]
pub struct DeleteArgs {
    pub identifier: Option<String>,

    /// Skip the confirmation prompt.
    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct ManageArgs {
    /// Directory to convert into a store.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Parser)]
pub struct UnmanageArgs {
    pub identifier: Option<String>,

    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct CheckpointCreateArgs {
    pub identifier: Option<String>,

    /// Checkpoint message.
    #[arg(long, short = 'm')]
    pub message: Option<String>,

    /// Only checkpoint if the mount has changed since the latest
    /// checkpoint (spec section 4.3.1).
    #[arg(long)]
    pub auto: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct CheckpointListArgs {
    pub identifier: Option<String>,

    /// Limit the number of rows returned (most recent first).
    #[arg(long)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Parser)]
pub struct CheckpointRestoreArgs {
    pub identifier: Option<String>,

    /// Checkpoint version, as `v<n>` or bare `<n>`.
    pub version: String,

    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct CheckpointDeleteArgs {
    pub identifier: Option<String>,
    pub version: String,

    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Debug, Clone, Parser)]
pub struct DiffArgs {
    pub identifier: Option<String>,

    /// Left side: "live" or a checkpoint version (`v<n>`/`<n>`).
    pub from: String,

    /// Right side: "live" or a checkpoint version. Defaults to "live".
    #[arg(default_value = "live")]
    pub to: String,

    /// Show a unified diff for a single file instead of a summary.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human readable (default)
    #[default]
    Human,
    /// JSON output
    Json,
}

/// Parse a diff/checkpoint endpoint: "live" (any case) or a version.
pub fn parse_time_point(input: &str) -> anyhow::Result<crate::diff::TimePoint> {
    if input.eq_ignore_ascii_case("live") {
        return Ok(crate::diff::TimePoint::Live);
    }
    crate::checkpoint::CheckpointManager::parse_version(input)
        .map(crate::diff::TimePoint::Checkpoint)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}
