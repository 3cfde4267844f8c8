//! AgentFS — instant, local version control for a project directory via
//! APFS sparse-bundle cloning and `clonefile` copy-on-write checkpoints.

#[cfg(not(target_os = "macos"))]
compile_error!("agentfs only supports macOS (APFS clonefile/sparse-bundle disk images)");

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use colored::Colorize;
use dialoguer::Confirm;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agentfs::bundle::{BundleBackend, CloneProvider, PlatformBundleBackend, PlatformCloneProvider};
use agentfs::checkpoint::CheckpointManager;
use agentfs::cli::{
    CheckpointCommand, Cli, Commands, DiffArgs, OutputFormat, RegistryCommand,
};
use agentfs::config::Config;
use agentfs::context::ContextResolver;
use agentfs::convert::ConvertPipeline;
use agentfs::diff::{Differ, FileDiff};
use agentfs::error::AgentFsError;
use agentfs::registry::Registry;
use agentfs::store::{Store, StoreManager};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "agentfs=debug" } else { "agentfs=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse().unwrap()))
        .init();

    if let Err(e) = Config::ensure_exists() {
        tracing::warn!(error = %e, "could not write default config");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            let code = e
                .downcast_ref::<AgentFsError>()
                .map(|af| af.exit_code())
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

struct App {
    store_manager: StoreManager,
    checkpoint_manager: CheckpointManager,
    differ_workers: usize,
    clone_provider: Arc<dyn CloneProvider>,
    bundle_backend: Arc<dyn BundleBackend>,
    output: OutputFormat,
    explicit_store: Option<String>,
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load();
    let bundle_backend: Arc<dyn BundleBackend> = Arc::new(PlatformBundleBackend);
    let clone_provider: Arc<dyn CloneProvider> = Arc::new(PlatformCloneProvider);

    let app = App {
        store_manager: StoreManager::new(bundle_backend.clone()),
        checkpoint_manager: CheckpointManager::new(clone_provider.clone(), bundle_backend.clone()),
        differ_workers: if config.diff.workers == 0 { num_cpus::get() } else { config.diff.workers },
        clone_provider,
        bundle_backend,
        output: cli.output,
        explicit_store: cli.store,
    };

    match cli.command {
        Commands::Init(args) => app.cmd_init(args, &config),
        Commands::Mount(args) => app.cmd_mount(args),
        Commands::Unmount(args) => app.cmd_unmount(args),
        Commands::Delete(args) => app.cmd_delete(args),
        Commands::Manage(args) => app.cmd_manage(args, &config),
        Commands::Unmanage(args) => app.cmd_unmanage(args, &config),
        Commands::Checkpoint(cmd) => app.cmd_checkpoint(cmd),
        Commands::Diff(args) => app.cmd_diff(args),
        Commands::Registry(cmd) => app.cmd_registry(cmd, &config),
        Commands::Status(args) => app.cmd_status(args),
    }
}

impl App {
    fn cwd(&self) -> Result<PathBuf> {
        std::env::current_dir().map_err(|e| anyhow!(e))
    }

    /// Resolve `identifier` (or the global `--store` flag, or context) to a
    /// `Store`.
    fn resolve(&self, identifier: Option<&str>) -> Result<Store> {
        let cwd = self.cwd()?;
        let identifier = identifier.or(self.explicit_store.as_deref());
        let store_path = ContextResolver::new()
            .resolve(identifier, &cwd)
            .map_err(anyhow::Error::from)?;
        self.store_manager
            .get_from_path(&store_path)
            .map_err(anyhow::Error::from)?
            .ok_or_else(|| anyhow::Error::from(AgentFsError::NotFound(format!("store not found: {}", store_path.display()))))
    }

    /// A spinner for operations with no known total (copy-in during
    /// `manage`, mount-and-walk during `diff`). Suppressed in JSON mode so
    /// it doesn't interleave with machine-readable output.
    fn spinner(&self, message: &str) -> Option<ProgressBar> {
        if matches!(self.output, OutputFormat::Json) {
            return None;
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    }

    fn confirm(&self, prompt: &str, skip: bool) -> Result<bool> {
        if skip || matches!(self.output, OutputFormat::Json) {
            return Ok(true);
        }
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|e| anyhow!(e))
    }

    fn cmd_init(&self, args: agentfs::cli::InitArgs, config: &Config) -> Result<()> {
        let size = match &args.size {
            Some(s) => parse_size(s)?,
            None => config.default_store_size(),
        };
        let path = args.path.with_extension("fs");
        let store = self.store_manager.create(&path, size).map_err(anyhow::Error::from)?;

        if let Ok(registry) = Registry::open_default() {
            if let Err(e) = registry.register(&store.path, &store.mount_point, false) {
                tracing::warn!(error = %e, "registry write failed");
            }
        }

        self.emit_store(&store, "created")
    }

    fn cmd_mount(&self, args: agentfs::cli::StoreIdentifierArgs) -> Result<()> {
        let store = self.resolve(args.identifier.as_deref())?;
        if self.checkpoint_manager.detect_interrupted_restore(&store) {
            return Err(anyhow!(
                "{} has an interrupted restore; run recovery before mounting",
                store.path.display()
            ));
        }
        self.store_manager.mount(&store).map_err(anyhow::Error::from)?;
        if let Ok(registry) = Registry::open_default() {
            let _ = registry.update_last_mounted(&store.path);
        }
        self.emit_store(&store, "mounted")
    }

    fn cmd_unmount(&self, args: agentfs::cli::StoreIdentifierArgs) -> Result<()> {
        let store = self.resolve(args.identifier.as_deref())?;
        self.store_manager.unmount(&store).map_err(anyhow::Error::from)?;
        self.emit_store(&store, "unmounted")
    }

    fn cmd_delete(&self, args: agentfs::cli::DeleteArgs) -> Result<()> {
        let store = self.resolve(args.identifier.as_deref())?;
        if !self.confirm(&format!("Permanently delete {}?", store.path.display()), args.yes)? {
            return Ok(());
        }
        self.store_manager.delete(&store).map_err(anyhow::Error::from)?;
        if let Ok(registry) = Registry::open_default() {
            let _ = registry.unregister(&store.path);
        }
        self.emit_store(&store, "deleted")
    }

    fn cmd_manage(&self, args: agentfs::cli::ManageArgs, _config: &Config) -> Result<()> {
        let pipeline = self.convert_pipeline();
        let spinner = self.spinner(&format!("copying {} into a new store...", args.path.display()));
        let result = pipeline.manage(&args.path).map_err(anyhow::Error::from);
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }
        self.emit_store(&result?, "managed")
    }

    fn cmd_unmanage(&self, args: agentfs::cli::UnmanageArgs, _config: &Config) -> Result<()> {
        let store = self.resolve(args.identifier.as_deref())?;
        if !self.confirm(&format!("Convert {} back into a plain directory?", store.path.display()), args.yes)? {
            return Ok(());
        }
        let pipeline = self.convert_pipeline();
        pipeline.unmanage(&store).map_err(anyhow::Error::from)?;
        match self.output {
            OutputFormat::Human => println!("{} unmanaged {}", "✓".green(), store.mount_point.display()),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"action": "unmanaged", "path": store.mount_point}))
            }
        }
        Ok(())
    }

    fn convert_pipeline(&self) -> ConvertPipeline {
        ConvertPipeline::new(
            self.bundle_backend.clone(),
            self.clone_provider.clone(),
            Config::data_dir().join("registry.db"),
            Config::data_dir().join("backups"),
        )
    }

    fn cmd_checkpoint(&self, cmd: CheckpointCommand) -> Result<()> {
        match cmd {
            CheckpointCommand::Create(args) => {
                let store = self.resolve(args.identifier.as_deref())?;
                let row = if args.auto {
                    match self.checkpoint_manager.create_auto(&store).map_err(anyhow::Error::from)? {
                        Some(row) => row,
                        None => {
                            if matches!(self.output, OutputFormat::Json) {
                                println!("{}", serde_json::json!({"action": "checkpoint-create", "created": false}));
                            } else {
                                println!("no changes since v{}", "latest".dimmed());
                            }
                            return Ok(());
                        }
                    }
                } else {
                    self.checkpoint_manager
                        .create(&store, args.message.as_deref())
                        .map_err(anyhow::Error::from)?
                };
                self.emit_checkpoint(&row)
            }
            CheckpointCommand::List(args) => {
                let store = self.resolve(args.identifier.as_deref())?;
                let rows = self.checkpoint_manager.list(&store, args.limit).map_err(anyhow::Error::from)?;
                match self.output {
                    OutputFormat::Human => {
                        for row in &rows {
                            let duration = row
                                .duration_ms
                                .map(|ms| {
                                    humantime::format_duration(std::time::Duration::from_millis(ms as u64))
                                        .to_string()
                                })
                                .unwrap_or_else(|| "-".into());
                            println!(
                                "v{:<5} {:<20} parent={:<6} took={:<10} {}",
                                row.version,
                                row.created_at.to_rfc3339(),
                                row.parent_version.map(|v| format!("v{v}")).unwrap_or_else(|| "-".into()),
                                duration,
                                row.message.as_deref().unwrap_or(""),
                            );
                        }
                    }
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows_to_json(&rows))?),
                }
                Ok(())
            }
            CheckpointCommand::Restore(args) => {
                let store = self.resolve(args.identifier.as_deref())?;
                let version = CheckpointManager::parse_version(&args.version).map_err(anyhow::Error::from)?;
                if !self.confirm(
                    &format!("Restore {} to checkpoint v{version}? A pre-restore checkpoint will be created first.", store.mount_point.display()),
                    args.yes,
                )? {
                    return Ok(());
                }
                let row = self.checkpoint_manager.restore(&store, version).map_err(anyhow::Error::from)?;
                self.emit_checkpoint(&row)
            }
            CheckpointCommand::Delete(args) => {
                let store = self.resolve(args.identifier.as_deref())?;
                let version = CheckpointManager::parse_version(&args.version).map_err(anyhow::Error::from)?;
                if !self.confirm(&format!("Delete checkpoint v{version}?"), args.yes)? {
                    return Ok(());
                }
                self.checkpoint_manager.delete(&store, version).map_err(anyhow::Error::from)?;
                match self.output {
                    OutputFormat::Human => println!("{} deleted v{version}", "✓".green()),
                    OutputFormat::Json => println!("{}", serde_json::json!({"action": "checkpoint-delete", "version": version})),
                }
                Ok(())
            }
        }
    }

    fn cmd_diff(&self, args: DiffArgs) -> Result<()> {
        let store = self.resolve(args.identifier.as_deref())?;
        let from = agentfs::cli::parse_time_point(&args.from)?;
        let to = agentfs::cli::parse_time_point(&args.to)?;
        let differ = Differ::new(self.clone_provider.clone(), self.bundle_backend.clone(), self.differ_workers);
        let spinner = self.spinner("mounting and comparing...");

        if let Some(rel_path) = &args.file {
            let file_diff = differ.diff_file(&store, from, to, rel_path).map_err(anyhow::Error::from);
            if let Some(pb) = &spinner {
                pb.finish_and_clear();
            }
            match file_diff? {
                FileDiff::Unified(text) => print!("{text}"),
                FileDiff::BinarySizeChange { from_bytes, to_bytes } => {
                    println!(
                        "binary file changed: {} -> {}",
                        format_size(from_bytes, BINARY),
                        format_size(to_bytes, BINARY)
                    );
                }
                FileDiff::Unchanged => println!("(no changes)"),
            }
            return Ok(());
        }

        let summary = differ.diff(&store, from, to).map_err(anyhow::Error::from);
        if let Some(pb) = &spinner {
            pb.finish_and_clear();
        }
        let summary = summary?;
        match self.output {
            OutputFormat::Human => {
                for path in &summary.added {
                    println!("{} {}", "+".green(), path.display());
                }
                for path in &summary.modified {
                    println!("{} {}", "~".yellow(), path.display());
                }
                for path in &summary.deleted {
                    println!("{} {}", "-".red(), path.display());
                }
                println!(
                    "{} added, {} modified, {} deleted",
                    summary.added.len(),
                    summary.modified.len(),
                    summary.deleted.len()
                );
            }
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({
                    "added": summary.added,
                    "modified": summary.modified,
                    "deleted": summary.deleted,
                })
            ),
        }
        Ok(())
    }

    fn cmd_registry(&self, cmd: RegistryCommand, _config: &Config) -> Result<()> {
        let registry = Registry::open_default()?;
        match cmd {
            RegistryCommand::List => {
                let entries = registry.list()?;
                match self.output {
                    OutputFormat::Human => {
                        for entry in &entries {
                            println!(
                                "{}  mounted_at={}  auto_mount={}",
                                entry.store_path.display(),
                                entry.mount_point.display(),
                                entry.auto_mount
                            );
                        }
                    }
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries_to_json(&entries))?),
                }
            }
            RegistryCommand::Prune => {
                let removed = registry.remove_stale()?;
                match self.output {
                    OutputFormat::Human => {
                        for path in &removed {
                            println!("{} pruned {}", "✓".green(), path.display());
                        }
                    }
                    OutputFormat::Json => println!("{}", serde_json::json!({"pruned": removed})),
                }
            }
        }
        Ok(())
    }

    fn cmd_status(&self, args: agentfs::cli::StoreIdentifierArgs) -> Result<()> {
        let store = self.resolve(args.identifier.as_deref())?;
        let mounted = self.store_manager.is_mounted(&store).map_err(anyhow::Error::from)?;
        let latest = self.checkpoint_manager.latest(&store).map_err(anyhow::Error::from)?;
        let count = self.checkpoint_manager.count(&store).map_err(anyhow::Error::from)?;

        match self.output {
            OutputFormat::Human => {
                println!("store:      {}", store.path.display());
                println!("mount:      {}", store.mount_point.display());
                println!("mounted:    {}", if mounted { "yes".green() } else { "no".red() });
                println!("checkpoints: {count}");
                if let Some(row) = latest {
                    println!("latest:     v{} ({})", row.version, row.created_at.to_rfc3339());
                } else {
                    println!("latest:     (none)");
                }
            }
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({
                    "store": store.path,
                    "mount": store.mount_point,
                    "mounted": mounted,
                    "checkpoint_count": count,
                    "latest_version": latest.as_ref().map(|r| r.version),
                })
            ),
        }
        Ok(())
    }

    fn emit_store(&self, store: &Store, action: &str) -> Result<()> {
        match self.output {
            OutputFormat::Human => println!("{} {action} {}", "✓".green(), store.path.display()),
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({"action": action, "store": store.path, "mount": store.mount_point})
            ),
        }
        Ok(())
    }

    fn emit_checkpoint(&self, row: &agentfs::db::CheckpointRow) -> Result<()> {
        match self.output {
            OutputFormat::Human => println!(
                "{} v{} {}",
                "✓".green(),
                row.version,
                row.message.as_deref().unwrap_or("")
            ),
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({
                    "version": row.version,
                    "parent_version": row.parent_version,
                    "message": row.message,
                    "created_at": row.created_at.to_rfc3339(),
                })
            ),
        }
        Ok(())
    }
}

fn rows_to_json(rows: &[agentfs::db::CheckpointRow]) -> serde_json::Value {
    serde_json::json!(rows
        .iter()
        .map(|r| serde_json::json!({
            "version": r.version,
            "parent_version": r.parent_version,
            "message": r.message,
            "created_at": r.created_at.to_rfc3339(),
            "duration_ms": r.duration_ms,
        }))
        .collect::<Vec<_>>())
}

fn entries_to_json(entries: &[agentfs::registry::RegistryEntry]) -> serde_json::Value {
    serde_json::json!(entries
        .iter()
        .map(|e| serde_json::json!({
            "store_path": e.store_path,
            "mount_point": e.mount_point,
            "auto_mount": e.auto_mount,
            "created_at": e.created_at.to_rfc3339(),
            "last_mounted_at": e.last_mounted_at.map(|t| t.to_rfc3339()),
        }))
        .collect::<Vec<_>>())
}

/// Parse a size string like "10GB" / "512MB" into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let trimmed = s.trim().to_uppercase();
    let (num, unit) = if let Some(n) = trimmed.strip_suffix("GB") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = trimmed.strip_suffix("MB") {
        (n, 1024u64 * 1024)
    } else if let Some(n) = trimmed.strip_suffix("KB") {
        (n, 1024u64)
    } else if let Some(n) = trimmed.strip_suffix('B') {
        (n, 1u64)
    } else {
        (trimmed.as_str(), 1u64)
    };
    num.trim()
        .parse::<u64>()
        .map(|n| n * unit)
        .map_err(|_| anyhow!("invalid size: {s}"))
}
