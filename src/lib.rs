//! AgentFS
//!
//! Instant, local version control for a project directory. `init` creates
//! an APFS sparse-bundle disk image mounted in place of the project; every
//! `checkpoint create` clones the bundle's bands with `clonefile(2)`, so a
//! checkpoint costs disk space only for the blocks that later diverge.
//! `checkpoint restore` swaps the live bands for a prior checkpoint's,
//! `diff` compares any two points in time, and `manage`/`unmanage` convert
//! an existing plain directory into a store and back.
//!
//! # Example
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use agentfs::bundle::{FakeBundleBackend, FakeCloneProvider};
//! use agentfs::store::StoreManager;
//! use agentfs::checkpoint::CheckpointManager;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(FakeBundleBackend);
//! let store_mgr = StoreManager::new(backend.clone());
//! let store = store_mgr.create(std::path::Path::new("/tmp/widget.fs"), 0)?;
//!
//! let checkpoints = CheckpointManager::new(Arc::new(FakeCloneProvider), backend);
//! checkpoints.create(&store, Some("initial"))?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod bundle;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod context;
pub mod convert;
pub mod db;
pub mod diff;
pub mod error;
pub mod naming;
pub mod registry;
pub mod store;

pub use checkpoint::CheckpointManager;
pub use config::Config;
pub use context::ContextResolver;
pub use convert::ConvertPipeline;
pub use db::CheckpointRow;
pub use diff::{DiffSummary, Differ, TimePoint};
pub use error::{AgentFsError, Result};
pub use registry::{Registry, RegistryEntry};
pub use store::{Store, StoreManager};
