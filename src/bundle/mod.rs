//! Sparse-bundle and clone mechanics — the platform-facing layer every
//! other module routes through instead of calling `hdiutil`/`clonefile`
//! directly (spec section 9).

mod backend;
mod clone;
mod sparsebundle;

pub use backend::{BundleBackend, FakeBundleBackend};
#[cfg(target_os = "macos")]
pub use backend::PlatformBundleBackend;
pub use clone::{CloneProvider, FakeCloneProvider};
pub(crate) use clone::copy_recursive;
#[cfg(target_os = "macos")]
pub use clone::PlatformCloneProvider;
pub use sparsebundle::SparseBundle;

/// Default band size used by `hdiutil`'s sparse-bundle images (spec
/// section 1: "~8 MiB bands").
pub const DEFAULT_BAND_SIZE: u64 = 8 * 1024 * 1024;
