//! On-disk configuration for quotio: the credential store and the
//! fallback-chain document, plus the watcher that picks up external edits.

pub mod fallback;
pub mod store;
pub mod watcher;

use std::path::PathBuf;

pub use fallback::{FallbackConfig, FallbackEntry, VirtualModel};
pub use store::{FileCredentialStore, StoreError};
pub use watcher::FallbackWatcher;

/// `<config_dir>/quotio`, e.g. `~/.config/quotio` on Linux.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("quotio"))
}
