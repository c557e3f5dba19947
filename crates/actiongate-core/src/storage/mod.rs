mod config;
pub mod database;
pub mod store;

pub use config::{
    BypassConfig, Config, FeatureLimitConfig, LimitsConfig, ModerationConfig, ReconcilerConfig,
    MAX_WINDOW_SECS,
};
pub use database::SqliteStore;
pub use store::{MemoryStore, StateStore};

use std::path::PathBuf;

/// Returns the data directory, creating it if needed.
///
/// `ACTIONGATE_DATA_DIR` overrides the location outright. Otherwise this is
/// `~/.config/actiongate[-dev]/`, with `ACTIONGATE_ENV=dev` selecting the
/// development directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let dir = match std::env::var_os("ACTIONGATE_DATA_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");

            let env = std::env::var("ACTIONGATE_ENV").unwrap_or_else(|_| "production".to_string());

            if env == "dev" {
                base_dir.join("actiongate-dev")
            } else {
                base_dir.join("actiongate")
            }
        }
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
