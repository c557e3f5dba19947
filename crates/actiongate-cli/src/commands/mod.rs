pub mod config;
pub mod limits;
pub mod moderation;
pub mod session;
pub mod watch;

use std::sync::{Arc, RwLock};

use actiongate_core::{
    Config, GateDeps, LimitRegistry, SharedConfig, SqliteStore, StateStore, SystemClock,
};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Everything a command needs, opened from the data directory.
pub struct Gate {
    pub config: SharedConfig,
    pub store: Arc<dyn StateStore>,
    pub registry: LimitRegistry,
}

impl Gate {
    pub fn open() -> Result<Self, Box<dyn std::error::Error>> {
        let config: SharedConfig = Arc::new(RwLock::new(Config::load()?));
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open()?);
        let registry = LimitRegistry::from_deps(&GateDeps::stored(
            store.clone(),
            config.clone(),
            Arc::new(SystemClock),
        ));
        Ok(Self {
            config,
            store,
            registry,
        })
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
