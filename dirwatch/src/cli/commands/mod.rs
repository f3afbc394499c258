pub mod config;
pub mod inspect;
pub mod watch;

use anyhow::Result;
use dirwatch_core::WatchConfig;
use std::path::Path;
use tracing::debug;

/// Load the configuration file if one was given, defaults otherwise
pub fn load_config(path: Option<&Path>) -> Result<WatchConfig> {
    match path {
        Some(path) => {
            debug!("Loading configuration from {:?}", path);
            WatchConfig::from_file(path)
        }
        None => Ok(WatchConfig::default()),
    }
}
