//! Config command: print or save the effective configuration

use anyhow::{Context, Result};
use dirwatch_core::WatchConfig;
use tracing::info;

use crate::cli::app::ConfigArgs;

/// Execute config command
pub fn execute(args: ConfigArgs, config: &WatchConfig) -> Result<()> {
    match args.output {
        Some(path) => {
            config.save(&path)?;
            info!("Configuration written to {:?}", path);
        }
        None => {
            let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
            print!("{}", content);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands::load_config;

    #[test]
    fn test_written_config_loads_back() {
        let dir = std::env::temp_dir().join(format!("dirwatch-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dirwatch.toml");

        let config = WatchConfig { poll_interval_ms: 750, ..WatchConfig::default() };
        execute(ConfigArgs { output: Some(path.clone()) }, &config).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.poll_interval_ms, 750);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_config_file_fails() {
        assert!(load_config(Some(std::path::Path::new("/nonexistent/dirwatch.toml"))).is_err());
    }
}
