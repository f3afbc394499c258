//! Watcher configuration
//!
//! Selects the preferred notification mechanism, the polling cadence for
//! local and network-mounted paths, and the noisy filenames that never count
//! as directory content changes.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use pattern_utils::{NoiseFilter, defaults};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backend::BackendMode;
use crate::error::{WatchError, WatchResult};

/// Mechanism requested by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    #[default]
    Kernel,
    Daemon,
    WatcherService,
    Polling,
}

impl BackendPreference {
    pub fn mode(self) -> BackendMode {
        match self {
            BackendPreference::Kernel => BackendMode::KernelEvent,
            BackendPreference::Daemon => BackendMode::DaemonEvent,
            BackendPreference::WatcherService => BackendMode::WatcherService,
            BackendPreference::Polling => BackendMode::Polling,
        }
    }
}

/// Main configuration for the watch engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Mechanism tried first for local paths
    pub preferred_backend: BackendPreference,

    /// Mechanism tried first for network-mounted paths.
    /// Kernel notification misses changes made by other machines.
    pub network_preferred_backend: BackendPreference,

    /// Polling cadence for local paths
    pub poll_interval_ms: u64,

    /// Polling cadence for network-mounted paths
    pub network_poll_interval_ms: u64,

    /// Glob patterns identifying network-mounted paths
    pub network_paths: Vec<String>,

    /// Filename prefixes ignored when classifying directory content changes
    pub noisy_prefixes: Vec<String>,

    /// Filename suffixes ignored when classifying directory content changes
    pub noisy_suffixes: Vec<String>,

    /// Delay between a backend event and the rescan that delivers it
    pub event_coalesce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            preferred_backend: BackendPreference::Kernel,
            network_preferred_backend: BackendPreference::Kernel,
            poll_interval_ms: 500,
            network_poll_interval_ms: 5000,
            network_paths: Vec::new(),
            noisy_prefixes: defaults::PREFIXES.iter().map(|s| s.to_string()).collect(),
            noisy_suffixes: defaults::SUFFIXES.iter().map(|s| s.to_string()).collect(),
            event_coalesce_ms: 100,
        }
    }
}

impl WatchConfig {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> WatchResult<()> {
        if self.poll_interval_ms == 0 || self.network_poll_interval_ms == 0 {
            return Err(WatchError::Config { message: "poll intervals must be greater than zero".to_string() });
        }
        self.network_matcher()?;
        Ok(())
    }

    pub fn event_coalesce(&self) -> Duration {
        Duration::from_millis(self.event_coalesce_ms)
    }

    pub(crate) fn noise_filter(&self) -> NoiseFilter {
        if same_list(&self.noisy_prefixes, defaults::PREFIXES) && same_list(&self.noisy_suffixes, defaults::SUFFIXES) {
            return NoiseFilter::default();
        }
        NoiseFilter::new(&self.noisy_prefixes[..], &self.noisy_suffixes[..])
    }

    pub(crate) fn network_matcher(&self) -> WatchResult<NetworkPaths> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.network_paths {
            let glob = Glob::new(pattern).map_err(|e| WatchError::Config {
                message: format!("invalid network path pattern '{}': {}", pattern, e),
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| WatchError::Config { message: format!("invalid network path patterns: {}", e) })?;
        Ok(NetworkPaths { set })
    }
}

/// Classifies paths as network-mounted
#[derive(Debug, Clone)]
pub(crate) struct NetworkPaths {
    set: GlobSet,
}

impl NetworkPaths {
    pub(crate) fn is_network(&self, path: &Path) -> bool {
        // A pattern for the mount point covers everything below it
        path.ancestors().any(|p| self.set.is_match(p))
    }
}

fn same_list(list: &[String], stock: &[&str]) -> bool {
    list.iter().map(String::as_str).eq(stock.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = WatchConfig::default();
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.network_poll_interval_ms, 5000);
        assert_eq!(config.preferred_backend, BackendPreference::Kernel);
        assert!(config.noisy_prefixes.contains(&".xsession-errors".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = WatchConfig { poll_interval_ms: 0, ..WatchConfig::default() };
        assert!(matches!(config.validate(), Err(WatchError::Config { .. })));
    }

    #[test]
    fn test_bad_glob_rejected() {
        let config = WatchConfig { network_paths: vec!["/mnt/[".to_string()], ..WatchConfig::default() };
        assert!(matches!(config.validate(), Err(WatchError::Config { .. })));
    }

    #[test]
    fn test_network_paths_cover_descendants() {
        let config = WatchConfig { network_paths: vec!["/mnt/nfs".to_string()], ..WatchConfig::default() };
        let network = config.network_matcher().unwrap();
        assert!(network.is_network(Path::new("/mnt/nfs")));
        assert!(network.is_network(Path::new("/mnt/nfs/home/user/file")));
        assert!(!network.is_network(Path::new("/home/user/file")));
    }

    #[test]
    fn test_roundtrip_through_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dirwatch.toml");

        let config = WatchConfig {
            preferred_backend: BackendPreference::Polling,
            poll_interval_ms: 250,
            ..WatchConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = WatchConfig::from_file(&path).unwrap();
        assert_eq!(loaded.preferred_backend, BackendPreference::Polling);
        assert_eq!(loaded.poll_interval_ms, 250);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dirwatch.toml");
        std::fs::write(&path, "preferred_backend = \"watcher-service\"\n").unwrap();

        let loaded = WatchConfig::from_file(&path).unwrap();
        assert_eq!(loaded.preferred_backend, BackendPreference::WatcherService);
        assert_eq!(loaded.poll_interval_ms, 500);
    }

    #[test]
    fn test_noise_filter_from_config() {
        let config = WatchConfig {
            noisy_prefixes: vec![".cache".to_string()],
            noisy_suffixes: vec![],
            ..WatchConfig::default()
        };
        let filter = config.noise_filter();
        assert!(filter.is_noisy(".cache-1"));
        assert!(!filter.is_noisy("file.swp"));
    }

    #[test]
    fn test_default_noise_lists_use_shared_filter() {
        let filter = WatchConfig::default().noise_filter();
        assert!(filter.is_noisy("Cargo.lock"));
        assert!(filter.is_noisy(".xsession-errors"));
        assert!(!filter.is_noisy("main.rs"));
    }
}
