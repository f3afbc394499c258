//! Watch command: print change events until interrupted

use anyhow::{Context, Result};
use chrono::Local;
use dirwatch_core::{DirWatchEngine, WatchConfig, WatchEvent, WatchKind, WatchModes, WatchService};
use tracing::{info, warn};

use crate::cli::app::WatchArgs;

/// Execute watch command
pub async fn execute(args: WatchArgs, config: WatchConfig) -> Result<()> {
    let config = apply_overrides(config, &args);
    let engine = DirWatchEngine::new(config).context("Failed to start the watch engine")?;
    info!("Available mechanisms: {:?}", engine.available_backends());

    let service = WatchService::spawn(engine);
    let handle = service.handle();
    let (id, mut events) = handle.subscribe().await?;

    let modes = WatchModes { files: args.files, subdirs: args.subdirs };
    for path in &args.paths {
        let kind = watch_kind(&args, path);
        handle
            .add_watch(id, path.clone(), kind, modes)
            .await
            .with_context(|| format!("Failed to watch {}", path.display()))?;
        if !path.exists() {
            info!("{} does not exist yet, waiting for it", path.display());
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event, args.json)?,
                None => {
                    warn!("Event stream closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

/// Command-line flags win over the configuration file
fn apply_overrides(mut config: WatchConfig, args: &WatchArgs) -> WatchConfig {
    if let Some(backend) = args.backend {
        config.preferred_backend = backend.into();
        config.network_preferred_backend = backend.into();
    }
    if let Some(interval) = args.interval {
        config.poll_interval_ms = interval;
    }
    config
}

fn watch_kind(args: &WatchArgs, path: &std::path::Path) -> WatchKind {
    if args.dir || args.files || args.subdirs || path.is_dir() {
        WatchKind::Dir
    } else {
        WatchKind::File
    }
}

fn print_event(event: &WatchEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        let time = event.timestamp.with_timezone(&Local).format("%H:%M:%S%.3f");
        let kind = if event.is_dir { "dir" } else { "file" };
        println!("{} {:<8} {:<4} {}", time, event.kind, kind, event.path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::app::BackendArg;
    use dirwatch_core::BackendPreference;
    use std::path::PathBuf;

    fn args() -> WatchArgs {
        WatchArgs {
            paths: vec![PathBuf::from("/nonexistent/dirwatch/path")],
            dir: false,
            files: false,
            subdirs: false,
            backend: None,
            interval: None,
            json: false,
        }
    }

    #[test]
    fn test_overrides_applied() {
        let args = WatchArgs { backend: Some(BackendArg::Polling), interval: Some(250), ..args() };
        let config = apply_overrides(WatchConfig::default(), &args);
        assert_eq!(config.preferred_backend, BackendPreference::Polling);
        assert_eq!(config.poll_interval_ms, 250);
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let config = apply_overrides(WatchConfig::default(), &args());
        assert_eq!(config.preferred_backend, BackendPreference::Kernel);
        assert_eq!(config.poll_interval_ms, 500);
    }

    #[test]
    fn test_watch_kind_selection() {
        let missing = PathBuf::from("/nonexistent/dirwatch/path");
        assert_eq!(watch_kind(&args(), &missing), WatchKind::File);
        assert_eq!(watch_kind(&WatchArgs { files: true, ..args() }, &missing), WatchKind::Dir);
        assert_eq!(watch_kind(&args(), &std::env::temp_dir()), WatchKind::Dir);
    }
}
